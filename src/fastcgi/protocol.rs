//! FastCGI wire format
//!
//! Record framing for the client side of a single Responder request:
//!
//! ```text
//! {BEGIN_REQUEST, 1, {RESPONDER, 0}}
//! {PARAMS,        1, "\x0f\x11SCRIPT_FILENAME/var/www/test.php..."}
//! {PARAMS,        1, ""}
//! {STDIN,         1, ""}
//!
//!     {STDOUT,      1, "Content-type: text/html\r\n\r\n<html>..."}
//!     {END_REQUEST, 1, {0, REQUEST_COMPLETE}}
//! ```
//!
//! Ref: https://fastcgi-archives.github.io/FastCGI_Specification.html

use super::GatewayError;
use crate::framing;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncRead;
use tracing::debug;

/// Protocol version written in every header
pub const VERSION_1: u8 = 1;

/// Request id used on a dedicated, non-multiplexed connection
pub const REQUEST_ID: u16 = 1;

/// Length of a record header
pub const HEADER_LEN: usize = 8;

/// Largest content carried by one record
pub const MAX_CONTENT_LEN: usize = u16::MAX as usize;

/// Responder role in a BEGIN_REQUEST body
pub const ROLE_RESPONDER: u16 = 1;

/// Keep the connection open after the request
pub const FLAG_KEEP_CONN: u8 = 1;

/// Largest name or value length the 4-byte form can carry
const MAX_PARAM_LEN: usize = 0x7fff_ffff;

/// Record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    BeginRequest = 1,
    AbortRequest = 2,
    EndRequest = 3,
    Params = 4,
    Stdin = 5,
    Stdout = 6,
    Stderr = 7,
    Data = 8,
    GetValues = 9,
    GetValuesResult = 10,
    UnknownType = 11,
}

impl RecordType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::BeginRequest,
            2 => Self::AbortRequest,
            3 => Self::EndRequest,
            4 => Self::Params,
            5 => Self::Stdin,
            6 => Self::Stdout,
            7 => Self::Stderr,
            8 => Self::Data,
            9 => Self::GetValues,
            10 => Self::GetValuesResult,
            11 => Self::UnknownType,
            _ => return None,
        })
    }
}

/// Record header, deserialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    /// Raw type byte; unknown values are kept so the caller can stop on them
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
}

impl RecordHeader {
    /// Header for `content_length` bytes padded to a multiple of 8
    pub fn new(record_type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: VERSION_1,
            record_type: record_type as u8,
            request_id,
            content_length,
            padding_length: padding_for(content_length as usize),
        }
    }

    pub fn from_bytes(b: &[u8; HEADER_LEN]) -> Self {
        Self {
            version: b[0],
            record_type: b[1],
            request_id: u16::from_be_bytes([b[2], b[3]]),
            content_length: u16::from_be_bytes([b[4], b[5]]),
            padding_length: b[6],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let id = self.request_id.to_be_bytes();
        let len = self.content_length.to_be_bytes();
        [
            self.version,
            self.record_type,
            id[0],
            id[1],
            len[0],
            len[1],
            self.padding_length,
            0, // reserved
        ]
    }

    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_u8(self.record_type)
    }

    /// Bytes following the header: content plus padding
    pub fn body_len(&self) -> usize {
        self.content_length as usize + self.padding_length as usize
    }
}

/// Padding needed to round `len` up to the next multiple of 8
pub fn padding_for(len: usize) -> u8 {
    ((8 - (len % 8)) % 8) as u8
}

/// Append one record: header, content, zero padding
///
/// `content` must fit in a single record.
pub fn write_record(buf: &mut BytesMut, record_type: RecordType, request_id: u16, content: &[u8]) {
    debug_assert!(content.len() <= MAX_CONTENT_LEN);
    let header = RecordHeader::new(record_type, request_id, content.len() as u16);
    buf.put_slice(&header.to_bytes());
    buf.put_slice(content);
    buf.put_bytes(0, header.padding_length as usize);
}

/// Append a stream record type, splitting `content` over as many records
/// as needed
///
/// Empty content produces nothing; the terminating empty record is written
/// separately.
pub fn write_stream(buf: &mut BytesMut, record_type: RecordType, request_id: u16, content: &[u8]) {
    for chunk in content.chunks(MAX_CONTENT_LEN) {
        write_record(buf, record_type, request_id, chunk);
    }
}

/// BEGIN_REQUEST body
pub fn begin_request_body(role: u16, keep_conn: bool) -> [u8; 8] {
    let role = role.to_be_bytes();
    let flags = if keep_conn { FLAG_KEEP_CONN } else { 0 };
    [role[0], role[1], flags, 0, 0, 0, 0, 0]
}

/// Ordered CGI parameters; insertion order is wire order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter, replacing the value of an existing name in place
    pub fn insert(&mut self, name: &str, value: &str) {
        match self.pairs.iter_mut().find(|(n, _)| n == name) {
            Some(pair) => pair.1 = value.to_string(),
            None => self.pairs.push((name.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Name-value pair stream, unpadded
    pub fn encode(&self) -> Result<Bytes, GatewayError> {
        let mut buf = BytesMut::new();
        for (name, value) in self.iter() {
            write_name_value(&mut buf, name.as_bytes(), value.as_bytes())
                .map_err(|_| GatewayError::ParamTooLong(name.to_string()))?;
        }
        Ok(buf.freeze())
    }

    /// Parse a name-value pair stream back into ordered parameters
    pub fn decode(mut content: &[u8]) -> Result<Self, GatewayError> {
        let mut params = Params::new();
        while !content.is_empty() {
            let (name_len, rest) = read_length(content)?;
            let (value_len, rest) = read_length(rest)?;
            if rest.len() < name_len + value_len {
                return Err(GatewayError::Protocol(
                    "name-value pair overruns PARAMS content".to_string(),
                ));
            }
            let name = String::from_utf8_lossy(&rest[..name_len]);
            let value = String::from_utf8_lossy(&rest[name_len..name_len + value_len]);
            params.pairs.push((name.into_owned(), value.into_owned()));
            content = &rest[name_len + value_len..];
        }
        Ok(params)
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Params {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

/// Append one name-value pair
///
/// Lengths up to 127 use one byte; longer ones use four bytes with the high
/// bit set.
fn write_name_value(buf: &mut BytesMut, name: &[u8], value: &[u8]) -> Result<(), ()> {
    write_length(buf, name.len())?;
    write_length(buf, value.len())?;
    buf.put_slice(name);
    buf.put_slice(value);
    Ok(())
}

fn write_length(buf: &mut BytesMut, len: usize) -> Result<(), ()> {
    if len > MAX_PARAM_LEN {
        return Err(());
    }
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32(len as u32 | 0x8000_0000);
    }
    Ok(())
}

fn read_length(buf: &[u8]) -> Result<(usize, &[u8]), GatewayError> {
    let truncated = || GatewayError::Protocol("truncated name-value length".to_string());
    let first = *buf.first().ok_or_else(truncated)?;
    if first & 0x80 == 0 {
        Ok((first as usize, &buf[1..]))
    } else {
        let len = framing::read_u32_be(buf, 0).ok_or_else(truncated)?;
        Ok(((len & 0x7fff_ffff) as usize, &buf[4..]))
    }
}

/// Full client request: BEGIN_REQUEST, PARAMS stream, empty PARAMS, empty STDIN
pub fn encode_request(request_id: u16, params: &Params) -> Result<Bytes, GatewayError> {
    let content = params.encode()?;

    let mut buf = BytesMut::with_capacity(content.len() + 5 * HEADER_LEN + 8 + 8);
    write_record(
        &mut buf,
        RecordType::BeginRequest,
        request_id,
        &begin_request_body(ROLE_RESPONDER, false),
    );
    write_stream(&mut buf, RecordType::Params, request_id, &content);
    write_record(&mut buf, RecordType::Params, request_id, &[]);
    write_record(&mut buf, RecordType::Stdin, request_id, &[]);

    Ok(buf.freeze())
}

/// Read records until the first non-STDOUT record, returning the
/// concatenated STDOUT content
///
/// The stream is assumed to carry a single request, so records are not
/// matched by id. A stream that ends mid-record or before a terminating
/// record is an error.
pub async fn read_stdout<R>(reader: &mut R) -> Result<Bytes, GatewayError>
where
    R: AsyncRead + Unpin,
{
    let mut out = BytesMut::new();

    loop {
        let header = RecordHeader::from_bytes(&framing::read_array::<_, HEADER_LEN>(reader).await?);

        if header.kind() != Some(RecordType::Stdout) {
            debug!(
                "FastCGI stream ended by record type {} after {} bytes",
                header.record_type,
                out.len()
            );
            break;
        }

        let body = framing::read_field(reader, header.body_len()).await?;
        out.put_slice(&body[..header.content_length as usize]);
    }

    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(record_type: RecordType, content: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_record(&mut buf, record_type, REQUEST_ID, content);
        buf.to_vec()
    }

    #[test]
    fn test_header_layout() {
        let header = RecordHeader::new(RecordType::Params, 1, 0x0123);
        assert_eq!(header.to_bytes(), [1, 4, 0, 1, 0x01, 0x23, 5, 0]);
        assert_eq!(RecordHeader::from_bytes(&header.to_bytes()), header);
    }

    #[test]
    fn test_padding() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 7);
        assert_eq!(padding_for(8), 0);
        assert_eq!(padding_for(13), 3);
    }

    #[test]
    fn test_params_record_length_and_padding() {
        let params: Params = [
            ("SCRIPT_FILENAME", "/var/www/test.php"),
            ("QUERY_STRING", "a=1"),
        ]
        .into_iter()
        .collect();

        let encoded = encode_request(REQUEST_ID, &params).unwrap();
        let expected: usize = params.iter().map(|(n, v)| 2 + n.len() + v.len()).sum();

        // Second record follows the 16-byte BEGIN_REQUEST record
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&encoded[16..24]);
        let header = RecordHeader::from_bytes(&header);
        assert_eq!(header.kind(), Some(RecordType::Params));
        assert_eq!(header.content_length as usize, expected);
        assert_eq!((expected + header.padding_length as usize) % 8, 0);
        assert!(header.padding_length < 8);

        let padding_start = 24 + expected;
        let padding = &encoded[padding_start..padding_start + header.padding_length as usize];
        assert!(padding.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_request_layout() {
        let params: Params = [("QUERY_STRING", "")].into_iter().collect();
        let encoded = encode_request(REQUEST_ID, &params).unwrap();

        assert_eq!(
            &encoded[..16],
            &[1, 1, 0, 1, 0, 8, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0]
        );
        // 14 bytes of params content, 2 bytes of padding
        assert_eq!(&encoded[16..24], &[1, 4, 0, 1, 0, 14, 2, 0]);
        assert_eq!(
            &encoded[40..],
            &[1, 4, 0, 1, 0, 0, 0, 0, 1, 5, 0, 1, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_params_round_trip() {
        let long_value = "v".repeat(300);
        let params: Params = [
            ("SCRIPT_FILENAME", "/var/www/index.php"),
            ("QUERY_STRING", ""),
            ("REQUEST_METHOD", "GET"),
            ("LONG", long_value.as_str()),
            ("GATEWAY_INTERFACE", "CGI/1.1"),
        ]
        .into_iter()
        .collect();

        let decoded = Params::decode(&params.encode().unwrap()).unwrap();
        assert_eq!(decoded, params);
        assert_eq!(decoded.get("LONG").map(str::len), Some(300));
    }

    #[test]
    fn test_long_length_form() {
        let value = "x".repeat(200);
        let params: Params = [("K", value.as_str())].into_iter().collect();
        let encoded = params.encode().unwrap();

        assert_eq!(encoded[0], 1);
        assert_eq!(&encoded[1..5], &[0x80, 0, 0, 200]);
        assert_eq!(encoded.len(), 1 + 4 + 1 + 200);
    }

    #[test]
    fn test_decode_truncated_params() {
        assert!(Params::decode(&[5, 1, b'a']).is_err());
        assert!(Params::decode(&[0x80, 0]).is_err());
    }

    #[test]
    fn test_large_params_split_over_records() {
        let value = "y".repeat(MAX_CONTENT_LEN);
        let params: Params = [("BIG", value.as_str())].into_iter().collect();
        let content_len = params.encode().unwrap().len();
        let encoded = encode_request(REQUEST_ID, &params).unwrap();

        let mut offset = 16;
        let mut carried = 0;
        loop {
            let mut header = [0u8; HEADER_LEN];
            header.copy_from_slice(&encoded[offset..offset + HEADER_LEN]);
            let header = RecordHeader::from_bytes(&header);
            assert_eq!(header.kind(), Some(RecordType::Params));
            offset += HEADER_LEN + header.body_len();
            if header.content_length == 0 {
                break;
            }
            carried += header.content_length as usize;
        }
        assert_eq!(carried, content_len);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut params = Params::new();
        params.insert("A", "1");
        params.insert("B", "2");
        params.insert("A", "3");
        let names: Vec<_> = params.iter().collect();
        assert_eq!(names, vec![("A", "3"), ("B", "2")]);
    }

    #[tokio::test]
    async fn test_read_stdout_concatenates() {
        // Only the END_REQUEST header is consumed, so only it is scripted
        let end = RecordHeader::new(RecordType::EndRequest, REQUEST_ID, 8).to_bytes();
        let mut stream = tokio_test::io::Builder::new()
            .read(&record(RecordType::Stdout, b"Hello, "))
            .read(&record(RecordType::Stdout, b"World!"))
            .read(&end)
            .build();

        let body = read_stdout(&mut stream).await.unwrap();
        assert_eq!(&body[..], b"Hello, World!");
    }

    #[tokio::test]
    async fn test_read_stdout_split_reads() {
        let first = record(RecordType::Stdout, b"Hello, ");
        let (a, b) = first.split_at(5);
        let end_header = RecordHeader::new(RecordType::EndRequest, REQUEST_ID, 8).to_bytes();

        let mut stream = tokio_test::io::Builder::new()
            .read(a)
            .read(b)
            .read(&end_header)
            .build();

        let body = read_stdout(&mut stream).await.unwrap();
        assert_eq!(&body[..], b"Hello, ");
    }

    #[tokio::test]
    async fn test_read_stdout_truncated_record() {
        let full = record(RecordType::Stdout, b"Hello, World!");
        let mut stream = tokio_test::io::Builder::new().read(&full[..12]).build();

        let err = read_stdout(&mut stream).await.unwrap_err();
        assert!(matches!(err, GatewayError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));
    }
}
