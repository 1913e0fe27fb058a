//! Request line parsing
//!
//! Only the first line of a request is looked at. Method and version are
//! not validated; the target between the first and the last space is split
//! into path and query.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("request has no line terminator")]
    MissingNewline,
    #[error("request line has no target")]
    MissingTarget,
}

/// Path and query of a request target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub path: String,
    pub query: String,
}

impl RequestTarget {
    /// Parse the target out of raw request bytes
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let end = raw
            .iter()
            .position(|b| *b == b'\n')
            .ok_or(ParseError::MissingNewline)?;
        let line = String::from_utf8_lossy(&raw[..end]);

        let (first, last) = match (line.find(' '), line.rfind(' ')) {
            (Some(first), Some(last)) if first < last => (first, last),
            _ => return Err(ParseError::MissingTarget),
        };
        let uri = &line[first + 1..last];

        let (path, query) = uri.split_once('?').unwrap_or((uri, ""));

        Ok(Self {
            path: path.to_string(),
            query: query.to_string(),
        })
    }
}
