//! SCGI request header reader (worker side).
//!
//! An SCGI request starts with a netstring holding NUL-separated
//! name/value pairs, followed by the body:
//!
//! ```text
//! 70:CONTENT_LENGTH\027\0SCGI\01\0REQUEST_METHOD\0POST\0REQUEST_URI\0/deepthought\0,<body>
//! ```
//!
//! The first pair must be `CONTENT_LENGTH` and an `SCGI` pair with value
//! `1` must be present. The reader consumes exactly the header block and
//! its trailing ',' so the body can be read from the same reader.
//! Wrap the connection in a `BufReader`; the length prefix is scanned one
//! byte at a time.

use crate::error::HeaderError;
use std::io::Read;

/// Largest header block accepted by `RequestEnv::read_from`.
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Digits allowed in the netstring length prefix.
const MAX_LENGTH_DIGITS: usize = 10;

/// Request variables from one SCGI header block, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnv {
    vars: Vec<(String, String)>,
    content_length: usize,
}

impl RequestEnv {
    /// Read and validate a header block, limited to `MAX_HEADER_LEN`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, HeaderError> {
        Self::read_with_limit(reader, MAX_HEADER_LEN)
    }

    pub fn read_with_limit<R: Read>(reader: &mut R, max_len: usize) -> Result<Self, HeaderError> {
        let len = read_length_prefix(reader)?;
        if len > max_len {
            return Err(HeaderError::TooLarge(len));
        }

        let mut block = vec![0u8; len];
        reader.read_exact(&mut block)?;

        let mut comma = [0u8; 1];
        reader.read_exact(&mut comma)?;
        if comma[0] != b',' {
            return Err(HeaderError::MissingComma);
        }

        Self::parse_block(&block)
    }

    /// Parse the inside of the netstring (without length prefix and comma).
    pub fn parse_block(block: &[u8]) -> Result<Self, HeaderError> {
        if block.is_empty() {
            return Err(HeaderError::BadContentLength);
        }
        if block[block.len() - 1] != 0 {
            return Err(HeaderError::Malformed("block does not end with NUL"));
        }

        // Drop the terminator so split yields exactly name, value, name, ...
        let fields: Vec<&[u8]> = block[..block.len() - 1].split(|&b| b == 0).collect();
        if fields.len() % 2 != 0 {
            return Err(HeaderError::Malformed("odd number of fields"));
        }

        let mut vars = Vec::with_capacity(fields.len() / 2);
        for pair in fields.chunks_exact(2) {
            if pair[0].is_empty() {
                return Err(HeaderError::Malformed("empty header name"));
            }
            let name = std::str::from_utf8(pair[0])
                .map_err(|_| HeaderError::Malformed("header name is not UTF-8"))?
                .to_string();
            let value = String::from_utf8_lossy(pair[1]).into_owned();
            vars.push((name, value));
        }

        let content_length = match vars.first() {
            Some((name, value)) if name == "CONTENT_LENGTH" => parse_decimal(value.as_bytes())
                .ok_or(HeaderError::BadContentLength)?,
            _ => return Err(HeaderError::BadContentLength),
        };

        match vars.iter().find(|(n, _)| n == "SCGI") {
            Some((_, v)) if v == "1" => {}
            _ => return Err(HeaderError::BadVersion),
        }

        Ok(Self { vars, content_length })
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body length announced by the `CONTENT_LENGTH` header.
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.get("REMOTE_ADDR")
    }

    pub fn request_method(&self) -> Option<&str> {
        self.get("REQUEST_METHOD")
    }

    pub fn request_uri(&self) -> Option<&str> {
        self.get("REQUEST_URI")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

fn read_length_prefix<R: Read>(reader: &mut R) -> Result<usize, HeaderError> {
    let mut digits = Vec::with_capacity(MAX_LENGTH_DIGITS);
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        match byte[0] {
            b':' => break,
            b'0'..=b'9' if digits.len() < MAX_LENGTH_DIGITS => digits.push(byte[0]),
            _ => return Err(HeaderError::BadLength),
        }
    }
    // Netstrings forbid leading zeros ("0:" is the only zero form).
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(HeaderError::BadLength);
    }
    parse_decimal(&digits).ok_or(HeaderError::BadLength)
}

fn parse_decimal(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
