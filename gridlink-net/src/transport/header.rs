//! Fixed-size textual message header.
//!
//! Every framed message starts with a 32 character header of seven
//! space-separated, left-aligned fields:
//!
//! ```text
//! <version:1> <size:3> <length:7> <format:5> <format_version:3.1> <timeout:1> <status:3>
//! ```
//!
//! followed by three spaces and then the message body. The layout is kept
//! byte for byte compatible with existing peers.

use std::time::Duration;

use crate::connection::Mode;
use crate::error::{Error, Result};

/// Length of the header, including trailing padding.
pub const HEADER_SIZE: usize = 32;
pub const DEFAULT_HEADER_VERSION: u32 = 0;
pub const DEFAULT_FORMAT: &str = "NONE";
pub const DEFAULT_FORMAT_VERSION: f64 = 0.0;
/// Maximum accepted difference between format versions.
pub const FORMAT_VERSION_TOLERANCE: f64 = 0.099;
/// Status carried by successful responses.
pub const STATUS_OK: u32 = 200;
/// Status carried by requests.
pub const STATUS_REQUEST: u32 = 0;
pub const MAX_FORMAT_LEN: usize = 5;

/// Header settings shared by both ends of a framed transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderConfig {
    pub version: u32,
    pub size: usize,
    pub format: String,
    pub format_version: f64,
    pub timeout: Duration,
    /// Status written into outgoing headers
    pub send_status: u32,
    /// Status required on incoming headers
    pub expect_status: u32,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        HeaderConfig {
            version: DEFAULT_HEADER_VERSION,
            size: HEADER_SIZE,
            format: DEFAULT_FORMAT.to_string(),
            format_version: DEFAULT_FORMAT_VERSION,
            timeout: Duration::from_secs(1),
            send_status: STATUS_REQUEST,
            expect_status: STATUS_OK,
        }
    }
}

/// Parsed incoming header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub version: u32,
    pub size: usize,
    pub length: usize,
    pub format: String,
    pub format_version: f64,
    pub timeout: u32,
    pub status: u32,
}

impl HeaderConfig {
    /// Clients send requests and expect responses, servers the opposite.
    pub fn set_mode(&mut self, mode: Mode) {
        match mode {
            Mode::Client => {
                self.send_status = STATUS_REQUEST;
                self.expect_status = STATUS_OK;
            }
            Mode::Server => {
                self.send_status = STATUS_OK;
                self.expect_status = STATUS_REQUEST;
            }
        }
    }

    /// Timeout field value. Any positive timeout is written as 9.
    fn timeout_field(&self) -> u32 {
        if self.timeout > Duration::from_secs(0) {
            9
        } else {
            1
        }
    }

    /// Formats the header for a body of `length` bytes.
    pub fn encode(&self, length: usize) -> Result<String> {
        let mut header = format!(
            "{:<1} {:<3} {:<7} {:<5.5} {:<3.1} {:<1} {:<3}   ",
            self.version,
            self.size,
            length,
            self.format,
            self.format_version,
            self.timeout_field(),
            self.send_status
        );
        if header.len() > self.size {
            return Err(Error::Protocol(format!(
                "header '{}' doesn't fit in {} bytes",
                header, self.size
            )));
        }
        while header.len() < self.size {
            header.push(' ');
        }
        Ok(header)
    }

    /// Checks every header field against this configuration.
    pub fn validate(&self, header: &Header) -> Result<()> {
        if header.version != self.version {
            return Err(Error::Protocol(format!(
                "incorrect header version {}, expected {}",
                header.version, self.version
            )));
        }
        if header.size != self.size {
            return Err(Error::Protocol(format!(
                "unexpected header size {}, expected {}",
                header.size, self.size
            )));
        }
        let format = if self.format.len() > MAX_FORMAT_LEN {
            &self.format[..MAX_FORMAT_LEN]
        } else {
            &self.format
        };
        if header.format != format {
            return Err(Error::Protocol(format!(
                "unexpected message format '{}', expected '{}'",
                header.format, format
            )));
        }
        if (header.format_version - self.format_version).abs() > FORMAT_VERSION_TOLERANCE {
            return Err(Error::Protocol(format!(
                "unexpected message version {:.1}, expected {:.1}",
                header.format_version, self.format_version
            )));
        }
        if header.status != self.expect_status {
            return Err(Error::Protocol(format!(
                "unexpected response code {}, expected {}",
                header.status, self.expect_status
            )));
        }
        Ok(())
    }

    /// Returns the body following a validated header.
    pub fn body<'a>(&self, header: &Header, raw: &'a [u8]) -> Result<&'a [u8]> {
        let end = self.size + header.length;
        if raw.len() < end {
            return Err(Error::Protocol(format!(
                "message body truncated: declared {} bytes, got {}",
                header.length,
                raw.len().saturating_sub(self.size)
            )));
        }
        Ok(&raw[self.size..end])
    }
}

impl Header {
    /// Parses the leading `size` bytes of a raw message.
    pub fn parse(raw: &[u8], size: usize) -> Result<Header> {
        if raw.len() < size {
            return Err(Error::Protocol(format!(
                "incomplete message header ({} bytes)",
                raw.len()
            )));
        }
        let text = std::str::from_utf8(&raw[..size])
            .map_err(|_| Error::Protocol("message header is not valid text".to_string()))?;
        let fields = text.split_whitespace().collect::<Vec<&str>>();
        if fields.len() != 7 {
            return Err(Error::Protocol(format!(
                "incomplete or invalid message header '{}'",
                text
            )));
        }
        let invalid = |name: &str| {
            Error::Protocol(format!("invalid {} in message header '{}'", name, text))
        };
        Ok(Header {
            version: fields[0].parse().map_err(|_| invalid("version"))?,
            size: fields[1].parse().map_err(|_| invalid("size"))?,
            length: fields[2].parse().map_err(|_| invalid("length"))?,
            format: fields[3].to_string(),
            format_version: fields[4].parse().map_err(|_| invalid("format version"))?,
            timeout: fields[5].parse().map_err(|_| invalid("timeout"))?,
            status: fields[6].parse().map_err(|_| invalid("status"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_header_layout() {
        let config = HeaderConfig::default();
        let header = config.encode(42).unwrap();
        assert_eq!(header, "0 32  42      NONE  0.0 9 0     ");
        assert_eq!(header.len(), HEADER_SIZE);

        let mut server = HeaderConfig {
            format: "JSONLONG".to_string(),
            format_version: 1.0,
            timeout: Duration::from_secs(0),
            ..Default::default()
        };
        server.set_mode(Mode::Server);
        assert_eq!(server.encode(7).unwrap(), "0 32  7       JSONL 1.0 1 200   ");
    }

    #[test]
    fn parse_and_validate() {
        let mut server = HeaderConfig::default();
        server.set_mode(Mode::Server);
        let raw = format!("{}hello", server.encode(5).unwrap());
        let header = Header::parse(raw.as_bytes(), HEADER_SIZE).unwrap();
        assert_eq!(header.length, 5);
        assert_eq!(header.status, STATUS_OK);

        let client = HeaderConfig::default();
        client.validate(&header).unwrap();
        assert_eq!(client.body(&header, raw.as_bytes()).unwrap(), b"hello");
        // the server expects requests, not responses
        assert!(server.validate(&header).is_err());
        assert!(Header::parse(b"0 32 5", HEADER_SIZE).is_err());
    }
}
