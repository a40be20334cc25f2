//! Message codecs.
//!
//! A connection doesn't know the wire format of the messages it exchanges.
//! Message programs are run against a pair of [`ExchangeTranslator`]s, one
//! encoding into the transport's output buffer and one decoding from the
//! structured form of the last received body. The structured form is
//! produced by a [`BodyParser`] registered on the transport.
//!
//! The plain codec provided here writes messages like:
//!
//! ```text
//! {method="precommit", data={remote.tag="3.14"}, id=1}
//! ```
//!
//! [`ExchangeTranslator`]: trait.ExchangeTranslator.html
//! [`BodyParser`]: trait.BodyParser.html

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Delimiter placed between fields of the plain codec.
pub const PLAIN_DELIMITER: &str = ", ";

/// How a decoded field relates to the value given by the program.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum FieldMode {
    /// Received value must equal the given one
    MatchOnly,
    /// Received value replaces the given one, up to `limit` bytes
    RoundTrip { limit: usize },
}

/// Structural encoder or decoder used by the message program evaluator.
pub trait ExchangeTranslator: Send + Sync {
    /// Opens the top level group when `name` is `None`, otherwise a named
    /// nested group.
    fn group_open(&self, transport: &mut Transport, name: Option<&str>) -> Result<()>;
    fn group_close(&self, transport: &mut Transport) -> Result<()>;
    /// Exchanges a single tagged value.
    fn field(
        &self,
        transport: &mut Transport,
        tag: &str,
        value: &mut String,
        mode: FieldMode,
        quoted: bool,
    ) -> Result<()>;
    /// Field delimiter the encoder expects from the transport.
    fn delimiter(&self) -> Option<&str> {
        None
    }
}

/// Parses a received body into a tree of fields.
pub trait BodyParser: Send + Sync {
    fn parse(&self, body: &str) -> Result<Fields>;
}

/// Single parsed value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Group(Fields),
}

/// Ordered collection of parsed fields.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fields {
    entries: Vec<(String, FieldValue)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tag: &str, value: FieldValue) {
        self.entries.push((tag.to_string(), value));
    }

    pub fn get(&self, tag: &str) -> Option<&FieldValue> {
        self.entries.iter().find(|(t, _)| t == tag).map(|(_, v)| v)
    }

    pub fn text(&self, tag: &str) -> Option<&str> {
        match self.get(tag) {
            Some(FieldValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn group(&self, tag: &str) -> Option<&Fields> {
        match self.get(tag) {
            Some(FieldValue::Group(g)) => Some(g),
            _ => None,
        }
    }

    /// Follows a path of nested group names.
    pub fn walk(&self, path: &[String]) -> Option<&Fields> {
        let mut current = self;
        for name in path {
            current = current.group(name)?;
        }
        Some(current)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(t, v)| (t.as_str(), v))
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Encoding half of the plain codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainExport;

impl ExchangeTranslator for PlainExport {
    fn group_open(&self, transport: &mut Transport, name: Option<&str>) -> Result<()> {
        match name {
            None => transport.message_append("{")?,
            Some(name) => transport.message_append(&format!("{}={{", name))?,
        };
        transport.reset_field_count();
        Ok(())
    }

    fn group_close(&self, transport: &mut Transport) -> Result<()> {
        transport.reset_field_count();
        transport.message_append("}")?;
        Ok(())
    }

    fn field(
        &self,
        transport: &mut Transport,
        tag: &str,
        value: &mut String,
        _mode: FieldMode,
        quoted: bool,
    ) -> Result<()> {
        let field = if quoted {
            format!("{}=\"{}\"", tag, escape(value))
        } else {
            format!("{}={}", tag, value)
        };
        transport.message_append(&field)?;
        Ok(())
    }

    fn delimiter(&self) -> Option<&str> {
        Some(PLAIN_DELIMITER)
    }
}

/// Decoding half of the plain codec.
///
/// Works on any parsed body, so it can be paired with other parsers.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainImport;

impl ExchangeTranslator for PlainImport {
    fn group_open(&self, transport: &mut Transport, name: Option<&str>) -> Result<()> {
        match name {
            None => {
                if transport.translation().is_none() {
                    return Err(Error::Exchange(
                        "received message has no parsed body".to_string(),
                    ));
                }
                transport.reset_scope();
                Ok(())
            }
            Some(name) => transport.enter_group(name),
        }
    }

    fn group_close(&self, transport: &mut Transport) -> Result<()> {
        transport.leave_group();
        Ok(())
    }

    fn field(
        &self,
        transport: &mut Transport,
        tag: &str,
        value: &mut String,
        mode: FieldMode,
        _quoted: bool,
    ) -> Result<()> {
        let found = match transport.lookup(tag) {
            Some(FieldValue::Text(s)) => s.clone(),
            Some(FieldValue::Group(_)) => {
                return Err(Error::Exchange(format!("{} is a group, not a value", tag)))
            }
            None => return Err(Error::TagNotFound(tag.to_string())),
        };
        match mode {
            FieldMode::MatchOnly => {
                if found != *value {
                    return Err(Error::TagMismatch {
                        tag: tag.to_string(),
                        expected: value.clone(),
                        found,
                    });
                }
            }
            FieldMode::RoundTrip { limit } => {
                if found.len() > limit {
                    return Err(Error::MessageOverflow {
                        len: found.len(),
                        max: limit,
                    });
                }
                *value = found;
            }
        }
        Ok(())
    }
}

/// Parser for bodies written by [`PlainExport`].
///
/// [`PlainExport`]: struct.PlainExport.html
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainParser;

impl BodyParser for PlainParser {
    fn parse(&self, body: &str) -> Result<Fields> {
        let mut cursor = Cursor {
            chars: body.chars().collect(),
            pos: 0,
        };
        cursor.skip_whitespace();
        let fields = cursor.group()?;
        cursor.skip_whitespace();
        if cursor.pos != cursor.chars.len() {
            return Err(cursor.error("trailing characters after message"));
        }
        Ok(fields)
    }
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.pos += 1;
        }
    }

    fn error(&self, what: &str) -> Error {
        Error::ParsingError(format!("{} at position {}", what, self.pos))
    }

    fn expect(&mut self, c: char) -> Result<()> {
        match self.next() {
            Some(n) if n == c => Ok(()),
            _ => Err(self.error(&format!("expected '{}'", c))),
        }
    }

    fn group(&mut self) -> Result<Fields> {
        self.expect('{')?;
        let mut fields = Fields::new();
        self.skip_whitespace();
        if self.peek() == Some('}') {
            self.pos += 1;
            return Ok(fields);
        }
        loop {
            self.skip_whitespace();
            let tag = self.tag()?;
            self.skip_whitespace();
            let value = match self.peek() {
                Some('{') => FieldValue::Group(self.group()?),
                Some('"') => FieldValue::Text(self.quoted()?),
                _ => FieldValue::Text(self.bare()?),
            };
            fields.push(&tag, value);
            self.skip_whitespace();
            match self.next() {
                Some(',') => continue,
                Some('}') => return Ok(fields),
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn tag(&mut self) -> Result<String> {
        let mut tag = String::new();
        loop {
            match self.next() {
                Some('=') => break,
                Some(c) if c == ',' || c == '{' || c == '}' || c == '"' => {
                    return Err(self.error("unexpected character in tag"))
                }
                Some(c) => tag.push(c),
                None => return Err(self.error("unexpected end of message")),
            }
        }
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(self.error("empty tag"));
        }
        Ok(tag.to_string())
    }

    fn quoted(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut value = String::new();
        loop {
            match self.next() {
                Some('\\') => match self.next() {
                    Some(c) => value.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some('"') => return Ok(value),
                Some(c) => value.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn bare(&mut self) -> Result<String> {
        let mut value = String::new();
        while let Some(c) = self.peek() {
            if c == ',' || c == '}' {
                break;
            }
            value.push(c);
            self.pos += 1;
        }
        Ok(value.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportKind};

    #[test]
    fn parse_nested_message() {
        let fields = PlainParser
            .parse(r#" {method="precommit", data={remote.tag="3.14", q="say \"hi\""}, id=1} "#)
            .unwrap();
        assert_eq!(fields.text("method"), Some("precommit"));
        assert_eq!(fields.text("id"), Some("1"));
        let data = fields.group("data").unwrap();
        assert_eq!(data.text("remote.tag"), Some("3.14"));
        assert_eq!(data.text("q"), Some("say \"hi\""));
        assert_eq!(
            fields.walk(&["data".to_string()]).unwrap().len(),
            2
        );
        assert!(PlainParser.parse("{}").unwrap().is_empty());
    }

    #[test]
    fn reject_malformed_bodies() {
        assert!(PlainParser.parse("method=init").is_err());
        assert!(PlainParser.parse("{method=\"init}").is_err());
        assert!(PlainParser.parse("{method=init").is_err());
        assert!(PlainParser.parse("{=init}").is_err());
        assert!(PlainParser.parse("{a=1} x").is_err());
    }

    #[test]
    fn export_places_delimiters_between_fields() {
        let mut transport = Transport::new(TransportKind::Channel);
        transport.set_delimiter(Some(PLAIN_DELIMITER));
        transport.message_open().unwrap();
        let codec = PlainExport;
        codec.group_open(&mut transport, None).unwrap();
        codec
            .field(
                &mut transport,
                "method",
                &mut "precommit".to_string(),
                FieldMode::MatchOnly,
                true,
            )
            .unwrap();
        codec.group_open(&mut transport, Some("data")).unwrap();
        codec
            .field(
                &mut transport,
                "remote.tag",
                &mut "3.14".to_string(),
                FieldMode::MatchOnly,
                true,
            )
            .unwrap();
        codec.group_close(&mut transport).unwrap();
        codec
            .field(
                &mut transport,
                "id",
                &mut "1".to_string(),
                FieldMode::MatchOnly,
                false,
            )
            .unwrap();
        codec.group_close(&mut transport).unwrap();
        assert_eq!(
            transport.output(),
            r#"{method="precommit", data={remote.tag="3.14"}, id=1}"#
        );
    }
}
