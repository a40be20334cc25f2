//! Message programs.
//!
//! A program is the ordered list of instructions describing one message.
//! The same program is encoded by the side sending the message and decoded
//! by the side receiving it, see [`Connection::client_initiated`].
//!
//! ```ignore
//! let mut request = Program::new()
//!     .initiate()
//!     .tag("method", "precommit")
//!     .open("data")
//!     .data(CacheSelector::Write)
//!     .close()
//!     .complete();
//! ```
//!
//! [`Connection::client_initiated`]: ../connection/struct.Connection.html#method.client_initiated

use gridlink_core::{Float, Int};

/// Default limit for decoded string values.
pub const DEFAULT_STRING_LIMIT: usize = 1024;

/// Cache referenced by schema and data instructions.
///
/// The selector names the cache of the encoding side. The decoding side
/// uses the opposite cache, so that a writer's values end up in the
/// reader's read cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheSelector {
    Read,
    Write,
}

impl CacheSelector {
    pub fn opposite(self) -> CacheSelector {
        match self {
            CacheSelector::Read => CacheSelector::Write,
            CacheSelector::Write => CacheSelector::Read,
        }
    }
}

/// Single step of a message program.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Marks the whole exchange as critical, must come before `Initiate`
    Critical,
    /// Starts a new message
    Initiate,
    /// Extends the current message
    Continue,
    /// Finishes the message and sends or consumes it
    Complete,
    /// Tagged value, matched on decode unless `capture` is set
    Tag {
        tag: String,
        value: String,
        capture: bool,
    },
    /// Schema description of every item in a cache
    Schema(CacheSelector),
    /// Value of every item in a cache
    Data(CacheSelector),
    String {
        tag: String,
        value: String,
        limit: usize,
    },
    Real {
        tag: String,
        value: Float,
    },
    Integer {
        tag: String,
        value: Int,
    },
    /// Opens a named nested group
    Open(String),
    /// Closes the innermost nested group
    Close,
}

impl Instruction {
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::Critical => "critical",
            Instruction::Initiate => "initiate",
            Instruction::Continue => "continue",
            Instruction::Complete => "complete",
            Instruction::Tag { .. } => "tag",
            Instruction::Schema(_) => "schema",
            Instruction::Data(_) => "data",
            Instruction::String { .. } => "string",
            Instruction::Real { .. } => "real",
            Instruction::Integer { .. } => "integer",
            Instruction::Open(_) => "open",
            Instruction::Close => "close",
        }
    }
}

/// Ordered list of instructions, built with chained calls.
///
/// Decoding stores received values back into the instructions, where they
/// can be read with the accessor methods.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    instructions: Vec<Instruction>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn critical(self) -> Self {
        self.push(Instruction::Critical)
    }

    pub fn initiate(self) -> Self {
        self.push(Instruction::Initiate)
    }

    pub fn continue_message(self) -> Self {
        self.push(Instruction::Continue)
    }

    pub fn complete(self) -> Self {
        self.push(Instruction::Complete)
    }

    /// Tag that has to carry `value` on the receiving side.
    pub fn tag(self, tag: &str, value: &str) -> Self {
        self.push(Instruction::Tag {
            tag: tag.to_string(),
            value: value.to_string(),
            capture: false,
        })
    }

    /// Tag whose received value is stored.
    pub fn capture(self, tag: &str) -> Self {
        self.push(Instruction::Tag {
            tag: tag.to_string(),
            value: String::new(),
            capture: true,
        })
    }

    pub fn schema(self, cache: CacheSelector) -> Self {
        self.push(Instruction::Schema(cache))
    }

    pub fn data(self, cache: CacheSelector) -> Self {
        self.push(Instruction::Data(cache))
    }

    pub fn string(self, tag: &str, value: &str) -> Self {
        self.push(Instruction::String {
            tag: tag.to_string(),
            value: value.to_string(),
            limit: DEFAULT_STRING_LIMIT,
        })
    }

    pub fn real(self, tag: &str, value: Float) -> Self {
        self.push(Instruction::Real {
            tag: tag.to_string(),
            value,
        })
    }

    pub fn integer(self, tag: &str, value: Int) -> Self {
        self.push(Instruction::Integer {
            tag: tag.to_string(),
            value,
        })
    }

    pub fn open(self, name: &str) -> Self {
        self.push(Instruction::Open(name.to_string()))
    }

    pub fn close(self) -> Self {
        self.push(Instruction::Close)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn instructions_mut(&mut self) -> &mut [Instruction] {
        &mut self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn is_critical(&self) -> bool {
        self.instructions.contains(&Instruction::Critical)
    }

    /// Value of the first tag or string instruction with the given tag.
    pub fn text(&self, tag: &str) -> Option<&str> {
        self.instructions.iter().find_map(|i| match i {
            Instruction::Tag { tag: t, value, .. } | Instruction::String { tag: t, value, .. }
                if t == tag =>
            {
                Some(value.as_str())
            }
            _ => None,
        })
    }

    pub fn real_value(&self, tag: &str) -> Option<Float> {
        self.instructions.iter().find_map(|i| match i {
            Instruction::Real { tag: t, value } if t == tag => Some(*value),
            _ => None,
        })
    }

    pub fn integer_value(&self, tag: &str) -> Option<Int> {
        self.instructions.iter().find_map(|i| match i {
            Instruction::Integer { tag: t, value } if t == tag => Some(*value),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_order() {
        let program = Program::new()
            .critical()
            .initiate()
            .tag("method", "init")
            .open("params")
            .string("application", "gridlink")
            .real("version", 1.5)
            .integer("count", 3)
            .close()
            .complete();
        assert_eq!(program.len(), 9);
        assert!(program.is_critical());
        assert_eq!(program.instructions()[1], Instruction::Initiate);
        assert_eq!(program.text("method"), Some("init"));
        assert_eq!(program.text("application"), Some("gridlink"));
        assert_eq!(program.real_value("version"), Some(1.5));
        assert_eq!(program.integer_value("count"), Some(3));
        assert_eq!(program.text("missing"), None);
    }

    #[test]
    fn selectors_flip() {
        assert_eq!(CacheSelector::Read.opposite(), CacheSelector::Write);
        assert_eq!(CacheSelector::Write.opposite(), CacheSelector::Read);
    }
}
