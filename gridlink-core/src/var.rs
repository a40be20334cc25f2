//! Value types and their transformations.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::{Float, Int};

// default sizes for base value types, in bytes
const FLOAT_VALUE_SIZE: usize = 8;
const INT_VALUE_SIZE: usize = 8;
const COMPLEX_VALUE_SIZE: usize = 16;
/// Default declared size of string properties.
pub const DEFAULT_STRING_SIZE: usize = 1024;

const FLOAT_TYPE_NAME: &str = "double";
const FLOAT_TYPE_NAME_ALT: &str = "float";
const FLOAT_TYPE_NAME_ALT2: &str = "real";
const INT_TYPE_NAME: &str = "int64";
const INT_TYPE_NAME_ALT: &str = "int";
const INT_TYPE_NAME_ALT2: &str = "integer";
const COMPLEX_TYPE_NAME: &str = "complex";
const STRING_TYPE_NAME: &str = "string";
const STRING_TYPE_NAME_ALT: &str = "str";
const STRING_TYPE_NAME_ALT2: &str = "char1024";

/// Defines all possible types of property values.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ValueKind {
    Float,
    Int,
    Complex,
    String,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> std::result::Result<(), fmt::Error> {
        write!(formatter, "{}", self.to_str())
    }
}

impl FromStr for ValueKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<ValueKind> {
        let kind = match s.to_lowercase().as_str() {
            FLOAT_TYPE_NAME | FLOAT_TYPE_NAME_ALT | FLOAT_TYPE_NAME_ALT2 => ValueKind::Float,
            INT_TYPE_NAME | INT_TYPE_NAME_ALT | INT_TYPE_NAME_ALT2 => ValueKind::Int,
            COMPLEX_TYPE_NAME => ValueKind::Complex,
            STRING_TYPE_NAME | STRING_TYPE_NAME_ALT | STRING_TYPE_NAME_ALT2 => ValueKind::String,
            _ => return Err(Error::InvalidValueKind(s.to_string())),
        };
        Ok(kind)
    }
}

impl ValueKind {
    /// Returns the canonical type name, as used in schema descriptions.
    pub fn to_str(&self) -> &'static str {
        match self {
            ValueKind::Float => FLOAT_TYPE_NAME,
            ValueKind::Int => INT_TYPE_NAME,
            ValueKind::Complex => COMPLEX_TYPE_NAME,
            ValueKind::String => STRING_TYPE_NAME,
        }
    }

    /// Declared storage size of a value of this kind.
    pub fn size(&self) -> usize {
        match self {
            ValueKind::Float => FLOAT_VALUE_SIZE,
            ValueKind::Int => INT_VALUE_SIZE,
            ValueKind::Complex => COMPLEX_VALUE_SIZE,
            ValueKind::String => DEFAULT_STRING_SIZE,
        }
    }

    /// Default value for the kind.
    pub fn default_value(&self) -> Value {
        match self {
            ValueKind::Float => Value::Float(0.),
            ValueKind::Int => Value::Int(0),
            ValueKind::Complex => Value::Complex(Complex::default()),
            ValueKind::String => Value::String(String::new()),
        }
    }
}

/// Complex number in rectangular form.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Complex {
    pub re: Float,
    pub im: Float,
}

impl Complex {
    pub fn new(re: Float, im: Float) -> Self {
        Complex { re, im }
    }

    pub fn magnitude(&self) -> Float {
        self.re.hypot(self.im)
    }
}

impl fmt::Display for Complex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:+}j", self.re, self.im)
    }
}

impl FromStr for Complex {
    type Err = Error;
    /// Accepts `a+bj`, `a-bi`, `bj` and plain `a`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || Error::InvalidValue {
            kind: COMPLEX_TYPE_NAME.to_string(),
            value: s.to_string(),
        };
        let body = match s.strip_suffix(|c| c == 'j' || c == 'i') {
            Some(b) => b,
            None => return Ok(Complex::new(s.parse().map_err(|_| invalid())?, 0.)),
        };
        // split on the last sign that isn't part of an exponent
        let bytes = body.as_bytes();
        let split = (1..bytes.len())
            .rev()
            .find(|&i| {
                (bytes[i] == b'+' || bytes[i] == b'-')
                    && bytes[i - 1] != b'e'
                    && bytes[i - 1] != b'E'
            });
        match split {
            Some(i) => {
                let re = body[..i].trim().parse().map_err(|_| invalid())?;
                let im = match body[i..].trim() {
                    "+" => 1.,
                    "-" => -1.,
                    v => v.parse().map_err(|_| invalid())?,
                };
                Ok(Complex::new(re, im))
            }
            None => {
                let im = match body {
                    "" | "+" => 1.,
                    "-" => -1.,
                    v => v.parse().map_err(|_| invalid())?,
                };
                Ok(Complex::new(0., im))
            }
        }
    }
}

/// Typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(Float),
    Int(Int),
    Complex(Complex),
    String(String),
}

impl Value {
    /// Parses a value of the given kind from its textual form.
    pub fn parse(kind: ValueKind, s: &str) -> Result<Value> {
        let invalid = || Error::InvalidValue {
            kind: kind.to_string(),
            value: s.to_string(),
        };
        let value = match kind {
            ValueKind::Float => Value::Float(s.trim().parse().map_err(|_| invalid())?),
            ValueKind::Int => Value::Int(s.trim().parse().map_err(|_| invalid())?),
            ValueKind::Complex => Value::Complex(s.parse()?),
            ValueKind::String => Value::String(s.to_string()),
        };
        Ok(value)
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Float(_) => ValueKind::Float,
            Value::Int(_) => ValueKind::Int,
            Value::Complex(_) => ValueKind::Complex,
            Value::String(_) => ValueKind::String,
        }
    }

    /// Numeric distance between two values of the same kind.
    ///
    /// Complex values are compared by magnitude. Strings and values of
    /// differing kinds have no distance.
    pub fn distance(&self, other: &Value) -> Option<Float> {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => Some((a - b).abs()),
            (Value::Int(a), Value::Int(b)) => Some((*a as Float - *b as Float).abs()),
            (Value::Complex(a), Value::Complex(b)) => {
                Some((a.magnitude() - b.magnitude()).abs())
            }
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Complex(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
        }
    }
}

#[test]
fn complex_from_str() {
    assert_eq!(Complex::from_str("1+2j").unwrap(), Complex::new(1., 2.));
    assert_eq!(Complex::from_str("-1.5-0.5i").unwrap(), Complex::new(-1.5, -0.5));
    assert_eq!(Complex::from_str("1e-3+2e+1j").unwrap(), Complex::new(0.001, 20.));
    assert_eq!(Complex::from_str("4j").unwrap(), Complex::new(0., 4.));
    assert_eq!(Complex::from_str("7.25").unwrap(), Complex::new(7.25, 0.));
    assert!(Complex::from_str("abc").is_err());
}

#[test]
fn complex_display_parses_back() {
    let c = Complex::new(120.5, -3.25);
    assert_eq!(c.to_string(), "120.5-3.25j");
    assert_eq!(Complex::from_str(&c.to_string()).unwrap(), c);
    assert_eq!(Complex::new(3., 4.).magnitude(), 5.);
}

#[test]
fn value_kind_aliases() {
    assert_eq!(ValueKind::from_str("double").unwrap(), ValueKind::Float);
    assert_eq!(ValueKind::from_str("INT").unwrap(), ValueKind::Int);
    assert_eq!(ValueKind::from_str("char1024").unwrap(), ValueKind::String);
    assert!(ValueKind::from_str("enumeration").is_err());
}

#[test]
fn value_distance() {
    let a = Value::parse(ValueKind::Float, "1.5").unwrap();
    let b = Value::parse(ValueKind::Float, " 2.0 ").unwrap();
    assert_eq!(a.distance(&b), Some(0.5));
    let c = Value::parse(ValueKind::Complex, "3+4j").unwrap();
    let d = Value::parse(ValueKind::Complex, "0+1j").unwrap();
    assert_eq!(c.distance(&d), Some(4.));
    assert_eq!(a.distance(&c), None);
    assert!(Value::parse(ValueKind::Int, "1.5").is_err());
}
