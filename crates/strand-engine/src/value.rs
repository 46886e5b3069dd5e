//! Runtime values of interpreted programs.

use crate::channel::Channel;
use crate::fiber::Fiber;
use std::fmt;
use std::sync::Arc;

/// A dynamically typed value held in an interpreter register.
///
/// `Int`, `Float`, and `Bool` occupy primitive stack slots; everything else
/// is saved as a reference.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absent value
    #[default]
    Null,
    /// 64-bit integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// Boolean
    Bool(bool),
    /// Immutable string
    Str(Arc<str>),
    /// Method reference, the target of dynamic calls and spawns
    Method(Arc<str>),
    /// Channel carrying values
    Channel(Channel<Value>),
    /// Fiber handle
    Fiber(Fiber),
}

impl Value {
    /// Integer payload
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float payload (integers widen)
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Channel payload
    pub fn as_channel(&self) -> Option<&Channel<Value>> {
        match self {
            Value::Channel(ch) => Some(ch),
            _ => None,
        }
    }

    /// Fiber payload
    pub fn as_fiber(&self) -> Option<&Fiber> {
        match self {
            Value::Fiber(f) => Some(f),
            _ => None,
        }
    }

    /// Whether this is `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness used by conditional branches
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            _ => true,
        }
    }

    /// Short type name for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Method(_) => "method",
            Value::Channel(_) => "channel",
            Value::Fiber(_) => "fiber",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Method(a), Value::Method(b)) => a == b,
            (Value::Channel(a), Value::Channel(b)) => a.same_channel(b),
            (Value::Fiber(a), Value::Fiber(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::Method(m) => write!(f, "<method {}>", m),
            Value::Channel(ch) => write!(f, "<channel len={}>", ch.len()),
            Value::Fiber(fiber) => write!(f, "<fiber {}>", fiber.id()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(Arc::from(v))
    }
}

impl From<Channel<Value>> for Value {
    fn from(ch: Channel<Value>) -> Self {
        Value::Channel(ch)
    }
}

impl From<Fiber> for Value {
    fn from(fiber: Fiber) -> Self {
        Value::Fiber(fiber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(3).is_truthy());
        assert!(Value::from("x").is_truthy());
    }

    #[test]
    fn test_equality_and_display() {
        assert_eq!(Value::from(4_i64), Value::Int(4));
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::from("hi").to_string(), "hi");
        assert_eq!(Value::Float(2.5).as_float(), Some(2.5));
        assert_eq!(Value::Int(2).as_float(), Some(2.0));
    }
}
