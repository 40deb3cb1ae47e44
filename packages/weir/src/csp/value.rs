// the channel value domain.

use super::chan::Chan;
use std::{
    any::Any,
    fmt::{self, Debug, Formatter},
    rc::Rc,
};

/// A value travelling through a channel
///
/// The domain is scalars, opaque structured values, other channels (enabling
/// channel-of-channels), and the CLOSED sentinel. Cloning is cheap: strings
/// and objects are reference-counted, channels are handles.
#[derive(Clone)]
pub enum Value {
    /// The CLOSED sentinel, delivered to takes on a closed, drained channel
    Closed,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    /// An opaque structured value
    Obj(Rc<dyn Any>),
    /// Another channel; the queue flattens these on take
    Chan(Chan),
}

impl Value {
    /// Whether this is the CLOSED sentinel.
    pub fn is_closed(&self) -> bool {
        matches!(self, Value::Closed)
    }

    /// The inner channel, if this value is one.
    pub fn as_chan(&self) -> Option<&Chan> {
        match self {
            Value::Chan(ch) => Some(ch),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Closed, Value::Closed) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            // opaque values compare by identity
            (Value::Obj(a), Value::Obj(b)) => Rc::ptr_eq(a, b),
            (Value::Chan(a), Value::Chan(b)) => a == b,
            _ => false,
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Value::Closed => write!(f, "Closed"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Float(x) => write!(f, "Float({})", x),
            Value::Str(s) => write!(f, "Str({:?})", s),
            Value::Obj(_) => write!(f, "Obj(..)"),
            Value::Chan(ch) => write!(f, "Chan(#{})", ch.id()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s.into())
    }
}

impl From<Chan> for Value {
    fn from(ch: Chan) -> Self {
        Value::Chan(ch)
    }
}
