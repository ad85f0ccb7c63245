//! Host-side values exchanged with backends

use std::sync::Arc;

/// A host value crossing the FFI boundary
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Raw address
    Pointer(usize),
    /// Byte string; char arrays and `char *` arguments
    Bytes(Vec<u8>),
    /// Array items or struct fields in declaration order
    List(Vec<Value>),
}

/// A host function that native code can call through a callback trampoline
pub type HostCallable = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

impl Value {
    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    /// Integer view of numeric and pointer values
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            Value::Pointer(p) => i64::try_from(p).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::Int(v) => u64::try_from(v).ok(),
            Value::UInt(v) => Some(v),
            Value::Pointer(p) => Some(p as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(v) => Some(v),
            Value::Int(v) => Some(v as f64),
            Value::UInt(v) => Some(v as f64),
            _ => None,
        }
    }

    /// Address for pointer-like values; integers are accepted as addresses
    pub fn as_address(&self) -> Option<usize> {
        match *self {
            Value::Pointer(p) => Some(p),
            Value::Int(v) => usize::try_from(v).ok(),
            Value::UInt(v) => usize::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Short description used in error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Void => "void",
            Value::Int(_) => "integer",
            Value::UInt(_) => "unsigned integer",
            Value::Float(_) => "float",
            Value::Pointer(_) => "pointer",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(v as u64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(v.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_views() {
        assert_eq!(Value::Int(-1).as_u64(), None);
        assert_eq!(Value::UInt(u64::MAX).as_i64(), None);
        assert_eq!(Value::Pointer(16).as_i64(), Some(16));
        assert_eq!(Value::Int(3).as_f64(), Some(3.0));
        assert_eq!(Value::Float(1.5).as_i64(), None);
        assert_eq!(Value::Int(-4).as_address(), None);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Value::from("hi"), Value::Bytes(b"hi".to_vec()));
        assert_eq!(Value::from(true), Value::Int(1));
        assert_eq!(
            Value::from(vec![Value::from(1), Value::from(2u32)]),
            Value::List(vec![Value::Int(1), Value::UInt(2)])
        );
    }
}
