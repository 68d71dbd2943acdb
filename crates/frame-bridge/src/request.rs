//! Decoded host requests.
//!
//! A host dispatch layer hands over a method name plus named arguments;
//! [`Request::parse`] turns that into one of the two operations the bridge
//! understands.

use std::collections::BTreeMap;

use crate::error::{BridgeError, BridgeResult};
use crate::registry::TextureId;

/// A decoded argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// A named call with its arguments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodCall {
    pub method: String,
    pub args: BTreeMap<String, Value>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    fn int(&self, name: &str) -> BridgeResult<i64> {
        match self.args.get(name) {
            Some(Value::Int(v)) => Ok(*v),
            Some(other) => Err(BridgeError::validation(format!(
                "'{name}' must be an int, got {}",
                other.kind()
            ))),
            None => Err(BridgeError::validation(format!("'{name}' is required"))),
        }
    }

    fn dimension(&self, name: &str) -> BridgeResult<u32> {
        let v = self.int(name)?;
        match u32::try_from(v) {
            Ok(d) if d > 0 => Ok(d),
            _ => Err(BridgeError::validation(format!(
                "'{name}' must be a positive 32-bit size, got {v}"
            ))),
        }
    }

    fn bytes(&self, name: &str) -> BridgeResult<&[u8]> {
        match self.args.get(name) {
            Some(Value::Bytes(v)) => Ok(v),
            Some(other) => Err(BridgeError::validation(format!(
                "'{name}' must be bytes, got {}",
                other.kind()
            ))),
            None => Err(BridgeError::validation(format!("'{name}' is required"))),
        }
    }
}

/// An operation the bridge executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Create { width: u32, height: u32 },
    Render { id: TextureId, data: &'a [u8] },
}

impl<'a> Request<'a> {
    pub const CREATE: &'static str = "create";
    pub const RENDER: &'static str = "render";

    /// Decode `call`. Unknown method names are
    /// [`BridgeError::UnsupportedOperation`]; bad arguments are
    /// [`BridgeError::Validation`].
    pub fn parse(call: &'a MethodCall) -> BridgeResult<Self> {
        match call.method.as_str() {
            Self::CREATE => Ok(Request::Create {
                width: call.dimension("width")?,
                height: call.dimension("height")?,
            }),
            Self::RENDER => Ok(Request::Render {
                id: TextureId(call.int("id")?),
                data: call.bytes("data")?,
            }),
            other => Err(BridgeError::unsupported(other)),
        }
    }
}

/// Result payload of a successful request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    TextureId(TextureId),
    Empty,
}
