//! Argument transfer between caller and controller memory

use crate::connection::{ConnectionError, DeviceConnection};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use plc_command_shared::symbols;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArgumentError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Type mismatch for {symbol}: expected {expected} bytes, got {actual}")]
    TypeMismatch {
        symbol: String,
        expected: usize,
        actual: usize,
    },

    #[error("String argument {0} is not valid UTF-8")]
    InvalidString(String),

    #[error("Missing argument: {0}")]
    Missing(String),
}

/// Value of a single command argument
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentValue {
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Real32(f32),
    Real64(f64),
    String(String),
}

impl ArgumentValue {
    /// Encode as the controller stores it (little-endian, NUL-terminated strings)
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8);
        match self {
            ArgumentValue::Bool(v) => buf.put_u8(*v as u8),
            ArgumentValue::Int16(v) => buf.put_i16_le(*v),
            ArgumentValue::UInt16(v) => buf.put_u16_le(*v),
            ArgumentValue::Int32(v) => buf.put_i32_le(*v),
            ArgumentValue::UInt32(v) => buf.put_u32_le(*v),
            ArgumentValue::Real32(v) => buf.put_f32_le(*v),
            ArgumentValue::Real64(v) => buf.put_f64_le(*v),
            ArgumentValue::String(s) => {
                buf.put_slice(s.as_bytes());
                buf.put_u8(0);
            }
        }
        buf.freeze()
    }

    /// Size of the encoded value; `None` for strings
    fn fixed_size(&self) -> Option<usize> {
        match self {
            ArgumentValue::Bool(_) => Some(1),
            ArgumentValue::Int16(_) | ArgumentValue::UInt16(_) => Some(2),
            ArgumentValue::Int32(_) | ArgumentValue::UInt32(_) | ArgumentValue::Real32(_) => {
                Some(4)
            }
            ArgumentValue::Real64(_) => Some(8),
            ArgumentValue::String(_) => None,
        }
    }

    /// Decode raw bytes into a value of the same type as `self`
    pub fn decode_like(&self, symbol: &str, mut raw: &[u8]) -> Result<Self, ArgumentError> {
        if let Some(size) = self.fixed_size() {
            if raw.len() != size {
                return Err(ArgumentError::TypeMismatch {
                    symbol: symbol.to_string(),
                    expected: size,
                    actual: raw.len(),
                });
            }
        }

        let value = match self {
            ArgumentValue::Bool(_) => ArgumentValue::Bool(raw.get_u8() != 0),
            ArgumentValue::Int16(_) => ArgumentValue::Int16(raw.get_i16_le()),
            ArgumentValue::UInt16(_) => ArgumentValue::UInt16(raw.get_u16_le()),
            ArgumentValue::Int32(_) => ArgumentValue::Int32(raw.get_i32_le()),
            ArgumentValue::UInt32(_) => ArgumentValue::UInt32(raw.get_u32_le()),
            ArgumentValue::Real32(_) => ArgumentValue::Real32(raw.get_f32_le()),
            ArgumentValue::Real64(_) => ArgumentValue::Real64(raw.get_f64_le()),
            ArgumentValue::String(_) => {
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                let text = std::str::from_utf8(&raw[..end])
                    .map_err(|_| ArgumentError::InvalidString(symbol.to_string()))?;
                ArgumentValue::String(text.to_string())
            }
        };
        Ok(value)
    }
}

/// Ordered, named command arguments
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandArguments {
    entries: Vec<(String, ArgumentValue)>,
}

impl CommandArguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument (builder style)
    pub fn with(mut self, name: impl Into<String>, value: ArgumentValue) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or replace an argument, keeping its original position
    pub fn set(&mut self, name: impl Into<String>, value: ArgumentValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ArgumentValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value)
    }

    /// Get an argument or fail with `ArgumentError::Missing`
    pub fn require(&self, name: &str) -> Result<&ArgumentValue, ArgumentError> {
        self.get(name)
            .ok_or_else(|| ArgumentError::Missing(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgumentValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Moves command arguments into and out of controller memory
#[async_trait]
pub trait ArgumentHandler: Send + Sync {
    /// Write all input values before the command is armed
    async fn write_input(&self, command_path: &str, input: &CommandArguments) -> Result<(), ArgumentError>;

    /// Read output values after successful completion; `output` names the
    /// arguments to read and their types, and is filled in place
    async fn read_output(&self, command_path: &str, output: &mut CommandArguments) -> Result<(), ArgumentError>;
}

/// Reads and writes each argument as its own symbol below the command
/// (`<path>.stInput.<name>` / `<path>.stOutput.<name>`)
pub struct SymbolArgumentHandler {
    connection: Arc<dyn DeviceConnection>,
}

impl SymbolArgumentHandler {
    pub fn new(connection: Arc<dyn DeviceConnection>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ArgumentHandler for SymbolArgumentHandler {
    async fn write_input(&self, command_path: &str, input: &CommandArguments) -> Result<(), ArgumentError> {
        for (name, value) in input.iter() {
            let symbol = symbols::input(command_path, name);
            debug!("[ARGS] {} <- {:?}", symbol, value);
            self.connection.write_value(&symbol, value.encode()).await?;
        }
        Ok(())
    }

    async fn read_output(&self, command_path: &str, output: &mut CommandArguments) -> Result<(), ArgumentError> {
        for (name, template) in output.entries.iter_mut() {
            let symbol = symbols::output(command_path, name);
            let raw = self.connection.read_value(&symbol).await?;
            *template = template.decode_like(&symbol, &raw)?;
            debug!("[ARGS] {} -> {:?}", symbol, template);
        }
        Ok(())
    }
}
