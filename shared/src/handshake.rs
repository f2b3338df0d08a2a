//! Handshake structure and its fixed binary layout
//!
//! Every PLC command exposes a small handshake structure used to coordinate
//! one invocation:
//! ```text
//! offset 0  bExecute    BOOL  (u8)
//! offset 1  bBusy       BOOL  (u8)
//! offset 2  nResultCode UINT  (u16, little-endian)
//! offset 4  nProgress   USINT (u8, 0..=100)
//! offset 5  nSubTask    UINT  (u16, little-endian)
//! offset 7  padding
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::result_code::ResultCode;

/// Size of the handshake structure on the controller
pub const HANDSHAKE_SIZE: usize = 8;

/// Bytes that carry data; the last byte is alignment padding
const HANDSHAKE_PAYLOAD: usize = 7;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Not enough data: need {needed} bytes, have {available}")]
    NotEnoughData { needed: usize, available: usize },

    #[error("Progress out of range: {0} (max: 100)")]
    ProgressOutOfRange(u8),
}

/// Immutable snapshot of a command handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeSnapshot {
    pub execute: bool,
    pub busy: bool,
    pub result_code: u16,
    pub progress: u8,
    pub sub_task: u16,
}

impl HandshakeSnapshot {
    /// Handshake of a command that is neither requested nor running
    pub fn idle() -> Self {
        Self::default()
    }

    /// Handshake of a running command at the given progress
    pub fn running(progress: u8) -> Self {
        Self {
            execute: true,
            busy: true,
            result_code: ResultCode::Running.code(),
            progress,
            sub_task: 0,
        }
    }

    /// Handshake of a command that finished with the given result code
    pub fn finished(result_code: u16) -> Self {
        Self {
            execute: false,
            busy: false,
            result_code,
            progress: 100,
            sub_task: 0,
        }
    }

    pub fn with_sub_task(mut self, sub_task: u16) -> Self {
        self.sub_task = sub_task;
        self
    }

    /// The controller has released the command
    pub fn is_finished(&self) -> bool {
        !self.execute && !self.busy
    }

    /// The controller aborted the command, or acknowledged a cancel request
    pub fn is_cancelled_by_plc(&self) -> bool {
        (!self.execute && self.busy) || self.result_code == ResultCode::Cancelled.code()
    }

    /// Finished or cancelled; the wait for this invocation is over
    pub fn is_terminal(&self) -> bool {
        self.is_finished() || self.is_cancelled_by_plc()
    }

    /// Encode into the controller layout
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_SIZE);
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode directly into a provided buffer
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        if self.progress > 100 {
            return Err(CodecError::ProgressOutOfRange(self.progress));
        }

        buf.reserve(HANDSHAKE_SIZE);
        buf.put_u8(self.execute as u8);
        buf.put_u8(self.busy as u8);
        buf.put_u16_le(self.result_code);
        buf.put_u8(self.progress);
        buf.put_u16_le(self.sub_task);
        buf.put_u8(0);

        Ok(())
    }

    /// Decode from the controller layout
    ///
    /// The padding byte is optional. Progress values above 100 are clamped,
    /// since they only ever come from a misbehaving controller program and
    /// the terminal flags are still meaningful.
    pub fn decode(mut raw: &[u8]) -> Result<Self, CodecError> {
        if raw.len() < HANDSHAKE_PAYLOAD {
            return Err(CodecError::NotEnoughData {
                needed: HANDSHAKE_PAYLOAD,
                available: raw.len(),
            });
        }

        let execute = raw.get_u8() != 0;
        let busy = raw.get_u8() != 0;
        let result_code = raw.get_u16_le();
        let progress = raw.get_u8().min(100);
        let sub_task = raw.get_u16_le();

        Ok(Self {
            execute,
            busy,
            result_code,
            progress,
            sub_task,
        })
    }
}

/// One handshake change as delivered by a device notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandChangeEvent {
    pub timestamp: DateTime<Utc>,
    pub handshake: HandshakeSnapshot,
}

impl CommandChangeEvent {
    pub fn new(timestamp: DateTime<Utc>, handshake: HandshakeSnapshot) -> Self {
        Self {
            timestamp,
            handshake,
        }
    }

    /// Decode a raw notification payload
    pub fn from_raw(timestamp: DateTime<Utc>, raw: &[u8]) -> Result<Self, CodecError> {
        Ok(Self::new(timestamp, HandshakeSnapshot::decode(raw)?))
    }
}
