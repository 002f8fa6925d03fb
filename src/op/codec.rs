//! Payload codec registry
//!
//! Maps operation codes to the routines that encode and decode their
//! payloads. A record's payload is decoded with the same codec that was used
//! to encode it, selected by the op code stored next to it.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::AtlasError;

use super::{Compensation, Payload};

/// Operation code stored in every log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpCode(pub u16);

impl OpCode {
    pub const NONE: OpCode = OpCode(0);
    pub const UPDATE: OpCode = OpCode(1);
    pub const ALLOCATE: OpCode = OpCode(2);
    pub const DEALLOCATE: OpCode = OpCode(3);
    pub const COMPENSATION: OpCode = OpCode(0x40);
    pub const CHECKPOINT: OpCode = OpCode(0x41);
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            OpCode::NONE => "none",
            OpCode::UPDATE => "update",
            OpCode::ALLOCATE => "allocate",
            OpCode::DEALLOCATE => "deallocate",
            OpCode::COMPENSATION => "compensation",
            OpCode::CHECKPOINT => "checkpoint",
            _ => return write!(f, "op#{}", self.0),
        };
        f.write_str(name)
    }
}

/// Encode/decode routines for one operation code
#[derive(Clone, Copy)]
pub struct PayloadCodec {
    pub encode: fn(&Payload) -> Result<Vec<u8>>,
    pub decode: fn(&[u8]) -> Result<Payload>,
}

/// Registry of payload codecs keyed by operation code
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<OpCode, PayloadCodec>,
}

impl CodecRegistry {
    /// Registry with no codecs at all
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with the codecs for every built-in payload
    pub fn builtin() -> Self {
        let mut registry = Self::empty();

        let operation = PayloadCodec {
            encode: encode_operation,
            decode: decode_operation,
        };
        registry.register(OpCode::UPDATE, operation);
        registry.register(OpCode::ALLOCATE, operation);
        registry.register(OpCode::DEALLOCATE, operation);

        registry.register(
            OpCode::COMPENSATION,
            PayloadCodec {
                encode: encode_compensation,
                decode: decode_compensation,
            },
        );
        registry.register(
            OpCode::CHECKPOINT,
            PayloadCodec {
                encode: encode_checkpoint,
                decode: decode_checkpoint,
            },
        );
        registry.register(
            OpCode::NONE,
            PayloadCodec {
                encode: encode_empty,
                decode: decode_empty,
            },
        );

        registry
    }

    /// Add or replace the codec for `code`
    pub fn register(&mut self, code: OpCode, codec: PayloadCodec) {
        self.codecs.insert(code, codec);
    }

    pub fn contains(&self, code: OpCode) -> bool {
        self.codecs.contains_key(&code)
    }

    /// Encode a payload, returning the op code it must be stored under
    pub fn encode(&self, payload: &Payload) -> Result<(OpCode, Vec<u8>)> {
        let code = payload.op_code();
        let codec = self.lookup(code)?;
        Ok((code, (codec.encode)(payload)?))
    }

    /// Decode a payload stored under `code`
    pub fn decode(&self, code: OpCode, bytes: &[u8]) -> Result<Payload> {
        let codec = self.lookup(code)?;
        let payload = (codec.decode)(bytes)?;

        if payload.op_code() != code {
            return Err(AtlasError::Serialization(format!(
                "payload decoded as {} but was stored as {}",
                payload.op_code(),
                code
            )));
        }
        Ok(payload)
    }

    fn lookup(&self, code: OpCode) -> Result<&PayloadCodec> {
        self.codecs
            .get(&code)
            .ok_or(AtlasError::UnknownOpCode(code.0))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn mismatch(expected: &str, payload: &Payload) -> AtlasError {
    AtlasError::Serialization(format!(
        "{} codec cannot encode a {} payload",
        expected,
        payload.op_code()
    ))
}

fn encode_operation(payload: &Payload) -> Result<Vec<u8>> {
    match payload {
        Payload::Operation(op) => Ok(bincode::serialize(op)?),
        other => Err(mismatch("operation", other)),
    }
}

fn decode_operation(bytes: &[u8]) -> Result<Payload> {
    Ok(Payload::Operation(bincode::deserialize(bytes)?))
}

fn encode_compensation(payload: &Payload) -> Result<Vec<u8>> {
    match payload {
        Payload::Compensation(clr) => clr.encode(),
        other => Err(mismatch("compensation", other)),
    }
}

fn decode_compensation(bytes: &[u8]) -> Result<Payload> {
    Ok(Payload::Compensation(Compensation::decode(bytes)?))
}

fn encode_checkpoint(payload: &Payload) -> Result<Vec<u8>> {
    match payload {
        Payload::Checkpoint(data) => Ok(bincode::serialize(data)?),
        other => Err(mismatch("checkpoint", other)),
    }
}

fn decode_checkpoint(bytes: &[u8]) -> Result<Payload> {
    Ok(Payload::Checkpoint(bincode::deserialize(bytes)?))
}

fn encode_empty(payload: &Payload) -> Result<Vec<u8>> {
    match payload {
        Payload::Empty => Ok(Vec::new()),
        other => Err(mismatch("empty", other)),
    }
}

fn decode_empty(_bytes: &[u8]) -> Result<Payload> {
    Ok(Payload::Empty)
}
