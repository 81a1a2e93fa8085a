// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rs485-acquisition project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Register decoding
//!
//! Pure conversions from the raw bytes returned by a register transaction into
//! numeric values. A Modbus register is a 16-bit word transmitted high byte
//! first; multi-register values (32 and 64 bit) are laid out according to the
//! declared [`ByteOrder`]:
//!
//! - [`ByteOrder::Big`]: network order, most significant word and byte first.
//!   This is the native format of the field sensors and the default.
//! - [`ByteOrder::Little`]: the whole payload is least significant byte first.
//!
//! Nothing here performs I/O or keeps state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Word value used by sensors for "not configured" registers.
pub const UNCONFIGURED_SENTINEL: u16 = 0xFFFF;

/// Errors produced while decoding a register payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("insufficient data: {expected} bytes required, {actual} available")]
    InsufficientData { expected: usize, actual: usize },
    #[error("unknown data type '{0}'")]
    UnknownType(String),
    #[error("value {0} does not fit a 16-bit register word")]
    OutOfRange(String),
}

impl DecodeError {
    /// Stable identifier used in error records
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::InsufficientData { .. } => "insufficient_data",
            DecodeError::UnknownType(_) => "unknown_type",
            DecodeError::OutOfRange(_) => "out_of_range",
        }
    }
}

/// Declared type of a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Float64,
}

impl DataType {
    /// Number of payload bytes needed to decode this type
    pub fn byte_len(self) -> usize {
        match self {
            DataType::Uint16 | DataType::Int16 => 2,
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    /// Number of 16-bit registers spanned by this type
    pub fn register_count(self) -> u16 {
        (self.byte_len() / 2) as u16
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Uint16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Uint32 => "uint32",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uint16" | "u16" => Ok(DataType::Uint16),
            "int16" | "i16" => Ok(DataType::Int16),
            "uint32" | "u32" => Ok(DataType::Uint32),
            "int32" | "i32" => Ok(DataType::Int32),
            "float32" | "f32" => Ok(DataType::Float32),
            "float64" | "f64" => Ok(DataType::Float64),
            _ => Err(DecodeError::UnknownType(s.to_string())),
        }
    }
}

/// Byte order of a register payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    #[serde(alias = "big_endian")]
    Big,
    #[serde(alias = "little_endian")]
    Little,
}

/// Logical description of one register read
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterSpec {
    /// Logical name, also used as metadata key
    pub name: String,
    /// First holding register address
    pub address: u16,
    /// Number of 16-bit registers to read
    pub count: u16,
    pub data_type: DataType,
    pub byte_order: ByteOrder,
    /// Optional registers fall back to `fallback` when the read fails
    pub optional: bool,
    pub fallback: Option<f64>,
    /// Replace [`UNCONFIGURED_SENTINEL`] by this value
    pub sentinel_default: Option<u16>,
}

impl RegisterSpec {
    /// Mandatory single-register `uint16` read
    pub fn word(name: &str, address: u16) -> Self {
        Self {
            name: name.to_string(),
            address,
            count: 1,
            data_type: DataType::Uint16,
            byte_order: ByteOrder::Big,
            optional: false,
            fallback: None,
            sentinel_default: None,
        }
    }

    /// Mark the register optional with the hinted fallback value
    pub fn optional(mut self, fallback: f64) -> Self {
        self.optional = true;
        self.fallback = Some(fallback);
        self
    }

    /// Mark the register optional; a failed read leaves the value absent
    pub fn optional_without_fallback(mut self) -> Self {
        self.optional = true;
        self.fallback = None;
        self
    }

    /// Treat `0xFFFF` as "not configured" and substitute `default`
    pub fn with_sentinel_default(mut self, default: u16) -> Self {
        self.sentinel_default = Some(default);
        self
    }

    /// Decode a payload returned for this register
    pub fn decode(&self, bytes: &[u8]) -> Result<f64, DecodeError> {
        if let Some(default) = self.sentinel_default {
            if self.data_type == DataType::Uint16 {
                let word = read_word(bytes, self.byte_order)?;
                return Ok(f64::from(resolve_sentinel(word, default)));
            }
        }
        decode(bytes, self.data_type, self.byte_order)
    }
}

/// Raw bytes returned by one transaction, tagged with the register spec that produced them
#[derive(Debug, Clone, PartialEq)]
pub struct RawRegisterBlock {
    pub spec: RegisterSpec,
    pub bytes: Vec<u8>,
}

impl RawRegisterBlock {
    pub fn decode(&self) -> Result<f64, DecodeError> {
        self.spec.decode(&self.bytes)
    }
}

fn take<const N: usize>(bytes: &[u8], order: ByteOrder) -> Result<[u8; N], DecodeError> {
    if bytes.len() < N {
        return Err(DecodeError::InsufficientData {
            expected: N,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    // Normalize to big-endian so the callers only use from_be_bytes
    if order == ByteOrder::Little {
        out.reverse();
    }
    Ok(out)
}

fn read_word(bytes: &[u8], order: ByteOrder) -> Result<u16, DecodeError> {
    Ok(u16::from_be_bytes(take::<2>(bytes, order)?))
}

/// Decode `bytes` as `data_type` laid out in `byte_order`
pub fn decode(bytes: &[u8], data_type: DataType, byte_order: ByteOrder) -> Result<f64, DecodeError> {
    let value = match data_type {
        DataType::Uint16 => f64::from(u16::from_be_bytes(take::<2>(bytes, byte_order)?)),
        DataType::Int16 => f64::from(i16::from_be_bytes(take::<2>(bytes, byte_order)?)),
        DataType::Uint32 => f64::from(u32::from_be_bytes(take::<4>(bytes, byte_order)?)),
        DataType::Int32 => f64::from(i32::from_be_bytes(take::<4>(bytes, byte_order)?)),
        DataType::Float32 => f64::from(f32::from_be_bytes(take::<4>(bytes, byte_order)?)),
        DataType::Float64 => f64::from_be_bytes(take::<8>(bytes, byte_order)?),
    };
    Ok(value)
}

/// Decode a `dataType` given by name, as found in register override tables
pub fn decode_named(bytes: &[u8], data_type: &str, byte_order: ByteOrder) -> Result<f64, DecodeError> {
    decode(bytes, data_type.parse()?, byte_order)
}

/// Inverse of [`decode`]. Integer types truncate `value` toward zero and
/// saturate at the type bounds.
pub fn encode(value: f64, data_type: DataType, byte_order: ByteOrder) -> Vec<u8> {
    let mut bytes = match data_type {
        DataType::Uint16 => (value as u16).to_be_bytes().to_vec(),
        DataType::Int16 => (value as i16).to_be_bytes().to_vec(),
        DataType::Uint32 => (value as u32).to_be_bytes().to_vec(),
        DataType::Int32 => (value as i32).to_be_bytes().to_vec(),
        DataType::Float32 => (value as f32).to_be_bytes().to_vec(),
        DataType::Float64 => value.to_be_bytes().to_vec(),
    };
    if byte_order == ByteOrder::Little {
        bytes.reverse();
    }
    bytes
}

/// Compose a 32-bit value from two separately read 16-bit registers
pub fn combine_words(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

/// Substitute `default` for the "not configured" sentinel
pub fn resolve_sentinel(word: u16, default: u16) -> u16 {
    if word == UNCONFIGURED_SENTINEL {
        default
    } else {
        word
    }
}

/// Serialize register words the way they travel on the wire (high byte first)
pub fn words_to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Split a wire payload back into register words. A trailing odd byte is an error.
pub fn bytes_to_words(bytes: &[u8]) -> Result<Vec<u16>, DecodeError> {
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::InsufficientData {
            expected: bytes.len() + 1,
            actual: bytes.len(),
        });
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}
