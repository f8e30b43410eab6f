//! Typed column values and their encodings.
//!
//! Rows are serialized with bincode; primary keys get a dedicated
//! order-preserving encoding so that byte-wise key comparison in the LSM
//! agrees with typed ordering: a type-tag byte (fixing cross-type order),
//! then big-endian bytes with a sign-bit flip for integers and the IEEE
//! 754 total-order trick for floats.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// Type prefixes for key encoding. Their numeric order defines cross-type
// ordering.
const TAG_BOOLEAN: u8 = 0x01;
const TAG_INTEGER: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_TEXT: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Boolean,
    Integer,
    Float,
    Text,
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Integer => write!(f, "INTEGER"),
            DataType::Float => write!(f, "FLOAT"),
            DataType::Text => write!(f, "TEXT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn datatype(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Integer(_) => Some(DataType::Integer),
            Value::Float(_) => Some(DataType::Float),
            Value::Text(_) => Some(DataType::Text),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Order-preserving key bytes. Null is not a valid key.
    pub fn encode_key(&self) -> Result<Vec<u8>> {
        match self {
            Value::Null => Err(Error::InvalidInput(
                "NULL cannot be used as a key".to_string(),
            )),
            Value::Boolean(b) => Ok(vec![TAG_BOOLEAN, *b as u8]),
            Value::Integer(i) => {
                // Flip the sign bit so negative values sort first.
                let flipped = (*i as u64) ^ (1 << 63);
                let mut buf = Vec::with_capacity(9);
                buf.push(TAG_INTEGER);
                buf.extend_from_slice(&flipped.to_be_bytes());
                Ok(buf)
            }
            Value::Float(f) => {
                // Negative floats flip all bits, positive flip the sign
                // bit, which sorts the IEEE 754 encoding totally.
                let bits = f.to_bits();
                let ordered = if bits & (1 << 63) != 0 {
                    !bits
                } else {
                    bits | (1 << 63)
                };
                let mut buf = Vec::with_capacity(9);
                buf.push(TAG_FLOAT);
                buf.extend_from_slice(&ordered.to_be_bytes());
                Ok(buf)
            }
            Value::Text(s) => {
                let mut buf = Vec::with_capacity(1 + s.len());
                buf.push(TAG_TEXT);
                buf.extend_from_slice(s.as_bytes());
                Ok(buf)
            }
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}
