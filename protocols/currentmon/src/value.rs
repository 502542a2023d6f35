// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Dynamic CBOR items.
//!
//! Command payloads and responses are CBOR maps with text keys whose value
//! set varies by command, and pass-through ports must preserve fields the
//! driver does not know about. The firmware emits definite-length items
//! only, so indefinite lengths are rejected.

use super::*;

use minicbor::{data::Type, decode, encode, Decode, Decoder, Encode, Encoder};

/// A dynamic CBOR item.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    /// Serialize the item to CBOR bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        self.encode(&mut e, &mut ())
            .map_err(|err| Error::CborEncode(err.to_string()))?;
        Ok(buf)
    }

    /// Deserialize one item from CBOR bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Value, Error> {
        Ok(minicbor::decode(data)?)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Numeric view accepting both integer and floating point items.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<'b, C> Decode<'b, C> for Value {
    fn decode(d: &mut Decoder<'b>, ctx: &mut C) -> Result<Self, decode::Error> {
        match d.datatype()? {
            Type::Bool => Ok(Value::Bool(d.bool()?)),
            Type::Null => {
                d.null()?;
                Ok(Value::Null)
            }
            Type::Undefined => {
                d.undefined()?;
                Ok(Value::Null)
            }
            Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
                let v = d.u64()?;
                i64::try_from(v)
                    .map(Value::Int)
                    .map_err(|_| decode::Error::message("unsigned item exceeds i64 range"))
            }
            Type::I8 | Type::I16 | Type::I32 | Type::I64 => Ok(Value::Int(d.i64()?)),
            Type::F32 => Ok(Value::Float(f64::from(d.f32()?))),
            Type::F64 => Ok(Value::Float(d.f64()?)),
            Type::Bytes => Ok(Value::Bytes(d.bytes()?.to_vec())),
            Type::String => Ok(Value::Text(d.str()?.to_owned())),
            Type::Array => {
                let len = d
                    .array()?
                    .ok_or_else(|| decode::Error::message("indefinite length array"))?;
                let mut items = Vec::with_capacity(len.min(1024) as usize);
                for _ in 0..len {
                    items.push(Self::decode(d, ctx)?);
                }
                Ok(Value::Array(items))
            }
            Type::Map => {
                let len = d
                    .map()?
                    .ok_or_else(|| decode::Error::message("indefinite length map"))?;
                let mut entries = Vec::with_capacity(len.min(1024) as usize);
                for _ in 0..len {
                    let key = d.str()?.to_owned();
                    entries.push((key, Self::decode(d, ctx)?));
                }
                Ok(Value::Map(entries))
            }
            Type::Tag => {
                d.tag()?;
                Self::decode(d, ctx)
            }
            _ => Err(decode::Error::message("unsupported CBOR item")),
        }
    }
}

impl<C> Encode<C> for Value {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        ctx: &mut C,
    ) -> Result<(), encode::Error<W::Error>> {
        match self {
            Value::Null => {
                e.null()?;
            }
            Value::Bool(v) => {
                e.bool(*v)?;
            }
            Value::Int(v) => {
                e.i64(*v)?;
            }
            Value::Float(v) => {
                e.f64(*v)?;
            }
            Value::Bytes(v) => {
                e.bytes(v)?;
            }
            Value::Text(v) => {
                e.str(v)?;
            }
            Value::Array(items) => {
                e.array(items.len() as u64)?;
                for item in items {
                    item.encode(e, ctx)?;
                }
            }
            Value::Map(entries) => {
                e.map(entries.len() as u64)?;
                for (key, value) in entries {
                    e.str(key)?;
                    value.encode(e, ctx)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nested_round_trip() {
        let item = Value::Map(vec![
            ("f".to_string(), Value::from("cmd_status")),
            ("s".to_string(), Value::from(true)),
            ("err".to_string(), Value::from(0u32)),
            ("t_degc".to_string(), Value::Float(36.5)),
            ("serial".to_string(), Value::from(&[0u8, 1, 2, 3][..])),
            (
                "loads".to_string(),
                Value::Array(vec![Value::Int(-2), Value::Null]),
            ),
        ]);
        let bytes = item.to_bytes().unwrap();
        assert_eq!(Value::from_bytes(&bytes).unwrap(), item);
    }

    #[test]
    fn accessors() {
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::from(17u32).as_u64(), Some(17));
        assert_eq!(Value::Int(-1).as_u64(), None);
        assert_eq!(Value::Int(4).as_f64(), Some(4.0));
        assert_eq!(Value::from("abc").as_str(), Some("abc"));
        assert_eq!(Value::from(1.5).as_bool(), None);
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = Value::from(7u32).to_bytes().unwrap();
        bytes.extend_from_slice(&[0xaa, 0xbb]);
        assert_eq!(Value::from_bytes(&bytes).unwrap(), Value::Int(7));
    }
}
