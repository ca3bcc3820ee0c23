use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;

use crate::error::{CodecError, Result};
use crate::tlv::{Decoder, Encoder};

/// Type code carried in the type sequence for each item.
///
/// Codes 5..=7 are reserved: they have no codec rules, and encoding or
/// decoding an item that carries one fails with
/// [`CodecError::UnsupportedType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Integer = 0,
    Boolean = 1,
    Real = 2,
    String = 3,
    Binary = 4,
    Event = 5,
    FunctionCall = 6,
    ImageFrame = 7,
}

impl DataType {
    /// Wire code.
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            0 => Self::Integer,
            1 => Self::Boolean,
            2 => Self::Real,
            3 => Self::String,
            4 => Self::Binary,
            5 => Self::Event,
            6 => Self::FunctionCall,
            7 => Self::ImageFrame,
            _ => return None,
        })
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, Self::Event | Self::FunctionCall | Self::ImageFrame)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Real => "real",
            Self::String => "string",
            Self::Binary => "binary",
            Self::Event => "event",
            Self::FunctionCall => "function_call",
            Self::ImageFrame => "image_frame",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value with codec rules.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Integer(i64),
    Boolean(bool),
    Real(f64),
    String(String),
    Binary(Vec<u8>),
}

impl DataValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Integer(_) => DataType::Integer,
            Self::Boolean(_) => DataType::Boolean,
            Self::Real(_) => DataType::Real,
            Self::String(_) => DataType::String,
            Self::Binary(_) => DataType::Binary,
        }
    }

    fn encode(&self, enc: &mut Encoder) -> Result<()> {
        match self {
            Self::Integer(v) => enc.put_integer(*v),
            Self::Boolean(v) => enc.put_boolean(*v),
            Self::Real(v) => enc.put_real(*v),
            Self::String(v) => enc.put_utf8(v)?,
            Self::Binary(v) => enc.put_octets(v)?,
        }
        Ok(())
    }

    fn decode(data_type: DataType, dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(match data_type {
            DataType::Integer => Self::Integer(dec.integer()?),
            DataType::Boolean => Self::Boolean(dec.boolean()?),
            DataType::Real => Self::Real(dec.real()?),
            DataType::String => Self::String(dec.utf8()?.to_string()),
            DataType::Binary => Self::Binary(dec.octets()?.to_vec()),
            DataType::Event | DataType::FunctionCall | DataType::ImageFrame => {
                return Err(CodecError::UnsupportedType(data_type.code()))
            }
        })
    }
}

impl From<i64> for DataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for DataValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<f64> for DataValue {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<String> for DataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<Vec<u8>> for DataValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

/// One `(type, key, value)` entry of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct DataItem {
    /// Type code written to the type sequence.
    pub data_type: DataType,
    /// Item key. Not required to be unique within a message.
    pub key: String,
    pub value: DataValue,
}

impl DataItem {
    /// Build an item with an explicit type code.
    ///
    /// The code is checked against the value at encode time.
    pub fn new(data_type: DataType, key: impl Into<String>, value: impl Into<DataValue>) -> Self {
        Self {
            data_type,
            key: key.into(),
            value: value.into(),
        }
    }

    fn typed(key: impl Into<String>, value: DataValue) -> Self {
        Self {
            data_type: value.data_type(),
            key: key.into(),
            value,
        }
    }

    pub fn integer(key: impl Into<String>, value: i64) -> Self {
        Self::typed(key, DataValue::Integer(value))
    }

    pub fn boolean(key: impl Into<String>, value: bool) -> Self {
        Self::typed(key, DataValue::Boolean(value))
    }

    pub fn real(key: impl Into<String>, value: f64) -> Self {
        Self::typed(key, DataValue::Real(value))
    }

    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::typed(key, DataValue::String(value.into()))
    }

    pub fn binary(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::typed(key, DataValue::Binary(value.into()))
    }

    fn check(&self) -> Result<()> {
        if self.data_type.is_reserved() {
            return Err(CodecError::UnsupportedType(self.data_type.code()));
        }
        let actual = self.value.data_type();
        if actual != self.data_type {
            return Err(CodecError::ValueTypeMismatch {
                key: self.key.clone(),
                declared: self.data_type.name(),
                actual: actual.name(),
            });
        }
        Ok(())
    }
}

/// Types and keys of a message, read without touching any value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub types: Vec<DataType>,
    pub keys: Vec<String>,
}

impl Manifest {
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Encode items as one three-sequence message.
///
/// Every item is validated before anything is written, so a rejected item
/// never yields a partial message.
pub fn encode_items(items: &[DataItem]) -> Result<Bytes> {
    for item in items {
        item.check()?;
    }

    let mut enc = Encoder::with_capacity(64 + items.len() * 24);
    let message = enc.begin_sequence();

    let types = enc.begin_sequence();
    for item in items {
        enc.put_integer(item.data_type.code());
    }
    enc.end_sequence(types)?;

    let keys = enc.begin_sequence();
    for item in items {
        enc.put_utf8(&item.key)?;
    }
    enc.end_sequence(keys)?;

    let values = enc.begin_sequence();
    for item in items {
        item.value.encode(&mut enc)?;
    }
    enc.end_sequence(values)?;

    enc.end_sequence(message)?;
    Ok(enc.finish())
}

/// Decode a three-sequence message back into items, in encoding order.
pub fn decode_items(buf: &[u8]) -> Result<Vec<DataItem>> {
    let mut message = open_message(buf)?;
    let manifest = read_manifest(&mut message)?;

    let mut values = message.sequence()?;
    let mut items = Vec::with_capacity(manifest.len());
    for (data_type, key) in manifest.types.iter().zip(manifest.keys) {
        if values.is_empty() {
            break;
        }
        let value = DataValue::decode(*data_type, &mut values)?;
        items.push(DataItem {
            data_type: *data_type,
            key,
            value,
        });
    }

    let mut value_count = items.len();
    while !values.is_empty() {
        values.skip_element()?;
        value_count += 1;
    }
    if value_count != manifest.types.len() {
        return Err(CodecError::SequenceCountMismatch {
            types: manifest.types.len(),
            keys: manifest.types.len(),
            values: value_count,
        });
    }

    message.finish()?;
    Ok(items)
}

/// Decode only the type and key sequences of a message.
///
/// Reserved type codes are reported as-is; unknown codes are rejected.
pub fn decode_manifest(buf: &[u8]) -> Result<Manifest> {
    let mut message = open_message(buf)?;
    read_manifest(&mut message)
}

/// Collapse items into a key → value map. Duplicate keys: last write wins.
pub fn items_to_map(items: &[DataItem]) -> HashMap<&str, &DataValue> {
    items
        .iter()
        .map(|item| (item.key.as_str(), &item.value))
        .collect()
}

fn open_message(buf: &[u8]) -> Result<Decoder<'_>> {
    let mut outer = Decoder::new(buf);
    let message = outer.sequence()?;
    match outer.remaining() {
        0 => Ok(message),
        n => Err(CodecError::TrailingBytes(n)),
    }
}

fn read_manifest(message: &mut Decoder<'_>) -> Result<Manifest> {
    let mut type_seq = message.sequence()?;
    let mut types = Vec::new();
    while !type_seq.is_empty() {
        let code = type_seq.integer()?;
        types.push(DataType::from_code(code).ok_or(CodecError::UnsupportedType(code))?);
    }

    let mut key_seq = message.sequence()?;
    let mut keys = Vec::with_capacity(types.len());
    while !key_seq.is_empty() {
        keys.push(key_seq.utf8()?.to_string());
    }

    if types.len() != keys.len() {
        return Err(CodecError::SequenceCountMismatch {
            types: types.len(),
            keys: keys.len(),
            values: 0,
        });
    }

    Ok(Manifest { types, keys })
}
