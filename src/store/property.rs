//! Property value types and their storage encoding.
//!
//! Scalars are stored inline in the property record's 8-byte value field.
//! Strings go to the string store as UTF-8; arrays go to the array store as
//! `[element type u8][count u32][elements]`.

use crate::types::{Result, StoreError};

/// Type code persisted in a property record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum PropertyType {
    /// Boolean.
    Bool = 1,
    /// Signed 8-bit integer.
    Byte = 2,
    /// Signed 16-bit integer.
    Short = 3,
    /// Unicode scalar.
    Char = 4,
    /// Signed 32-bit integer.
    Int = 5,
    /// Signed 64-bit integer.
    Long = 6,
    /// 32-bit float.
    Float = 7,
    /// 64-bit float.
    Double = 8,
    /// String held in the string store.
    String = 9,
    /// Array held in the array store.
    Array = 10,
}

impl PropertyType {
    /// Persisted code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Parses a persisted code.
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => PropertyType::Bool,
            2 => PropertyType::Byte,
            3 => PropertyType::Short,
            4 => PropertyType::Char,
            5 => PropertyType::Int,
            6 => PropertyType::Long,
            7 => PropertyType::Float,
            8 => PropertyType::Double,
            9 => PropertyType::String,
            10 => PropertyType::Array,
            _ => return None,
        })
    }

    /// True for types whose value lives in a dynamic store.
    pub fn is_dynamic(self) -> bool {
        matches!(self, PropertyType::String | PropertyType::Array)
    }
}

/// Homogeneous array value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyArray {
    /// Booleans.
    Bool(Vec<bool>),
    /// Bytes.
    Byte(Vec<i8>),
    /// Shorts.
    Short(Vec<i16>),
    /// Ints.
    Int(Vec<i32>),
    /// Longs.
    Long(Vec<i64>),
    /// Floats.
    Float(Vec<f32>),
    /// Doubles.
    Double(Vec<f64>),
    /// Strings.
    String(Vec<String>),
}

/// A property value as seen by callers.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    /// Boolean.
    Bool(bool),
    /// Signed 8-bit integer.
    Byte(i8),
    /// Signed 16-bit integer.
    Short(i16),
    /// Unicode scalar.
    Char(char),
    /// Signed 32-bit integer.
    Int(i32),
    /// Signed 64-bit integer.
    Long(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// String.
    String(String),
    /// Array.
    Array(PropertyArray),
}

impl PropertyValue {
    /// Storage type of this value.
    pub fn property_type(&self) -> PropertyType {
        match self {
            PropertyValue::Bool(_) => PropertyType::Bool,
            PropertyValue::Byte(_) => PropertyType::Byte,
            PropertyValue::Short(_) => PropertyType::Short,
            PropertyValue::Char(_) => PropertyType::Char,
            PropertyValue::Int(_) => PropertyType::Int,
            PropertyValue::Long(_) => PropertyType::Long,
            PropertyValue::Float(_) => PropertyType::Float,
            PropertyValue::Double(_) => PropertyType::Double,
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Array(_) => PropertyType::Array,
        }
    }

    /// Inline encoding for scalar values; `None` for dynamic values.
    pub fn inline_bits(&self) -> Option<u64> {
        Some(match self {
            PropertyValue::Bool(v) => u64::from(*v),
            PropertyValue::Byte(v) => *v as u8 as u64,
            PropertyValue::Short(v) => *v as u16 as u64,
            PropertyValue::Char(v) => u64::from(u32::from(*v)),
            PropertyValue::Int(v) => *v as u32 as u64,
            PropertyValue::Long(v) => *v as u64,
            PropertyValue::Float(v) => u64::from(v.to_bits()),
            PropertyValue::Double(v) => v.to_bits(),
            PropertyValue::String(_) | PropertyValue::Array(_) => return None,
        })
    }

    /// Rebuilds a scalar value from its inline bits.
    pub fn from_inline(prop_type: PropertyType, bits: u64) -> Result<Self> {
        Ok(match prop_type {
            PropertyType::Bool => PropertyValue::Bool(bits != 0),
            PropertyType::Byte => PropertyValue::Byte(bits as u8 as i8),
            PropertyType::Short => PropertyValue::Short(bits as u16 as i16),
            PropertyType::Char => PropertyValue::Char(
                char::from_u32(bits as u32).ok_or(StoreError::Corruption("invalid char property"))?,
            ),
            PropertyType::Int => PropertyValue::Int(bits as u32 as i32),
            PropertyType::Long => PropertyValue::Long(bits as i64),
            PropertyType::Float => PropertyValue::Float(f32::from_bits(bits as u32)),
            PropertyType::Double => PropertyValue::Double(f64::from_bits(bits)),
            PropertyType::String | PropertyType::Array => {
                return Err(StoreError::Invalid("dynamic property has no inline value"))
            }
        })
    }

    /// Bytes stored in a dynamic store for string and array values.
    pub fn dynamic_bytes(&self) -> Option<Vec<u8>> {
        match self {
            PropertyValue::String(s) => Some(s.as_bytes().to_vec()),
            PropertyValue::Array(a) => Some(encode_array(a)),
            _ => None,
        }
    }

    /// Rebuilds a dynamic value from its stored bytes.
    pub fn from_dynamic(prop_type: PropertyType, bytes: Vec<u8>) -> Result<Self> {
        match prop_type {
            PropertyType::String => String::from_utf8(bytes)
                .map(PropertyValue::String)
                .map_err(|_| StoreError::Corruption("string property is not utf-8")),
            PropertyType::Array => decode_array(&bytes).map(PropertyValue::Array),
            _ => Err(StoreError::Invalid("inline property has no dynamic value")),
        }
    }
}

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for PropertyValue {
                fn from(value: $ty) -> Self {
                    PropertyValue::$variant(value.into())
                }
            }
        )*
    };
}

impl_from_value!(
    bool => Bool,
    i32 => Int,
    i64 => Long,
    f64 => Double,
    String => String,
    &str => String,
);

const ARRAY_BOOL: u8 = 1;
const ARRAY_BYTE: u8 = 2;
const ARRAY_SHORT: u8 = 3;
const ARRAY_INT: u8 = 5;
const ARRAY_LONG: u8 = 6;
const ARRAY_FLOAT: u8 = 7;
const ARRAY_DOUBLE: u8 = 8;
const ARRAY_STRING: u8 = 9;

fn encode_array(array: &PropertyArray) -> Vec<u8> {
    let mut out = Vec::new();
    let header = |tag: u8, len: usize, out: &mut Vec<u8>| {
        out.push(tag);
        out.extend_from_slice(&(len as u32).to_be_bytes());
    };
    match array {
        PropertyArray::Bool(v) => {
            header(ARRAY_BOOL, v.len(), &mut out);
            out.extend(v.iter().map(|b| u8::from(*b)));
        }
        PropertyArray::Byte(v) => {
            header(ARRAY_BYTE, v.len(), &mut out);
            out.extend(v.iter().map(|b| *b as u8));
        }
        PropertyArray::Short(v) => {
            header(ARRAY_SHORT, v.len(), &mut out);
            v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes()));
        }
        PropertyArray::Int(v) => {
            header(ARRAY_INT, v.len(), &mut out);
            v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes()));
        }
        PropertyArray::Long(v) => {
            header(ARRAY_LONG, v.len(), &mut out);
            v.iter().for_each(|x| out.extend_from_slice(&x.to_be_bytes()));
        }
        PropertyArray::Float(v) => {
            header(ARRAY_FLOAT, v.len(), &mut out);
            v.iter().for_each(|x| out.extend_from_slice(&x.to_bits().to_be_bytes()));
        }
        PropertyArray::Double(v) => {
            header(ARRAY_DOUBLE, v.len(), &mut out);
            v.iter().for_each(|x| out.extend_from_slice(&x.to_bits().to_be_bytes()));
        }
        PropertyArray::String(v) => {
            header(ARRAY_STRING, v.len(), &mut out);
            for s in v {
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
        }
    }
    out
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(StoreError::Corruption("array property truncated"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }
}

fn decode_array(bytes: &[u8]) -> Result<PropertyArray> {
    let mut cur = Cursor { buf: bytes, pos: 0 };
    let tag = cur.take(1)?[0];
    let count = u32::from_be_bytes(cur.array::<4>()?) as usize;
    let array = match tag {
        ARRAY_BOOL => PropertyArray::Bool(chunks(&mut cur, count, 1)?.map(|c| c[0] != 0).collect()),
        ARRAY_BYTE => PropertyArray::Byte(chunks(&mut cur, count, 1)?.map(|c| c[0] as i8).collect()),
        ARRAY_SHORT => PropertyArray::Short(
            chunks(&mut cur, count, 2)?
                .map(|c| i16::from_be_bytes([c[0], c[1]]))
                .collect(),
        ),
        ARRAY_INT => PropertyArray::Int(
            chunks(&mut cur, count, 4)?
                .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        ARRAY_LONG => PropertyArray::Long(
            chunks(&mut cur, count, 8)?
                .map(|c| i64::from_be_bytes(to8(c)))
                .collect(),
        ),
        ARRAY_FLOAT => PropertyArray::Float(
            chunks(&mut cur, count, 4)?
                .map(|c| f32::from_bits(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
                .collect(),
        ),
        ARRAY_DOUBLE => PropertyArray::Double(
            chunks(&mut cur, count, 8)?
                .map(|c| f64::from_bits(u64::from_be_bytes(to8(c))))
                .collect(),
        ),
        ARRAY_STRING => {
            let mut out = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let len = u32::from_be_bytes(cur.array::<4>()?) as usize;
                let raw = cur.take(len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| StoreError::Corruption("array string is not utf-8"))?;
                out.push(s.to_owned());
            }
            PropertyArray::String(out)
        }
        _ => return Err(StoreError::Corruption("unknown array element type")),
    };
    if cur.pos != bytes.len() {
        return Err(StoreError::Corruption("trailing bytes after array property"));
    }
    Ok(array)
}

fn chunks<'a>(
    cur: &mut Cursor<'a>,
    count: usize,
    width: usize,
) -> Result<std::slice::ChunksExact<'a, u8>> {
    let total = count
        .checked_mul(width)
        .ok_or(StoreError::Corruption("array property too large"))?;
    Ok(cur.take(total)?.chunks_exact(width))
}

fn to8(c: &[u8]) -> [u8; 8] {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(c);
    arr
}
