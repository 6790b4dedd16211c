//! Tagged binary encode/decode for [`Value`]. One tag byte per value, `u32`
//! little-endian length prefixes for variable-length content, fixed
//! little-endian widths for numbers.
use std::collections::HashMap;

use crate::error::{CodecError, CodecErrorKind};
use crate::value::Value;

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_UINT: u8 = 0x04;
const TAG_FLOAT: u8 = 0x05;
const TAG_STR: u8 = 0x06;
const TAG_BYTES: u8 = 0x07;
const TAG_SEQ: u8 = 0x08;
const TAG_MAP: u8 = 0x09;

/// Encodes a value into the canonical wire representation.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Int(n) => {
            out.push(TAG_INT);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Value::UInt(n) => {
            out.push(TAG_UINT);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Value::Float(n) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Value::Str(s) => {
            out.push(TAG_STR);
            write_len_prefixed(s.as_bytes(), out);
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            write_len_prefixed(b, out);
        }
        Value::Seq(items) => {
            out.push(TAG_SEQ);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_into(item, out);
            }
        }
        Value::Map(entries) => {
            out.push(TAG_MAP);
            out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
            for (key, val) in entries {
                write_len_prefixed(key.as_bytes(), out);
                encode_into(val, out);
            }
        }
    }
}

fn write_len_prefixed(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Strict recursive-descent decoder. Returns an error on malformed or
/// truncated input instead of guessing.
pub fn decode(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let value = decode_value(&mut cursor)?;
    if cursor.pos != cursor.bytes.len() {
        return Err(CodecError::new(
            "trailing bytes after decoded value",
            CodecErrorKind::TrailingData,
        ));
    }
    Ok(value)
}

/// Tolerant entry point for received frames: falls back to `Value::Bytes`
/// on any decode failure so a callback always gets something instead of an
/// error for payloads that are not valid structured data.
pub fn decode_lenient(bytes: &[u8]) -> Value {
    decode(bytes).unwrap_or_else(|_| Value::Bytes(bytes.to_vec()))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.bytes.len() {
            return Err(CodecError::new(
                "buffer ended before complete value",
                CodecErrorKind::UnexpectedEnd,
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, CodecError> {
        let slice = self.take(4)?;
        Ok(u32::from_le_bytes(slice.try_into().unwrap()))
    }

    fn take_i64(&mut self) -> Result<i64, CodecError> {
        let slice = self.take(8)?;
        Ok(i64::from_le_bytes(slice.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64, CodecError> {
        let slice = self.take(8)?;
        Ok(u64::from_le_bytes(slice.try_into().unwrap()))
    }

    fn take_f64(&mut self) -> Result<f64, CodecError> {
        let slice = self.take(8)?;
        Ok(f64::from_le_bytes(slice.try_into().unwrap()))
    }

    fn take_len_prefixed(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.take_u32()? as usize;
        self.take(len)
    }

    fn take_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.take_len_prefixed()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| CodecError::new(e.to_string(), CodecErrorKind::InvalidUtf8))
    }
}

fn decode_value(cursor: &mut Cursor) -> Result<Value, CodecError> {
    match cursor.take_u8()? {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT => Ok(Value::Int(cursor.take_i64()?)),
        TAG_UINT => Ok(Value::UInt(cursor.take_u64()?)),
        TAG_FLOAT => Ok(Value::Float(cursor.take_f64()?)),
        TAG_STR => Ok(Value::Str(cursor.take_string()?)),
        TAG_BYTES => Ok(Value::Bytes(cursor.take_len_prefixed()?.to_vec())),
        TAG_SEQ => {
            let len = cursor.take_u32()? as usize;
            let mut items = Vec::with_capacity(len.min(1 << 20));
            for _ in 0..len {
                items.push(decode_value(cursor)?);
            }
            Ok(Value::Seq(items))
        }
        TAG_MAP => {
            let len = cursor.take_u32()? as usize;
            let mut entries = HashMap::with_capacity(len.min(1 << 20));
            for _ in 0..len {
                let key = cursor.take_string()?;
                let val = decode_value(cursor)?;
                entries.insert(key, val);
            }
            Ok(Value::Map(entries))
        }
        other => Err(CodecError::new(
            format!("unknown tag byte: {other:#x}"),
            CodecErrorKind::UnknownTag,
        )),
    }
}

/// Non-recursive decoder for the same wire format, walking an explicit
/// work stack instead of the call stack. Semantically equivalent to
/// [`decode`]; exists so very long or deeply nested sequences (e.g. a
/// 100,000-element array) don't grow the call stack.
pub fn decode_fast(bytes: &[u8]) -> Result<Value, CodecError> {
    enum Frame {
        Seq { remaining: usize, items: Vec<Value> },
        Map {
            remaining: usize,
            pending_key: Option<String>,
            entries: HashMap<String, Value>,
        },
    }

    let mut cursor = Cursor { bytes, pos: 0 };
    let mut stack: Vec<Frame> = Vec::new();
    let mut completed: Option<Value> = None;

    loop {
        let value = if completed.is_some() {
            completed.take().unwrap()
        } else {
            match cursor.take_u8()? {
                TAG_NULL => Value::Null,
                TAG_FALSE => Value::Bool(false),
                TAG_TRUE => Value::Bool(true),
                TAG_INT => Value::Int(cursor.take_i64()?),
                TAG_UINT => Value::UInt(cursor.take_u64()?),
                TAG_FLOAT => Value::Float(cursor.take_f64()?),
                TAG_STR => Value::Str(cursor.take_string()?),
                TAG_BYTES => Value::Bytes(cursor.take_len_prefixed()?.to_vec()),
                TAG_SEQ => {
                    let len = cursor.take_u32()? as usize;
                    if len == 0 {
                        Value::Seq(Vec::new())
                    } else {
                        stack.push(Frame::Seq {
                            remaining: len,
                            items: Vec::with_capacity(len.min(1 << 20)),
                        });
                        continue;
                    }
                }
                TAG_MAP => {
                    let len = cursor.take_u32()? as usize;
                    if len == 0 {
                        Value::Map(HashMap::new())
                    } else {
                        stack.push(Frame::Map {
                            remaining: len,
                            pending_key: None,
                            entries: HashMap::with_capacity(len.min(1 << 20)),
                        });
                        continue;
                    }
                }
                other => {
                    return Err(CodecError::new(
                        format!("unknown tag byte: {other:#x}"),
                        CodecErrorKind::UnknownTag,
                    ));
                }
            }
        };

        match stack.last_mut() {
            None => {
                if cursor.pos != cursor.bytes.len() {
                    return Err(CodecError::new(
                        "trailing bytes after decoded value",
                        CodecErrorKind::TrailingData,
                    ));
                }
                return Ok(value);
            }
            Some(Frame::Seq { remaining, items }) => {
                items.push(value);
                *remaining -= 1;
                if *remaining == 0 {
                    let Frame::Seq { items, .. } = stack.pop().unwrap() else {
                        unreachable!()
                    };
                    completed = Some(Value::Seq(items));
                }
            }
            Some(Frame::Map {
                remaining,
                pending_key,
                entries,
            }) => {
                if let Some(key) = pending_key.take() {
                    entries.insert(key, value);
                    *remaining -= 1;
                    if *remaining == 0 {
                        let Frame::Map { entries, .. } = stack.pop().unwrap() else {
                            unreachable!()
                        };
                        completed = Some(Value::Map(entries));
                    }
                } else {
                    let Value::Str(key) = value else {
                        return Err(CodecError::new(
                            "map key must decode as a string",
                            CodecErrorKind::UnknownTag,
                        ));
                    };
                    *pending_key = Some(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let encoded = encode(&value);
        assert_eq!(decode(&encoded).unwrap(), value);
        assert_eq!(decode_fast(&encoded).unwrap(), value);
    }

    #[test]
    fn round_trips_scalars() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Int(-42));
        roundtrip(Value::UInt(42));
        roundtrip(Value::Float(123.456));
        roundtrip(Value::Str("Hello World".to_string()));
        roundtrip(Value::Bytes(b"Hello World".to_vec()));
    }

    #[test]
    fn round_trips_sequence_and_map() {
        roundtrip(Value::Seq(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));

        let mut map = HashMap::new();
        map.insert("key".to_string(), Value::Str("value".to_string()));
        roundtrip(Value::Map(map));
    }

    #[test]
    fn round_trips_large_sequence_without_stack_overflow() {
        let items: Vec<Value> = (0..100_000)
            .map(|_| Value::Str("Hello World".to_string()))
            .collect();
        roundtrip(Value::Seq(items));
    }

    #[test]
    fn preserves_byte_strings_distinct_from_text() {
        let text = encode(&Value::Str("abc".to_string()));
        let bytes = encode(&Value::Bytes(b"abc".to_vec()));
        assert_ne!(text, bytes);
        assert_eq!(decode(&text).unwrap(), Value::Str("abc".to_string()));
        assert_eq!(decode(&bytes).unwrap(), Value::Bytes(b"abc".to_vec()));
    }

    #[test]
    fn decode_lenient_passes_through_invalid_input() {
        let garbage = vec![0xffu8, 0x01, 0x02];
        assert_eq!(decode_lenient(&garbage), Value::Bytes(garbage));
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let mut encoded = encode(&Value::Str("Hello".to_string()));
        encoded.truncate(encoded.len() - 2);
        assert!(decode(&encoded).is_err());
    }

    #[test]
    fn decode_fast_matches_default_decoder_on_nested_structures() {
        let mut inner = HashMap::new();
        inner.insert("nested".to_string(), Value::Seq(vec![Value::Int(1), Value::Bool(false)]));
        let mut outer = HashMap::new();
        outer.insert("key".to_string(), Value::Map(inner));
        outer.insert("bytes".to_string(), Value::Bytes(vec![1, 2, 3]));
        roundtrip(Value::Map(outer));
    }
}
