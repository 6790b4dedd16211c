//! Binary-safe RESP2 wire encoding.
//!
//! Unlike a text-oriented RESP reader, every bulk payload here is carried as
//! `Vec<u8>` end to end so that codec-encoded pub/sub payloads (which are
//! not valid UTF-8 in general) round-trip without loss.
use std::io::{BufRead, Read, Write};

use crate::error::{BrokerError, BrokerErrorKind};

pub const ARRAY_SIGIL: u8 = b'*';
pub const BULK_SIGIL: u8 = b'$';
pub const SIMPLE_SIGIL: u8 = b'+';
pub const ERROR_SIGIL: u8 = b'-';
pub const INTEGER_SIGIL: u8 = b':';
pub const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn as_bulk(&self) -> Option<&[u8]> {
        match self {
            RespValue::Bulk(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_bulk(self) -> Option<Vec<u8>> {
        match self {
            RespValue::Bulk(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RespValue]> {
        match self {
            RespValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

/// Writes a command as an array of bulk strings, the form every Redis
/// command takes regardless of argument content.
pub fn write_command(parts: &[Vec<u8>], stream: &mut dyn Write) -> Result<(), BrokerError> {
    let mut out = Vec::with_capacity(32);
    out.push(ARRAY_SIGIL);
    out.extend_from_slice(parts.len().to_string().as_bytes());
    out.extend_from_slice(CRLF);
    for part in parts {
        out.push(BULK_SIGIL);
        out.extend_from_slice(part.len().to_string().as_bytes());
        out.extend_from_slice(CRLF);
        out.extend_from_slice(part);
        out.extend_from_slice(CRLF);
    }
    stream.write_all(&out)?;
    stream.flush()?;
    Ok(())
}

pub fn command_from_str_parts(parts: &[&str]) -> Vec<Vec<u8>> {
    parts.iter().map(|p| p.as_bytes().to_vec()).collect()
}

/// Reads a single RESP value from the stream, blocking until the full value
/// has arrived.
pub fn read_value(stream: &mut dyn BufRead) -> Result<RespValue, BrokerError> {
    let line = read_line(stream)?;
    if line.is_empty() {
        return Err(BrokerError::new(
            "connection closed by peer",
            BrokerErrorKind::ConnectionError,
        ));
    }

    let (sigil, rest) = (line[0], &line[1..]);
    match sigil {
        SIMPLE_SIGIL => Ok(RespValue::Simple(String::from_utf8_lossy(rest).into_owned())),
        ERROR_SIGIL => Ok(RespValue::Error(String::from_utf8_lossy(rest).into_owned())),
        INTEGER_SIGIL => {
            let n = parse_ascii_i64(rest)?;
            Ok(RespValue::Integer(n))
        }
        BULK_SIGIL => {
            let len = parse_ascii_i64(rest)?;
            if len < 0 {
                return Ok(RespValue::Nil);
            }
            let mut buf = vec![0u8; len as usize];
            read_exact_from(stream, &mut buf)?;
            consume_crlf(stream)?;
            Ok(RespValue::Bulk(buf))
        }
        ARRAY_SIGIL => {
            let len = parse_ascii_i64(rest)?;
            if len < 0 {
                return Ok(RespValue::Nil);
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read_value(stream)?);
            }
            Ok(RespValue::Array(items))
        }
        other => Err(BrokerError::new(
            format!("unexpected RESP sigil: {}", other as char),
            BrokerErrorKind::ProtocolError,
        )),
    }
}

fn read_line(stream: &mut dyn BufRead) -> Result<Vec<u8>, BrokerError> {
    let mut line = Vec::with_capacity(64);
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte)?;
        if n == 0 {
            if line.is_empty() {
                return Ok(line);
            }
            break;
        }
        if byte[0] == b'\r' {
            let mut lf = [0u8; 1];
            stream.read_exact(&mut lf)?;
            break;
        }
        line.push(byte[0]);
    }
    Ok(line)
}

fn read_exact_from(stream: &mut dyn BufRead, buf: &mut [u8]) -> Result<(), BrokerError> {
    stream.read_exact(buf)?;
    Ok(())
}

fn consume_crlf(stream: &mut dyn BufRead) -> Result<(), BrokerError> {
    let mut crlf = [0u8; 2];
    stream.read_exact(&mut crlf)?;
    Ok(())
}

fn parse_ascii_i64(bytes: &[u8]) -> Result<i64, BrokerError> {
    std::str::from_utf8(bytes)
        .map_err(|e| BrokerError::new(e.to_string(), BrokerErrorKind::ProtocolError))?
        .parse::<i64>()
        .map_err(BrokerError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn writes_command_as_bulk_array() {
        let mut buf = Vec::new();
        let parts = command_from_str_parts(&["SET", "foo", "bar"]);
        write_command(&parts, &mut buf).unwrap();
        assert_eq!(buf, b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
    }

    #[test]
    fn reads_bulk_string_round_trip() {
        let mut cursor = Cursor::new(b"$5\r\nhello\r\n".to_vec());
        let value = read_value(&mut cursor).unwrap();
        assert_eq!(value, RespValue::Bulk(b"hello".to_vec()));
    }

    #[test]
    fn reads_binary_bulk_payload_with_embedded_crlf() {
        let payload = vec![0u8, 1, b'\r', b'\n', 255];
        let mut wire = format!("${}\r\n", payload.len()).into_bytes();
        wire.extend_from_slice(&payload);
        wire.extend_from_slice(b"\r\n");
        let mut cursor = Cursor::new(wire);
        let value = read_value(&mut cursor).unwrap();
        assert_eq!(value, RespValue::Bulk(payload));
    }

    #[test]
    fn reads_nil_bulk_string() {
        let mut cursor = Cursor::new(b"$-1\r\n".to_vec());
        let value = read_value(&mut cursor).unwrap();
        assert_eq!(value, RespValue::Nil);
    }

    #[test]
    fn reads_nested_array() {
        let mut cursor = Cursor::new(b"*2\r\n$3\r\nfoo\r\n:42\r\n".to_vec());
        let value = read_value(&mut cursor).unwrap();
        assert_eq!(
            value,
            RespValue::Array(vec![RespValue::Bulk(b"foo".to_vec()), RespValue::Integer(42)])
        );
    }

    #[test]
    fn reads_simple_error() {
        let mut cursor = Cursor::new(b"-ERR unknown command\r\n".to_vec());
        let value = read_value(&mut cursor).unwrap();
        assert_eq!(value, RespValue::Error("ERR unknown command".to_string()));
    }
}
