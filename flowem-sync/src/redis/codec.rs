//! RESP2 framing.
//!
//! Requests are arrays of bulk strings. Replies are decoded into [`RespValue`]s once a
//! complete value is buffered; a partial value leaves the buffer untouched.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Refuse bulk strings larger than this, as the server does by default.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    /// A bulk string, `None` for the null bulk string.
    Bulk(Option<Bytes>),
    /// An array, `None` for the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// The value as UTF-8 text, for simple and bulk strings.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Simple(s) => Some(s),
            Self::Bulk(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

/// A request: a command name followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: &'static str) -> Self {
        Self { args: vec![Bytes::from_static(name.as_bytes())] }
    }

    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The command name.
    pub fn name(&self) -> &[u8] {
        &self.args[0]
    }
}

#[derive(Debug, Default)]
pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = RespError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse(src, 0)? {
            Some((value, consumed)) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Command> for RespCodec {
    type Error = RespError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(16 + item.args.iter().map(|a| a.len() + 16).sum::<usize>());

        dst.put_u8(b'*');
        dst.put_slice(item.args.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");

        for arg in item.args {
            dst.put_u8(b'$');
            dst.put_slice(arg.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put(arg);
            dst.put_slice(b"\r\n");
        }

        Ok(())
    }
}

/// Finds the line starting at `pos`. Returns the line without its terminator and the position
/// after it.
fn line(src: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = src.get(pos..)?;
    let end = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..end], pos + end + 2))
}

fn text(raw: &[u8]) -> Result<String, RespError> {
    String::from_utf8(raw.to_vec()).map_err(|_| RespError::Protocol("non UTF-8 line".into()))
}

fn integer(raw: &[u8]) -> Result<i64, RespError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RespError::Protocol(format!("invalid integer {:?}", String::from_utf8_lossy(raw))))
}

/// Parses one value starting at `pos`. Returns `None` if it is not complete yet.
fn parse(src: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RespError> {
    let Some(&tag) = src.get(pos) else {
        return Ok(None);
    };
    let Some((raw, next)) = line(src, pos + 1) else {
        return Ok(None);
    };

    let parsed = match tag {
        b'+' => (RespValue::Simple(text(raw)?), next),
        b'-' => (RespValue::Error(text(raw)?), next),
        b':' => (RespValue::Integer(integer(raw)?), next),
        b'$' => {
            let len = integer(raw)?;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), next)));
            }

            let len = len as usize;
            if len > MAX_BULK_LEN {
                return Err(RespError::Protocol(format!("bulk string of {len} bytes")));
            }
            if src.len() < next + len + 2 {
                return Ok(None);
            }
            if &src[next + len..next + len + 2] != b"\r\n" {
                return Err(RespError::Protocol("bulk string not terminated".into()));
            }

            (RespValue::Bulk(Some(Bytes::copy_from_slice(&src[next..next + len]))), next + len + 2)
        }
        b'*' => {
            let len = integer(raw)?;
            if len < 0 {
                return Ok(Some((RespValue::Array(None), next)));
            }

            let mut items = Vec::with_capacity((len as usize).min(1024));
            let mut cursor = next;
            for _ in 0..len {
                match parse(src, cursor)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }

            (RespValue::Array(Some(items)), cursor)
        }
        other => {
            return Err(RespError::Protocol(format!("unknown type byte {:?}", other as char)));
        }
    };

    Ok(Some(parsed))
}
