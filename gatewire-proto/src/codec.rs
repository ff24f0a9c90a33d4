//! Binary dump/load of [`Value`]s.
//!
//! The format is self-describing: a format-version byte, then a stream of
//! single-byte opcodes driving a small stack machine, terminated by STOP.
//! All fixed-width integers are big-endian. Incompatible versions fail
//! closed instead of misreading the stream.

use thiserror::Error;

use crate::value::Value;

/// Version byte prefixed to every dump. Bumped whenever the opcode set or
/// any encoding changes incompatibly.
pub const FORMAT_VERSION: u8 = 2;

/// Opcode bytes, assigned consecutively in alphabetical order of name.
/// The set and the order of definition are part of the versioned contract.
mod op {
    pub const BUILDTUPLE: u8 = 0x40;
    pub const BYTES: u8 = 0x41;
    pub const BYTETEXT: u8 = 0x42;
    pub const CHANNEL: u8 = 0x43;
    pub const COMPLEX: u8 = 0x44;
    pub const FALSE: u8 = 0x45;
    pub const FLOAT: u8 = 0x46;
    pub const FROZENSET: u8 = 0x47;
    pub const INT: u8 = 0x48;
    pub const LONG: u8 = 0x49;
    pub const LONGINT: u8 = 0x4a;
    pub const LONGLONG: u8 = 0x4b;
    pub const NEWDICT: u8 = 0x4c;
    pub const NEWLIST: u8 = 0x4d;
    pub const NIL: u8 = 0x4e;
    pub const SET: u8 = 0x4f;
    pub const SETITEM: u8 = 0x50;
    pub const STOP: u8 = 0x51;
    pub const TEXT: u8 = 0x52;
    pub const TRUE: u8 = 0x53;
    pub const UNICODE: u8 = 0x54;
}

/// A value cannot be serialised.
#[derive(Debug, Error)]
pub enum DumpError {
    /// A string or container is too long for the 32-bit length field.
    #[error("cannot serialise a {0} of {1} items, length does not fit 32 bits")]
    TooLong(&'static str, usize),
}

/// The wire bytes cannot be turned back into a value.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The stream ended in the middle of a value.
    #[error("unexpected end of data")]
    Truncated,
    /// An opcode outside the defined set. Wire corruption, or a peer
    /// speaking a different protocol altogether.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    /// The leading format-version byte does not match this implementation.
    #[error("data format version mismatch: peer wrote {found:#04x}, this side speaks {expected:#04x}")]
    FormatVersion {
        /// The version byte found on the wire.
        found: u8,
        /// The version this implementation speaks.
        expected: u8,
    },
    /// Text bytes that are not valid UTF-8.
    #[error("text is not valid utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    /// An integer literal wider than this endpoint's 64-bit universe.
    #[error("integer literal {0:?} does not fit 64 bits")]
    IntegerOverflow(String),
    /// A structurally broken opcode stream.
    #[error("malformed stream: {0}")]
    Malformed(&'static str),
}

/// Decoder policy for the two text opcodes, toggled by the RECONFIGURE
/// message for cross-runtime interop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrCoercion {
    /// Decode legacy eight-bit text (BYTETEXT) as `Text` instead of `Bytes`.
    pub bytetext_as_text: bool,
    /// Decode native text (TEXT/UNICODE) as `Bytes` instead of `Text`.
    pub text_as_bytes: bool,
}

/// Serialise a value.
///
/// The dump is built in a scratch buffer and returned whole, so a failing
/// dump never leaks partial bytes towards the framer.
pub fn dump(value: &Value) -> Result<Vec<u8>, DumpError> {
    let mut out = Vec::with_capacity(64);
    out.push(FORMAT_VERSION);
    write_value(&mut out, value)?;
    out.push(op::STOP);
    Ok(out)
}

/// Deserialise a value with default coercion and no channel hook.
pub fn load(bytes: &[u8]) -> Result<Value, LoadError> {
    load_with(bytes, StrCoercion::default(), |_| {})
}

/// Deserialise a value.
///
/// `on_channel` is invoked for every CHANNEL opcode with the referenced id,
/// so a receiving gateway can pre-register proxy channels before the value
/// reaches user code.
pub fn load_with(
    bytes: &[u8],
    coercion: StrCoercion,
    mut on_channel: impl FnMut(u32),
) -> Result<Value, LoadError> {
    let mut cur = Cursor { data: bytes, pos: 0 };
    let found = cur.u8()?;
    if found != FORMAT_VERSION {
        return Err(LoadError::FormatVersion {
            found,
            expected: FORMAT_VERSION,
        });
    }
    let mut stack: Vec<Value> = Vec::new();
    loop {
        let opcode = cur.u8().map_err(|_| LoadError::Malformed("missing STOP"))?;
        match opcode {
            op::STOP => break,
            op::NIL => stack.push(Value::Nil),
            op::TRUE => stack.push(Value::Bool(true)),
            op::FALSE => stack.push(Value::Bool(false)),
            op::INT | op::LONG => {
                let i = cur.i32()?;
                stack.push(Value::Int(i64::from(i)));
            }
            op::LONGINT | op::LONGLONG => {
                let raw = cur.byte_string()?;
                stack.push(parse_decimal(&raw)?);
            }
            op::FLOAT => stack.push(Value::Float(cur.f64()?)),
            op::COMPLEX => {
                let re = cur.f64()?;
                let im = cur.f64()?;
                stack.push(Value::Complex { re, im });
            }
            op::BYTES => stack.push(Value::Bytes(cur.byte_string()?)),
            op::TEXT | op::UNICODE => {
                let raw = cur.byte_string()?;
                if coercion.text_as_bytes {
                    stack.push(Value::Bytes(raw));
                } else {
                    stack.push(Value::Text(String::from_utf8(raw)?));
                }
            }
            op::BYTETEXT => {
                let raw = cur.byte_string()?;
                if coercion.bytetext_as_text {
                    stack.push(Value::Text(String::from_utf8_lossy(&raw).into_owned()));
                } else {
                    stack.push(Value::Bytes(raw));
                }
            }
            op::NEWLIST => {
                let n = cur.u32()? as usize;
                stack.push(Value::List(vec![Value::Nil; n]));
            }
            op::NEWDICT => stack.push(Value::Dict(Vec::new())),
            op::SETITEM => {
                if stack.len() < 3 {
                    return Err(LoadError::Malformed("not enough items for SETITEM"));
                }
                let value = stack.pop().expect("stack length checked");
                let key = stack.pop().expect("stack length checked");
                match stack.last_mut().expect("stack length checked") {
                    Value::Dict(pairs) => pairs.push((key, value)),
                    Value::List(items) => {
                        let idx = key
                            .as_int()
                            .and_then(|i| usize::try_from(i).ok())
                            .ok_or(LoadError::Malformed("non-integer list index"))?;
                        let slot = items
                            .get_mut(idx)
                            .ok_or(LoadError::Malformed("list index out of range"))?;
                        *slot = value;
                    }
                    _ => return Err(LoadError::Malformed("SETITEM on a non-container")),
                }
            }
            op::BUILDTUPLE => {
                let items = pop_n(&mut stack, cur.u32()?)?;
                stack.push(Value::Tuple(items));
            }
            op::SET => {
                let items = pop_n(&mut stack, cur.u32()?)?;
                stack.push(Value::Set(items));
            }
            op::FROZENSET => {
                let items = pop_n(&mut stack, cur.u32()?)?;
                stack.push(Value::FrozenSet(items));
            }
            op::CHANNEL => {
                let id = cur.u32()?;
                on_channel(id);
                stack.push(Value::Channel(id));
            }
            other => return Err(LoadError::UnknownOpcode(other)),
        }
    }
    if cur.pos != bytes.len() {
        return Err(LoadError::Malformed("trailing bytes after STOP"));
    }
    if stack.len() != 1 {
        return Err(LoadError::Malformed("stream did not reduce to one value"));
    }
    Ok(stack.pop().expect("stack length checked"))
}

fn pop_n(stack: &mut Vec<Value>, n: u32) -> Result<Vec<Value>, LoadError> {
    let n = n as usize;
    if stack.len() < n {
        return Err(LoadError::Malformed("not enough items on the stack"));
    }
    Ok(stack.split_off(stack.len() - n))
}

fn parse_decimal(raw: &[u8]) -> Result<Value, LoadError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| LoadError::Malformed("non-ascii integer literal"))?;
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::Int(i));
    }
    match text.parse::<u64>() {
        Ok(u) => Ok(Value::UInt(u)),
        Err(_) => Err(LoadError::IntegerOverflow(text.to_owned())),
    }
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), DumpError> {
    match value {
        Value::Nil => out.push(op::NIL),
        Value::Bool(true) => out.push(op::TRUE),
        Value::Bool(false) => out.push(op::FALSE),
        Value::Int(i) => {
            if let Ok(small) = i32::try_from(*i) {
                out.push(op::INT);
                out.extend_from_slice(&small.to_be_bytes());
            } else {
                out.push(op::LONGINT);
                write_byte_string(out, i.to_string().as_bytes())?;
            }
        }
        Value::UInt(u) => {
            if let Ok(small) = i32::try_from(*u) {
                out.push(op::INT);
                out.extend_from_slice(&small.to_be_bytes());
            } else {
                out.push(op::LONGINT);
                write_byte_string(out, u.to_string().as_bytes())?;
            }
        }
        Value::Float(f) => {
            out.push(op::FLOAT);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::Complex { re, im } => {
            out.push(op::COMPLEX);
            out.extend_from_slice(&re.to_be_bytes());
            out.extend_from_slice(&im.to_be_bytes());
        }
        Value::Bytes(b) => {
            out.push(op::BYTES);
            write_byte_string(out, b)?;
        }
        Value::Text(s) => {
            out.push(op::TEXT);
            write_byte_string(out, s.as_bytes())?;
        }
        Value::List(items) => {
            out.push(op::NEWLIST);
            write_len(out, items.len(), "list")?;
            for (idx, item) in items.iter().enumerate() {
                write_value(out, &Value::from(idx))?;
                write_value(out, item)?;
                out.push(op::SETITEM);
            }
        }
        Value::Dict(pairs) => {
            out.push(op::NEWDICT);
            for (key, val) in pairs {
                write_value(out, key)?;
                write_value(out, val)?;
                out.push(op::SETITEM);
            }
        }
        Value::Tuple(items) => write_trailing(out, items, op::BUILDTUPLE, "tuple")?,
        Value::Set(items) => write_trailing(out, items, op::SET, "set")?,
        Value::FrozenSet(items) => write_trailing(out, items, op::FROZENSET, "frozenset")?,
        Value::Channel(id) => {
            out.push(op::CHANNEL);
            out.extend_from_slice(&id.to_be_bytes());
        }
    }
    Ok(())
}

fn write_trailing(
    out: &mut Vec<u8>,
    items: &[Value],
    opcode: u8,
    kind: &'static str,
) -> Result<(), DumpError> {
    for item in items {
        write_value(out, item)?;
    }
    out.push(opcode);
    write_len(out, items.len(), kind)
}

fn write_len(out: &mut Vec<u8>, len: usize, kind: &'static str) -> Result<(), DumpError> {
    let len = u32::try_from(len).map_err(|_| DumpError::TooLong(kind, len))?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

fn write_byte_string(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), DumpError> {
    write_len(out, bytes.len(), "byte string")?;
    out.extend_from_slice(bytes);
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        if self.data.len() - self.pos < n {
            return Err(LoadError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn i32(&mut self) -> Result<i32, LoadError> {
        let raw = self.take(4)?;
        Ok(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn f64(&mut self) -> Result<f64, LoadError> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(f64::from_be_bytes(buf))
    }

    fn byte_string(&mut self) -> Result<Vec<u8>, LoadError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}
