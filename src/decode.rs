//! Conversion of raw holding register words into typed measurements.
//!
//! Meters transfer everything as big-endian 16-bit words. Multi-word numbers are sent with the
//! most significant word first, and text is packed two bytes per word, high byte first.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("expected {expected} register words, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("register words do not hold ASCII text")]
    NotAscii,
    #[error("register words do not hold UTF-8 text")]
    Utf8(#[source] std::string::FromUtf8Error),
    #[error("only numeric values can be scaled")]
    NotNumeric,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Decoder {
    Ascii,
    Utf8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    /// The register bytes, as-is. Used where the encoding is device specific (bitfields, tariff
    /// codes, and so on.)
    RawBytes,
    /// A numeric value multiplied by a factor, e.g. `0.01` for a meter reporting in centi-units.
    Scaled(&'static Decoder, f64),
}

impl Decoder {
    /// The exact number of words this decoder consumes, if it is fixed.
    ///
    /// Text and raw byte decoders accept as many words as the read requested.
    pub const fn words(&self) -> Option<u16> {
        match self {
            Self::Ascii | Self::Utf8 | Self::RawBytes => None,
            Self::U16 | Self::I16 => Some(1),
            Self::U32 | Self::I32 | Self::F32 => Some(2),
            Self::U64 | Self::I64 => Some(4),
            Self::Scaled(inner, _) => inner.words(),
        }
    }

    pub fn decode(&self, words: &[u16]) -> Result<Value, Error> {
        match self.words() {
            Some(expected) if words.len() != usize::from(expected) => {
                let expected = usize::from(expected);
                return Err(Error::SizeMismatch { expected, actual: words.len() });
            }
            None if words.is_empty() => {
                return Err(Error::SizeMismatch { expected: 1, actual: 0 });
            }
            _ => {}
        }
        Ok(match *self {
            Self::Ascii => {
                let bytes = to_bytes(words);
                if !bytes.is_ascii() {
                    return Err(Error::NotAscii);
                }
                let text = bytes.into_iter().map(char::from).collect::<String>();
                Value::Text(trim_padding(text))
            }
            Self::Utf8 => {
                let text = String::from_utf8(to_bytes(words)).map_err(Error::Utf8)?;
                Value::Text(trim_padding(text))
            }
            Self::U16 => Value::U16(words[0]),
            Self::I16 => Value::I16(i16::from_be_bytes(be_bytes(words))),
            Self::U32 => Value::U32(u32::from_be_bytes(be_bytes(words))),
            Self::I32 => Value::I32(i32::from_be_bytes(be_bytes(words))),
            Self::U64 => Value::U64(u64::from_be_bytes(be_bytes(words))),
            Self::I64 => Value::I64(i64::from_be_bytes(be_bytes(words))),
            Self::F32 => Value::F32(f32::from_be_bytes(be_bytes(words))),
            Self::RawBytes => Value::Bytes(to_bytes(words)),
            Self::Scaled(inner, factor) => {
                let value = inner.decode(words)?.as_f64().ok_or(Error::NotNumeric)?;
                Value::F64(value * factor)
            }
        })
    }
}

impl std::fmt::Display for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ascii => f.write_str("ascii"),
            Self::Utf8 => f.write_str("utf8"),
            Self::U16 => f.write_str("u16"),
            Self::I16 => f.write_str("i16"),
            Self::U32 => f.write_str("u32"),
            Self::I32 => f.write_str("i32"),
            Self::U64 => f.write_str("u64"),
            Self::I64 => f.write_str("i64"),
            Self::F32 => f.write_str("f32"),
            Self::RawBytes => f.write_str("raw"),
            Self::Scaled(inner, factor) => f.write_fmt(format_args!("{inner}*{factor}")),
        }
    }
}

fn to_bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

/// Callers must have checked that `words` holds exactly `N / 2` words.
fn be_bytes<const N: usize>(words: &[u16]) -> [u8; N] {
    let mut bytes = [0; N];
    for (chunk, word) in bytes.chunks_exact_mut(2).zip(words) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    bytes
}

fn trim_padding(mut text: String) -> String {
    let len = text.trim_end_matches(|c: char| c == '\0' || c.is_ascii_whitespace()).len();
    text.truncate(len);
    text
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Text(String),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        Some(match *self {
            Value::U16(n) => n.into(),
            Value::I16(n) => n.into(),
            Value::U32(n) => n.into(),
            Value::I32(n) => n.into(),
            Value::U64(n) => n as f64,
            Value::I64(n) => n as f64,
            Value::F32(n) => n.into(),
            Value::F64(n) => n,
            Value::Text(_) | Value::Bytes(_) => return None,
        })
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Text(s) => f.write_fmt(format_args!("{s:?}")),
            Value::U16(n) => f.write_fmt(format_args!("{n}")),
            Value::I16(n) => f.write_fmt(format_args!("{n}")),
            Value::U32(n) => f.write_fmt(format_args!("{n}")),
            Value::I32(n) => f.write_fmt(format_args!("{n}")),
            Value::U64(n) => f.write_fmt(format_args!("{n}")),
            Value::I64(n) => f.write_fmt(format_args!("{n}")),
            Value::F32(n) => f.write_fmt(format_args!("{n}")),
            Value::F64(n) => f.write_fmt(format_args!("{n}")),
            Value::Bytes(bs) => {
                f.write_str("[")?;
                for (i, b) in bs.iter().enumerate() {
                    if i != 0 {
                        f.write_str(", ")?;
                    }
                    f.write_fmt(format_args!("0x{b:02X}"))?;
                }
                f.write_str("]")
            }
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Text(s) => serializer.serialize_str(s),
            Value::U16(n) => serializer.serialize_u16(*n),
            Value::I16(n) => serializer.serialize_i16(*n),
            Value::U32(n) => serializer.serialize_u32(*n),
            Value::I32(n) => serializer.serialize_i32(*n),
            Value::U64(n) => serializer.serialize_u64(*n),
            Value::I64(n) => serializer.serialize_i64(*n),
            Value::F32(n) => serializer.serialize_f32(*n),
            Value::F64(n) => serializer.serialize_f64(*n),
            Value::Bytes(bs) => serializer.collect_seq(bs),
        }
    }
}
