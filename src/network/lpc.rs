// LPC value serialization for the MudMode protocol
//
// Intermud-3 routers exchange LPC data structures in a text form:
// arrays as ({elem,elem,}), mappings as ([key:value,]), strings with
// backslash escapes, integers and floats as plain literals. This module
// provides the value tree and the codec both directions.

use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while encoding or decoding LPC data
#[derive(Error, Debug)]
pub enum LpcError {
    #[error("Invalid UTF-8 in LPC data: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Unexpected end of data")]
    UnexpectedEnd,

    #[error("Unexpected character {ch:?} at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("Invalid number at position {0}")]
    InvalidNumber(usize),
}

/// A dynamically-typed LPC value as carried on the I3 wire.
///
/// There is deliberately no boolean variant: the wire has no boolean type,
/// so callers encode truth as `Int(0)` / `Int(1)`.
#[derive(Debug, Clone, PartialEq)]
pub enum LpcValue {
    Null,
    Int(i32),
    Float(f64),
    Str(String),
    Array(Vec<LpcValue>),
    /// Key-ordered mapping; order is stable within a single decode pass
    Mapping(Vec<(LpcValue, LpcValue)>),
    /// Opaque byte buffer; encoded as a string after lossy UTF-8 replacement
    Buffer(Vec<u8>),
}

impl LpcValue {
    pub fn string(s: impl Into<String>) -> Self {
        LpcValue::Str(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LpcValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            LpcValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[LpcValue]> {
        match self {
            LpcValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&[(LpcValue, LpcValue)]> {
        match self {
            LpcValue::Mapping(pairs) => Some(pairs),
            _ => None,
        }
    }

    /// Look up a mapping entry by string key
    pub fn get(&self, key: &str) -> Option<&LpcValue> {
        self.as_mapping()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// The wire convention for "absent": integer zero or the string "0"
    pub fn is_zero(&self) -> bool {
        matches!(self, LpcValue::Null | LpcValue::Int(0))
            || self.as_str().map(|s| s == "0").unwrap_or(false)
    }

    /// Coerce to a display string the way the original wire fields are read
    pub fn to_string_lossy(&self) -> String {
        match self {
            LpcValue::Null => String::new(),
            LpcValue::Int(i) => i.to_string(),
            LpcValue::Float(f) => f.to_string(),
            LpcValue::Str(s) => s.clone(),
            LpcValue::Buffer(b) => String::from_utf8_lossy(b).into_owned(),
            _ => String::new(),
        }
    }
}

impl From<&str> for LpcValue {
    fn from(s: &str) -> Self {
        LpcValue::Str(s.to_string())
    }
}

impl From<String> for LpcValue {
    fn from(s: String) -> Self {
        LpcValue::Str(s)
    }
}

impl From<i32> for LpcValue {
    fn from(i: i32) -> Self {
        LpcValue::Int(i)
    }
}

impl From<HashMap<String, i32>> for LpcValue {
    fn from(map: HashMap<String, i32>) -> Self {
        LpcValue::Mapping(
            map.into_iter()
                .map(|(k, v)| (LpcValue::Str(k), LpcValue::Int(v)))
                .collect(),
        )
    }
}

/// Codec for the LPC text representation
pub struct LpcCodec;

impl LpcCodec {
    /// Encode a value tree to its UTF-8 wire text
    pub fn encode(value: &LpcValue) -> Vec<u8> {
        let mut out = String::new();
        Self::encode_value(value, &mut out);
        out.into_bytes()
    }

    fn encode_value(value: &LpcValue, out: &mut String) {
        match value {
            LpcValue::Null => out.push('0'),
            LpcValue::Int(i) => out.push_str(&i.to_string()),
            LpcValue::Float(f) => {
                let s = f.to_string();
                out.push_str(&s);
                // Keep the '.' so the decoder reads this back as a float
                if !s.contains('.') {
                    out.push_str(".0");
                }
            }
            LpcValue::Str(s) => Self::encode_string(s, out),
            LpcValue::Buffer(b) => Self::encode_string(&String::from_utf8_lossy(b), out),
            LpcValue::Array(items) => {
                out.push_str("({");
                for item in items {
                    Self::encode_value(item, out);
                    out.push(',');
                }
                out.push_str("})");
            }
            LpcValue::Mapping(pairs) => {
                out.push_str("([");
                for (key, val) in pairs {
                    Self::encode_value(key, out);
                    out.push(':');
                    Self::encode_value(val, out);
                    out.push(',');
                }
                out.push_str("])");
            }
        }
    }

    fn encode_string(s: &str, out: &mut String) {
        out.push('"');
        for ch in s.chars() {
            match ch {
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                '\t' => out.push_str("\\t"),
                '\r' => out.push_str("\\r"),
                c => out.push(c),
            }
        }
        out.push('"');
    }

    /// Decode a value from wire bytes.
    ///
    /// One optional trailing NUL is stripped first; trailing data after the
    /// first complete value is tolerated (the framer hands us exact frames,
    /// so it does not occur in practice).
    pub fn decode(data: &[u8]) -> Result<LpcValue, LpcError> {
        let data = match data.last() {
            Some(0) => &data[..data.len() - 1],
            _ => data,
        };
        let text = String::from_utf8(data.to_vec())?;
        let mut decoder = Decoder {
            chars: text.chars().collect(),
            pos: 0,
        };
        decoder.decode_value()
    }
}

struct Decoder {
    chars: Vec<char>,
    pos: usize,
}

impl Decoder {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) -> Result<char, LpcError> {
        let ch = self.chars.get(self.pos).copied().ok_or(LpcError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(ch)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\n' | '\r')) {
            self.pos += 1;
        }
    }

    fn decode_value(&mut self) -> Result<LpcValue, LpcError> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(LpcError::UnexpectedEnd),
            Some('"') => self.decode_string(),
            Some('(') => self.decode_compound(),
            Some(ch) if ch == '-' || ch.is_ascii_digit() => self.decode_number(),
            Some(ch) => Err(LpcError::UnexpectedChar { ch, pos: self.pos }),
        }
    }

    fn decode_string(&mut self) -> Result<LpcValue, LpcError> {
        self.advance()?; // opening quote
        let mut result = String::new();
        loop {
            match self.advance()? {
                '"' => break,
                '\\' => match self.advance()? {
                    'n' => result.push('\n'),
                    't' => result.push('\t'),
                    'r' => result.push('\r'),
                    other => result.push(other),
                },
                ch => result.push(ch),
            }
        }
        Ok(LpcValue::Str(result))
    }

    fn decode_number(&mut self) -> Result<LpcValue, LpcError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(ch) if ch.is_ascii_digit() || ch == '.') {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if text.contains('.') {
            text.parse::<f64>()
                .map(LpcValue::Float)
                .map_err(|_| LpcError::InvalidNumber(start))
        } else {
            text.parse::<i32>()
                .map(LpcValue::Int)
                .map_err(|_| LpcError::InvalidNumber(start))
        }
    }

    fn decode_compound(&mut self) -> Result<LpcValue, LpcError> {
        self.advance()?; // '('
        match self.advance()? {
            '{' => self.decode_array(),
            '[' => self.decode_mapping(),
            ch => Err(LpcError::UnexpectedChar { ch, pos: self.pos - 1 }),
        }
    }

    fn decode_array(&mut self) -> Result<LpcValue, LpcError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                }
                Some('}') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => items.push(self.decode_value()?),
                None => return Err(LpcError::UnexpectedEnd),
            }
        }
        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.pos += 1;
        }
        Ok(LpcValue::Array(items))
    }

    fn decode_mapping(&mut self) -> Result<LpcValue, LpcError> {
        let mut pairs = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                }
                Some(']') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let key = self.decode_value()?;
                    self.skip_whitespace();
                    if self.peek() == Some(':') {
                        self.pos += 1;
                    }
                    let value = self.decode_value()?;
                    pairs.push((key, value));
                }
                None => return Err(LpcError::UnexpectedEnd),
            }
        }
        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.pos += 1;
        }
        Ok(LpcValue::Mapping(pairs))
    }
}
