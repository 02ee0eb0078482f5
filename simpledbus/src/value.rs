//! The two value models the codec translates between.
//!
//! [`HostValue`] is everything the scripting side can hand over: numbers,
//! booleans, strings, sequences, mappings and nil. [`Arg`] is a typed wire
//! argument as it sits in a message body.

use std::fmt;

use crate::signature::WireType;

/// A value on the host side of the binding.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nil,
    Bool(bool),
    /// All numeric wire types map to one double precision representation.
    Number(f64),
    Str(String),
    /// Positional sequence, used for arrays and structs. A `Nil` element
    /// ends the sequence as far as encoding is concerned.
    Seq(Vec<HostValue>),
    Map(HostMap),
}

impl HostValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, HostValue::Nil)
    }

    /// Name of the value's shape, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Nil => "nil",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::Str(_) => "string",
            HostValue::Seq(_) | HostValue::Map(_) => "table",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Element at 1-based `index` of a sequence; `None` past the end, on a
    /// nil element, or for anything that is not a sequence.
    pub fn index(&self, index: usize) -> Option<&HostValue> {
        match self {
            HostValue::Seq(items) if index >= 1 => match items.get(index - 1) {
                Some(HostValue::Nil) | None => None,
                Some(v) => Some(v),
            },
            _ => None,
        }
    }

    /// Numeric view with string coercion: `"42"` reads as `42`.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            HostValue::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Textual view with number coercion: `42.0` reads as `"42"`.
    pub fn to_text(&self) -> Option<String> {
        match self {
            HostValue::Str(s) => Some(s.clone()),
            HostValue::Number(n) => Some(format_number(*n)),
            _ => None,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostValue::Nil => f.write_str("nil"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Number(n) => f.write_str(&format_number(*n)),
            HostValue::Str(s) => f.write_str(s),
            HostValue::Seq(items) => {
                f.write_str("{")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                f.write_str("}")
            }
            HostValue::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "[{}] = {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<i32> for HostValue {
    fn from(n: i32) -> Self {
        HostValue::Number(n.into())
    }
}

impl From<u32> for HostValue {
    fn from(n: u32) -> Self {
        HostValue::Number(n.into())
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::Str(s.into())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::Str(s)
    }
}

impl<T: Into<HostValue>> From<Vec<T>> for HostValue {
    fn from(v: Vec<T>) -> Self {
        HostValue::Seq(v.into_iter().map(Into::into).collect())
    }
}

impl From<HostMap> for HostValue {
    fn from(m: HostMap) -> Self {
        HostValue::Map(m)
    }
}

/// An insertion ordered mapping with replace-on-insert semantics.
///
/// Keys are compared with `==`, so `1` and `1.0` are the same key. Two maps
/// are equal when they hold the same key/value pairs in any order.
#[derive(Debug, Clone, Default)]
pub struct HostMap {
    entries: Vec<(HostValue, HostValue)>,
}

impl HostMap {
    pub fn new() -> Self {
        HostMap::default()
    }

    /// Insert `value` under `key`, returning the previous value.
    pub fn insert(&mut self, key: HostValue, value: HostValue) -> Option<HostValue> {
        for entry in self.entries.iter_mut() {
            if entry.0 == key {
                return Some(std::mem::replace(&mut entry.1, value));
            }
        }
        self.entries.push((key, value));
        None
    }

    pub fn get(&self, key: &HostValue) -> Option<&HostValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HostValue, &HostValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl PartialEq for HostMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).map_or(false, |o| o == v))
    }
}

impl<K: Into<HostValue>, V: Into<HostValue>> FromIterator<(K, V)> for HostMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HostMap::new();
        for (k, v) in iter {
            map.insert(k.into(), v.into());
        }
        map
    }
}

/// One typed argument of a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Arg {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    UnixFd(u32),
    /// Element type plus elements; the type is kept so empty arrays still
    /// carry a signature.
    Array(WireType, Vec<Arg>),
    Struct(Vec<Arg>),
    DictEntry(Box<Arg>, Box<Arg>),
    Variant(Box<Arg>),
}

impl Arg {
    /// The wire type this argument is an instance of.
    pub fn wire_type(&self) -> WireType {
        match self {
            Arg::Byte(_) => WireType::Byte,
            Arg::Bool(_) => WireType::Bool,
            Arg::Int16(_) => WireType::Int16,
            Arg::UInt16(_) => WireType::UInt16,
            Arg::Int32(_) => WireType::Int32,
            Arg::UInt32(_) => WireType::UInt32,
            Arg::Int64(_) => WireType::Int64,
            Arg::UInt64(_) => WireType::UInt64,
            Arg::Double(_) => WireType::Double,
            Arg::String(_) => WireType::String,
            Arg::ObjectPath(_) => WireType::ObjectPath,
            Arg::Signature(_) => WireType::Signature,
            Arg::UnixFd(_) => WireType::UnixFd,
            Arg::Array(element, _) => WireType::Array(Box::new(element.clone())),
            Arg::Struct(fields) => WireType::Struct(fields.iter().map(Arg::wire_type).collect()),
            Arg::DictEntry(k, v) => WireType::DictEntry(Box::new([k.wire_type(), v.wire_type()])),
            Arg::Variant(_) => WireType::Variant,
        }
    }

    /// Type code of the argument, as the message iterator reports it.
    pub fn code(&self) -> char {
        match self {
            Arg::Array(_, _) => 'a',
            Arg::Struct(_) => '(',
            Arg::DictEntry(_, _) => '{',
            a => a.wire_type().code(),
        }
    }
}
