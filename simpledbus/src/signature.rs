//! Wire type tags and the signature grammar.
//!
//! A signature is a compact string of type codes, e.g. `"a{sv}"` or `"(ii)s"`.
//! [`parse`] turns it into a sequence of [`WireType`] trees; [`SignatureIter`]
//! walks such a sequence the way a message builder does: look at the current
//! entry, recurse into it, step to the next one.

use std::convert::TryFrom;
use std::fmt;

use crate::error::*;

/// Signatures longer than this are rejected; the protocol stores them in a
/// 256 byte buffer including the terminating NUL.
pub const MAX_SIGNATURE_LEN: usize = 255;

/// Maximum nesting of arrays, and separately of structs/dict entries.
pub const MAX_DEPTH: usize = 32;

/// One complete type of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum WireType {
    Byte,
    Bool,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Array(Box<WireType>),
    Struct(Vec<WireType>),
    /// Key and value; only valid as the element of an array.
    DictEntry(Box<[WireType; 2]>),
    Variant,
}

impl WireType {
    /// The single type code of this type, `(` for structs and `{` for
    /// dict entries.
    pub fn code(&self) -> char {
        match self {
            WireType::Byte => 'y',
            WireType::Bool => 'b',
            WireType::Int16 => 'n',
            WireType::UInt16 => 'q',
            WireType::Int32 => 'i',
            WireType::UInt32 => 'u',
            WireType::Int64 => 'x',
            WireType::UInt64 => 't',
            WireType::Double => 'd',
            WireType::String => 's',
            WireType::ObjectPath => 'o',
            WireType::Signature => 'g',
            WireType::UnixFd => 'h',
            WireType::Array(_) => 'a',
            WireType::Struct(_) => '(',
            WireType::DictEntry(_) => '{',
            WireType::Variant => 'v',
        }
    }

    /// Basic types are the ones allowed as dictionary keys.
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            WireType::Array(_) | WireType::Struct(_) | WireType::DictEntry(_) | WireType::Variant
        )
    }

    /// `true` for `a{..}`, the only place a dict entry may appear.
    pub fn is_dict(&self) -> bool {
        matches!(self, WireType::Array(e) if matches!(**e, WireType::DictEntry(_)))
    }

    /// The types directly contained in this type, in order.
    pub fn children(&self) -> &[WireType] {
        match self {
            WireType::Array(e) => std::slice::from_ref(&**e),
            WireType::Struct(fields) => fields,
            WireType::DictEntry(kv) => &kv[..],
            _ => &[],
        }
    }

    /// The signature text of this single type.
    pub fn signature(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireType::Array(e) => write!(f, "a{}", e),
            WireType::Struct(fields) => {
                f.write_str("(")?;
                for field in fields {
                    write!(f, "{}", field)?;
                }
                f.write_str(")")
            }
            WireType::DictEntry(kv) => write!(f, "{{{}{}}}", kv[0], kv[1]),
            t => write!(f, "{}", t.code()),
        }
    }
}

impl From<WireType> for String {
    fn from(t: WireType) -> Self {
        t.to_string()
    }
}

impl TryFrom<String> for WireType {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        let mut types = parse(&s)?;
        if types.len() != 1 {
            return Err(malformed(&s, "expected exactly one complete type"));
        }
        Ok(types.remove(0))
    }
}

/// Render a sequence of types back to signature text.
pub fn to_signature(types: &[WireType]) -> String {
    types.iter().map(WireType::to_string).collect()
}

fn malformed(signature: &str, reason: &str) -> Error {
    context!(ErrorKind::MalformedSignature {
        signature: signature.into(),
        reason: reason.into(),
    })
}

struct Parser<'a> {
    signature: &'a str,
    bytes: &'a [u8],
    pos: usize,
    arrays: usize,
    structs: usize,
}

impl<'a> Parser<'a> {
    fn fail(&self, reason: &str) -> Error {
        malformed(self.signature, &format!("{} at offset {}", reason, self.pos))
    }

    fn basic(&mut self) -> Result<WireType> {
        let t = self.single()?;
        if !t.is_basic() {
            return Err(self.fail("dictionary key must be a basic type"));
        }
        Ok(t)
    }

    fn single(&mut self) -> Result<WireType> {
        let c = match self.bytes.get(self.pos) {
            Some(c) => *c,
            None => return Err(self.fail("missing type")),
        };
        self.pos += 1;

        let t = match c {
            b'y' => WireType::Byte,
            b'b' => WireType::Bool,
            b'n' => WireType::Int16,
            b'q' => WireType::UInt16,
            b'i' => WireType::Int32,
            b'u' => WireType::UInt32,
            b'x' => WireType::Int64,
            b't' => WireType::UInt64,
            b'd' => WireType::Double,
            b's' => WireType::String,
            b'o' => WireType::ObjectPath,
            b'g' => WireType::Signature,
            b'h' => WireType::UnixFd,
            b'v' => WireType::Variant,
            b'a' => {
                self.arrays += 1;
                if self.arrays > MAX_DEPTH {
                    return Err(self.fail("arrays nested too deeply"));
                }
                if self.bytes.get(self.pos) == Some(&b'{') {
                    self.pos += 1;
                    self.structs += 1;
                    if self.structs > MAX_DEPTH {
                        return Err(self.fail("structs nested too deeply"));
                    }
                    let key = self.basic()?;
                    let value = self.single()?;
                    if self.bytes.get(self.pos) != Some(&b'}') {
                        return Err(self.fail("dict entry must have exactly two types"));
                    }
                    self.pos += 1;
                    self.structs -= 1;
                    self.arrays -= 1;
                    return Ok(WireType::Array(Box::new(WireType::DictEntry(
                        Box::new([key, value]),
                    ))));
                }
                let element = self.single()?;
                self.arrays -= 1;
                WireType::Array(Box::new(element))
            }
            b'(' => {
                self.structs += 1;
                if self.structs > MAX_DEPTH {
                    return Err(self.fail("structs nested too deeply"));
                }
                let mut fields = Vec::new();
                loop {
                    match self.bytes.get(self.pos) {
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => fields.push(self.single()?),
                        None => return Err(self.fail("unterminated struct")),
                    }
                }
                if fields.is_empty() {
                    return Err(self.fail("empty struct"));
                }
                self.structs -= 1;
                WireType::Struct(fields)
            }
            b'{' => {
                self.pos -= 1;
                return Err(self.fail("dict entry outside of an array"));
            }
            b')' | b'}' => {
                self.pos -= 1;
                return Err(self.fail("unbalanced closing delimiter"));
            }
            _ => {
                self.pos -= 1;
                return Err(self.fail(&format!("unknown type code '{}'", c as char)));
            }
        };
        Ok(t)
    }
}

/// Parse a complete signature into its top-level types.
///
/// The empty signature is valid and yields no types.
pub fn parse(signature: &str) -> Result<Vec<WireType>> {
    if signature.len() > MAX_SIGNATURE_LEN {
        return Err(malformed(
            &signature[..signature
                .char_indices()
                .nth(16)
                .map(|(i, _)| i)
                .unwrap_or(signature.len())],
            &format!("longer than {} bytes", MAX_SIGNATURE_LEN),
        ));
    }

    let mut parser = Parser {
        signature,
        bytes: signature.as_bytes(),
        pos: 0,
        arrays: 0,
        structs: 0,
    };

    let mut types = Vec::new();
    while parser.pos < parser.bytes.len() {
        types.push(parser.single()?);
    }
    Ok(types)
}

/// A cursor over one level of a parsed signature.
///
/// ```
/// use simpledbus::signature::{Signature, WireType};
///
/// let sig = Signature::parse("a(is)u").unwrap();
/// let mut it = sig.iter();
/// assert_eq!(it.current().map(WireType::code), Some('a'));
/// let element = it.recurse().unwrap();
/// assert_eq!(element.signature(), "(is)");
/// let fields = element.recurse().unwrap();
/// assert_eq!(fields.signature(), "i");
/// assert!(it.next());
/// assert_eq!(it.current(), Some(&WireType::UInt32));
/// assert!(!it.next());
/// ```
#[derive(Debug, Clone)]
pub struct SignatureIter<'a> {
    types: &'a [WireType],
    pos: usize,
}

impl<'a> SignatureIter<'a> {
    pub fn new(types: &'a [WireType]) -> Self {
        SignatureIter { types, pos: 0 }
    }

    pub fn current(&self) -> Option<&WireType> {
        self.types.get(self.pos)
    }

    /// Signature text of the current entry, empty when exhausted.
    pub fn signature(&self) -> String {
        self.current().map(WireType::to_string).unwrap_or_default()
    }

    /// Iterator over the element types of the current container entry.
    ///
    /// For an array this yields its single element type, for a struct its
    /// fields, for a dict entry its key and value. `None` for basic types and
    /// variants, whose contents are only known from the data.
    pub fn recurse(&self) -> Option<SignatureIter<'a>> {
        let types: &'a [WireType] = self.types;
        let current = types.get(self.pos)?;
        if current.is_basic() || *current == WireType::Variant {
            return None;
        }
        Some(SignatureIter::new(current.children()))
    }

    /// Advance to the next top-level entry; `false` when there is none.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        if self.pos < self.types.len() {
            self.pos += 1;
        }
        self.pos < self.types.len()
    }

    /// `true` if entries remain at or after the current position.
    pub fn has_more(&self) -> bool {
        self.pos < self.types.len()
    }

    /// Number of entries at this level.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// A validated signature.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    text: String,
    types: Vec<WireType>,
}

impl Signature {
    pub fn parse(signature: &str) -> Result<Self> {
        Ok(Signature {
            text: signature.into(),
            types: parse(signature)?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn types(&self) -> &[WireType] {
        &self.types
    }

    pub fn iter(&self) -> SignatureIter<'_> {
        SignatureIter::new(&self.types)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(sig: &str) -> String {
        match parse(sig).unwrap_err().kind() {
            ErrorKind::MalformedSignature { reason, .. } => reason.clone(),
            kind => panic!("unexpected error {:?}", kind),
        }
    }

    #[test]
    fn test_parse_basic() {
        let types = parse("ybnqiuxtdsogv").unwrap();
        assert_eq!(types.len(), 13);
        assert_eq!(to_signature(&types), "ybnqiuxtdsogv");
    }

    #[test]
    fn test_parse_containers() {
        let types = parse("a{sv}(ia(ss))aai").unwrap();
        assert_eq!(types.len(), 3);
        assert!(types[0].is_dict());
        assert_eq!(
            types[1],
            WireType::Struct(vec![
                WireType::Int32,
                WireType::Array(Box::new(WireType::Struct(vec![
                    WireType::String,
                    WireType::String
                ]))),
            ])
        );
        assert_eq!(types[2].to_string(), "aai");
    }

    #[test]
    fn test_empty_signature() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn test_malformed() {
        assert!(reason("z").contains("unknown type code 'z'"));
        assert!(reason("a").contains("missing type"));
        assert!(reason("(ii").contains("unterminated struct"));
        assert!(reason("ii)").contains("unbalanced"));
        assert!(reason("()").contains("empty struct"));
        assert!(reason("{sv}").contains("outside of an array"));
        assert!(reason("a{vs}").contains("basic type"));
        assert!(reason("a{sss}").contains("exactly two"));
        assert!(reason("a{s}").contains("unbalanced"));
    }

    #[test]
    fn test_max_length() {
        let ok = "i".repeat(MAX_SIGNATURE_LEN);
        assert_eq!(parse(&ok).unwrap().len(), MAX_SIGNATURE_LEN);
        let long = "i".repeat(MAX_SIGNATURE_LEN + 1);
        assert!(reason(&long).contains("longer than"));
    }

    #[test]
    fn test_max_depth() {
        let deep = format!("{}i", "a".repeat(MAX_DEPTH));
        assert!(parse(&deep).is_ok());
        let deeper = format!("{}i", "a".repeat(MAX_DEPTH + 1));
        assert!(reason(&deeper).contains("too deeply"));
    }

    #[test]
    fn test_iter() {
        let sig = Signature::parse("sa{sv}").unwrap();
        let mut it = sig.iter();
        assert!(it.has_more());
        assert_eq!(it.signature(), "s");
        assert!(it.recurse().is_none());
        assert!(it.next());
        assert_eq!(it.signature(), "a{sv}");
        let entry = it.recurse().unwrap();
        assert_eq!(entry.signature(), "{sv}");
        let mut kv = entry.recurse().unwrap();
        assert_eq!(kv.current(), Some(&WireType::String));
        assert!(kv.next());
        assert_eq!(kv.current(), Some(&WireType::Variant));
        assert!(!it.next());
        assert!(!it.has_more());
    }

    #[test]
    fn test_serde_as_signature_text() {
        let t = WireType::Array(Box::new(WireType::Int32));
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"ai\"");
        let back: WireType = serde_json::from_str("\"a{sv}\"").unwrap();
        assert!(back.is_dict());
        assert!(serde_json::from_str::<WireType>("\"ii\"").is_err());
    }
}
