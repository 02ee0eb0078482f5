//! Host values to wire arguments.
//!
//! Every wire tag has one add-function, picked by [`add_fn`]. Containers are
//! assembled as complete [`Arg`] values and only handed back on success, so a
//! failure deep inside a nested value never leaves a half built container
//! behind.

use crate::error::*;
use crate::signature::{self, WireType};
use crate::value::{Arg, HostValue};

type AddFn = fn(&WireType, &HostValue, &str) -> Result<Arg>;

/// Encode `values[start..]` according to `signature`.
///
/// Fails with [`ErrorKind::Arity`] before encoding anything when fewer values
/// than top-level signature entries are supplied; surplus values are ignored.
/// Error messages name the offending argument as `#n` (1-based, relative to
/// `start`), followed by `[i]` for array elements and struct fields.
///
/// ```rust
/// use simpledbus::{encode, Arg, HostValue};
///
/// let args = encode("ny", &[HostValue::Number(40000.0), HostValue::Number(-1.0)], 0).unwrap();
/// assert_eq!(args, vec![Arg::Int16(-25536), Arg::Byte(255)]);
/// ```
pub fn encode(signature: &str, values: &[HostValue], start: usize) -> Result<Vec<Arg>> {
    let types = signature::parse(signature)?;
    let supplied = values.get(start..).unwrap_or(&[]);

    if supplied.len() < types.len() {
        return Err(context!(ErrorKind::Arity {
            index: supplied.len() + 1,
            signature: signature.into(),
        }));
    }

    encode_types(&types, supplied)
}

/// Encode values against already parsed types; the caller checked arity.
pub(crate) fn encode_types(types: &[WireType], values: &[HostValue]) -> Result<Vec<Arg>> {
    types
        .iter()
        .zip(values)
        .enumerate()
        .map(|(i, (t, v))| add_fn(t)(t, v, &format!("#{}", i + 1)))
        .collect()
}

fn add_fn(t: &WireType) -> AddFn {
    match t {
        WireType::Byte => add_byte,
        WireType::Bool => add_bool,
        WireType::Int16 => add_int16,
        WireType::UInt16 => add_uint16,
        WireType::Int32 => add_int32,
        WireType::UInt32 => add_uint32,
        WireType::Int64 => add_int64,
        WireType::UInt64 => add_uint64,
        WireType::Double => add_double,
        WireType::String => add_string,
        WireType::ObjectPath => add_object_path,
        WireType::Signature => add_signature,
        WireType::Array(_) if t.is_dict() => add_dict,
        WireType::Array(_) => add_array,
        WireType::Struct(_) => add_struct,
        WireType::Variant => add_variant,
        WireType::UnixFd | WireType::DictEntry(_) => add_unsupported,
    }
}

fn mismatch(path: &str, t: &WireType, expected: &str, v: &HostValue) -> Error {
    context!(ErrorKind::TypeMismatch(format!(
        "argument {}: expected {} for '{}', got {}",
        path,
        expected,
        t,
        v.type_name()
    )))
}

fn not_implemented(t: &WireType) -> Error {
    context!(ErrorKind::NotImplemented(t.to_string()))
}

const TWO_POW_64: f64 = 18_446_744_073_709_551_616.0;

/// Truncate toward zero and wrap modulo 2^64 into two's complement bits; the
/// callers narrow to their width. NaN and infinities give 0.
fn integer(t: &WireType, v: &HostValue, path: &str) -> Result<u64> {
    let n = v
        .to_number()
        .ok_or_else(|| mismatch(path, t, "a number", v))?
        .trunc();
    // exact: |r| < 2^64 and integral
    let r = n % TWO_POW_64;
    if r >= 0.0 {
        Ok(r as u64)
    } else {
        Ok((-r as u64).wrapping_neg())
    }
}

fn add_byte(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    Ok(Arg::Byte(integer(t, v, path)? as u8))
}

fn add_int16(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    Ok(Arg::Int16(integer(t, v, path)? as i16))
}

fn add_uint16(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    Ok(Arg::UInt16(integer(t, v, path)? as u16))
}

fn add_int32(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    Ok(Arg::Int32(integer(t, v, path)? as i32))
}

fn add_uint32(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    Ok(Arg::UInt32(integer(t, v, path)? as u32))
}

fn add_int64(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    Ok(Arg::Int64(integer(t, v, path)? as i64))
}

fn add_uint64(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    Ok(Arg::UInt64(integer(t, v, path)?))
}

fn add_double(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    v.to_number()
        .map(Arg::Double)
        .ok_or_else(|| mismatch(path, t, "a number", v))
}

fn add_bool(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    v.as_bool()
        .map(Arg::Bool)
        .ok_or_else(|| mismatch(path, t, "a boolean", v))
}

fn text(t: &WireType, v: &HostValue, path: &str) -> Result<String> {
    v.to_text().ok_or_else(|| mismatch(path, t, "a string", v))
}

fn add_string(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    Ok(Arg::String(text(t, v, path)?))
}

fn add_object_path(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    Ok(Arg::ObjectPath(text(t, v, path)?))
}

fn add_signature(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    Ok(Arg::Signature(text(t, v, path)?))
}

fn add_unsupported(t: &WireType, _v: &HostValue, _path: &str) -> Result<Arg> {
    Err(not_implemented(t))
}

/// The elements of a host sequence up to, not including, the first nil.
/// An empty mapping counts as an empty sequence.
fn elements<'a>(t: &WireType, v: &'a HostValue, path: &str) -> Result<&'a [HostValue]> {
    match v {
        HostValue::Seq(items) => {
            let end = items.iter().position(HostValue::is_nil).unwrap_or(items.len());
            Ok(&items[..end])
        }
        HostValue::Map(map) if map.is_empty() => Ok(&[]),
        _ => Err(mismatch(path, t, "a sequence", v)),
    }
}

fn add_array(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    let WireType::Array(element) = t else {
        return Err(not_implemented(t));
    };
    let add = add_fn(element);

    let items = elements(t, v, path)?
        .iter()
        .enumerate()
        .map(|(i, item)| add(element, item, &format!("{}[{}]", path, i + 1)))
        .collect::<Result<Vec<_>>>()?;

    Ok(Arg::Array((**element).clone(), items))
}

fn add_struct(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    let WireType::Struct(fields) = t else {
        return Err(not_implemented(t));
    };
    if !matches!(v, HostValue::Seq(_)) {
        return Err(mismatch(path, t, "a sequence", v));
    }

    let mut args = Vec::with_capacity(fields.len());
    for (i, field) in fields.iter().enumerate() {
        let field_path = format!("{}[{}]", path, i + 1);
        let value = v.index(i + 1).ok_or_else(|| {
            context!(ErrorKind::TypeMismatch(format!(
                "argument {}: missing struct field of type '{}'",
                field_path, field
            )))
        })?;
        args.push(add_fn(field)(field, value, &field_path)?);
    }
    Ok(Arg::Struct(args))
}

fn add_dict(t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    let WireType::Array(entry) = t else {
        return Err(not_implemented(t));
    };
    let WireType::DictEntry(kv) = &**entry else {
        return Err(not_implemented(t));
    };
    let [key_type, value_type] = &**kv;
    let (add_key, add_value) = (add_fn(key_type), add_fn(value_type));

    let add_entry = |k: &HostValue, val: &HostValue, entry_path: &str| -> Result<Arg> {
        Ok(Arg::DictEntry(
            Box::new(add_key(key_type, k, entry_path)?),
            Box::new(add_value(value_type, val, entry_path)?),
        ))
    };

    let entries = match v {
        HostValue::Map(map) => map
            .iter()
            .map(|(k, val)| add_entry(k, val, &format!("{}[{}]", path, k)))
            .collect::<Result<Vec<_>>>()?,
        HostValue::Seq(_) => {
            let mut entries = Vec::new();
            for (i, pair) in elements(t, v, path)?.iter().enumerate() {
                let entry_path = format!("{}[{}]", path, i + 1);
                match (pair, pair.index(1), pair.index(2)) {
                    (HostValue::Seq(_), Some(k), Some(val)) => {
                        entries.push(add_entry(k, val, &entry_path)?)
                    }
                    _ => return Err(mismatch(&entry_path, entry, "a key/value pair", pair)),
                }
            }
            entries
        }
        _ => return Err(mismatch(path, t, "a mapping", v)),
    };

    Ok(Arg::Array((**entry).clone(), entries))
}

/// The wire type a variant takes for a host value.
fn infer(v: &HostValue, path: &str) -> Result<WireType> {
    let variant_of = |key: WireType| {
        WireType::Array(Box::new(WireType::DictEntry(Box::new([
            key,
            WireType::Variant,
        ]))))
    };

    match v {
        HostValue::Str(_) => Ok(WireType::String),
        HostValue::Bool(_) => Ok(WireType::Bool),
        HostValue::Number(_) => Ok(WireType::Double),
        HostValue::Seq(_) => Ok(WireType::Array(Box::new(WireType::Variant))),
        HostValue::Map(map) if map.iter().all(|(k, _)| matches!(k, HostValue::Str(_))) => {
            Ok(variant_of(WireType::String))
        }
        HostValue::Map(map) if map.iter().all(|(k, _)| matches!(k, HostValue::Number(_))) => {
            Ok(variant_of(WireType::Double))
        }
        HostValue::Map(_) => Err(context!(ErrorKind::TypeMismatch(format!(
            "argument {}: cannot infer a variant type for a table with mixed keys",
            path
        )))),
        HostValue::Nil => Err(mismatch(path, &WireType::Variant, "a value", v)),
    }
}

fn add_variant(_t: &WireType, v: &HostValue, path: &str) -> Result<Arg> {
    let inner = infer(v, path)?;
    let arg = add_fn(&inner)(&inner, v, path)?;
    Ok(Arg::Variant(Box::new(arg)))
}
