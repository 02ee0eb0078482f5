//! Wire arguments to host values.
//!
//! The mirror image of [`encode`](crate::encode): one push-function per wire
//! tag, chosen from the declared type. Variants are unwrapped transparently,
//! dictionaries become mappings, other arrays and structs become sequences.

use crate::error::*;
use crate::message::Message;
use crate::signature::{self, WireType};
use crate::value::{Arg, HostMap, HostValue};

type PushFn = fn(&WireType, &Arg) -> Result<HostValue>;

/// Decode the body of a message.
///
/// The body has to match the signature the message declares.
pub fn decode(message: &Message) -> Result<Vec<HostValue>> {
    let actual = signature::to_signature(
        &message.body.iter().map(Arg::wire_type).collect::<Vec<_>>(),
    );
    if actual != message.signature {
        return Err(violation(format!(
            "message body '{}' does not match its signature '{}'",
            actual, message.signature
        )));
    }
    decode_args(&message.body)
}

/// Decode a list of arguments, each against its own type.
pub fn decode_args(args: &[Arg]) -> Result<Vec<HostValue>> {
    args.iter().map(|arg| push(&arg.wire_type(), arg)).collect()
}

fn violation(msg: String) -> Error {
    context!(ErrorKind::ProtocolViolation(msg))
}

/// Push `arg`, which has to be an instance of `declared`.
fn push(declared: &WireType, arg: &Arg) -> Result<HostValue> {
    if arg.code() != declared.code() {
        return Err(violation(format!(
            "expected '{}', got '{}'",
            declared,
            arg.wire_type()
        )));
    }
    push_fn(declared)(declared, arg)
}

fn push_fn(t: &WireType) -> PushFn {
    match t {
        WireType::Byte
        | WireType::Int16
        | WireType::UInt16
        | WireType::Int32
        | WireType::UInt32
        | WireType::Int64
        | WireType::UInt64
        | WireType::Double => push_number,
        WireType::Bool => push_bool,
        WireType::String | WireType::ObjectPath | WireType::Signature => push_string,
        WireType::Array(_) if t.is_dict() => push_dict,
        WireType::Array(_) => push_array,
        WireType::Struct(_) => push_struct,
        WireType::Variant => push_variant,
        WireType::UnixFd | WireType::DictEntry(_) => push_unsupported,
    }
}

fn push_number(_t: &WireType, arg: &Arg) -> Result<HostValue> {
    let n = match *arg {
        Arg::Byte(n) => n.into(),
        Arg::Int16(n) => n.into(),
        Arg::UInt16(n) => n.into(),
        Arg::Int32(n) => n.into(),
        Arg::UInt32(n) => n.into(),
        Arg::Int64(n) => n as f64,
        Arg::UInt64(n) => n as f64,
        Arg::Double(n) => n,
        ref a => return Err(violation(format!("'{}' is not a number", a.wire_type()))),
    };
    Ok(HostValue::Number(n))
}

fn push_bool(_t: &WireType, arg: &Arg) -> Result<HostValue> {
    match arg {
        Arg::Bool(b) => Ok(HostValue::Bool(*b)),
        a => Err(violation(format!("'{}' is not a boolean", a.wire_type()))),
    }
}

fn push_string(_t: &WireType, arg: &Arg) -> Result<HostValue> {
    match arg {
        Arg::String(s) | Arg::ObjectPath(s) | Arg::Signature(s) => Ok(HostValue::Str(s.clone())),
        a => Err(violation(format!("'{}' is not a string", a.wire_type()))),
    }
}

fn push_unsupported(t: &WireType, _arg: &Arg) -> Result<HostValue> {
    match t {
        WireType::DictEntry(_) => Err(violation(format!(
            "dict entry '{}' outside of a dictionary",
            t
        ))),
        _ => Err(violation(format!("cannot decode type '{}'", t))),
    }
}

/// The items of an array argument, checked against the declared element.
fn array_items<'a>(t: &WireType, arg: &'a Arg) -> Result<(&'a WireType, &'a [Arg])> {
    match (t, arg) {
        (WireType::Array(declared), Arg::Array(element, items)) if **declared == *element => {
            Ok((element, items))
        }
        _ => Err(violation(format!(
            "expected '{}', got '{}'",
            t,
            arg.wire_type()
        ))),
    }
}

fn push_array(t: &WireType, arg: &Arg) -> Result<HostValue> {
    let (element, items) = array_items(t, arg)?;
    let push_element = push_fn(element);

    items
        .iter()
        .map(|item| {
            if item.code() != element.code() {
                return Err(violation(format!(
                    "array element '{}' in array of '{}'",
                    item.wire_type(),
                    element
                )));
            }
            push_element(element, item)
        })
        .collect::<Result<Vec<_>>>()
        .map(HostValue::Seq)
}

fn push_dict(t: &WireType, arg: &Arg) -> Result<HostValue> {
    let (element, entries) = array_items(t, arg)?;
    let WireType::DictEntry(kv) = element else {
        return Err(violation(format!("'{}' is not a dictionary", t)));
    };
    let [key_type, value_type] = &**kv;

    let mut map = HostMap::new();
    for entry in entries {
        match entry {
            Arg::DictEntry(k, v) => {
                map.insert(push(key_type, k)?, push(value_type, v)?);
            }
            a => {
                return Err(violation(format!(
                    "'{}' in dictionary of '{}'",
                    a.wire_type(),
                    element
                )))
            }
        }
    }
    Ok(HostValue::Map(map))
}

fn push_struct(t: &WireType, arg: &Arg) -> Result<HostValue> {
    match (t, arg) {
        (WireType::Struct(types), Arg::Struct(fields)) if types.len() == fields.len() => types
            .iter()
            .zip(fields)
            .map(|(t, field)| push(t, field))
            .collect::<Result<Vec<_>>>()
            .map(HostValue::Seq),
        _ => Err(violation(format!(
            "expected '{}', got '{}'",
            t,
            arg.wire_type()
        ))),
    }
}

fn push_variant(_t: &WireType, arg: &Arg) -> Result<HostValue> {
    match arg {
        Arg::Variant(inner) => push(&inner.wire_type(), inner),
        a => Err(violation(format!("'{}' is not a variant", a.wire_type()))),
    }
}
