/*!
    conversion between raw register payloads and engineering values

    every rule of how a register's bytes become a physical quantity, a tag or a set of flags lives here, driven by the register's [RegisterDescriptor].
    Integers are little-endian on the wire. Scaling is done exactly on integers and only converted to floating point at the very end, so reading a raw value and writing it back reproduces the same raw integer.
*/

use std::collections::BTreeSet;
use log::*;
use thiserror::Error;

use crate::registers::{RegisterDescriptor, Kind, EnumDomain, BitfieldSpec};


/// value of a register in engineering units
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    /// tag of an enum domain
    Tag(String),
    /// active flags of a bitfield, `NAME` or `NAME=TAG` for multi-state flags
    Flags(BTreeSet<String>),
    Text(String),
}
impl Value {
    /// numeric value, if any
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float(value) => Some(value),
            Value::Integer(value) => Some(value as f64),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Integer(value) => Some(value),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Tag(text) | Value::Text(text) => Some(text),
            _ => None,
        }
    }
    pub fn flags(&self) -> Option<&BTreeSet<String>> {
        match self {
            Value::Flags(flags) => Some(flags),
            _ => None,
        }
    }
    /// build a flag set from names
    pub fn flags_of<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Value::Flags(names.into_iter().map(str::to_owned).collect())
    }
    fn describe(&self) -> String {
        match self {
            Value::Integer(value) => value.to_string(),
            Value::Float(value) => value.to_string(),
            Value::Tag(text) | Value::Text(text) => format!("{:?}", text),
            Value::Flags(flags) => format!("{:?}", flags),
        }
    }
}
impl From<i64> for Value {
    fn from(value: i64) -> Self {Value::Integer(value)}
}
impl From<i32> for Value {
    fn from(value: i32) -> Self {Value::Integer(i64::from(value))}
}
impl From<f64> for Value {
    fn from(value: f64) -> Self {Value::Float(value)}
}
impl From<bool> for Value {
    fn from(value: bool) -> Self {Value::Integer(i64::from(value))}
}
/// strings are taken as enum tags, use [Value::Text] for text registers
impl From<&str> for Value {
    fn from(value: &str) -> Self {Value::Tag(value.to_owned())}
}


/// error converting a value to or from its raw representation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("{value} does not fit register {register}, accepted range is {min} ..= {max} raw")]
    OutOfRange {register: &'static str, value: String, min: i64, max: i64},
    #[error("{value} is not a legal value of {register}, legal values are {legal:?}")]
    InvalidEnumValue {register: &'static str, value: String, legal: Vec<i64>},
    #[error("register {register} has no flag named {flag:?}")]
    UnknownFlag {register: &'static str, flag: String},
    #[error("register {register} expects {expected}")]
    TypeMismatch {register: &'static str, expected: &'static str},
    #[error("module sent an invalid value for {register}: {reason}")]
    ProtocolViolation {register: &'static str, reason: String},
}


/// raw payload of a register for the given engineering value
pub fn to_raw(descriptor: &RegisterDescriptor, value: &Value) -> Result<Vec<u8>, ConversionError> {
    let raw = match descriptor.kind {
        Kind::Integer => {
            let Value::Integer(value) = *value
                else {return Err(mismatch(descriptor, "an integer"))};
            integer_to_raw(descriptor, value)?
        },
        Kind::Float => {
            let Some(value) = value.as_f64()
                else {return Err(mismatch(descriptor, "a number"))};
            float_to_raw(descriptor, value)?
        },
        Kind::Single => {
            let Some(value) = value.as_f64()
                else {return Err(mismatch(descriptor, "a number"))};
            let single = value as f32;
            if !value.is_finite() || !single.is_finite()
                {return Err(out_of_range(descriptor, value, f32::MIN as i64, f32::MAX as i64))}
            return Ok(single.to_le_bytes().to_vec())
        },
        Kind::Enum(domain) => enum_to_raw(descriptor, domain, value)?,
        Kind::Bitfield(spec) => {
            let Value::Flags(flags) = value
                else {return Err(mismatch(descriptor, "a set of flags"))};
            flags_to_raw(descriptor, spec, flags)?
        },
        Kind::Ascii => {
            let Value::Text(text) = value
                else {return Err(mismatch(descriptor, "text"))};
            if !text.is_ascii() || text.len() > usize::from(descriptor.width)
                {return Err(ConversionError::OutOfRange {
                    register: descriptor.name,
                    value: value.describe(),
                    min: 0,
                    max: i64::from(descriptor.width),
                    })}
            return Ok(text.as_bytes().to_vec())
        },
    };
    let (min, max) = bounds(descriptor);
    if raw < min || raw > max
        {return Err(out_of_range(descriptor, value.describe(), min, max))}
    Ok(pack(descriptor, raw))
}

/// engineering value of a raw register payload received from the module
pub fn from_raw(descriptor: &RegisterDescriptor, bytes: &[u8]) -> Result<Value, ConversionError> {
    match descriptor.kind {
        Kind::Integer => {
            let raw = unpack(descriptor, bytes)?;
            let scaled = shifted(descriptor, raw)?.checked_mul(descriptor.scale.numerator)
                .ok_or_else(|| violation(descriptor, format!("raw {} overflows scaling", raw)))?;
            if scaled % descriptor.scale.denominator != 0
                {return Err(violation(descriptor, format!("raw {} is not an integer value", raw)))}
            Ok(Value::Integer(scaled / descriptor.scale.denominator))
        },
        Kind::Float => {
            let raw = unpack(descriptor, bytes)?;
            // exact up to this single rounding
            let scaled = shifted(descriptor, raw)?.checked_mul(descriptor.scale.numerator)
                .ok_or_else(|| violation(descriptor, format!("raw {} overflows scaling", raw)))?;
            Ok(Value::Float(scaled as f64 / descriptor.scale.denominator as f64))
        },
        Kind::Single => {
            let bytes: [u8; 4] = bytes.try_into()
                .map_err(|_| violation(descriptor, format!("{} bytes received, 4 expected", bytes.len())))?;
            let value = f32::from_le_bytes(bytes);
            if !value.is_finite()
                {return Err(violation(descriptor, format!("non finite float {}", value)))}
            Ok(Value::Float(f64::from(value)))
        },
        Kind::Enum(domain) => {
            let raw = unpack(descriptor, bytes)?;
            domain.tag(raw)
                .map(|tag| Value::Tag(tag.to_owned()))
                .ok_or_else(|| violation(descriptor, format!("raw {} is outside domain {} {:?}", raw, domain.name, domain.legal())))
        },
        Kind::Bitfield(spec) => {
            let raw = unpack(descriptor, bytes)?;
            raw_to_flags(descriptor, spec, raw).map(Value::Flags)
        },
        Kind::Ascii => {
            if bytes.len() > usize::from(descriptor.width)
                {return Err(violation(descriptor, format!("{} bytes of text, at most {} expected", bytes.len(), descriptor.width)))}
            let end = bytes.iter().rposition(|&byte| byte != 0).map_or(0, |last| last + 1);
            let text = std::str::from_utf8(&bytes[.. end])
                .map_err(|_| violation(descriptor, "text is not valid UTF-8".into()))?;
            Ok(Value::Text(text.to_owned()))
        },
    }
}

/// smallest and largest raw integer the register can hold
pub fn bounds(descriptor: &RegisterDescriptor) -> (i64, i64) {
    let bits = 8 * u32::from(descriptor.width.min(4));
    if descriptor.signed {
        (-(1i64 << (bits - 1)), (1i64 << (bits - 1)) - 1)
    }
    else {
        (0, (1i64 << bits) - 1)
    }
}


fn integer_to_raw(descriptor: &RegisterDescriptor, value: i64) -> Result<i64, ConversionError> {
    let (min, max) = bounds(descriptor);
    let scale = descriptor.scale;
    value.checked_mul(scale.denominator)
        .filter(|scaled| scaled % scale.numerator == 0)
        .and_then(|scaled| (scaled / scale.numerator).checked_sub(descriptor.offset))
        .ok_or_else(|| out_of_range(descriptor, value, min, max))
}

fn float_to_raw(descriptor: &RegisterDescriptor, value: f64) -> Result<i64, ConversionError> {
    let (min, max) = bounds(descriptor);
    let scale = descriptor.scale;
    let quantized = (value * scale.denominator as f64 / scale.numerator as f64).round();
    // beyond this, integers are no longer exact in f64 and fit no register anyway
    if !quantized.is_finite() || quantized.abs() >= 2f64.powi(52)
        {return Err(out_of_range(descriptor, value, min, max))}
    (quantized as i64).checked_sub(descriptor.offset)
        .ok_or_else(|| out_of_range(descriptor, value, min, max))
}

fn enum_to_raw(descriptor: &RegisterDescriptor, domain: &EnumDomain, value: &Value) -> Result<i64, ConversionError> {
    let raw = match value {
        Value::Tag(tag) => domain.raw(tag),
        &Value::Integer(raw) => Some(raw).filter(|&raw| domain.contains(raw)),
        _ => return Err(mismatch(descriptor, "a tag or an integer")),
    };
    raw.ok_or_else(|| ConversionError::InvalidEnumValue {
        register: descriptor.name,
        value: value.describe(),
        legal: domain.legal(),
        })
}

fn flags_to_raw(descriptor: &RegisterDescriptor, spec: &BitfieldSpec, flags: &BTreeSet<String>) -> Result<i64, ConversionError> {
    let mut raw = 0u64;
    // a multi-state flag holds one state at a time
    let mut assigned = BTreeSet::new();
    for entry in flags {
        let (name, state) = match entry.split_once('=') {
            Some((name, state)) => (name, Some(state)),
            None => (entry.as_str(), None),
        };
        let flag = spec.flag(name)
            .ok_or_else(|| ConversionError::UnknownFlag {register: descriptor.name, flag: entry.clone()})?;
        let bits = match (flag.states, state) {
            (Some(domain), Some(state)) => domain.raw(state)
                .filter(|_| assigned.insert(flag.name))
                .ok_or_else(|| ConversionError::InvalidEnumValue {
                    register: descriptor.name,
                    value: format!("{:?}", entry),
                    legal: domain.legal(),
                    })?,
            (None, None) => 1,
            // a state is required exactly for multi-state flags
            _ => return Err(ConversionError::UnknownFlag {register: descriptor.name, flag: entry.clone()}),
        };
        raw |= ((bits as u64) << flag.offset) & flag.mask();
    }
    Ok(raw as i64)
}

fn raw_to_flags(descriptor: &RegisterDescriptor, spec: &BitfieldSpec, raw: i64) -> Result<BTreeSet<String>, ConversionError> {
    let raw = raw as u64;
    let undeclared = raw & !spec.mask();
    if undeclared != 0
        {debug!("ignore undeclared bits {:#x} in {}", undeclared, descriptor.name)}

    let mut active = BTreeSet::new();
    for flag in spec.flags {
        let bits = (raw & flag.mask()) >> flag.offset;
        match flag.states {
            Some(domain) => {
                let state = domain.tag(bits as i64)
                    .ok_or_else(|| violation(descriptor, format!("flag {} in unknown state {}", flag.name, bits)))?;
                active.insert(format!("{}={}", flag.name, state));
            },
            None => if bits != 0 {
                active.insert(flag.name.to_owned());
            },
        }
    }
    Ok(active)
}

/// raw integer with the register offset applied
fn shifted(descriptor: &RegisterDescriptor, raw: i64) -> Result<i64, ConversionError> {
    raw.checked_add(descriptor.offset)
        .ok_or_else(|| violation(descriptor, format!("raw {} overflows offset", raw)))
}

fn pack(descriptor: &RegisterDescriptor, raw: i64) -> Vec<u8> {
    // bounds were checked, truncation keeps the two's complement representation
    raw.to_le_bytes()[.. usize::from(descriptor.width)].to_vec()
}

fn unpack(descriptor: &RegisterDescriptor, bytes: &[u8]) -> Result<i64, ConversionError> {
    let raw = match (bytes, descriptor.signed) {
        (&[a], false) => i64::from(a),
        (&[a], true) => i64::from(a as i8),
        (&[a, b], false) => i64::from(u16::from_le_bytes([a, b])),
        (&[a, b], true) => i64::from(i16::from_le_bytes([a, b])),
        (&[a, b, c, d], false) => i64::from(u32::from_le_bytes([a, b, c, d])),
        (&[a, b, c, d], true) => i64::from(i32::from_le_bytes([a, b, c, d])),
        _ => return Err(violation(descriptor, format!("{} bytes received", bytes.len()))),
    };
    if bytes.len() != usize::from(descriptor.width)
        {return Err(violation(descriptor, format!("{} bytes received, {} expected", bytes.len(), descriptor.width)))}
    Ok(raw)
}

fn out_of_range(descriptor: &RegisterDescriptor, value: impl ToString, min: i64, max: i64) -> ConversionError {
    ConversionError::OutOfRange {register: descriptor.name, value: value.to_string(), min, max}
}
fn mismatch(descriptor: &RegisterDescriptor, expected: &'static str) -> ConversionError {
    ConversionError::TypeMismatch {register: descriptor.name, expected}
}
fn violation(descriptor: &RegisterDescriptor, reason: String) -> ConversionError {
    ConversionError::ProtocolViolation {register: descriptor.name, reason}
}
