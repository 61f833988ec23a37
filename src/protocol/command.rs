//! Logical command definitions and parameter binding.
//!
//! Commands are static value objects defined once per protocol. Callers
//! supply named [`Params`]; [`Command::bind`] resolves them into the
//! ordered, range-checked argument list the codecs serialize.

use std::fmt;

use crate::error::{Error, Result};

/// How many responses a command produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseArity {
    /// Nothing comes back; completion is the write itself.
    None,
    /// Exactly one acknowledgement.
    Single,
    /// One acknowledgement, then asynchronous frames until reconfigured.
    Streaming,
}

impl ResponseArity {
    /// Returns true if the dispatcher must wait for an acknowledgement.
    #[must_use]
    pub const fn expects_reply(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Wire type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    Text,
}

impl ParamKind {
    /// Fixed encoded width in bytes, `None` for text.
    #[must_use]
    pub const fn width(self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 => Some(4),
            Self::Text => None,
        }
    }

    const fn range(self) -> (i64, i64) {
        match self {
            Self::U8 => (0, u8::MAX as i64),
            Self::I8 => (i8::MIN as i64, i8::MAX as i64),
            Self::U16 => (0, u16::MAX as i64),
            Self::I16 => (i16::MIN as i64, i16::MAX as i64),
            Self::U32 => (0, u32::MAX as i64),
            Self::I32 => (i32::MIN as i64, i32::MAX as i64),
            Self::Text => (0, 0),
        }
    }
}

/// Definition of one command parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub default: Option<i64>,
}

impl ParamSpec {
    /// A parameter the caller must supply.
    #[must_use]
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            default: None,
        }
    }

    /// A parameter with a default value.
    #[must_use]
    pub const fn or(name: &'static str, kind: ParamKind, default: i64) -> Self {
        Self {
            name,
            kind,
            default: Some(default),
        }
    }
}

/// A parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Int(i64),
    Text(String),
}

impl ParamValue {
    /// Returns the integer value, if any.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Text(_) => None,
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for ParamValue {
            fn from(v: $t) -> Self {
                Self::Int(i64::from(v))
            }
        })*
    };
}

impl_from_int!(u8, i8, u16, i16, u32, i32, i64);

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v:?}"),
        }
    }
}

/// Named parameters supplied by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    values: Vec<(String, ParamValue)>,
}

impl Params {
    /// Creates an empty parameter set.
    #[must_use]
    pub const fn new() -> Self {
        Self { values: Vec::new() }
    }

    /// Adds or replaces a parameter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Adds or replaces a parameter in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.values.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.values.push((name, value));
        }
    }

    /// Looks up a parameter by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Number of parameters set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if no parameter is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// A logical operation understood by one protocol family.
#[derive(Debug, PartialEq, Eq)]
pub struct Command {
    pub name: &'static str,
    /// Protocol-specific opcode bytes.
    pub opcode: &'static [u8],
    pub params: &'static [ParamSpec],
    pub response: ResponseArity,
    /// Identifier echoed by the device in its acknowledgement.
    pub tag: u8,
}

impl Command {
    /// Resolves named parameters into ordered, range-checked arguments.
    ///
    /// Missing parameters take their defaults; unknown names are rejected.
    pub fn bind(&self, params: &Params) -> Result<Vec<ParamValue>> {
        if let Some((name, _)) = params
            .iter()
            .find(|(name, _)| !self.params.iter().any(|spec| spec.name == *name))
        {
            return Err(self.invalid(format!("unknown parameter '{name}'")));
        }

        self.params
            .iter()
            .map(|spec| {
                let value = match (params.get(spec.name), spec.default) {
                    (Some(value), _) => value.clone(),
                    (None, Some(default)) => ParamValue::Int(default),
                    (None, None) => {
                        return Err(self.invalid(format!("missing parameter '{}'", spec.name)));
                    }
                };
                self.check(spec, &value)?;
                Ok(value)
            })
            .collect()
    }

    fn check(&self, spec: &ParamSpec, value: &ParamValue) -> Result<()> {
        match (spec.kind, value) {
            (ParamKind::Text, ParamValue::Text(text)) => {
                if text.is_ascii() {
                    Ok(())
                } else {
                    Err(self.invalid(format!("'{}' must be ASCII", spec.name)))
                }
            }
            (ParamKind::Text, ParamValue::Int(_)) => {
                Err(self.invalid(format!("'{}' must be text", spec.name)))
            }
            (_, ParamValue::Text(_)) => {
                Err(self.invalid(format!("'{}' must be an integer", spec.name)))
            }
            (kind, ParamValue::Int(v)) => {
                let (min, max) = kind.range();
                if (min..=max).contains(v) {
                    Ok(())
                } else {
                    Err(self.invalid(format!(
                        "'{}' = {v} outside {min}..={max}",
                        spec.name
                    )))
                }
            }
        }
    }

    pub(crate) fn invalid(&self, reason: String) -> Error {
        Error::InvalidParams {
            command: self.name,
            reason,
        }
    }
}

/// A command recovered from its encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    pub command: &'static Command,
    pub args: Vec<ParamValue>,
}

/// Looks up a command by name in a table.
pub(crate) fn find<'a>(table: &'a [Command], name: &str) -> Option<&'a Command> {
    table.iter().find(|c| c.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    static ROLL: Command = Command {
        name: "roll",
        opcode: &[0x02, 0x30],
        params: &[
            ParamSpec::required("speed", ParamKind::U8),
            ParamSpec::required("heading", ParamKind::U16),
            ParamSpec::or("state", ParamKind::U8, 1),
        ],
        response: ResponseArity::Single,
        tag: 0x0C,
    };

    #[test]
    fn test_bind_fills_defaults_in_order() {
        let params = Params::new().with("heading", 90u16).with("speed", 180u8);
        let args = ROLL.bind(&params).unwrap();
        assert_eq!(
            args,
            vec![ParamValue::Int(180), ParamValue::Int(90), ParamValue::Int(1)]
        );
    }

    #[test]
    fn test_bind_rejects_missing_and_unknown() {
        let missing = ROLL.bind(&Params::new().with("speed", 1));
        assert!(matches!(missing, Err(Error::InvalidParams { command: "roll", .. })));

        let unknown = ROLL.bind(&Params::new().with("speed", 1).with("heading", 2).with("spin", 3));
        assert!(matches!(unknown, Err(Error::InvalidParams { .. })));
    }

    #[test]
    fn test_bind_range_check() {
        let params = Params::new().with("speed", 300).with("heading", 0);
        assert!(ROLL.bind(&params).is_err());

        let params = Params::new().with("speed", "fast").with("heading", 0);
        assert!(ROLL.bind(&params).is_err());
    }

    #[test]
    fn test_params_set_replaces() {
        let mut params = Params::new().with("a", 1);
        params.set("a", 2);
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("a"), Some(&ParamValue::Int(2)));
    }
}
