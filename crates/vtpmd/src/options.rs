//! Comma-separated `key=value` option strings.
//!
//! Every option flag carries its own table of recognized keys; anything off
//! the table is an error, caught before the daemon starts serving. A bare
//! key is shorthand for a true boolean.

use std::collections::HashMap;

/// Value kind a key accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptKind {
    /// Free-form string.
    String,
    /// Decimal unsigned integer.
    Uint,
    /// Octal permission bits, at most 0777.
    Mode,
    /// `true`/`false`/`1`/`0`, or bare-key shorthand for true.
    Bool,
}

/// One recognized key.
#[derive(Debug, Clone, Copy)]
pub struct OptionDesc {
    /// Key name.
    pub name: &'static str,
    /// Value kind.
    pub kind: OptKind,
}

/// Shorthand for building key tables.
pub const fn opt(name: &'static str, kind: OptKind) -> OptionDesc {
    OptionDesc { name, kind }
}

/// Option-string parse errors.
#[derive(Debug, thiserror::Error)]
pub enum OptError {
    /// A key not present in the option's table.
    #[error("unknown option key '{0}'")]
    UnknownKey(String),
    /// A value that does not parse for its kind.
    #[error("invalid value '{1}' for key '{0}'")]
    InvalidValue(String, String),
    /// A non-boolean key without a value.
    #[error("missing value for key '{0}'")]
    MissingValue(String),
}

#[derive(Debug, Clone)]
enum OptValue {
    Str(String),
    Uint(u64),
    Mode(u32),
    Bool(bool),
}

/// Parsed values of one option string.
#[derive(Debug, Default)]
pub struct OptionValues {
    values: HashMap<&'static str, OptValue>,
}

impl OptionValues {
    /// String value of `name`, when given.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(OptValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Unsigned value of `name`, when given.
    pub fn get_uint(&self, name: &str) -> Option<u64> {
        match self.values.get(name) {
            Some(OptValue::Uint(v)) => Some(*v),
            _ => None,
        }
    }

    /// Mode bits of `name`, when given.
    pub fn get_mode(&self, name: &str) -> Option<u32> {
        match self.values.get(name) {
            Some(OptValue::Mode(v)) => Some(*v),
            _ => None,
        }
    }

    /// Boolean value of `name`, or `default` when absent.
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        match self.values.get(name) {
            Some(OptValue::Bool(v)) => *v,
            _ => default,
        }
    }
}

/// Parse `input` against a key table.
pub fn parse(descs: &[OptionDesc], input: &str) -> Result<OptionValues, OptError> {
    let mut out = OptionValues::default();
    for item in input.split(',') {
        if item.is_empty() {
            continue;
        }
        let (key, value) = match item.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (item, None),
        };
        let desc = descs
            .iter()
            .find(|d| d.name == key)
            .ok_or_else(|| OptError::UnknownKey(key.to_string()))?;
        let parsed = match (desc.kind, value) {
            (OptKind::Bool, None) => OptValue::Bool(true),
            (_, None) => return Err(OptError::MissingValue(key.to_string())),
            (OptKind::String, Some(v)) => OptValue::Str(v.to_string()),
            (OptKind::Uint, Some(v)) => OptValue::Uint(
                v.parse()
                    .map_err(|_| OptError::InvalidValue(key.to_string(), v.to_string()))?,
            ),
            (OptKind::Mode, Some(v)) => {
                let bits = u32::from_str_radix(v, 8)
                    .map_err(|_| OptError::InvalidValue(key.to_string(), v.to_string()))?;
                if bits > 0o777 {
                    return Err(OptError::InvalidValue(key.to_string(), v.to_string()));
                }
                OptValue::Mode(bits)
            }
            (OptKind::Bool, Some(v)) => match v {
                "true" | "1" => OptValue::Bool(true),
                "false" | "0" => OptValue::Bool(false),
                _ => return Err(OptError::InvalidValue(key.to_string(), v.to_string())),
            },
        };
        out.values.insert(desc.name, parsed);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[OptionDesc] = &[
        opt("dir", OptKind::String),
        opt("mode", OptKind::Mode),
        opt("lock", OptKind::Bool),
        opt("port", OptKind::Uint),
    ];

    #[test]
    fn parses_mixed_values() {
        let ovs = parse(TABLE, "dir=/tmp/tpm,mode=0640,lock,port=2321").unwrap();
        assert_eq!(ovs.get_str("dir"), Some("/tmp/tpm"));
        assert_eq!(ovs.get_mode("mode"), Some(0o640));
        assert!(ovs.get_bool("lock", false));
        assert_eq!(ovs.get_uint("port"), Some(2321));
    }

    #[test]
    fn explicit_booleans() {
        let ovs = parse(TABLE, "lock=false").unwrap();
        assert!(!ovs.get_bool("lock", true));
        assert!(parse(TABLE, "lock=maybe").is_err());
    }

    #[test]
    fn unknown_keys_are_errors() {
        assert!(matches!(parse(TABLE, "dir=/x,unknown=1"), Err(OptError::UnknownKey(_))));
    }

    #[test]
    fn missing_values_are_errors() {
        assert!(matches!(parse(TABLE, "dir"), Err(OptError::MissingValue(_))));
    }

    #[test]
    fn mode_is_octal_and_bounded() {
        assert!(parse(TABLE, "mode=640").unwrap().get_mode("mode") == Some(0o640));
        assert!(parse(TABLE, "mode=1777").is_err());
        assert!(parse(TABLE, "mode=abc").is_err());
    }
}
