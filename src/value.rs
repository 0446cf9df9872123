//! Typed configuration slots: one descriptor struct carrying a value
//! variant, a flag set, the states in which access is legal, and three
//! optional hooks (default, validator, task-env preparation). Properties
//! and data slots both build on this.

use std::collections::BTreeMap;

use crate::config::Config;
use crate::container::Container;
use crate::env::TaskEnv;
use crate::error::{Error, ErrorKind, Result};

/// Slot flags.
pub mod flags {
    /// Saved into the persistent record and restored after daemon restart.
    pub const PERSISTENT: u32 = 1 << 0;
    /// Not shown in property listings.
    pub const HIDDEN: u32 = 1 << 1;
    /// Never writable by clients.
    pub const READ_ONLY: u32 = 1 << 2;
    /// Writable only by the superuser.
    pub const SUPERUSER_ONLY: u32 = 1 << 3;
    /// String value must be an absolute, normalized path.
    pub const PATH_VALIDATED: u32 = 1 << 4;
    /// Writable only while the parent is stopped.
    pub const PARENT_RO: u32 = 1 << 5;
    /// Default comes from the parent's value.
    pub const PARENT_DEFAULT: u32 = 1 << 6;
    /// Interpreted relative to the container root when root is set.
    pub const RESTRICTED_ROOT: u32 = 1 << 7;
    /// virt_mode=os replaces the default.
    pub const OS_MODE_OVERRIDE: u32 = 1 << 8;
    /// Uint values accept K/M/G suffixes.
    pub const UINT_HAS_UNIT: u32 = 1 << 9;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Int,
    Uint,
    Bool,
    List,
    IntList,
    UintMap,
}

/// A slot value. The wire and kv representation is always a string; `parse`
/// and `format` below define it per kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Uint(u64),
    Bool(bool),
    List(Vec<String>),
    IntList(Vec<i64>),
    UintMap(BTreeMap<String, u64>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::Int(_) => ValueKind::Int,
            Value::Uint(_) => ValueKind::Uint,
            Value::Bool(_) => ValueKind::Bool,
            Value::List(_) => ValueKind::List,
            Value::IntList(_) => ValueKind::IntList,
            Value::UintMap(_) => ValueKind::UintMap,
        }
    }

    pub fn empty(kind: ValueKind) -> Value {
        match kind {
            ValueKind::Str => Value::Str(String::new()),
            ValueKind::Int => Value::Int(0),
            ValueKind::Uint => Value::Uint(0),
            ValueKind::Bool => Value::Bool(false),
            ValueKind::List => Value::List(vec![]),
            ValueKind::IntList => Value::IntList(vec![]),
            ValueKind::UintMap => Value::UintMap(BTreeMap::new()),
        }
    }

    /// Parse the client/kv string representation of a slot of `kind`.
    /// Lists split on ';', maps are `name: value` pairs separated by ';'.
    pub fn parse(kind: ValueKind, s: &str, has_unit: bool) -> Result<Value> {
        match kind {
            ValueKind::Str => Ok(Value::Str(s.to_string())),
            ValueKind::Int => s
                .trim()
                .parse()
                .map(Value::Int)
                .map_err(|_| invalid(s, "integer")),
            ValueKind::Uint => parse_uint(s.trim(), has_unit).map(Value::Uint),
            ValueKind::Bool => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(invalid(s, "boolean")),
            },
            ValueKind::List => Ok(Value::List(split_list(s))),
            ValueKind::IntList => {
                let mut items = vec![];
                for item in split_list(s) {
                    items.push(item.parse().map_err(|_| invalid(&item, "integer"))?);
                }
                Ok(Value::IntList(items))
            }
            ValueKind::UintMap => {
                let mut map = BTreeMap::new();
                for item in split_list(s) {
                    let mut kv = item.splitn(2, ':');
                    let key = kv.next().unwrap_or("").trim();
                    let val = kv.next().unwrap_or("").trim();
                    if key.is_empty() || val.is_empty() {
                        return Err(invalid(&item, "name: value pair"));
                    }
                    map.insert(key.to_string(), parse_uint(val, has_unit)?);
                }
                Ok(Value::UintMap(map))
            }
        }
    }

    pub fn format(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(v) => v.to_string(),
            Value::Uint(v) => v.to_string(),
            Value::Bool(v) => v.to_string(),
            Value::List(items) => items.join("; "),
            Value::IntList(items) => items
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; "),
            Value::UintMap(map) => map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Value::Str(s) => s,
            _ => "",
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(v) => *v,
            Value::Uint(v) => *v as i64,
            _ => 0,
        }
    }

    pub fn as_uint(&self) -> u64 {
        match self {
            Value::Uint(v) => *v,
            Value::Int(v) => *v as u64,
            _ => 0,
        }
    }

    pub fn as_bool(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    pub fn as_list(&self) -> &[String] {
        match self {
            Value::List(items) => items,
            _ => &[],
        }
    }

    pub fn as_uint_map(&self) -> Option<&BTreeMap<String, u64>> {
        match self {
            Value::UintMap(map) => Some(map),
            _ => None,
        }
    }
}

fn invalid(s: &str, what: &str) -> Error {
    Error::new(
        ErrorKind::InvalidValue,
        format!("cannot parse {:?} as {}", s, what),
    )
}

fn split_list(s: &str) -> Vec<String> {
    s.split(';')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn parse_uint(s: &str, has_unit: bool) -> Result<u64> {
    if !has_unit {
        return s.parse().map_err(|_| invalid(s, "unsigned integer"));
    }
    let (digits, mult) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1u64 << 10),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1u64 << 20),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1u64 << 30),
        _ => (s, 1),
    };
    let base: u64 = digits
        .trim()
        .parse()
        .map_err(|_| invalid(s, "unsigned integer"))?;
    base.checked_mul(mult)
        .ok_or_else(|| invalid(s, "unsigned integer"))
}

/// A property or data slot descriptor.
pub struct Slot {
    pub name: &'static str,
    pub desc: &'static str,
    pub kind: ValueKind,
    pub flags: u32,
    /// Bitmask of container states in which reads are legal; 0 means any.
    pub read_states: u32,
    /// Bitmask of container states in which writes are legal; 0 means never.
    pub write_states: u32,
    /// Computes the effective value when the slot is unset.
    pub def: Option<fn(&Container, &Config) -> Value>,
    /// Rejects bad values before they are stored.
    pub validate: Option<fn(&Container, &Config, &Value) -> Result<()>>,
    /// Maps the stored value into the task launch environment.
    pub prepare_task_env: Option<fn(&Container, &Config, &Value, &mut TaskEnv) -> Result<()>>,
}

impl Slot {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_round_trip() {
        let v = Value::parse(ValueKind::List, "a; b;c", false).unwrap();
        assert_eq!(v.as_list(), &["a", "b", "c"]);
        assert_eq!(v.format(), "a; b; c");

        let v = Value::parse(ValueKind::UintMap, "eth0: 10; default: 20", false).unwrap();
        let map = v.as_uint_map().unwrap();
        assert_eq!(map["eth0"], 10);
        assert_eq!(v.format(), "default: 20; eth0: 10");
    }

    #[test]
    fn bool_is_strict() {
        assert!(Value::parse(ValueKind::Bool, "true", false).is_ok());
        assert!(Value::parse(ValueKind::Bool, "1", false).is_err());
    }

    #[test]
    fn uint_units() {
        assert_eq!(
            Value::parse(ValueKind::Uint, "16M", true).unwrap().as_uint(),
            16 << 20
        );
        assert_eq!(
            Value::parse(ValueKind::Uint, "2G", true).unwrap().as_uint(),
            2 << 30
        );
        assert!(Value::parse(ValueKind::Uint, "16M", false).is_err());
        assert!(Value::parse(ValueKind::Uint, "999999999999G", true).is_err());
    }

    #[test]
    fn empty_values_match_kind() {
        for kind in &[
            ValueKind::Str,
            ValueKind::Int,
            ValueKind::Uint,
            ValueKind::Bool,
            ValueKind::List,
            ValueKind::IntList,
            ValueKind::UintMap,
        ] {
            assert_eq!(Value::empty(*kind).kind(), *kind);
        }
    }
}
