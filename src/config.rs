//! Memory budgets and storage options.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Storage options accepted when creating target and staging arrays.
pub const STORAGE_OPTIONS: &[&str] = &[
    "compressor",
    "filters",
    "order",
    "cache_metadata",
    "cache_attrs",
    "overwrite",
    "write_empty_chunks",
];

/// Memory layout of elements within a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArrayOrder {
    /// Row-major, last axis fastest.
    #[default]
    C,
    /// Column-major, first axis fastest.
    F,
}

/// Options controlling how a target or staging array is stored.
///
/// Parsed from a JSON object whose keys must be in [`STORAGE_OPTIONS`].
/// Stores ignore options which do not apply to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Bytes-to-bytes codec metadata, e.g. `{"name": "gzip", "configuration": {"level": 5}}`.
    pub compressor: Option<Value>,
    /// Array-to-array codec metadata applied before serialisation.
    pub filters: Option<Vec<Value>>,
    pub order: Option<ArrayOrder>,
    pub cache_metadata: Option<bool>,
    pub cache_attrs: Option<bool>,
    /// Replace an existing node at the array path.
    pub overwrite: bool,
    /// Store chunks which contain only the fill value.
    pub write_empty_chunks: Option<bool>,
}

impl StorageOptions {
    /// Parse storage options from a JSON object.
    ///
    /// # Errors
    /// Returns [`Error::InvalidStorageOption`] for keys outside [`STORAGE_OPTIONS`].
    pub fn from_map(options: &Map<String, Value>) -> Result<Self> {
        validate_options(options)?;
        Ok(serde_json::from_value(Value::Object(options.clone()))?)
    }
}

/// Check that every key of `options` is a supported storage option.
pub fn validate_options(options: &Map<String, Value>) -> Result<()> {
    match options.keys().find(|k| !STORAGE_OPTIONS.contains(&k.as_str())) {
        Some(option) => Err(Error::InvalidStorageOption {
            option: option.clone(),
            allowed: STORAGE_OPTIONS,
        }),
        None => Ok(()),
    }
}

/// Storage options for a single dataset variable.
///
/// `chunks` is rejected outright; other unsupported keys are dropped with a warning.
pub(crate) fn variable_options(
    variable: &str,
    options: &Map<String, Value>,
) -> Result<Map<String, Value>> {
    if options.contains_key("chunks") {
        return Err(Error::ChunksInOptions(variable.to_string()));
    }
    Ok(options
        .iter()
        .filter(|(k, _)| {
            let supported = STORAGE_OPTIONS.contains(&k.as_str());
            if !supported {
                log::warn!("ignoring unsupported storage option {k} for variable {variable}");
            }
            supported
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect())
}

/// Storage options for the arrays of a rechunking.
#[derive(Debug, Clone)]
pub enum MemberOptions {
    /// The same options for every array.
    Shared(Map<String, Value>),
    /// Options keyed by group member or dataset variable name.
    PerMember(std::collections::BTreeMap<String, Map<String, Value>>),
}

impl Default for MemberOptions {
    fn default() -> Self {
        Self::Shared(Map::new())
    }
}

impl From<Map<String, Value>> for MemberOptions {
    fn from(value: Map<String, Value>) -> Self {
        Self::Shared(value)
    }
}

impl MemberOptions {
    /// The options for the array named `member`, or the shared options.
    pub fn for_member(&self, member: Option<&str>) -> Map<String, Value> {
        match (self, member) {
            (Self::Shared(options), _) => options.clone(),
            (Self::PerMember(options), Some(member)) => {
                options.get(member).cloned().unwrap_or_default()
            }
            (Self::PerMember(_), None) => Map::new(),
        }
    }
}

/// A memory budget, either in bytes or as a human readable size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaxMem {
    Bytes(u64),
    /// A size such as `"100MB"`, `"1.5 GiB"` or `"2e6"`.
    Text(String),
}

impl From<u64> for MaxMem {
    fn from(value: u64) -> Self {
        Self::Bytes(value)
    }
}

impl From<&str> for MaxMem {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MaxMem {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl MaxMem {
    /// The budget in bytes.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMaxMem`] if the text cannot be parsed.
    pub fn to_bytes(&self) -> Result<u64> {
        match self {
            Self::Bytes(n) => Ok(*n),
            Self::Text(s) => parse_bytes(s),
        }
    }
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    let m = match unit {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "p" | "pb" => 1_000_000_000_000_000,
        "ki" | "kib" => 1 << 10,
        "mi" | "mib" => 1 << 20,
        "gi" | "gib" => 1 << 30,
        "ti" | "tib" => 1 << 40,
        "pi" | "pib" => 1 << 50,
        _ => return None,
    };
    Some(m)
}

/// Parse a human readable byte count.
///
/// Units are case-insensitive; `kB`, `MB`, ... are decimal and `KiB`, `MiB`, ... binary.
/// A bare number is a byte count and may be written in scientific notation.
pub fn parse_bytes(text: &str) -> Result<u64> {
    let invalid = || Error::InvalidMaxMem(text.to_string());
    let lower = text.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return Err(invalid());
    }
    let split = lower
        .find(|c: char| c.is_ascii_alphabetic() && c != 'e')
        .unwrap_or(lower.len());
    let (number, unit) = lower.split_at(split);
    let number = number.trim();
    let number: f64 = if number.is_empty() {
        1.0
    } else {
        number.parse().map_err(|_| invalid())?
    };
    let multiplier = unit_multiplier(unit.trim()).ok_or_else(invalid)?;
    let bytes = number * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_sizes() {
        assert_eq!(parse_bytes("100").unwrap(), 100);
        assert_eq!(parse_bytes("100MB").unwrap(), 100_000_000);
        assert_eq!(parse_bytes("512kB").unwrap(), 512_000);
        assert_eq!(parse_bytes("1.5 GiB").unwrap(), 1_610_612_736);
        assert_eq!(parse_bytes("2e6").unwrap(), 2_000_000);
        assert_eq!(parse_bytes("5 mib").unwrap(), 5 * 1024 * 1024);
        assert_eq!(parse_bytes("MB").unwrap(), 1_000_000);
    }

    #[test]
    fn parse_invalid_sizes() {
        for text in ["", "abc", "12 parsecs", "-5MB", "1..2kB"] {
            assert!(
                matches!(parse_bytes(text), Err(Error::InvalidMaxMem(_))),
                "{text:?} should not parse"
            );
        }
    }

    #[test]
    fn max_mem_conversions() {
        assert_eq!(MaxMem::from(280u64).to_bytes().unwrap(), 280);
        assert_eq!(MaxMem::from("1kB").to_bytes().unwrap(), 1000);
    }

    #[test]
    fn storage_options_allow_list() {
        let options = json!({"compressor": null, "order": "F", "overwrite": true});
        let parsed = StorageOptions::from_map(options.as_object().unwrap()).unwrap();
        assert_eq!(parsed.order, Some(ArrayOrder::F));
        assert!(parsed.overwrite);

        let options = json!({"chunks": [1, 2]});
        match StorageOptions::from_map(options.as_object().unwrap()) {
            Err(Error::InvalidStorageOption { option, .. }) => assert_eq!(option, "chunks"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn variable_options_filter_unknown_keys() {
        let options = json!({"compressor": null, "dtype": "f4"});
        let filtered = variable_options("temp", options.as_object().unwrap()).unwrap();
        assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["compressor"]);

        let options = json!({"chunks": [1]});
        assert!(matches!(
            variable_options("temp", options.as_object().unwrap()),
            Err(Error::ChunksInOptions(name)) if name == "temp"
        ));
    }

    #[test]
    fn member_options() {
        let mut per_member = std::collections::BTreeMap::new();
        per_member.insert("a".to_string(), json!({"overwrite": true}).as_object().unwrap().clone());
        let options = MemberOptions::PerMember(per_member);
        assert!(options.for_member(Some("a")).contains_key("overwrite"));
        assert!(options.for_member(Some("b")).is_empty());
    }
}
