//! `Properties`: a key/value configuration store with prefix queries, the
//! way dotted configuration options (`MessageSizeMax`,
//! `ThreadPool.Client.Size`, `RetryIntervals`, …) are addressed.
//!
//! A sync trait bounded `Send + Sync + 'static`, with a default in-memory
//! implementation and a swappable backend (here, a `toml` file) rather than
//! `Clone`-shared state.

use std::collections::HashMap;

use thiserror::Error;

/// Failures loading or parsing a property set.
#[derive(Error, Debug)]
pub enum PropertiesError {
    /// The backing file could not be read.
    #[error("failed to read properties file: {0}")]
    Io(#[from] std::io::Error),
    /// The file's contents were not valid TOML.
    #[error("failed to parse properties file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Key/value configuration store, queried by exact key or by dotted
/// prefix (e.g. `get_properties_for_prefix("ThreadPool.Client")` returns
/// `Size`, `SizeMax`, `Serialize`).
pub trait Properties: Send + Sync + 'static {
    /// Look up `key`.
    fn get(&self, key: &str) -> Option<String>;

    /// Look up `key`, falling back to `default` if unset.
    fn get_with_default(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Every key/value pair whose key starts with `prefix`.
    fn get_properties_for_prefix(&self, prefix: &str) -> Vec<(String, String)>;

    /// Set `key` to `value`, overwriting any previous value.
    fn set(&mut self, key: impl Into<String>, value: impl Into<String>)
    where
        Self: Sized;
}

/// Default `HashMap`-backed [`Properties`] implementation, seeded from CLI
/// flags and/or a `toml` file.
#[derive(Debug, Clone, Default)]
pub struct MapProperties {
    values: HashMap<String, String>,
}

impl MapProperties {
    /// An empty property set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a flat `key = "value"` TOML document into a property set.
    /// Nested tables are flattened with `.`-joined keys, matching the
    /// enumerated configuration's own dotted-prefix convention
    /// (`[ThreadPool.Client]` + `Size` becomes `ThreadPool.Client.Size`).
    ///
    /// # Errors
    ///
    /// Returns [`PropertiesError`] if the file can't be read or parsed.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, PropertiesError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse a flat or nested `toml` document into a property set.
    ///
    /// # Errors
    ///
    /// Returns [`PropertiesError::Parse`] if `contents` is not valid TOML.
    pub fn from_toml_str(contents: &str) -> Result<Self, PropertiesError> {
        let table: toml::Value = toml::from_str(contents)?;
        let mut values = HashMap::new();
        flatten_toml(String::new(), &table, &mut values);
        Ok(Self { values })
    }

    /// Merge `other`'s entries on top of `self`, `other` winning on
    /// conflicts. Used to layer CLI overrides on top of a file-backed
    /// property set.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }
}

fn flatten_toml(prefix: String, value: &toml::Value, out: &mut HashMap<String, String>) {
    match value {
        toml::Value::Table(table) => {
            for (key, inner) in table {
                let joined = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                flatten_toml(joined, inner, out);
            }
        },
        toml::Value::String(s) => {
            out.insert(prefix, s.clone());
        },
        other => {
            out.insert(prefix, other.to_string());
        },
    }
}

impl Properties for MapProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn get_properties_for_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.values.iter().filter(|(k, _)| k.starts_with(prefix)).map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_with_default_falls_back_when_unset() {
        let props = MapProperties::new();
        assert_eq!(props.get_with_default("MessageSizeMax", "1024"), "1024");
    }

    #[test]
    fn set_then_get_roundtrips() {
        let mut props = MapProperties::new();
        props.set("MessageSizeMax", "2048");
        assert_eq!(props.get("MessageSizeMax"), Some("2048".to_string()));
    }

    #[test]
    fn nested_toml_flattens_to_dotted_keys() {
        let props = MapProperties::from_toml_str(
            r#"
            MessageSizeMax = "1024"

            [ThreadPool.Client]
            Size = "2"
            SizeMax = "16"
            "#,
        )
        .unwrap();

        assert_eq!(props.get("MessageSizeMax"), Some("1024".to_string()));
        assert_eq!(props.get("ThreadPool.Client.Size"), Some("2".to_string()));
        let prefixed = props.get_properties_for_prefix("ThreadPool.Client");
        assert_eq!(prefixed.len(), 2);
    }

    #[test]
    fn merge_prefers_other_on_conflict() {
        let mut base = MapProperties::new();
        base.set("RetryIntervals", "0,10,100");

        let mut overrides = MapProperties::new();
        overrides.set("RetryIntervals", "0,50");

        base.merge(&overrides);
        assert_eq!(base.get("RetryIntervals"), Some("0,50".to_string()));
    }

    #[test]
    fn file_not_found_surfaces_io_error() {
        let result = MapProperties::from_toml_file("/nonexistent/path/pylon.toml");
        assert!(matches!(result, Err(PropertiesError::Io(_))));
    }

    #[test]
    fn from_toml_file_reads_an_actual_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"MessageSizeMax = \"4096\"\n").unwrap();

        let props = MapProperties::from_toml_file(file.path()).unwrap();
        assert_eq!(props.get("MessageSizeMax"), Some("4096".to_string()));
    }
}
