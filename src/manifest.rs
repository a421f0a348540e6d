//! Manifest model
//!
//! In-memory form of the YAML manifest: template variables plus the ordered
//! list of tables to dump.

use crate::error::{manifest_error, DumpResult};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Where a table specification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpecOrigin {
    /// Listed by the manifest author
    #[default]
    Declared,
    /// Pulled in through a foreign key the manifest did not list
    Synthesized,
}

/// How a single table is dumped
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TableSpec {
    pub table: String,

    /// Templated subset query; `None` dumps the whole table
    #[serde(default, deserialize_with = "empty_as_none")]
    pub query: Option<String>,

    /// Explicit column list; empty means introspect at emission time
    #[serde(default, deserialize_with = "null_as_default")]
    pub columns: Vec<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub post_actions: Vec<String>,

    #[serde(skip)]
    pub origin: SpecOrigin,
}

impl TableSpec {
    /// Declared spec dumping every row and column of `table`
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            query: None,
            columns: Vec::new(),
            post_actions: Vec::new(),
            origin: SpecOrigin::Declared,
        }
    }

    /// Default spec for a table reached only through a foreign key
    pub fn synthesized(table: impl Into<String>) -> Self {
        Self {
            origin: SpecOrigin::Synthesized,
            ..Self::new(table)
        }
    }

    pub fn is_synthesized(&self) -> bool {
        self.origin == SpecOrigin::Synthesized
    }
}

#[cfg(test)]
impl TableSpec {
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_post_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.post_actions = actions.into_iter().map(Into::into).collect();
        self
    }
}

/// Complete manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Manifest {
    #[serde(default, deserialize_with = "scalar_vars")]
    pub vars: HashMap<String, String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub tables: Vec<TableSpec>,
}

impl Manifest {
    /// Decode a manifest from YAML text
    pub fn from_yaml(text: &str) -> DumpResult<Self> {
        // An empty document decodes to YAML null
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let manifest: Manifest = serde_yaml::from_str(text)
            .map_err(|e| manifest_error(format!("invalid manifest: {}", e)))?;

        if let Some(spec) = manifest.tables.iter().find(|t| t.table.trim().is_empty()) {
            return Err(manifest_error(format!(
                "table entry with empty name (post_actions: {:?})",
                spec.post_actions
            )));
        }

        debug!(
            "Decoded manifest with {} tables and {} vars",
            manifest.tables.len(),
            manifest.vars.len()
        );
        Ok(manifest)
    }

    /// Read and decode a manifest file
    pub async fn load(path: &Path) -> DumpResult<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| manifest_error(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&text)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let query = Option::<String>::deserialize(deserializer)?;
    Ok(query.filter(|q| !q.trim().is_empty()))
}

/// Accept numbers and booleans as var values, the way YAML authors write them
fn scalar_vars<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_yaml::Value;

    let raw = Option::<HashMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    raw.into_iter()
        .map(|(name, value)| {
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null => String::new(),
                other => {
                    return Err(D::Error::custom(format!(
                        "var `{}` must be a scalar, got {:?}",
                        name, other
                    )))
                }
            };
            Ok((name, text))
        })
        .collect()
}
