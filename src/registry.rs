//! Galaxy data-manager records: `{"data_tables": {"<table>": [rows]}}`.

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::CtatError;
use crate::fs_util::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub value: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl TableRow {
    pub fn new(value: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            name: name.into(),
            path: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataManagerRecord {
    pub data_tables: BTreeMap<String, Vec<TableRow>>,
}

impl DataManagerRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&mut self, table: &str, row: TableRow) {
        self.data_tables
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Registers `table` even when it ends up without rows.
    pub fn add_table(&mut self, table: &str) {
        self.data_tables.entry(table.to_string()).or_default();
    }

    pub fn rows(&self, table: &str) -> &[TableRow] {
        self.data_tables
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn to_json_pretty(&self) -> Result<String, CtatError> {
        serde_json::to_string_pretty(self).map_err(|err| CtatError::Filesystem(err.to_string()))
    }

    pub fn write_to(&self, path: &Utf8Path) -> Result<(), CtatError> {
        let mut body = self.to_json_pretty()?;
        body.push('\n');
        write_atomic(path, body.as_bytes())
    }
}

pub fn unique_id(base: &str) -> String {
    format!("{base}.{}", Local::now().format("_%Y_%m_%d_%H_%M_%S_%6f"))
}

pub fn display_name(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}").replace(' ', "_")
}

/// Tab-separated `value name code date` rows; `#` lines are comments.
pub fn parse_cravat_tissues(content: &str) -> Result<Vec<TableRow>, CtatError> {
    let mut rows = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let items: Vec<&str> = line.split('\t').map(str::trim).collect();
        let [value, name, code, date, ..] = items.as_slice() else {
            return Err(CtatError::Config(format!(
                "cravat tissues line {} has {} columns, expected 4",
                index + 1,
                items.len()
            )));
        };
        rows.push(
            TableRow::new(*value, *name)
                .with_field("code", *code)
                .with_field("date", *date),
        );
    }
    Ok(rows)
}

pub fn load_cravat_tissues(path: &Utf8Path) -> Result<Vec<TableRow>, CtatError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| CtatError::Config(format!("cannot read cravat tissues file {path}: {err}")))?;
    parse_cravat_tissues(&content)
}
