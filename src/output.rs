// src/output.rs

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::{fs, path::Path};
use tracing::info;

/// A single cell of a query result.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// CSV rendering; nulls are empty fields.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) if f.is_finite() => f.to_string(),
            Value::Float(_) => String::new(),
            Value::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Column-named rows, the common currency between SQL results and CSV files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new<S: AsRef<str>>(columns: &[S]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| anyhow!("no column `{}` in {:?}", name, self.columns))
    }

    pub fn f64_column(&self, name: &str) -> Result<Vec<Option<f64>>> {
        let i = self.column_index(name)?;
        Ok(self.rows.iter().map(|r| r[i].as_f64()).collect())
    }

    pub fn text_column(&self, name: &str) -> Result<Vec<String>> {
        let i = self.column_index(name)?;
        Ok(self.rows.iter().map(|r| r[i].render()).collect())
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("creating {}", path.display()))?;
        wtr.write_record(&self.columns)?;
        for row in &self.rows {
            wtr.write_record(row.iter().map(Value::render))?;
        }
        wtr.flush()?;
        info!("Wrote {} ({} rows)", path.display(), self.rows.len());
        Ok(())
    }
}

pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Serialize typed rows with a header taken from the struct's field names.
pub fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    ensure_parent(path)?;
    let mut wtr =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    info!("Wrote {} ({} rows)", path.display(), rows.len());
    Ok(())
}

/// Long `(row_key, column_key, value)` triples pivoted into a wide table.
///
/// Rows and columns keep the order given; missing cells become `fill`.
pub fn pivot(
    index_name: &str,
    row_keys: &[String],
    col_keys: &[String],
    cells: &[(String, String, f64)],
    fill: Value,
) -> Table {
    use std::collections::HashMap;

    let row_pos: HashMap<&str, usize> =
        row_keys.iter().enumerate().map(|(i, k)| (k.as_str(), i)).collect();
    let col_pos: HashMap<&str, usize> =
        col_keys.iter().enumerate().map(|(i, k)| (k.as_str(), i)).collect();

    let mut header = vec![index_name.to_string()];
    header.extend(col_keys.iter().cloned());
    let mut table = Table::new(&header);
    let mut grid: Vec<Vec<Value>> = row_keys
        .iter()
        .map(|k| {
            let mut row = vec![Value::Text(k.clone())];
            row.extend(std::iter::repeat(fill.clone()).take(col_keys.len()));
            row
        })
        .collect();

    for (r, c, v) in cells {
        if let (Some(&ri), Some(&ci)) = (row_pos.get(r.as_str()), col_pos.get(c.as_str())) {
            grid[ri][ci + 1] = Value::Float(*v);
        }
    }
    table.rows = grid;
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn csv_renders_nulls_as_empty() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("out").join("t.csv");
        let mut t = Table::new(&["org", "amount"]);
        t.push(vec!["Alpha".into(), Value::Float(1.5)]);
        t.push(vec!["Beta".into(), Value::Null]);
        t.write_csv(&path)?;
        assert_eq!(fs::read_to_string(&path)?, "org,amount\nAlpha,1.5\nBeta,\n");
        Ok(())
    }

    #[test]
    fn pivot_fills_missing_cells() {
        let rows = vec!["2021-22".to_string(), "2022-23".to_string()];
        let cols = vec!["A".to_string(), "B".to_string()];
        let cells = vec![
            ("2021-22".to_string(), "A".to_string(), 1.0),
            ("2022-23".to_string(), "B".to_string(), 2.0),
        ];
        let t = pivot("fy", &rows, &cols, &cells, Value::Float(0.0));
        assert_eq!(t.columns, vec!["fy", "A", "B"]);
        assert_eq!(t.rows[0], vec!["2021-22".into(), Value::Float(1.0), Value::Float(0.0)]);
        assert_eq!(t.rows[1][2], Value::Float(2.0));
    }
}
