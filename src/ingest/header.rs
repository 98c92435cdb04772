// src/ingest/header.rs

use anyhow::{bail, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::grid::Grid;

/// Lowercase and drop everything outside `[a-z0-9]`.
///
/// Must agree with the SQL key `regexp_replace(lower(x), '[^a-z0-9]+', '', 'g')`.
pub fn norm_key(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .collect()
}

/// Bounded window + keyword set used to locate a header row.
#[derive(Debug, Clone)]
pub struct HeaderSpec {
    pub keywords: Vec<String>,
    pub scan_rows: usize,
    pub scan_cols: usize,
    pub min_score: usize,
}

impl HeaderSpec {
    pub fn new<S: AsRef<str>>(keywords: &[S], min_score: usize) -> Self {
        Self {
            keywords: keywords.iter().map(|k| norm_key(k.as_ref())).collect(),
            scan_rows: 60,
            scan_cols: 60,
            min_score,
        }
    }

    pub fn with_window(mut self, rows: usize, cols: usize) -> Self {
        self.scan_rows = rows;
        self.scan_cols = cols;
        self
    }

    /// Keyword set built from every candidate of every field.
    pub fn for_fields(fields: &[FieldSpec], min_score: usize) -> Self {
        let keywords: Vec<&str> = fields
            .iter()
            .flat_map(|f| f.candidates.iter().map(String::as_str))
            .collect();
        Self::new(&keywords, min_score)
    }
}

/// Where the header was found and what it says.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderHit {
    pub row: usize,
    pub first_col: usize,
    pub score: usize,
    /// Raw header text per column of the header row (empty for blank cells).
    pub headers: Vec<String>,
}

/// Score each row in the window by the number of distinct keywords that appear
/// as a normalized cell value, and return the best row (earliest on ties).
pub fn detect_header(grid: &Grid, spec: &HeaderSpec, sheet: &str) -> Result<HeaderHit> {
    let wanted: HashSet<&str> = spec.keywords.iter().map(String::as_str).collect();
    let rows = grid.height().min(spec.scan_rows);
    let cols = grid.width().min(spec.scan_cols);

    let mut best: Option<(usize, usize, usize)> = None; // (score, row, first_col)
    for r in 0..rows {
        let mut hits: HashSet<String> = HashSet::new();
        let mut first_col: Option<usize> = None;
        for c in 0..cols {
            let Some(text) = grid.cell(r, c).as_text() else {
                continue;
            };
            let key = norm_key(&text);
            if wanted.contains(key.as_str()) {
                first_col.get_or_insert(c);
                hits.insert(key);
            }
        }
        let score = hits.len();
        if score > 0 && best.map_or(true, |(s, _, _)| score > s) {
            best = Some((score, r, first_col.unwrap_or(0)));
        }
    }

    match best {
        Some((score, row, first_col)) if score >= spec.min_score => {
            debug!(sheet, row, first_col, score, "header row detected");
            let headers = (0..grid.width())
                .map(|c| grid.cell(row, c).as_text().unwrap_or_default())
                .collect();
            Ok(HeaderHit {
                row,
                first_col,
                score,
                headers,
            })
        }
        Some((score, row, _)) => bail!(
            "{}: no header row reached {} keyword matches (best was {} at row {})",
            sheet,
            spec.min_score,
            score,
            row + 1
        ),
        None => bail!(
            "{}: no header keywords found in the first {} rows",
            sheet,
            spec.scan_rows
        ),
    }
}

/// A logical field and the header spellings that may carry it, in priority order.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub candidates: Vec<String>,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &'static str, candidates: &[&str]) -> Self {
        Self {
            name,
            candidates: candidates.iter().map(|c| norm_key(c)).collect(),
            required: true,
        }
    }

    pub fn optional(name: &'static str, candidates: &[&str]) -> Self {
        Self {
            required: false,
            ..Self::required(name, candidates)
        }
    }
}

/// Logical field name → column index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnMap {
    columns: HashMap<&'static str, usize>,
}

impl ColumnMap {
    pub fn get(&self, field: &str) -> Option<usize> {
        self.columns.get(field).copied()
    }

    /// Column of a field that `resolve_columns` guaranteed to exist.
    pub fn col(&self, field: &str) -> usize {
        self.columns[field]
    }
}

/// Resolve each field to a column: the first candidate (in candidate order)
/// present among the normalized headers wins; repeated headers resolve leftmost.
pub fn resolve_columns(headers: &[String], fields: &[FieldSpec], source: &str) -> Result<ColumnMap> {
    let mut lookup: HashMap<String, usize> = HashMap::new();
    for (idx, h) in headers.iter().enumerate() {
        let key = norm_key(h);
        if !key.is_empty() {
            lookup.entry(key).or_insert(idx);
        }
    }

    let mut map = ColumnMap::default();
    let mut missing = Vec::new();
    for field in fields {
        match field.candidates.iter().find_map(|c| lookup.get(c)) {
            Some(&idx) => {
                map.columns.insert(field.name, idx);
            }
            None if field.required => missing.push(field.name),
            None => {}
        }
    }

    if !missing.is_empty() {
        let detected: Vec<&str> = headers
            .iter()
            .map(String::as_str)
            .filter(|h| !h.trim().is_empty())
            .collect();
        bail!(
            "{}: missing expected columns {:?}; detected columns: {:?}",
            source,
            missing,
            detected
        );
    }
    Ok(map)
}
