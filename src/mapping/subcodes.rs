// src/mapping/subcodes.rs

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, IngestConfig};
use crate::ingest::{infer_fy, list_workbooks, Grid, Workbook};
use crate::output::write_rows;

/// Two to five capitals, three or four digits, optional trailing capital (e.g. `SOC0100`, `EXP0390A`).
pub static SUBCODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z]{2,5}\d{3,4}[A-Z]?$").unwrap());

/// One row of `dim_tac_subcodes_by_year.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubcodeRow {
    pub fy: String,
    pub worksheet_name: String,
    pub sub_code: String,
    pub subcode_label: String,
    pub table_id: Option<String>,
    pub source_file: String,
}

fn subcode_text(grid: &Grid, r: usize, c: usize) -> Option<&str> {
    grid.cell(r, c).as_str().filter(|s| SUBCODE_RE.is_match(s))
}

/// First (row, column) whose next rows hold enough subcode-looking text values.
pub fn find_subcode_column(grid: &Grid, cfg: &IngestConfig) -> Option<(usize, usize)> {
    let rows = grid.height().min(cfg.subcode_scan_rows);
    for r in 0..rows {
        let end = (r + 1 + cfg.subcode_lookahead).min(grid.height());
        for c in 0..grid.width() {
            let hits = ((r + 1)..end)
                .filter(|&rr| subcode_text(grid, rr, c).is_some())
                .count();
            if hits >= cfg.subcode_min_hits {
                return Some((r, c));
            }
        }
    }
    None
}

/// Value to the right of the first cell mentioning "table id".
pub fn find_table_id(grid: &Grid, scan_rows: usize) -> Option<String> {
    for r in 0..grid.height().min(scan_rows) {
        for (c, cell) in grid.row(r).iter().enumerate() {
            let Some(text) = cell.as_str() else { continue };
            if text.to_lowercase().contains("table id") {
                return grid.cell(r, c + 1).as_text();
            }
        }
    }
    None
}

/// Subcode/label pairs from one illustrative worksheet; empty when no subcode
/// column can be located.
pub fn extract_sheet_subcodes(
    grid: &Grid,
    sheet: &str,
    fy: &str,
    source_file: &str,
    cfg: &IngestConfig,
) -> Vec<SubcodeRow> {
    let Some((hdr, col)) = find_subcode_column(grid, cfg) else {
        debug!(sheet, "no subcode column");
        return Vec::new();
    };
    let table_id = find_table_id(grid, cfg.table_id_scan_rows);

    ((hdr + 1)..grid.height())
        .filter_map(|r| {
            let sub = subcode_text(grid, r, col)?;
            let label = (0..col)
                .find_map(|c| grid.cell(r, c).as_str())
                .unwrap_or_default();
            Some(SubcodeRow {
                fy: fy.to_string(),
                worksheet_name: sheet.to_string(),
                sub_code: sub.to_string(),
                subcode_label: label.to_string(),
                table_id: table_id.clone(),
                source_file: source_file.to_string(),
            })
        })
        .collect()
}

/// One row per (fy, worksheet, subcode), later rows replacing earlier ones, sorted by key.
pub fn dedupe_subcodes(rows: Vec<SubcodeRow>) -> Vec<SubcodeRow> {
    let mut by_key = BTreeMap::new();
    for row in rows {
        let key = (row.fy.clone(), row.worksheet_name.clone(), row.sub_code.clone());
        by_key.insert(key, row);
    }
    by_key.into_values().collect()
}

/// Scan every illustrative workbook's `TAC*` sheets and write the subcode dimension.
#[instrument(level = "info", skip(cfg))]
pub fn build_subcode_dim(cfg: &Config) -> Result<Vec<SubcodeRow>> {
    let files = list_workbooks(&cfg.paths.reference_dir, "*.xlsx")?;
    let mut all = Vec::new();

    for path in &files {
        let mut wb = Workbook::open(path)?;
        let file = wb.name().to_string();
        let fy = infer_fy(&file);
        if fy == "unknown" {
            warn!("{}: no financial year in filename", file);
        }
        info!("Processing {} (fy={})", file, fy);

        for sheet in wb.sheet_names() {
            if !sheet.trim().to_lowercase().starts_with("tac") {
                continue;
            }
            let grid = wb.grid(&sheet)?;
            let rows = extract_sheet_subcodes(&grid, &sheet, &fy, &file, &cfg.ingest);
            if !rows.is_empty() {
                info!("  {}: {} subcodes", sheet, rows.len());
                all.extend(rows);
            }
        }
    }

    if all.is_empty() {
        bail!(
            "No subcode mappings extracted from {} (header detection likely needs tweaking)",
            cfg.paths.reference_dir.display()
        );
    }

    let dim = dedupe_subcodes(all);
    write_rows(&cfg.paths.subcode_dim(), &dim)?;
    Ok(dim)
}
