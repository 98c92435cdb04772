// src/mapping/lines.rs

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, instrument};

use crate::config::Config;
use crate::ingest::{
    detect_header, find_sheet_by_keywords, fy_start_year, list_workbooks, parse_tac_filename,
    resolve_columns, FieldSpec, Grid, HeaderSpec, Workbook,
};
use crate::output::write_rows;

pub const MAPPING_SHEET_KEYWORDS: [&str; 5] = ["mapping", "schedule", "lookup", "reference", "code"];

/// Identity of a TAC line across years.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineKey {
    pub table_id: String,
    pub main_code: String,
    pub sub_code: String,
    pub row_number: i64,
}

/// One row of `dim_tac_lines.csv`. The classification columns start blank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRow {
    pub table_id: String,
    pub main_code: String,
    pub sub_code: String,
    pub row_number: i64,
    pub line_label: String,
    pub fy_source: String,
    pub source_file: String,
    pub source_sheet: String,
    pub category_1: String,
    pub category_2: String,
    pub is_digital_data_it: String,
    pub notes: String,
}

impl LineRow {
    pub fn key(&self) -> LineKey {
        LineKey {
            table_id: self.table_id.clone(),
            main_code: self.main_code.clone(),
            sub_code: self.sub_code.clone(),
            row_number: self.row_number,
        }
    }
}

/// Seed row for manual line classification (`dim_tac_lines_seed.csv`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSeedRow {
    pub table_id: String,
    pub main_code: String,
    pub sub_code: String,
    pub row_number: i64,
    pub line_label: String,
    pub category_1: String,
    pub category_2: String,
    pub is_digital_data_it: String,
    pub notes: String,
}

pub fn mapping_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::required("table_id", &["tableid", "table", "table_id"]),
        FieldSpec::required("main_code", &["maincode", "main code", "main_code"]),
        FieldSpec::required("sub_code", &["subcode", "sub code", "sub_code"]),
        FieldSpec::required(
            "row_number",
            &["rownumber", "row number", "row", "rowno", "row_no"],
        ),
        FieldSpec::optional(
            "line_label",
            &[
                "description",
                "line description",
                "row description",
                "narrative",
                "label",
                "name",
            ],
        ),
    ]
}

/// Lines from a mapping schedule grid. Rows whose row number is not numeric are dropped.
pub fn extract_mapping_lines(
    grid: &Grid,
    fy: &str,
    source_file: &str,
    sheet: &str,
    min_score: usize,
) -> Result<Vec<LineRow>> {
    let fields = mapping_fields();
    let spec = HeaderSpec::for_fields(&fields, min_score);
    let hit = detect_header(grid, &spec, &format!("{} / {}", source_file, sheet))?;
    let cols = resolve_columns(&hit.headers, &fields, source_file)?;
    let label_col = cols.get("line_label");

    let text = |r: usize, field: &str| {
        grid.cell(r, cols.col(field))
            .as_text()
            .unwrap_or_default()
    };

    let mut out = Vec::new();
    for r in (hit.row + 1)..grid.height() {
        let Some(row_number) = grid.cell(r, cols.col("row_number")).as_int() else {
            continue;
        };
        out.push(LineRow {
            table_id: text(r, "table_id"),
            main_code: text(r, "main_code"),
            sub_code: text(r, "sub_code"),
            row_number,
            line_label: label_col
                .and_then(|c| grid.cell(r, c).as_text())
                .unwrap_or_default(),
            fy_source: fy.to_string(),
            source_file: source_file.to_string(),
            source_sheet: sheet.to_string(),
            category_1: String::new(),
            category_2: String::new(),
            is_digital_data_it: String::new(),
            notes: String::new(),
        });
    }
    Ok(out)
}

/// Keep the row from the latest financial year for every line key, sorted by key.
pub fn latest_per_line(rows: Vec<LineRow>) -> Vec<LineRow> {
    let mut by_key: BTreeMap<LineKey, LineRow> = BTreeMap::new();
    for row in rows {
        let year = fy_start_year(&row.fy_source).unwrap_or(0);
        match by_key.get(&row.key()) {
            Some(prev) if fy_start_year(&prev.fy_source).unwrap_or(0) > year => {}
            _ => {
                by_key.insert(row.key(), row);
            }
        }
    }
    by_key.into_values().collect()
}

/// Build `dim_tac_lines.csv` from the mapping schedule of every FT workbook.
#[instrument(level = "info", skip(cfg))]
pub fn build_line_dim(cfg: &Config) -> Result<Vec<LineRow>> {
    let files = list_workbooks(&cfg.paths.raw_dir, "TAC_FTs_*.xlsx")?;
    if files.is_empty() {
        bail!("No TAC_FTs_*.xlsx files found in {}", cfg.paths.raw_dir.display());
    }

    let mut all = Vec::new();
    for path in &files {
        let mut wb = Workbook::open(path)?;
        let file = wb.name().to_string();
        let fy = parse_tac_filename(&file)
            .map(|(_, fy)| fy)
            .unwrap_or_else(|_| "unknown".into());
        let sheet = find_sheet_by_keywords(&wb.sheet_names(), &MAPPING_SHEET_KEYWORDS, &file)?;
        let grid = wb.grid(&sheet)?;
        let rows = extract_mapping_lines(&grid, &fy, &file, &sheet, cfg.ingest.header_min_score)?;
        info!("Extracted mapping: {} | sheet='{}' | rows={}", file, sheet, rows.len());
        all.extend(rows);
    }

    let dim = latest_per_line(all);
    write_rows(&cfg.paths.line_dim(), &dim)?;
    Ok(dim)
}

#[derive(Debug, Deserialize)]
struct TopLineKey {
    table_id: Option<String>,
    main_code: Option<String>,
    sub_code: Option<String>,
    row_number: Option<i64>,
}

/// Distinct line keys of a top-lines report plus blank classification columns.
pub fn build_line_seed(top_lines_csv: &Path, out: &Path) -> Result<Vec<LineSeedRow>> {
    let mut rdr = csv::Reader::from_path(top_lines_csv)
        .with_context(|| format!("opening {}", top_lines_csv.display()))?;
    let mut keys: BTreeMap<LineKey, ()> = BTreeMap::new();
    for rec in rdr.deserialize::<TopLineKey>() {
        let rec = rec.with_context(|| format!("reading {}", top_lines_csv.display()))?;
        let Some(row_number) = rec.row_number else { continue };
        keys.insert(
            LineKey {
                table_id: rec.table_id.unwrap_or_default(),
                main_code: rec.main_code.unwrap_or_default(),
                sub_code: rec.sub_code.unwrap_or_default(),
                row_number,
            },
            (),
        );
    }

    let seed: Vec<LineSeedRow> = keys
        .into_keys()
        .map(|k| LineSeedRow {
            table_id: k.table_id,
            main_code: k.main_code,
            sub_code: k.sub_code,
            row_number: k.row_number,
            line_label: String::new(),
            category_1: String::new(),
            category_2: String::new(),
            is_digital_data_it: String::new(),
            notes: String::new(),
        })
        .collect();
    write_rows(out, &seed)?;
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Cell;
    use std::fs;

    fn t(s: &str) -> Cell {
        Cell::Text(s.into())
    }

    #[test]
    fn mapping_schedule_rows_with_numeric_row_numbers() -> Result<()> {
        let grid = Grid::new(vec![
            vec![t("Mapping schedule 2022-23")],
            vec![t("Table ID"), t("Main Code"), t("Sub Code"), t("Row No"), t("Description")],
            vec![Cell::Number(2.0), t("A09CY01"), t("EXP0390"), Cell::Number(39.0), t("Consultancy")],
            vec![Cell::Number(2.0), t("A09CY01"), t("EXP0400"), t("n/a"), t("Dropped")],
        ]);
        let rows = extract_mapping_lines(&grid, "2022-23", "TAC_FTs_2022-23.xlsx", "Mapping", 3)?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].table_id, "2");
        assert_eq!(rows[0].row_number, 39);
        assert_eq!(rows[0].line_label, "Consultancy");
        assert_eq!(rows[0].category_1, "");
        Ok(())
    }

    #[test]
    fn latest_year_wins_per_line() {
        let row = |fy: &str, label: &str| LineRow {
            table_id: "2".into(),
            main_code: "A09CY01".into(),
            sub_code: "EXP0390".into(),
            row_number: 39,
            line_label: label.into(),
            fy_source: fy.into(),
            source_file: String::new(),
            source_sheet: String::new(),
            category_1: String::new(),
            category_2: String::new(),
            is_digital_data_it: String::new(),
            notes: String::new(),
        };
        let out = latest_per_line(vec![row("2023-24", "new"), row("2021-22", "old")]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].line_label, "new");
    }

    #[test]
    fn seed_dedupes_and_sorts_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let top = dir.path().join("top.csv");
        fs::write(
            &top,
            "fy,sector,table_id,main_code,sub_code,row_number,abs_amount,rn\n\
             2023-24,FT,9,A09CY01,EXP0390,39,10.0,1\n\
             2023-24,Trust,9,A09CY01,EXP0390,39,5.0,1\n\
             2023-24,Trust,2,A02CY01,SOC0100,10,4.0,2\n",
        )?;
        let out = dir.path().join("seed.csv");
        let seed = build_line_seed(&top, &out)?;
        assert_eq!(seed.len(), 2);
        assert_eq!(seed[0].table_id, "2");
        assert!(fs::read_to_string(&out)?.starts_with(
            "table_id,main_code,sub_code,row_number,line_label,category_1"
        ));
        Ok(())
    }
}
