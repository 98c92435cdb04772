// src/ingest/tac.rs

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info, instrument};

use super::filename::parse_tac_filename;
use super::grid::Grid;
use super::header::{detect_header, resolve_columns, FieldSpec, HeaderSpec};
use super::workbook::{find_sheet, Workbook};
use crate::config::IngestConfig;
use crate::schema::FactRecord;

/// Name of the flat extract sheet in every raw TAC workbook.
pub const ALL_DATA_SHEET: &str = "All data";

const ORG: &str = "org";
const AMOUNT: &str = "amount";
const WORKSHEET: &str = "worksheet_name";
const TABLE: &str = "table_id";
const MAIN: &str = "main_code";
const ROW: &str = "row_number";
const SUB: &str = "sub_code";

/// Column candidates for the "All data" layout across years.
pub fn tac_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::required(WORKSHEET, &["worksheetname"]),
        FieldSpec::required(TABLE, &["tableid"]),
        FieldSpec::required(MAIN, &["maincode"]),
        FieldSpec::required(ROW, &["rownumber"]),
        FieldSpec::required(SUB, &["subcode"]),
        FieldSpec::required(
            ORG,
            &["organisationname", "orgname", "providername", "organisation"],
        ),
        FieldSpec::required(
            AMOUNT,
            &["valuenumber", "total", "amount", "valuenumeric", "value"],
        ),
    ]
}

/// Turn an "All data" grid into fact records.
///
/// Rows without an organisation name are skipped; amounts that are not numeric
/// are kept as null.
pub fn extract_fact_rows(
    grid: &Grid,
    cfg: &IngestConfig,
    sector: &str,
    fy: &str,
    source_file: &str,
) -> Result<Vec<FactRecord>> {
    let fields = tac_fields();
    let spec = HeaderSpec::for_fields(&fields, cfg.header_min_score)
        .with_window(cfg.header_scan_rows, cfg.header_scan_cols);
    let hit = detect_header(grid, &spec, source_file)?;
    let cols = resolve_columns(&hit.headers, &fields, source_file)?;

    let mut out = Vec::with_capacity(grid.height().saturating_sub(hit.row + 1));
    let mut skipped = 0usize;
    for r in (hit.row + 1)..grid.height() {
        let text = |field: &str| grid.cell(r, cols.col(field)).as_text();

        let Some(org) = text(ORG) else {
            skipped += 1;
            continue;
        };
        out.push(FactRecord {
            org_name_raw: org,
            sector: sector.to_string(),
            fy: fy.to_string(),
            worksheet_name: text(WORKSHEET),
            table_id: text(TABLE),
            main_code: text(MAIN),
            sub_code: text(SUB),
            row_number: grid.cell(r, cols.col(ROW)).as_int(),
            amount: grid.cell(r, cols.col(AMOUNT)).as_number(),
            source_file: source_file.to_string(),
            schema_version: fy.to_string(),
        });
    }
    debug!(source_file, header_row = hit.row, skipped, "extracted rows");
    Ok(out)
}

/// Open a raw `TAC_<sector>_<fy>.xlsx` workbook and extract its "All data" sheet.
#[instrument(level = "info", skip(path, cfg), fields(file = %path.display()))]
pub fn extract_tac_workbook(path: &Path, cfg: &IngestConfig) -> Result<Vec<FactRecord>> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let (sector, fy) = parse_tac_filename(&file_name)?;

    let mut wb = Workbook::open(path)?;
    let sheet = find_sheet(&wb.sheet_names(), ALL_DATA_SHEET, &file_name)?;
    let grid = wb.grid(&sheet)?;
    let rows = extract_fact_rows(&grid, cfg, sector.as_str(), &fy, &file_name)
        .with_context(|| format!("extracting '{}' from {}", sheet, file_name))?;
    info!("Loaded {}: {} rows", file_name, rows.len());
    Ok(rows)
}
