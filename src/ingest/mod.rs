//! Spreadsheet ingestion: sheet lookup, header sniffing and column resolution
//! for workbooks whose layout drifts from year to year.

pub mod filename;
pub mod grid;
pub mod header;
pub mod tac;
pub mod workbook;

pub use filename::{fy_start_year, infer_fy, parse_tac_filename, Sector};
pub use grid::{Cell, Grid};
pub use header::{detect_header, norm_key, resolve_columns, ColumnMap, FieldSpec, HeaderHit, HeaderSpec};
pub use tac::{extract_fact_rows, extract_tac_workbook};
pub use workbook::{find_sheet, find_sheet_by_keywords, list_workbooks, Workbook};
