// src/activity.rs

use anyhow::{bail, Context, Result};
use duckdb::Connection;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::ingest::{
    detect_header, find_sheet, infer_fy, list_workbooks, resolve_columns, FieldSpec, Grid,
    HeaderSpec, Workbook,
};
use crate::output::write_rows;

pub const BEDS_SHEET: &str = "NHS Trust by Sector";
const HEADER_KEYWORDS: [&str; 4] = ["org name", "total", "year", "period end"];

/// Mean bed count of one TAC organisation in one financial year (`beds_matched.csv`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BedRow {
    pub org_name_raw: String,
    pub sector: String,
    pub fy: String,
    pub beds: f64,
}

/// A bed observation as published, before matching to TAC names.
#[derive(Debug, Clone, PartialEq)]
pub struct BedObservation {
    pub org_name: String,
    pub fy: String,
    pub beds: f64,
}

fn bed_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::required("org", &["orgname", "organisationname"]),
        FieldSpec::required("beds", &["total", "totalbeds", "beds"]),
        FieldSpec::optional("year", &["year"]),
    ]
}

/// Observations from one bed-availability sheet. `file_fy` is used unless it is
/// `unknown`, in which case the row's `Year` cell supplies the year.
pub fn extract_bed_observations(grid: &Grid, file_fy: &str, source: &str) -> Result<Vec<BedObservation>> {
    let fields = bed_fields();
    let hit = detect_header(grid, &HeaderSpec::new(&HEADER_KEYWORDS, 2), source)?;
    let cols = resolve_columns(&hit.headers, &fields, source)?;
    let year_col = cols.get("year");

    let mut out = Vec::new();
    for r in (hit.row + 1)..grid.height() {
        let Some(org) = grid.cell(r, cols.col("org")).as_text() else {
            continue;
        };
        // sheets repeat their header block per region
        if org.eq_ignore_ascii_case("org name") {
            continue;
        }
        let Some(beds) = grid.cell(r, cols.col("beds")).as_number() else {
            continue;
        };
        let fy = if file_fy != "unknown" {
            file_fy.to_string()
        } else {
            match year_col.and_then(|c| grid.cell(r, c).as_text()) {
                Some(y) => y,
                None => continue,
            }
        };
        out.push(BedObservation { org_name: org, fy, beds });
    }
    Ok(out)
}

/// Mean beds per (organisation, fy), averaging over the reporting periods.
pub fn mean_beds(obs: &[BedObservation]) -> BTreeMap<(String, String), f64> {
    let mut acc: BTreeMap<(String, String), (f64, usize)> = BTreeMap::new();
    for o in obs {
        let e = acc.entry((o.org_name.clone(), o.fy.clone())).or_insert((0.0, 0));
        e.0 += o.beds;
        e.1 += 1;
    }
    acc.into_iter()
        .map(|(k, (sum, n))| (k, sum / n as f64))
        .collect()
}

fn match_key(name: &str) -> String {
    name.trim().to_uppercase()
}

/// Match bed organisations to TAC `(org_name_raw, sector)` pairs by uppercase
/// trimmed name. Returns matched rows and the unmatched bed organisation names.
pub fn match_beds(
    means: &BTreeMap<(String, String), f64>,
    tac_orgs: &[(String, String)],
) -> (Vec<BedRow>, Vec<String>) {
    let mut by_key: HashMap<String, Vec<&(String, String)>> = HashMap::new();
    for org in tac_orgs {
        by_key.entry(match_key(&org.0)).or_default().push(org);
    }

    let mut matched = Vec::new();
    let mut unmatched = BTreeSet::new();
    for ((org, fy), beds) in means {
        match by_key.get(&match_key(org)) {
            Some(hits) => matched.extend(hits.iter().map(|(raw, sector)| BedRow {
                org_name_raw: raw.clone(),
                sector: sector.clone(),
                fy: fy.clone(),
                beds: *beds,
            })),
            None => {
                unmatched.insert(org.clone());
            }
        }
    }
    (matched, unmatched.into_iter().collect())
}

fn tac_organisations(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT org_name_raw, sector FROM fact_tru_tac ORDER BY org_name_raw, sector",
    )?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Read every `*bed*.xlsx` under the activity directory, match to TAC names and
/// write `beds_matched.csv`.
#[instrument(level = "info", skip(conn, cfg))]
pub fn build_beds(conn: &Connection, cfg: &Config) -> Result<Vec<BedRow>> {
    let files = list_workbooks(&cfg.paths.activity_dir, "*bed*.xlsx")?;
    if files.is_empty() {
        bail!("No bed workbooks found in {}", cfg.paths.activity_dir.display());
    }

    let mut obs = Vec::new();
    for path in &files {
        let mut wb = Workbook::open(path)?;
        let file = wb.name().to_string();
        let sheet = find_sheet(&wb.sheet_names(), BEDS_SHEET, &file)?;
        let grid = wb.grid(&sheet)?;
        let rows = extract_bed_observations(&grid, &infer_fy(&file), &file)
            .with_context(|| format!("reading beds from {}", file))?;
        info!("Loaded {}: {} bed rows", file, rows.len());
        obs.extend(rows);
    }

    let means = mean_beds(&obs);
    let tac_orgs = tac_organisations(conn)?;
    let (matched, unmatched) = match_beds(&means, &tac_orgs);

    let bed_orgs: BTreeSet<&str> = means.keys().map(|(o, _)| o.as_str()).collect();
    let matched_orgs: BTreeSet<&str> = matched.iter().map(|b| b.org_name_raw.as_str()).collect();
    info!(
        "Matched {} of {} bed organisations ({:.1}%)",
        matched_orgs.len(),
        bed_orgs.len(),
        if bed_orgs.is_empty() {
            0.0
        } else {
            matched_orgs.len() as f64 / bed_orgs.len() as f64 * 100.0
        }
    );
    if !unmatched.is_empty() {
        warn!("Sample unmatched: {:?}", unmatched.iter().take(10).collect::<Vec<_>>());
    }

    write_rows(&cfg.paths.beds_matched(), &matched)?;
    Ok(matched)
}

/// Load `beds_matched.csv` if it exists.
pub fn load_beds(path: &Path) -> Result<Option<Vec<BedRow>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut rdr =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let rows = rdr
        .deserialize()
        .collect::<Result<Vec<BedRow>, _>>()
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(Some(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Cell;

    fn t(s: &str) -> Cell {
        Cell::Text(s.into())
    }

    fn bed_sheet() -> Grid {
        Grid::new(vec![
            vec![t("Bed availability and occupancy")],
            vec![t("Year"), t("Period End"), t("Org Code"), t("Org Name"), t("Total ")],
            vec![t("2022-23"), t("June"), t("RXX"), t("Alpha NHS Trust"), Cell::Number(100.0)],
            vec![t("2022-23"), t("Sept"), t("RXX"), t("Alpha NHS Trust"), Cell::Number(120.0)],
            vec![t("Year"), t("Period End"), t("Org Code"), t("Org Name"), t("Total ")],
            vec![t("2022-23"), t("June"), t("RYY"), t("Gamma Trust"), t("-")],
            vec![t("2022-23"), t("June"), t("RZZ"), t("Unknown Hospital"), Cell::Number(10.0)],
        ])
    }

    #[test]
    fn observations_skip_repeated_headers_and_blanks() -> Result<()> {
        let obs = extract_bed_observations(&bed_sheet(), "unknown", "beds.xlsx")?;
        assert_eq!(obs.len(), 3);
        assert!(obs.iter().all(|o| o.fy == "2022-23"));

        let from_name = extract_bed_observations(&bed_sheet(), "2023-24", "beds-2023-24.xlsx")?;
        assert!(from_name.iter().all(|o| o.fy == "2023-24"));
        Ok(())
    }

    #[test]
    fn means_are_matched_case_insensitively() -> Result<()> {
        let obs = extract_bed_observations(&bed_sheet(), "unknown", "beds.xlsx")?;
        let means = mean_beds(&obs);
        assert_eq!(
            means.get(&("Alpha NHS Trust".to_string(), "2022-23".to_string())),
            Some(&110.0)
        );

        let tac = vec![("ALPHA NHS TRUST ".to_string(), "Trust".to_string())];
        let (matched, unmatched) = match_beds(&means, &tac);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].org_name_raw, "ALPHA NHS TRUST ");
        assert_eq!(matched[0].beds, 110.0);
        assert_eq!(unmatched, vec!["Unknown Hospital".to_string()]);
        Ok(())
    }

    #[test]
    fn missing_bed_file_is_none() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(load_beds(&dir.path().join("beds_matched.csv"))?.is_none());
        Ok(())
    }
}
