// src/reports/pfi.rs

use anyhow::Result;
use duckdb::{Connection, ToSql};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::activity::{load_beds, BedRow};
use crate::chart;
use crate::config::Config;
use crate::output::write_rows;
use crate::reports::codes::{distinct_codes, placeholders, search_codes, CodeHit, CodeSearch};
use crate::reports::stats::{summarize, Summary};
use crate::store::FACT_TABLE;

pub const REPORT_DIR: &str = "pfi_analysis";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PfiType {
    Capital,
    Revenue,
}

/// Capital when the label or worksheet points at the balance sheet side, otherwise revenue.
pub fn classify_pfi(label: &str, worksheet: &str, ws_key: &str) -> PfiType {
    let label = label.to_lowercase();
    let ws = worksheet.to_lowercase();
    let capital_label = ["capital", "depreciation", "impairment"]
        .iter()
        .any(|t| label.contains(t));
    let capital_ws = ws.contains("capital")
        || ws.contains("balance sheet")
        || ws.contains("sofp")
        || ws_key.contains("capital")
        || ws_key.contains("balancesheet")
        || ws_key.contains("sofp");
    if capital_label || capital_ws {
        PfiType::Capital
    } else {
        PfiType::Revenue
    }
}

/// One row of `pfi_codes.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PfiCode {
    pub sub_code: String,
    pub subcode_label: String,
    pub worksheet_name: String,
    pub ws_key: String,
    pub years_present: i64,
    pub pfi_type: PfiType,
}

/// Codes by PFI terms, or the broader fallback terms when nothing matches.
pub fn find_pfi_codes(conn: &Connection, cfg: &Config) -> Result<Vec<CodeHit>> {
    let terms = &cfg.reports.categories;
    let hits = search_codes(conn, &CodeSearch::terms(&terms.pfi))?;
    if !hits.is_empty() {
        return Ok(hits);
    }
    warn!("no direct PFI codes; searching {:?}", terms.pfi_fallback);
    search_codes(
        conn,
        &CodeSearch {
            limit: Some(30),
            ..CodeSearch::terms(&terms.pfi_fallback)
        },
    )
}

/// Per-code type; a code is Capital if any of its labels classifies as Capital.
pub fn code_types(hits: &[CodeHit]) -> BTreeMap<String, PfiType> {
    let mut types: BTreeMap<String, PfiType> = BTreeMap::new();
    for h in hits {
        let t = classify_pfi(&h.subcode_label, &h.worksheet_name, &h.ws_key);
        types
            .entry(h.sub_code.clone())
            .and_modify(|prev| *prev = (*prev).min(t))
            .or_insert(t);
    }
    types
}

/// Capital and revenue PFI of one organisation in one year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PfiOrgYear {
    pub org_name_raw: String,
    pub sector: String,
    pub fy: String,
    pub capital: f64,
    pub revenue: f64,
    pub total_pfi: f64,
}

/// `PfiOrgYear` joined with beds (`pfi_with_beds.csv`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PfiPerBed {
    pub org_name_raw: String,
    pub sector: String,
    pub fy: String,
    pub capital: f64,
    pub revenue: f64,
    pub total_pfi: f64,
    pub beds: f64,
    pub capital_pfi_per_bed: f64,
    pub revenue_pfi_per_bed: f64,
    pub total_pfi_per_bed: f64,
}

/// Sum fact amounts of the given codes per (org, sector, fy), split by type.
/// Each fact row is counted once regardless of how many labels its code has.
pub fn pfi_spend(conn: &Connection, types: &BTreeMap<String, PfiType>) -> Result<Vec<PfiOrgYear>> {
    if types.is_empty() {
        return Ok(Vec::new());
    }
    let codes: Vec<&String> = types.keys().collect();
    let sql = format!(
        "SELECT org_name_raw, sector, fy, sub_code, SUM(amount) AS amount
         FROM {fact}
         WHERE sub_code IN ({ph})
         GROUP BY 1, 2, 3, 4",
        fact = FACT_TABLE,
        ph = placeholders(codes.len()),
    );
    let params: Vec<&dyn ToSql> = codes.iter().map(|c| *c as &dyn ToSql).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, Option<f64>>(4)?,
        ))
    })?;

    let mut acc: BTreeMap<(String, String, String), (f64, f64)> = BTreeMap::new();
    for row in rows {
        let (org, sector, fy, code, amount) = row?;
        let e = acc.entry((org, sector, fy)).or_insert((0.0, 0.0));
        match types.get(&code) {
            Some(PfiType::Capital) => e.0 += amount.unwrap_or(0.0),
            Some(PfiType::Revenue) => e.1 += amount.unwrap_or(0.0),
            None => {}
        }
    }
    Ok(acc
        .into_iter()
        .map(|((org_name_raw, sector, fy), (capital, revenue))| PfiOrgYear {
            org_name_raw,
            sector,
            fy,
            capital,
            revenue,
            total_pfi: capital + revenue,
        })
        .collect())
}

/// Inner join on (org, fy); rows without positive beds or with non-finite ratios are dropped.
pub fn per_bed(spend: &[PfiOrgYear], beds: &[BedRow]) -> Vec<PfiPerBed> {
    let by_key: HashMap<(&str, &str), f64> = beds
        .iter()
        .map(|b| ((b.org_name_raw.as_str(), b.fy.as_str()), b.beds))
        .collect();
    spend
        .iter()
        .filter_map(|s| {
            let beds = *by_key.get(&(s.org_name_raw.as_str(), s.fy.as_str()))?;
            if beds.is_nan() || beds <= 0.0 {
                return None;
            }
            let row = PfiPerBed {
                org_name_raw: s.org_name_raw.clone(),
                sector: s.sector.clone(),
                fy: s.fy.clone(),
                capital: s.capital,
                revenue: s.revenue,
                total_pfi: s.total_pfi,
                beds,
                capital_pfi_per_bed: s.capital / beds,
                revenue_pfi_per_bed: s.revenue / beds,
                total_pfi_per_bed: s.total_pfi / beds,
            };
            [row.capital_pfi_per_bed, row.revenue_pfi_per_bed, row.total_pfi_per_bed]
                .iter()
                .all(|v| v.is_finite())
                .then_some(row)
        })
        .collect()
}

pub fn latest_fy<'a>(years: impl Iterator<Item = &'a str>) -> Option<String> {
    years.max().map(str::to_string)
}

/// What `run_pfi` produced.
#[derive(Debug, Clone)]
pub struct PfiReport {
    pub codes: Vec<PfiCode>,
    pub spend: Vec<PfiOrgYear>,
    pub with_beds: Option<Vec<PfiPerBed>>,
    pub latest_fy: Option<String>,
    pub summary: Vec<Summary>,
}

/// Discover, classify and aggregate PFI codes; per-bed metrics when bed data exists.
#[instrument(level = "info", skip(conn, cfg))]
pub fn run_pfi(conn: &Connection, cfg: &Config) -> Result<PfiReport> {
    let out_dir = cfg.paths.report_dir(REPORT_DIR);

    // 1) discover + classify
    let hits = find_pfi_codes(conn, cfg)?;
    let types = code_types(&hits);
    let codes: Vec<PfiCode> = hits
        .iter()
        .map(|h| PfiCode {
            sub_code: h.sub_code.clone(),
            subcode_label: h.subcode_label.clone(),
            worksheet_name: h.worksheet_name.clone(),
            ws_key: h.ws_key.clone(),
            years_present: h.years_present,
            pfi_type: types.get(&h.sub_code).copied().unwrap_or(PfiType::Revenue),
        })
        .collect();
    let n_capital = types.values().filter(|t| **t == PfiType::Capital).count();
    info!(
        "{} PFI codes ({} capital, {} revenue)",
        distinct_codes(&hits).len(),
        n_capital,
        types.len() - n_capital
    );
    write_rows(&out_dir.join("pfi_codes.csv"), &codes)?;

    // 2) spend per org-year
    let spend = pfi_spend(conn, &types)?;
    info!("{} org-year PFI records", spend.len());

    // 3) beds
    let with_beds = match load_beds(&cfg.paths.beds_matched())? {
        Some(beds) => {
            let rows = per_bed(&spend, &beds);
            info!("{} org-year records with beds", rows.len());
            write_rows(&out_dir.join("pfi_with_beds.csv"), &rows)?;
            Some(rows)
        }
        None => {
            warn!("bed data not found; PFI report has no per-bed metrics");
            write_rows(&out_dir.join("pfi_by_org_year.csv"), &spend)?;
            None
        }
    };

    // 4) latest-year summary, top 10 and chart
    let (latest, summary) = match &with_beds {
        Some(rows) => summarise_per_bed(rows, &out_dir)?,
        None => summarise_totals(&spend, &out_dir)?,
    };

    Ok(PfiReport {
        codes,
        spend,
        with_beds,
        latest_fy: latest,
        summary,
    })
}

fn sorted_desc<T>(rows: &mut [&T], key: impl Fn(&T) -> f64) {
    rows.sort_by(|a, b| key(b).total_cmp(&key(a)));
}

fn summarise_per_bed(rows: &[PfiPerBed], out_dir: &Path) -> Result<(Option<String>, Vec<Summary>)> {
    let Some(fy) = latest_fy(rows.iter().map(|r| r.fy.as_str())) else {
        return Ok((None, Vec::new()));
    };
    let mut latest: Vec<&PfiPerBed> = rows.iter().filter(|r| r.fy == fy).collect();
    let col = |f: fn(&PfiPerBed) -> f64| latest.iter().map(|r| f(r)).collect::<Vec<f64>>();
    let summary = vec![
        summarize("capital_pfi_per_bed", &col(|r| r.capital_pfi_per_bed)),
        summarize("revenue_pfi_per_bed", &col(|r| r.revenue_pfi_per_bed)),
        summarize("total_pfi_per_bed", &col(|r| r.total_pfi_per_bed)),
    ];
    for s in &summary {
        info!(
            "{} {}: mean £{:.0}, median £{:.0}, max £{:.0}",
            fy,
            s.metric,
            s.mean.unwrap_or(f64::NAN),
            s.median.unwrap_or(f64::NAN),
            s.max.unwrap_or(f64::NAN)
        );
    }
    write_rows(&out_dir.join(format!("pfi_summary_{}.csv", fy)), &summary)?;

    sorted_desc(&mut latest, |r| r.total_pfi_per_bed);
    let top10: Vec<PfiPerBed> = latest.iter().take(10).map(|r| (*r).clone()).collect();
    write_rows(&out_dir.join(format!("pfi_top10_per_bed_{}.csv", fy)), &top10)?;

    let top20: Vec<&&PfiPerBed> = latest.iter().take(20).collect();
    chart::bar_chart(
        &out_dir.join(format!("pfi_top20_per_bed_{}.svg", fy)),
        &format!("Total PFI per bed, top 20 ({})", fy),
        &top20.iter().map(|r| r.org_name_raw.clone()).collect::<Vec<_>>(),
        &top20.iter().map(|r| r.total_pfi_per_bed).collect::<Vec<_>>(),
        "£ per bed",
    )?;
    Ok((Some(fy), summary))
}

fn summarise_totals(rows: &[PfiOrgYear], out_dir: &Path) -> Result<(Option<String>, Vec<Summary>)> {
    let Some(fy) = latest_fy(rows.iter().map(|r| r.fy.as_str())) else {
        return Ok((None, Vec::new()));
    };
    let mut latest: Vec<&PfiOrgYear> = rows.iter().filter(|r| r.fy == fy).collect();
    let summary = vec![
        summarize("capital", &latest.iter().map(|r| r.capital).collect::<Vec<_>>()),
        summarize("revenue", &latest.iter().map(|r| r.revenue).collect::<Vec<_>>()),
        summarize("total_pfi", &latest.iter().map(|r| r.total_pfi).collect::<Vec<_>>()),
    ];
    write_rows(&out_dir.join(format!("pfi_summary_{}.csv", fy)), &summary)?;

    sorted_desc(&mut latest, |r| r.total_pfi);
    let top10: Vec<PfiOrgYear> = latest.iter().take(10).map(|r| (*r).clone()).collect();
    write_rows(&out_dir.join(format!("pfi_top10_{}.csv", fy)), &top10)?;

    let top20: Vec<&&PfiOrgYear> = latest.iter().take(20).collect();
    chart::bar_chart(
        &out_dir.join(format!("pfi_top20_{}.svg", fy)),
        &format!("Total PFI, top 20 ({})", fy),
        &top20.iter().map(|r| r.org_name_raw.clone()).collect::<Vec<_>>(),
        &top20.iter().map(|r| r.total_pfi).collect::<Vec<_>>(),
        "£",
    )?;
    Ok((Some(fy), summary))
}

/// `pfi_with_beds.csv` as written by `run_pfi`.
pub fn pfi_with_beds_path(cfg: &Config) -> PathBuf {
    cfg.paths.report_dir(REPORT_DIR).join("pfi_with_beds.csv")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reports::codes::tests::subcode_dim;

    #[test]
    fn classification_rules() {
        assert_eq!(classify_pfi("PFI depreciation", "TAC02 SoCI", "tac02soci"), PfiType::Capital);
        assert_eq!(classify_pfi("PFI liability", "TAC20 Balance Sheet", "tac20balancesheet"), PfiType::Capital);
        assert_eq!(classify_pfi("PFI liability", "SoFP", "sofp"), PfiType::Capital);
        assert_eq!(classify_pfi("PFI unitary payment", "TAC09 Op Exp", "tac09opexp"), PfiType::Revenue);
    }

    fn hit(code: &str, label: &str) -> CodeHit {
        CodeHit {
            sub_code: code.into(),
            subcode_label: label.into(),
            worksheet_name: "TAC09 Op Exp".into(),
            ws_key: "tac09opexp".into(),
            years_present: 1,
        }
    }

    #[test]
    fn capital_under_any_label_wins() {
        let types = code_types(&[
            hit("EXP0500", "PFI service charge"),
            hit("EXP0500", "PFI capital element"),
            hit("EXP0600", "PFI interest"),
        ]);
        assert_eq!(types["EXP0500"], PfiType::Capital);
        assert_eq!(types["EXP0600"], PfiType::Revenue);
    }

    #[test]
    fn spend_counts_each_fact_row_once() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        subcode_dim(&conn)?;
        conn.execute_batch(
            "CREATE TABLE fact_tru_tac(org_name_raw VARCHAR, sector VARCHAR, fy VARCHAR,
               sub_code VARCHAR, amount DOUBLE);
             INSERT INTO fact_tru_tac VALUES
               ('Alpha', 'Trust', '2022-23', 'EXP0500', 100.0),
               ('Alpha', 'Trust', '2022-23', 'SOC0300', 40.0),
               ('Alpha', 'Trust', '2022-23', 'EXP0390', 999.0),
               ('Beta', 'FT', '2022-23', 'EXP0500', NULL);",
        )?;
        let cfg = Config::default();
        let hits = find_pfi_codes(&conn, &cfg)?;
        assert_eq!(distinct_codes(&hits), vec!["EXP0500", "SOC0300"]);

        let spend = pfi_spend(&conn, &code_types(&hits))?;
        assert_eq!(spend.len(), 2);
        assert_eq!(spend[0].org_name_raw, "Alpha");
        assert_eq!(spend[0].capital, 40.0);
        assert_eq!(spend[0].revenue, 100.0);
        assert_eq!(spend[0].total_pfi, 140.0);
        assert_eq!(spend[1].total_pfi, 0.0);
        Ok(())
    }

    #[test]
    fn per_bed_drops_missing_and_zero_beds() {
        let spend = vec![
            PfiOrgYear {
                org_name_raw: "Alpha".into(),
                sector: "Trust".into(),
                fy: "2022-23".into(),
                capital: 50.0,
                revenue: 150.0,
                total_pfi: 200.0,
            },
            PfiOrgYear {
                org_name_raw: "Beta".into(),
                sector: "FT".into(),
                fy: "2022-23".into(),
                capital: 1.0,
                revenue: 1.0,
                total_pfi: 2.0,
            },
        ];
        let beds = vec![
            BedRow {
                org_name_raw: "Alpha".into(),
                sector: "Trust".into(),
                fy: "2022-23".into(),
                beds: 100.0,
            },
            BedRow {
                org_name_raw: "Beta".into(),
                sector: "FT".into(),
                fy: "2022-23".into(),
                beds: 0.0,
            },
        ];
        let rows = per_bed(&spend, &beds);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_pfi_per_bed, 2.0);
        assert_eq!(rows[0].capital_pfi_per_bed, 0.5);
    }
}
