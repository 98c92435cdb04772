// src/reports/flourish.rs

use anyhow::{bail, Context, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::output::{pivot, Table, Value};
use crate::reports::pfi::{latest_fy, pfi_with_beds_path, PfiPerBed, REPORT_DIR};
use crate::reports::stats::mean;

pub const EXPORT_DIR: &str = "flourish_exports";

pub fn read_pfi_with_beds(path: &Path) -> Result<Vec<PfiPerBed>> {
    if !path.exists() {
        bail!("{} not found; run `pfi` with bed data first", path.display());
    }
    let mut rdr =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let rows = rdr
        .deserialize()
        .collect::<Result<Vec<PfiPerBed>, _>>()
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(rows)
}

/// Organisations ranked by `score` of their per-year total per bed, best first.
fn top_orgs(rows: &[PfiPerBed], n: usize, score: impl Fn(&[f64]) -> f64) -> Vec<String> {
    let mut by_org: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for r in rows {
        by_org.entry(r.org_name_raw.as_str()).or_default().push(r.total_pfi_per_bed);
    }
    let mut scored: Vec<(&str, f64)> = by_org.into_iter().map(|(o, v)| (o, score(&v))).collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    scored.into_iter().take(n).map(|(o, _)| o.to_string()).collect()
}

fn years(rows: &[PfiPerBed]) -> Vec<String> {
    rows.iter()
        .map(|r| r.fy.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn by_total_per_bed_desc(rows: &mut [&PfiPerBed]) {
    rows.sort_by(|a, b| b.total_pfi_per_bed.total_cmp(&a.total_pfi_per_bed));
}

/// Top 20 organisations by their best year; org × fy, missing years 0.
pub fn bar_chart_race(rows: &[PfiPerBed]) -> Table {
    let mut orgs = top_orgs(rows, 20, |v| v.iter().copied().fold(f64::NEG_INFINITY, f64::max));
    orgs.sort();
    let keep: BTreeSet<&str> = orgs.iter().map(String::as_str).collect();
    let cells: Vec<(String, String, f64)> = rows
        .iter()
        .filter(|r| keep.contains(r.org_name_raw.as_str()))
        .map(|r| (r.org_name_raw.clone(), r.fy.clone(), r.total_pfi_per_bed))
        .collect();
    pivot("org_name_raw", &orgs, &years(rows), &cells, Value::Float(0.0))
}

pub fn scatter_capital_vs_revenue(latest: &[&PfiPerBed]) -> Table {
    let mut t = Table::new(&[
        "Organization",
        "Sector",
        "Beds",
        "Capital PFI per Bed",
        "Revenue PFI per Bed",
        "Total PFI per Bed",
    ]);
    for r in latest {
        t.push(vec![
            r.org_name_raw.as_str().into(),
            r.sector.as_str().into(),
            r.beds.into(),
            r.capital_pfi_per_bed.into(),
            r.revenue_pfi_per_bed.into(),
            r.total_pfi_per_bed.into(),
        ]);
    }
    t
}

/// Top 30 of the latest year by total per bed, listed by capital per bed.
pub fn stacked_capital_revenue(latest: &[&PfiPerBed]) -> Table {
    let mut top: Vec<&PfiPerBed> = latest.to_vec();
    by_total_per_bed_desc(&mut top);
    top.truncate(30);
    top.sort_by(|a, b| b.capital_pfi_per_bed.total_cmp(&a.capital_pfi_per_bed));

    let mut t = Table::new(&["Organization", "Capital", "Revenue"]);
    for r in top {
        t.push(vec![
            r.org_name_raw.as_str().into(),
            r.capital_pfi_per_bed.into(),
            r.revenue_pfi_per_bed.into(),
        ]);
    }
    t
}

/// Top 10 organisations by mean total per bed; fy × org, missing years blank.
pub fn line_chart_trends(rows: &[PfiPerBed]) -> Table {
    let mut orgs = top_orgs(rows, 10, |v| mean(v).unwrap_or(f64::NEG_INFINITY));
    orgs.sort();
    let keep: BTreeSet<&str> = orgs.iter().map(String::as_str).collect();
    let cells: Vec<(String, String, f64)> = rows
        .iter()
        .filter(|r| keep.contains(r.org_name_raw.as_str()))
        .map(|r| (r.fy.clone(), r.org_name_raw.clone(), r.total_pfi_per_bed))
        .collect();
    pivot("fy", &years(rows), &orgs, &cells, Value::Null)
}

const DETAIL_COLUMNS: [&str; 6] = [
    "Capital PFI per Bed (£)",
    "Revenue PFI per Bed (£)",
    "Total PFI per Bed (£)",
    "Total Capital PFI (£)",
    "Total Revenue PFI (£)",
    "Total PFI (£)",
];

fn detail_values(r: &PfiPerBed) -> [Value; 6] {
    [
        r.capital_pfi_per_bed.into(),
        r.revenue_pfi_per_bed.into(),
        r.total_pfi_per_bed.into(),
        r.capital.into(),
        r.revenue.into(),
        r.total_pfi.into(),
    ]
}

pub fn detailed_rankings(latest: &[&PfiPerBed]) -> Table {
    let mut ranked: Vec<&PfiPerBed> = latest.to_vec();
    by_total_per_bed_desc(&mut ranked);

    let mut cols = vec!["Rank", "Organization", "Sector", "Beds"];
    cols.extend(DETAIL_COLUMNS);
    let mut t = Table::new(&cols);
    for (i, r) in ranked.into_iter().enumerate() {
        let mut row: Vec<Value> = vec![
            (i as i64 + 1).into(),
            r.org_name_raw.as_str().into(),
            r.sector.as_str().into(),
            r.beds.into(),
        ];
        row.extend(detail_values(r));
        t.push(row);
    }
    t
}

pub fn sector_comparison(latest: &[&PfiPerBed]) -> Table {
    let mut by_sector: BTreeMap<&str, Vec<&PfiPerBed>> = BTreeMap::new();
    for r in latest {
        by_sector.entry(r.sector.as_str()).or_default().push(*r);
    }
    let mut t = Table::new(&[
        "Sector",
        "Avg Capital per Bed",
        "Avg Revenue per Bed",
        "Avg Total per Bed",
        "Number of Organizations",
    ]);
    for (sector, rows) in by_sector {
        let avg = |f: fn(&PfiPerBed) -> f64| {
            Value::from(mean(&rows.iter().map(|r| f(r)).collect::<Vec<_>>()))
        };
        t.push(vec![
            sector.into(),
            avg(|r| r.capital_pfi_per_bed),
            avg(|r| r.revenue_pfi_per_bed),
            avg(|r| r.total_pfi_per_bed),
            (rows.len() as i64).into(),
        ]);
    }
    t
}

/// (ODS code, postcode) by uppercase trimmed organisation name; first occurrence wins.
pub fn load_postcodes(path: &Path) -> Result<HashMap<String, (String, String)>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut lookup = HashMap::new();
    for rec in rdr.records() {
        let rec = rec.with_context(|| format!("reading {}", path.display()))?;
        let (Some(ods), Some(name)) = (rec.get(0), rec.get(1)) else {
            continue;
        };
        let postcode = rec.get(9).unwrap_or_default();
        lookup
            .entry(name.trim().to_uppercase())
            .or_insert_with(|| (ods.trim().to_string(), postcode.trim().to_string()));
    }
    Ok(lookup)
}

/// Latest-year rows with ODS code and postcode; unmatched organisations keep blank locations.
pub fn map_by_location(latest: &[&PfiPerBed], lookup: &HashMap<String, (String, String)>) -> Table {
    let mut ranked: Vec<&PfiPerBed> = latest.to_vec();
    by_total_per_bed_desc(&mut ranked);

    let mut cols = vec!["Organization", "ODS Code", "Postcode", "Sector", "Beds"];
    cols.extend(DETAIL_COLUMNS);
    let mut t = Table::new(&cols);
    for r in ranked {
        let loc = lookup.get(&r.org_name_raw.trim().to_uppercase());
        let mut row: Vec<Value> = vec![
            r.org_name_raw.as_str().into(),
            loc.map(|l| l.0.clone()).into(),
            loc.map(|l| l.1.clone()).into(),
            r.sector.as_str().into(),
            r.beds.into(),
        ];
        row.extend(detail_values(r));
        t.push(row);
    }
    t
}

/// Write the Flourish-ready CSVs from `pfi_with_beds.csv`.
#[instrument(level = "info", skip(cfg))]
pub fn export_pfi(cfg: &Config) -> Result<Vec<String>> {
    let rows = read_pfi_with_beds(&pfi_with_beds_path(cfg))?;
    let Some(fy) = latest_fy(rows.iter().map(|r| r.fy.as_str())) else {
        bail!("pfi_with_beds.csv is empty");
    };
    info!("{} PFI records, latest year {}", rows.len(), fy);
    let latest: Vec<&PfiPerBed> = rows.iter().filter(|r| r.fy == fy).collect();

    let out = cfg.paths.report_dir(REPORT_DIR).join(EXPORT_DIR);
    let mut written = Vec::new();
    let mut save = |name: &str, table: Table| -> Result<()> {
        table.write_csv(&out.join(name))?;
        written.push(name.to_string());
        Ok(())
    };

    save("1_bar_chart_race.csv", bar_chart_race(&rows))?;
    save("2_scatter_capital_vs_revenue.csv", scatter_capital_vs_revenue(&latest))?;
    save("3_stacked_bar_capital_revenue.csv", stacked_capital_revenue(&latest))?;
    save("4_line_chart_trends.csv", line_chart_trends(&rows))?;
    save("5_table_detailed_rankings.csv", detailed_rankings(&latest))?;
    save("6_sector_comparison.csv", sector_comparison(&latest))?;

    let postcodes = cfg.paths.postcodes();
    if postcodes.exists() {
        let lookup = load_postcodes(&postcodes)?;
        let map = map_by_location(&latest, &lookup);
        let matched = map.text_column("Postcode")?.iter().filter(|p| !p.is_empty()).count();
        info!("postcodes matched for {}/{} organisations", matched, map.len());
        save("7_map_pfi_by_location.csv", map)?;
    } else {
        warn!("{} not found; skipping map export", postcodes.display());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn row(org: &str, sector: &str, fy: &str, capital: f64, revenue: f64, beds: f64) -> PfiPerBed {
        PfiPerBed {
            org_name_raw: org.into(),
            sector: sector.into(),
            fy: fy.into(),
            capital,
            revenue,
            total_pfi: capital + revenue,
            beds,
            capital_pfi_per_bed: capital / beds,
            revenue_pfi_per_bed: revenue / beds,
            total_pfi_per_bed: (capital + revenue) / beds,
        }
    }

    fn sample() -> Vec<PfiPerBed> {
        vec![
            row("Alpha", "Trust", "2021-22", 100.0, 100.0, 10.0),
            row("Alpha", "Trust", "2022-23", 300.0, 100.0, 10.0),
            row("Beta", "FT", "2022-23", 10.0, 90.0, 10.0),
            row("Gamma", "FT", "2021-22", 0.0, 50.0, 10.0),
        ]
    }

    #[test]
    fn race_fills_missing_years_with_zero() {
        let t = bar_chart_race(&sample());
        assert_eq!(t.columns, vec!["org_name_raw", "2021-22", "2022-23"]);
        assert_eq!(t.rows[1][0], Value::from("Beta"));
        assert_eq!(t.rows[1][1], Value::Float(0.0));
        assert_eq!(t.rows[0][2], Value::Float(40.0));
    }

    #[test]
    fn trends_leave_missing_years_blank() {
        let t = line_chart_trends(&sample());
        assert_eq!(t.columns, vec!["fy", "Alpha", "Beta", "Gamma"]);
        assert_eq!(t.rows[0][2], Value::Null);
        assert_eq!(t.rows[1][1], Value::Float(40.0));
    }

    #[test]
    fn latest_year_tables() {
        let rows = sample();
        let latest: Vec<&PfiPerBed> = rows.iter().filter(|r| r.fy == "2022-23").collect();

        let ranked = detailed_rankings(&latest);
        assert_eq!(ranked.text_column("Organization").unwrap(), vec!["Alpha", "Beta"]);
        assert_eq!(ranked.text_column("Rank").unwrap(), vec!["1", "2"]);
        assert_eq!(ranked.columns[9], "Total PFI (£)");

        let sectors = sector_comparison(&latest);
        assert_eq!(sectors.text_column("Sector").unwrap(), vec!["FT", "Trust"]);
        assert_eq!(sectors.f64_column("Avg Total per Bed").unwrap()[1], Some(40.0));

        let stacked = stacked_capital_revenue(&latest);
        assert_eq!(stacked.f64_column("Capital").unwrap(), vec![Some(30.0), Some(1.0)]);
    }

    #[test]
    fn postcode_lookup_first_occurrence_wins() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("trust_postcodes.csv");
        fs::write(
            &path,
            "RAA,ALPHA ,x,x,x,x,x,x,x,AB1 2CD\n\
             RAB,Alpha,x,x,x,x,x,x,x,ZZ9 9ZZ\n\
             RBB,Short row\n",
        )?;
        let lookup = load_postcodes(&path)?;
        assert_eq!(lookup["ALPHA"], ("RAA".to_string(), "AB1 2CD".to_string()));
        assert_eq!(lookup["SHORT ROW"].1, "");

        let rows = sample();
        let latest: Vec<&PfiPerBed> = rows.iter().filter(|r| r.fy == "2022-23").collect();
        let map = map_by_location(&latest, &lookup);
        assert_eq!(map.text_column("Postcode")?, vec!["AB1 2CD", ""]);
        Ok(())
    }
}
