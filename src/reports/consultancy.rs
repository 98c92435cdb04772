// src/reports/consultancy.rs

use anyhow::{bail, Result};
use duckdb::{Connection, ToSql};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::activity::{load_beds, BedRow};
use crate::chart;
use crate::config::Config;
use crate::enrich::ws_key_sql;
use crate::ingest::norm_key;
use crate::output::{write_rows, Table, Value};
use crate::reports::codes::{distinct_codes, placeholders, search_codes, CodeSearch};
use crate::reports::stats::{outlier_indices, zscores, Tail};
use crate::store::FACT_TABLE;

pub const REPORT_DIR: &str = "outlier_analysis";
pub const PER_BED_DIR: &str = "consultancy_per_bed";

/// Consultancy spend of one organisation-year with its operating income.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsultancyRow {
    pub org_name_raw: String,
    pub sector: String,
    pub fy: String,
    pub consultancy_spend: f64,
    pub operating_income: f64,
    /// `None` when income is zero.
    pub consultancy_pct_turnover: Option<f64>,
    pub consultancy_millions: f64,
    pub turnover_millions: f64,
}

const ROW_COLUMNS: [&str; 8] = [
    "org_name_raw",
    "sector",
    "fy",
    "consultancy_spend",
    "operating_income",
    "consultancy_pct_turnover",
    "consultancy_millions",
    "turnover_millions",
];

impl ConsultancyRow {
    fn values(&self) -> Vec<Value> {
        vec![
            self.org_name_raw.as_str().into(),
            self.sector.as_str().into(),
            self.fy.as_str().into(),
            self.consultancy_spend.into(),
            self.operating_income.into(),
            self.consultancy_pct_turnover.into(),
            self.consultancy_millions.into(),
            self.turnover_millions.into(),
        ]
    }
}

/// Consultancy spend joined with beds (`consultancy_with_beds.csv`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsultancyBedRow {
    pub org_name_raw: String,
    pub sector: String,
    pub fy: String,
    pub consultancy_spend: f64,
    pub operating_income: Option<f64>,
    pub consultancy_pct_turnover: Option<f64>,
    pub beds: f64,
    pub consultancy_per_bed: f64,
    pub consultancy_millions: f64,
    pub turnover_millions: Option<f64>,
}

type OrgYear = (String, String, String);

fn sum_by_org_year(
    conn: &Connection,
    codes: &[String],
    worksheet: Option<&str>,
) -> Result<BTreeMap<OrgYear, f64>> {
    if codes.is_empty() {
        return Ok(BTreeMap::new());
    }
    let mut params: Vec<String> = codes.to_vec();
    let mut filter = format!("sub_code IN ({})", placeholders(codes.len()));
    if let Some(ws) = worksheet {
        filter.push_str(&format!(" AND {} = ?", ws_key_sql("worksheet_name")));
        params.push(norm_key(ws));
    }
    let sql = format!(
        "SELECT org_name_raw, sector, fy, SUM(amount)
         FROM {fact}
         WHERE {filter}
         GROUP BY 1, 2, 3",
        fact = FACT_TABLE,
    );
    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(refs.as_slice(), |r| {
        Ok((
            (r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?),
            r.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
        ))
    })?;
    Ok(rows.collect::<Result<BTreeMap<_, _>, _>>()?)
}

/// Consultancy spend per (org, sector, fy) and operating income per (org, fy).
pub fn load_spend_and_income(
    conn: &Connection,
    cfg: &Config,
) -> Result<(BTreeMap<OrgYear, f64>, HashMap<(String, String), f64>)> {
    let terms = &cfg.reports.categories;
    let codes = distinct_codes(&search_codes(conn, &CodeSearch::terms(&terms.consultancy))?);
    let income_codes = distinct_codes(&search_codes(
        conn,
        &CodeSearch {
            worksheet: Some(terms.income_worksheet.as_str()),
            ..CodeSearch::terms(&terms.operating_income)
        },
    )?);
    info!(
        "{} consultancy codes, {} operating income codes",
        codes.len(),
        income_codes.len()
    );

    let spend = sum_by_org_year(conn, &codes, None)?;
    let mut income: HashMap<(String, String), f64> = HashMap::new();
    for ((org, _, fy), v) in sum_by_org_year(conn, &income_codes, Some(terms.income_worksheet.as_str()))? {
        *income.entry((org, fy)).or_insert(0.0) += v;
    }
    Ok((spend, income))
}

/// Inner join of spend with income on (org, fy).
pub fn with_turnover(
    spend: &BTreeMap<OrgYear, f64>,
    income: &HashMap<(String, String), f64>,
) -> Vec<ConsultancyRow> {
    spend
        .iter()
        .filter_map(|((org, sector, fy), &s)| {
            let inc = *income.get(&(org.clone(), fy.clone()))?;
            let pct = (inc != 0.0).then(|| s / inc * 100.0).filter(|p| p.is_finite());
            Some(ConsultancyRow {
                org_name_raw: org.clone(),
                sector: sector.clone(),
                fy: fy.clone(),
                consultancy_spend: s,
                operating_income: inc,
                consultancy_pct_turnover: pct,
                consultancy_millions: s / 1e6,
                turnover_millions: inc / 1e6,
            })
        })
        .collect()
}

/// Rows at `idx` with an extra z-score column, sorted on `key`.
fn outlier_table(
    rows: &[&ConsultancyRow],
    z: &[Option<f64>],
    mut idx: Vec<usize>,
    z_name: &str,
    key: impl Fn(&ConsultancyRow) -> f64,
    descending: bool,
) -> Table {
    idx.sort_by(|&a, &b| {
        let ord = key(rows[a]).total_cmp(&key(rows[b]));
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
    let mut cols: Vec<&str> = ROW_COLUMNS.to_vec();
    cols.push(z_name);
    let mut t = Table::new(&cols);
    for i in idx {
        let mut v = rows[i].values();
        v.push(z[i].into());
        t.push(v);
    }
    t
}

/// Organisation growth from the first to the latest year.
#[derive(Debug, Clone, PartialEq)]
pub struct Growth {
    pub org_name_raw: String,
    pub sector: String,
    pub first: f64,
    pub latest: f64,
    pub growth_pct: f64,
}

/// Growth of consultancy spend between two years; non-finite growth is dropped.
pub fn growth(rows: &[ConsultancyRow], first_fy: &str, latest_fy: &str) -> Vec<Growth> {
    let mut by_org: BTreeMap<(&str, &str), (Option<f64>, Option<f64>)> = BTreeMap::new();
    for r in rows {
        let e = by_org.entry((r.org_name_raw.as_str(), r.sector.as_str())).or_default();
        if r.fy == first_fy {
            e.0 = Some(r.consultancy_spend);
        }
        if r.fy == latest_fy {
            e.1 = Some(r.consultancy_spend);
        }
    }
    by_org
        .into_iter()
        .filter_map(|((org, sector), (first, latest))| {
            let (first, latest) = (first?, latest?);
            let growth_pct = (latest - first) / first * 100.0;
            growth_pct.is_finite().then(|| Growth {
                org_name_raw: org.to_string(),
                sector: sector.to_string(),
                first,
                latest,
                growth_pct,
            })
        })
        .collect()
}

fn growth_table(g: &[Growth], z: &[Option<f64>], idx: &[usize], first_fy: &str, latest_fy: &str) -> Table {
    let mut t = Table::new(&["org_name_raw", "sector", first_fy, latest_fy, "growth_pct", "z_score_growth"]);
    for &i in idx {
        let r = &g[i];
        t.push(vec![
            r.org_name_raw.as_str().into(),
            r.sector.as_str().into(),
            r.first.into(),
            r.latest.into(),
            r.growth_pct.into(),
            z[i].into(),
        ]);
    }
    t
}

/// Counts of what `run_consultancy` flagged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutlierCounts {
    pub latest_fy: String,
    pub organisations: usize,
    pub high_pct: usize,
    pub low_pct: usize,
    pub high_spend: usize,
    pub high_growth: usize,
    pub negative_growth: usize,
    pub sector_outliers: usize,
    pub high_per_bed: usize,
    pub low_per_bed: usize,
}

/// Consultancy relative to turnover, with z-score outlier lists and charts.
#[instrument(level = "info", skip(conn, cfg))]
pub fn run_consultancy(conn: &Connection, cfg: &Config) -> Result<OutlierCounts> {
    let dir = cfg.paths.report_dir(REPORT_DIR);
    let threshold = cfg.reports.outlier_z;

    // 1) data
    let (spend, income) = load_spend_and_income(conn, cfg)?;
    let rows = with_turnover(&spend, &income);
    if rows.is_empty() {
        bail!("no organisation has both consultancy spend and operating income");
    }
    write_rows(&dir.join("consultancy_with_turnover_pct.csv"), &rows)?;

    let mut years: Vec<&str> = rows.iter().map(|r| r.fy.as_str()).collect();
    years.sort();
    years.dedup();
    let (first_fy, latest_fy) = (years[0].to_string(), years[years.len() - 1].to_string());
    let latest: Vec<&ConsultancyRow> = rows
        .iter()
        .filter(|r| r.fy == latest_fy && r.consultancy_pct_turnover.is_some())
        .collect();
    let mut counts = OutlierCounts {
        latest_fy: latest_fy.clone(),
        organisations: latest.len(),
        ..Default::default()
    };
    info!("{} organisations in {}", latest.len(), latest_fy);

    // 2) percent of turnover
    let pct = |r: &ConsultancyRow| r.consultancy_pct_turnover.unwrap_or(f64::NAN);
    let pct_values: Vec<f64> = latest.iter().map(|r| pct(*r)).collect();
    let z_pct = zscores(&pct_values);
    let high = outlier_table(&latest, &z_pct, outlier_indices(&z_pct, threshold, Tail::High), "z_score_pct", pct, true);
    let low = outlier_table(&latest, &z_pct, outlier_indices(&z_pct, threshold, Tail::Low), "z_score_pct", pct, false);
    counts.high_pct = high.len();
    counts.low_pct = low.len();
    high.write_csv(&dir.join("high_outliers_consultancy_pct.csv"))?;
    low.write_csv(&dir.join("low_outliers_consultancy_pct.csv"))?;

    // 3) absolute spend
    let millions: Vec<f64> = latest.iter().map(|r| r.consultancy_millions).collect();
    let z_spend = zscores(&millions);
    let high_spend = outlier_table(
        &latest,
        &z_spend,
        outlier_indices(&z_spend, threshold, Tail::High),
        "z_score_spend",
        |r| r.consultancy_millions,
        true,
    );
    counts.high_spend = high_spend.len();
    high_spend.write_csv(&dir.join("high_outliers_absolute_spend.csv"))?;

    // 4) growth first -> latest
    let g = growth(&rows, &first_fy, &latest_fy);
    let z_growth = zscores(&g.iter().map(|r| r.growth_pct).collect::<Vec<_>>());
    let by_growth = |tail: Tail, descending: bool| {
        let mut idx = outlier_indices(&z_growth, threshold, tail);
        idx.sort_by(|&a, &b| {
            let ord = g[a].growth_pct.total_cmp(&g[b].growth_pct);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        idx
    };
    let high_growth = by_growth(Tail::High, true);
    let negative_growth = by_growth(Tail::Low, false);
    counts.high_growth = high_growth.len();
    counts.negative_growth = negative_growth.len();
    if !high_growth.is_empty() {
        growth_table(&g, &z_growth, &high_growth, &first_fy, &latest_fy)
            .write_csv(&dir.join("high_growth_outliers.csv"))?;
    }
    if !negative_growth.is_empty() {
        growth_table(&g, &z_growth, &negative_growth, &first_fy, &latest_fy)
            .write_csv(&dir.join("negative_growth_outliers.csv"))?;
    }

    // 5) within-sector
    let mut by_sector: BTreeMap<&str, Vec<&ConsultancyRow>> = BTreeMap::new();
    for r in &latest {
        by_sector.entry(r.sector.as_str()).or_default().push(*r);
    }
    for (sector, sector_rows) in &by_sector {
        let z = zscores(&sector_rows.iter().map(|r| pct(*r)).collect::<Vec<_>>());
        let t = outlier_table(sector_rows, &z, outlier_indices(&z, threshold, Tail::Both), "z_score_sector", pct, true);
        counts.sector_outliers += t.len();
        if !t.is_empty() {
            t.write_csv(&dir.join(format!("outliers_{}.csv", sector.to_lowercase())))?;
        }
    }

    // 6) charts
    charts(&dir, &rows, &latest, &z_pct, threshold, &latest_fy)?;

    // 7) per bed
    match load_beds(&cfg.paths.beds_matched())? {
        Some(beds) => {
            let (h, l) = per_bed_outliers(cfg, &spend, &income, &beds, threshold)?;
            counts.high_per_bed = h;
            counts.low_per_bed = l;
        }
        None => warn!("bed data not found; skipping per-bed consultancy outliers"),
    }

    info!(
        "outliers: pct high={} low={}, spend high={}, growth high={} negative={}, sector={}",
        counts.high_pct,
        counts.low_pct,
        counts.high_spend,
        counts.high_growth,
        counts.negative_growth,
        counts.sector_outliers
    );
    Ok(counts)
}

fn charts(
    dir: &Path,
    rows: &[ConsultancyRow],
    latest: &[&ConsultancyRow],
    z_pct: &[Option<f64>],
    threshold: f64,
    latest_fy: &str,
) -> Result<()> {
    let pct: Vec<f64> = latest.iter().filter_map(|r| r.consultancy_pct_turnover).collect();
    chart::histogram(
        &dir.join("consultancy_pct_distribution.svg"),
        &format!("Consultancy % of turnover ({})", latest_fy),
        &pct,
        30,
        "Consultancy % of turnover",
    )?;

    let flagged = outlier_indices(z_pct, threshold, Tail::Both);
    let point = |r: &ConsultancyRow| (r.turnover_millions, r.consultancy_pct_turnover.unwrap_or(0.0));
    let highlighted: Vec<(f64, f64)> = flagged.iter().map(|&i| point(latest[i])).collect();
    let normal: Vec<(f64, f64)> = (0..latest.len())
        .filter(|i| !flagged.contains(i))
        .map(|i| point(latest[i]))
        .collect();
    chart::scatter_chart(
        &dir.join("size_vs_consultancy_pct.svg"),
        &format!("Organisation size vs consultancy % ({})", latest_fy),
        &normal,
        &highlighted,
        "Turnover (£ millions)",
        "Consultancy % of turnover",
    )?;

    // top 5 high outliers over time
    let mut high = outlier_indices(z_pct, threshold, Tail::High);
    high.sort_by(|&a, &b| {
        let (a, b) = (latest[a].consultancy_pct_turnover, latest[b].consultancy_pct_turnover);
        b.unwrap_or(0.0).total_cmp(&a.unwrap_or(0.0))
    });
    if high.is_empty() {
        return Ok(());
    }
    let mut years: Vec<String> = rows.iter().map(|r| r.fy.clone()).collect();
    years.sort();
    years.dedup();
    let series: Vec<(String, Vec<Option<f64>>)> = high
        .iter()
        .take(5)
        .map(|&i| {
            let org = &latest[i].org_name_raw;
            let by_fy: HashMap<&str, Option<f64>> = rows
                .iter()
                .filter(|r| &r.org_name_raw == org)
                .map(|r| (r.fy.as_str(), r.consultancy_pct_turnover))
                .collect();
            let values = years.iter().map(|fy| by_fy.get(fy.as_str()).copied().flatten()).collect();
            (org.clone(), values)
        })
        .collect();
    chart::line_chart(
        &dir.join("top5_outlier_trends.svg"),
        "Top 5 outliers: consultancy % of turnover",
        &years,
        &series,
        "Consultancy % of turnover",
    )
}

/// Spend left-joined with income, inner-joined with beds on (org, fy).
pub fn with_beds(
    spend: &BTreeMap<OrgYear, f64>,
    income: &HashMap<(String, String), f64>,
    beds: &[BedRow],
) -> Vec<ConsultancyBedRow> {
    let beds_by: HashMap<(&str, &str), f64> = beds
        .iter()
        .map(|b| ((b.org_name_raw.as_str(), b.fy.as_str()), b.beds))
        .collect();
    spend
        .iter()
        .filter_map(|((org, sector, fy), &s)| {
            let beds = *beds_by.get(&(org.as_str(), fy.as_str()))?;
            let per_bed = s / beds;
            if !per_bed.is_finite() {
                return None;
            }
            let inc = income.get(&(org.clone(), fy.clone())).copied();
            Some(ConsultancyBedRow {
                org_name_raw: org.clone(),
                sector: sector.clone(),
                fy: fy.clone(),
                consultancy_spend: s,
                operating_income: inc,
                consultancy_pct_turnover: inc
                    .filter(|i| *i != 0.0)
                    .map(|i| s / i * 100.0),
                beds,
                consultancy_per_bed: per_bed,
                consultancy_millions: s / 1e6,
                turnover_millions: inc.map(|i| i / 1e6),
            })
        })
        .collect()
}

fn per_bed_outliers(
    cfg: &Config,
    spend: &BTreeMap<OrgYear, f64>,
    income: &HashMap<(String, String), f64>,
    beds: &[BedRow],
    threshold: f64,
) -> Result<(usize, usize)> {
    let dir = cfg.paths.report_dir(PER_BED_DIR);
    let rows = with_beds(spend, income, beds);
    write_rows(&dir.join("consultancy_with_beds.csv"), &rows)?;
    let Some(latest_fy) = rows.iter().map(|r| r.fy.as_str()).max() else {
        return Ok((0, 0));
    };
    let latest: Vec<&ConsultancyBedRow> = rows.iter().filter(|r| r.fy == latest_fy).collect();
    let z = zscores(&latest.iter().map(|r| r.consultancy_per_bed).collect::<Vec<_>>());

    let table = |tail: Tail, descending: bool| {
        let mut idx = outlier_indices(&z, threshold, tail);
        idx.sort_by(|&a, &b| {
            let ord = latest[a].consultancy_per_bed.total_cmp(&latest[b].consultancy_per_bed);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        let mut t = Table::new(&[
            "org_name_raw",
            "sector",
            "fy",
            "beds",
            "consultancy_millions",
            "consultancy_per_bed",
            "consultancy_pct_turnover",
            "z_score_per_bed",
        ]);
        for i in idx {
            let r = latest[i];
            t.push(vec![
                r.org_name_raw.as_str().into(),
                r.sector.as_str().into(),
                r.fy.as_str().into(),
                r.beds.into(),
                r.consultancy_millions.into(),
                r.consultancy_per_bed.into(),
                r.consultancy_pct_turnover.into(),
                z[i].into(),
            ]);
        }
        t
    };
    let high = table(Tail::High, true);
    let low = table(Tail::Low, false);
    info!(
        "{} per-bed records; {} high and {} low outliers in {}",
        rows.len(),
        high.len(),
        low.len(),
        latest_fy
    );
    high.write_csv(&dir.join("high_outliers_per_bed.csv"))?;
    low.write_csv(&dir.join("low_outliers_per_bed.csv"))?;
    Ok((high.len(), low.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spend_map(rows: &[(&str, &str, &str, f64)]) -> BTreeMap<OrgYear, f64> {
        rows.iter()
            .map(|(o, s, fy, v)| ((o.to_string(), s.to_string(), fy.to_string()), *v))
            .collect()
    }

    #[test]
    fn turnover_join_is_inner_and_guards_zero_income() {
        let spend = spend_map(&[
            ("Alpha", "Trust", "2022-23", 2.0e6),
            ("Beta", "FT", "2022-23", 1.0e6),
            ("Gamma", "FT", "2022-23", 1.0e6),
        ]);
        let income: HashMap<(String, String), f64> = [
            (("Alpha".to_string(), "2022-23".to_string()), 100.0e6),
            (("Beta".to_string(), "2022-23".to_string()), 0.0),
        ]
        .into_iter()
        .collect();

        let rows = with_turnover(&spend, &income);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].consultancy_pct_turnover, Some(2.0));
        assert_eq!(rows[0].consultancy_millions, 2.0);
        assert_eq!(rows[0].turnover_millions, 100.0);
        assert_eq!(rows[1].consultancy_pct_turnover, None);
    }

    fn row(org: &str, fy: &str, spend: f64) -> ConsultancyRow {
        ConsultancyRow {
            org_name_raw: org.into(),
            sector: "Trust".into(),
            fy: fy.into(),
            consultancy_spend: spend,
            operating_income: 100.0,
            consultancy_pct_turnover: Some(spend),
            consultancy_millions: spend / 1e6,
            turnover_millions: 1e-4,
        }
    }

    #[test]
    fn growth_needs_both_years_and_finite_ratio() {
        let rows = vec![
            row("Alpha", "2019-20", 10.0),
            row("Alpha", "2022-23", 15.0),
            row("Beta", "2022-23", 5.0),
            row("Gamma", "2019-20", 0.0),
            row("Gamma", "2022-23", 5.0),
        ];
        let g = growth(&rows, "2019-20", "2022-23");
        assert_eq!(g.len(), 1);
        assert_eq!(g[0].org_name_raw, "Alpha");
        assert_eq!(g[0].growth_pct, 50.0);
    }

    #[test]
    fn outlier_tables_sort_and_carry_z() {
        let rows: Vec<ConsultancyRow> = (0..10)
            .map(|i| row(&format!("Org{}", i), "2022-23", if i == 9 { 50.0 } else { 1.0 }))
            .collect();
        let refs: Vec<&ConsultancyRow> = rows.iter().collect();
        let z = zscores(&rows.iter().map(|r| r.consultancy_spend).collect::<Vec<_>>());
        let idx = outlier_indices(&z, 2.0, Tail::High);
        assert_eq!(idx, vec![9]);

        let t = outlier_table(&refs, &z, idx, "z_score_pct", |r| r.consultancy_spend, true);
        assert_eq!(t.columns.last().map(String::as_str), Some("z_score_pct"));
        assert_eq!(t.text_column("org_name_raw").unwrap(), vec!["Org9"]);
        assert!(t.f64_column("z_score_pct").unwrap()[0].unwrap() > 2.0);
    }

    #[test]
    fn per_bed_join_skips_missing_beds() {
        let spend = spend_map(&[("Alpha", "Trust", "2022-23", 1000.0), ("Beta", "FT", "2022-23", 10.0)]);
        let beds = vec![BedRow {
            org_name_raw: "Alpha".into(),
            sector: "Trust".into(),
            fy: "2022-23".into(),
            beds: 100.0,
        }];
        let rows = with_beds(&spend, &HashMap::new(), &beds);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].consultancy_per_bed, 10.0);
        assert_eq!(rows[0].operating_income, None);
    }
}
