// src/reports/it_consultancy.rs

use anyhow::Result;
use duckdb::{Connection, ToSql};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::chart;
use crate::config::Config;
use crate::ingest::norm_key;
use crate::output::{write_rows, Table, Value};
use crate::reports::codes::{distinct_codes, placeholders, search_codes, CodeHit, CodeSearch};
use crate::store::{query_table, ENRICHED_TABLE};

pub const REPORT_DIR: &str = "it_consultancy_analysis";

/// Rows restricted either to a code list or to one worksheet.
#[derive(Debug, Clone)]
pub enum Scope {
    Codes(Vec<String>),
    Worksheet(String),
}

impl Scope {
    fn filter(&self) -> (String, Vec<String>) {
        match self {
            Scope::Codes(codes) => (
                format!("sub_code IN ({})", placeholders(codes.len())),
                if codes.is_empty() {
                    vec![String::new()]
                } else {
                    codes.clone()
                },
            ),
            Scope::Worksheet(ws) => ("ws_key = ?".to_string(), vec![norm_key(ws)]),
        }
    }
}

/// Spend by (fy, sector, label, worksheet) from the enriched fact table.
pub fn spend_detail(conn: &Connection, scope: &Scope) -> Result<Table> {
    let (filter, params) = scope.filter();
    let sql = format!(
        "SELECT
           fy,
           sector,
           subcode_label,
           worksheet_name,
           sub_code,
           CAST(COUNT(*) AS BIGINT) AS record_count,
           SUM(amount) AS total_amount,
           AVG(amount) AS avg_amount,
           CAST(COUNT(DISTINCT org_name_raw) AS BIGINT) AS num_orgs
         FROM {enriched}
         WHERE {filter}
         GROUP BY 1, 2, 3, 4, 5
         ORDER BY fy, total_amount DESC NULLS LAST",
        enriched = ENRICHED_TABLE,
    );
    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    query_table(conn, &sql, &refs)
}

/// Sum of `total_amount` and `record_count` per fy of a detail table.
pub fn by_year(detail: &Table, total_name: &str) -> Result<Table> {
    let fy = detail.text_column("fy")?;
    let amount = detail.f64_column("total_amount")?;
    let count = detail.f64_column("record_count")?;

    let mut acc: BTreeMap<String, (f64, i64)> = BTreeMap::new();
    for ((fy, a), c) in fy.into_iter().zip(amount).zip(count) {
        let e = acc.entry(fy).or_insert((0.0, 0));
        e.0 += a.unwrap_or(0.0);
        e.1 += c.unwrap_or(0.0) as i64;
    }
    let mut t = Table::new(&["fy", total_name, "record_count"]);
    for (fy, (total, n)) in acc {
        t.push(vec![fy.into(), total.into(), n.into()]);
    }
    Ok(t)
}

/// Total per (fy, sector) of a detail table.
fn by_year_sector(detail: &Table) -> Result<BTreeMap<(String, String), f64>> {
    let fy = detail.text_column("fy")?;
    let sector = detail.text_column("sector")?;
    let amount = detail.f64_column("total_amount")?;
    let mut acc = BTreeMap::new();
    for ((fy, sector), a) in fy.into_iter().zip(sector).zip(amount) {
        *acc.entry((fy, sector)).or_insert(0.0) += a.unwrap_or(0.0);
    }
    Ok(acc)
}

fn year_values(t: &Table, column: &str) -> Result<BTreeMap<String, f64>> {
    let fy = t.text_column("fy")?;
    let v = t.f64_column(column)?;
    Ok(fy.into_iter().zip(v).map(|(f, v)| (f, v.unwrap_or(0.0))).collect())
}

/// One row per year seen in any category; absent categories are 0.
pub fn combined_summary(it: &Table, intangibles: &Table, consultancy: &Table) -> Result<Table> {
    let it = year_values(it, "total_it_spend")?;
    let int = year_values(intangibles, "total_intangibles_value")?;
    let cons = year_values(consultancy, "total_consultancy_spend")?;
    let years: BTreeSet<&String> = it.keys().chain(int.keys()).chain(cons.keys()).collect();

    let mut t = Table::new(&["fy", "it_spend", "intangibles_value", "consultancy_spend"]);
    for fy in years {
        let get = |m: &BTreeMap<String, f64>| Value::Float(m.get(fy).copied().unwrap_or(0.0));
        t.push(vec![fy.as_str().into(), get(&it), get(&int), get(&cons)]);
    }
    Ok(t)
}

fn millions(t: &Table, column: &str) -> Result<Vec<f64>> {
    Ok(t.f64_column(column)?
        .into_iter()
        .map(|v| v.unwrap_or(0.0) / 1e6)
        .collect())
}

fn write_codes(dir: &Path, name: &str, hits: &[CodeHit], what: &str) -> Result<Vec<String>> {
    let codes = distinct_codes(hits);
    info!("{} {} subcodes ({} label rows)", codes.len(), what, hits.len());
    write_rows(&dir.join(name), hits)?;
    Ok(codes)
}

/// Category tables and charts for IT, intangible assets and consultancy spend.
#[instrument(level = "info", skip(conn, cfg))]
pub fn run_it_consultancy(conn: &Connection, cfg: &Config) -> Result<Table> {
    let dir = cfg.paths.report_dir(REPORT_DIR);
    let terms = &cfg.reports.categories;

    // 1) code discovery
    let it_hits = search_codes(conn, &CodeSearch::terms(&terms.it))?;
    let it_codes = write_codes(&dir, "01_it_subcodes_identified.csv", &it_hits, "IT")?;
    let cons_hits = search_codes(conn, &CodeSearch::terms(&terms.consultancy_broad))?;
    let cons_codes =
        write_codes(&dir, "02_consultancy_subcodes_identified.csv", &cons_hits, "consultancy")?;
    let int_hits = search_codes(
        conn,
        &CodeSearch {
            or_worksheet: Some(terms.intangibles_worksheet.as_str()),
            ..CodeSearch::terms(&terms.intangibles)
        },
    )?;
    write_codes(&dir, "03_intangible_subcodes_identified.csv", &int_hits, "intangible")?;

    // 2) IT
    let it_detail = spend_detail(conn, &Scope::Codes(it_codes.clone()))?;
    it_detail.write_csv(&dir.join("04_it_spending_detail.csv"))?;
    let it_year = by_year(&it_detail, "total_it_spend")?;
    it_year.write_csv(&dir.join("05_it_spending_by_year.csv"))?;
    if it_codes.is_empty() {
        warn!("no IT subcodes found");
    } else if !it_year.is_empty() {
        let years = it_year.text_column("fy")?;
        chart::line_chart(
            &dir.join("05_it_spending_trends.svg"),
            "Total IT spending over time",
            &years,
            &[("IT".into(), millions(&it_year, "total_it_spend")?.into_iter().map(Some).collect())],
            "IT spend (£ millions)",
        )?;
        let by_sector = by_year_sector(&it_detail)?;
        let sectors: BTreeSet<&String> = by_sector.keys().map(|(_, s)| s).collect();
        let series: Vec<(String, Vec<Option<f64>>)> = sectors
            .into_iter()
            .map(|s| {
                let values = years
                    .iter()
                    .map(|fy| by_sector.get(&(fy.clone(), s.clone())).map(|v| v / 1e6))
                    .collect();
                (s.clone(), values)
            })
            .collect();
        chart::line_chart(
            &dir.join("05_it_spending_by_sector.svg"),
            "IT spending by sector",
            &years,
            &series,
            "IT spend (£ millions)",
        )?;
    }

    // 3) intangible assets
    let int_detail = spend_detail(conn, &Scope::Worksheet(terms.intangibles_worksheet.clone()))?;
    int_detail.write_csv(&dir.join("06_intangibles_detail.csv"))?;
    let int_year = by_year(&int_detail, "total_intangibles_value")?;
    int_year.write_csv(&dir.join("07_intangibles_by_year.csv"))?;
    if !int_year.is_empty() {
        chart::bar_chart(
            &dir.join("07_intangibles_values.svg"),
            "Intangible assets by year",
            &int_year.text_column("fy")?,
            &millions(&int_year, "total_intangibles_value")?,
            "Value (£ millions)",
        )?;
    }

    // 4) consultancy
    let cons_detail = spend_detail(conn, &Scope::Codes(cons_codes.clone()))?;
    cons_detail.write_csv(&dir.join("08_consultancy_detail.csv"))?;
    let cons_year = by_year(&cons_detail, "total_consultancy_spend")?;
    cons_year.write_csv(&dir.join("09_consultancy_by_year.csv"))?;
    if cons_codes.is_empty() {
        warn!("no consultancy subcodes found");
    } else if !cons_year.is_empty() {
        chart::line_chart(
            &dir.join("09_consultancy_trends.svg"),
            "Consultancy spending over time",
            &cons_year.text_column("fy")?,
            &[(
                "Consultancy".into(),
                millions(&cons_year, "total_consultancy_spend")?.into_iter().map(Some).collect(),
            )],
            "Consultancy spend (£ millions)",
        )?;
    }

    // 5) combined
    let summary = combined_summary(&it_year, &int_year, &cons_year)?;
    summary.write_csv(&dir.join("10_combined_summary.csv"))?;
    if !summary.is_empty() {
        chart::grouped_bar_chart(
            &dir.join("10_combined_summary.svg"),
            "IT & consultancy spending summary",
            &summary.text_column("fy")?,
            &[
                ("IT spend".into(), millions(&summary, "it_spend")?),
                ("Intangibles value".into(), millions(&summary, "intangibles_value")?),
                ("Consultancy spend".into(), millions(&summary, "consultancy_spend")?),
            ],
            "Amount (£ millions)",
        )?;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enriched(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE fact_tru_tac_enriched(
               org_name_raw VARCHAR, sector VARCHAR, fy VARCHAR, worksheet_name VARCHAR,
               ws_key VARCHAR, sub_code VARCHAR, subcode_label VARCHAR, amount DOUBLE);
             INSERT INTO fact_tru_tac_enriched VALUES
               ('Alpha', 'Trust', '2021-22', 'TAC09 Op Exp', 'tac09opexp', 'EXP0390', 'Consultancy services', 10.0),
               ('Beta',  'Trust', '2021-22', 'TAC09 Op Exp', 'tac09opexp', 'EXP0390', 'Consultancy services', 30.0),
               ('Alpha', 'Trust', '2022-23', 'TAC09 Op Exp', 'tac09opexp', 'EXP0390', 'Consultancy services', 5.0),
               ('Alpha', 'FT',    '2022-23', 'TAC13 Intangibles', 'tac13intangibles', 'INT0100', 'Software licences', 7.0);",
        )?;
        Ok(())
    }

    #[test]
    fn detail_and_yearly_totals() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        enriched(&conn)?;

        let detail = spend_detail(&conn, &Scope::Codes(vec!["EXP0390".into()]))?;
        assert_eq!(detail.len(), 2);
        assert_eq!(detail.f64_column("total_amount")?[0], Some(40.0));
        assert_eq!(detail.f64_column("avg_amount")?[0], Some(20.0));
        assert_eq!(detail.text_column("num_orgs")?[0], "2");

        let years = by_year(&detail, "total_consultancy_spend")?;
        assert_eq!(years.columns, vec!["fy", "total_consultancy_spend", "record_count"]);
        assert_eq!(years.text_column("record_count")?, vec!["2", "1"]);

        let int = spend_detail(&conn, &Scope::Worksheet("TAC13 Intangibles".into()))?;
        assert_eq!(int.len(), 1);
        assert!(spend_detail(&conn, &Scope::Codes(Vec::new()))?.is_empty());
        Ok(())
    }

    #[test]
    fn combined_summary_unions_years() -> Result<()> {
        let mut it = Table::new(&["fy", "total_it_spend", "record_count"]);
        it.push(vec!["2022-23".into(), 1.0.into(), 1i64.into()]);
        let mut cons = Table::new(&["fy", "total_consultancy_spend", "record_count"]);
        cons.push(vec!["2021-22".into(), 2.0.into(), 1i64.into()]);
        let int = Table::new(&["fy", "total_intangibles_value", "record_count"]);

        let s = combined_summary(&it, &int, &cons)?;
        assert_eq!(s.text_column("fy")?, vec!["2021-22", "2022-23"]);
        assert_eq!(s.f64_column("it_spend")?, vec![Some(0.0), Some(1.0)]);
        assert_eq!(s.f64_column("consultancy_spend")?, vec![Some(2.0), Some(0.0)]);
        Ok(())
    }
}
