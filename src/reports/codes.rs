// src/reports/codes.rs

use anyhow::Result;
use duckdb::{Connection, ToSql};
use serde::Serialize;

use crate::enrich::ws_key_sql;
use crate::ingest::norm_key;

/// A subcode whose label matched a search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeHit {
    pub sub_code: String,
    pub subcode_label: String,
    pub worksheet_name: String,
    pub ws_key: String,
    pub years_present: i64,
}

/// Label search over `dim_tac_subcodes_ws`.
#[derive(Debug, Clone, Default)]
pub struct CodeSearch<'a> {
    /// Case-insensitive substrings of the label.
    pub terms: &'a [String],
    /// Only codes on this worksheet (compared by normalized key).
    pub worksheet: Option<&'a str>,
    /// Also every code on this worksheet, whatever its label.
    pub or_worksheet: Option<&'a str>,
    pub limit: Option<usize>,
}

impl<'a> CodeSearch<'a> {
    pub fn terms(terms: &'a [String]) -> Self {
        Self {
            terms,
            ..Default::default()
        }
    }
}

/// Distinct (code, label, worksheet) triples for a search, with the number of
/// financial years each appears in.
pub fn search_codes(conn: &Connection, search: &CodeSearch<'_>) -> Result<Vec<CodeHit>> {
    let mut params: Vec<String> = Vec::new();
    let mut matches: Vec<String> = Vec::new();
    for term in search.terms {
        matches.push("lower(subcode_label) LIKE ?".into());
        params.push(format!("%{}%", term.to_lowercase()));
    }
    if let Some(ws) = search.or_worksheet {
        matches.push("ws_key = ?".into());
        params.push(norm_key(ws));
    }
    if matches.is_empty() {
        return Ok(Vec::new());
    }

    let mut filter = format!("({})", matches.join(" OR "));
    if let Some(ws) = search.worksheet {
        filter.push_str(" AND ws_key = ?");
        params.push(norm_key(ws));
    }
    let limit = search
        .limit
        .map(|n| format!("LIMIT {}", n))
        .unwrap_or_default();

    let sql = format!(
        "SELECT
           sub_code,
           coalesce(subcode_label, '') AS subcode_label,
           worksheet_name,
           {ws} AS ws_key,
           CAST(COUNT(DISTINCT fy) AS BIGINT) AS years_present
         FROM dim_tac_subcodes_ws
         WHERE sub_code IS NOT NULL AND {filter}
         GROUP BY 1, 2, 3, 4
         ORDER BY sub_code, worksheet_name, subcode_label
         {limit}",
        ws = ws_key_sql("worksheet_name"),
    );
    let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(refs.as_slice(), |r| {
        Ok(CodeHit {
            sub_code: r.get(0)?,
            subcode_label: r.get(1)?,
            worksheet_name: r.get(2)?,
            ws_key: r.get(3)?,
            years_present: r.get(4)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Distinct subcodes of a hit list, sorted.
pub fn distinct_codes(hits: &[CodeHit]) -> Vec<String> {
    let mut codes: Vec<String> = hits.iter().map(|h| h.sub_code.clone()).collect();
    codes.sort();
    codes.dedup();
    codes
}

/// `?, ?, ?` for an `IN (...)` list of `n` bound values.
pub fn placeholders(n: usize) -> String {
    vec!["?"; n.max(1)].join(", ")
}
