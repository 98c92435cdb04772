// src/reports/top_lines.rs

use anyhow::{bail, Result};
use duckdb::Connection;
use std::path::PathBuf;
use tracing::{info, instrument};

use crate::config::Config;
use crate::output::Table;
use crate::store::{query_table, FACT_TABLE};

/// Latest financial year present in the fact table.
pub fn latest_fy(conn: &Connection) -> Result<Option<String>> {
    let fy: Option<String> =
        conn.query_row(&format!("SELECT max(fy) FROM {}", FACT_TABLE), [], |r| r.get(0))?;
    Ok(fy)
}

/// The `limit` largest lines per sector by absolute amount in `fy`.
pub fn top_lines(conn: &Connection, fy: &str, limit: usize) -> Result<Table> {
    let sql = format!(
        "WITH agg AS (
           SELECT fy, sector, table_id, main_code, sub_code, row_number,
                  SUM(ABS(amount)) AS abs_amount
           FROM {fact}
           WHERE fy = ?
           GROUP BY 1, 2, 3, 4, 5, 6
         ),
         ranked AS (
           SELECT *,
                  ROW_NUMBER() OVER (
                    PARTITION BY sector
                    ORDER BY abs_amount DESC NULLS LAST, table_id, sub_code, row_number
                  ) AS rn
           FROM agg
         )
         SELECT fy, sector, table_id, main_code, sub_code, row_number, abs_amount,
                CAST(rn AS BIGINT) AS rn
         FROM ranked
         WHERE rn <= {limit}
         ORDER BY sector, rn",
        fact = FACT_TABLE,
    );
    query_table(conn, &sql, &[&fy])
}

/// Where the top-lines report for (`limit`, `fy`) is written.
pub fn top_lines_path(cfg: &Config, limit: usize, fy: &str) -> PathBuf {
    cfg.paths
        .outputs_dir
        .join(format!("top_{}_lines_{}.csv", limit, fy))
}

/// Write `outputs/top_<N>_lines_<fy>.csv`. Returns the file written.
#[instrument(level = "info", skip(conn, cfg))]
pub fn write_top_lines(
    conn: &Connection,
    cfg: &Config,
    fy: Option<&str>,
    limit: Option<usize>,
) -> Result<PathBuf> {
    let limit = limit.unwrap_or(cfg.reports.top_lines_per_sector);
    let fy = match fy.map(str::to_string).or_else(|| cfg.reports.top_lines_fy.clone()) {
        Some(fy) => fy,
        None => match latest_fy(conn)? {
            Some(fy) => fy,
            None => bail!("{} is empty; nothing to rank", FACT_TABLE),
        },
    };
    let table = top_lines(conn, &fy, limit)?;
    if table.is_empty() {
        bail!("no fact rows for fy {}", fy);
    }
    let path = top_lines_path(cfg, limit, &fy);
    table.write_csv(&path)?;
    info!("top {} lines per sector for {}", limit, fy);
    Ok(path)
}
