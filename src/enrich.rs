// src/enrich.rs

use anyhow::{bail, Result};
use duckdb::Connection;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::output::{Table, Value};
use crate::store::{count_rows, duck::param_refs, query_table, sql_path, ENRICHED_TABLE};

/// SQL rendering of `norm_key` for a column expression.
pub fn ws_key_sql(expr: &str) -> String {
    format!("regexp_replace(lower({}), '[^a-z0-9]+', '', 'g')", expr)
}

/// Materialise `dim_provider` from the hand-kept CSV, or derive a placeholder
/// from the fact table when the CSV does not exist yet.
pub fn load_provider_dim(conn: &Connection, cfg: &Config) -> Result<()> {
    let path = cfg.paths.provider_dim();
    let sql = if path.exists() {
        format!(
            "CREATE OR REPLACE TABLE dim_provider AS
             SELECT DISTINCT ON (sector, org_name_raw)
               sector, org_name_raw, provider_id, org_name_canonical
             FROM read_csv({}, header = true, all_varchar = true)
             ORDER BY sector, org_name_raw;",
            sql_path(&path)
        )
    } else {
        warn!(
            "{} not found; provider ids will be empty (seed it from {})",
            path.display(),
            cfg.paths.provider_seed().display()
        );
        "CREATE OR REPLACE TABLE dim_provider AS
         SELECT DISTINCT
           sector,
           org_name_raw,
           CAST(NULL AS VARCHAR) AS provider_id,
           org_name_raw AS org_name_canonical
         FROM fact_tru_tac;"
            .to_string()
    };
    conn.execute_batch(&sql)?;
    Ok(())
}

/// Materialise `dim_tac_subcodes_ws`: the subcode dimension keyed by normalized worksheet.
pub fn load_subcode_dim(conn: &Connection, cfg: &Config) -> Result<()> {
    let path = cfg.paths.subcode_dim();
    if !path.exists() {
        bail!(
            "{} not found; run `build-subcodes` first",
            path.display()
        );
    }
    let sql = format!(
        "CREATE OR REPLACE TABLE dim_tac_subcodes_ws AS
         SELECT DISTINCT ON (fy, ws_key, sub_code) *
         FROM (
           SELECT
             fy,
             worksheet_name,
             {ws_key} AS ws_key,
             sub_code,
             subcode_label,
             table_id,
             source_file AS mapping_source_file
           FROM read_csv({path}, header = true, all_varchar = true)
         )
         ORDER BY fy, ws_key, sub_code;",
        ws_key = ws_key_sql("worksheet_name"),
        path = sql_path(&path)
    );
    conn.execute_batch(&sql)?;
    Ok(())
}

/// Join the fact table to provider and subcode labels. Requires both dimensions loaded.
pub fn create_enriched_table(conn: &Connection) -> Result<i64> {
    let sql = format!(
        "CREATE OR REPLACE TABLE {enriched} AS
         SELECT
           f.*,
           p.provider_id,
           p.org_name_canonical,
           m.subcode_label,
           m.mapping_source_file,
           CASE WHEN m.subcode_label IS NULL THEN 1 ELSE 0 END AS is_unmapped
         FROM (
           SELECT *, {ws_key} AS ws_key FROM fact_tru_tac
         ) f
         LEFT JOIN dim_provider p
           ON f.sector = p.sector
          AND f.org_name_raw = p.org_name_raw
         LEFT JOIN dim_tac_subcodes_ws m
           ON f.fy = m.fy
          AND f.ws_key = m.ws_key
          AND f.sub_code = m.sub_code;",
        enriched = ENRICHED_TABLE,
        ws_key = ws_key_sql("worksheet_name")
    );
    conn.execute_batch(&sql)?;
    count_rows(conn, ENRICHED_TABLE)
}

const MAPPING_QC_SQL: &str = "
SELECT
  fy,
  sector,
  CAST(SUM(is_unmapped) AS BIGINT) AS unmapped_rows,
  CAST(COUNT(*) AS BIGINT) AS total_rows,
  SUM(ABS(amount)) AS abs_total,
  SUM(CASE WHEN is_unmapped = 1 THEN ABS(amount) ELSE 0 END) AS abs_unmapped,
  SUM(CASE WHEN is_unmapped = 1 THEN ABS(amount) ELSE 0 END)
    / NULLIF(SUM(ABS(amount)), 0) AS share_abs_unmapped
FROM fact_tru_tac_enriched
GROUP BY 1, 2
ORDER BY 1, 2";

/// Unmapped share per (fy, sector).
pub fn mapping_qc(conn: &Connection) -> Result<Table> {
    query_table(conn, MAPPING_QC_SQL, &[])
}

/// Rebuild the enriched table and write `outputs/mapping_qc.csv`.
#[instrument(level = "info", skip(conn, cfg))]
pub fn enrich(conn: &Connection, cfg: &Config) -> Result<Table> {
    load_provider_dim(conn, cfg)?;
    load_subcode_dim(conn, cfg)?;
    let n = create_enriched_table(conn)?;
    info!("{}: {} rows", ENRICHED_TABLE, n);

    let qc = mapping_qc(conn)?;
    let (fy_i, sector_i) = (qc.column_index("fy")?, qc.column_index("sector")?);
    let unmapped = qc.column_index("unmapped_rows")?;
    let total = qc.column_index("total_rows")?;
    let share = qc.column_index("share_abs_unmapped")?;
    for row in &qc.rows {
        info!(
            "{} {:<5} unmapped {}/{} rows, {} of abs amount",
            row[fy_i].render(),
            row[sector_i].render(),
            row[unmapped].render(),
            row[total].render(),
            row[share]
                .as_f64()
                .map(|s| format!("{:.1}%", s * 100.0))
                .unwrap_or_else(|| "n/a".into())
        );
    }
    qc.write_csv(&cfg.paths.outputs_dir.join("mapping_qc.csv"))?;
    Ok(qc)
}

/// Largest unmapped (fy, sector, worksheet, table, subcode) groups by absolute amount.
pub fn unmapped_report(conn: &Connection, years: &[String], limit: usize) -> Result<Table> {
    let placeholders = vec!["?"; years.len().max(1)].join(", ");
    let sql = format!(
        "SELECT
           fy,
           sector,
           worksheet_name,
           table_id,
           sub_code,
           CAST(COUNT(*) AS BIGINT) AS rows,
           SUM(ABS(amount)) AS abs_amount
         FROM fact_tru_tac_enriched
         WHERE is_unmapped = 1
           AND fy IN ({})
         GROUP BY 1, 2, 3, 4, 5
         ORDER BY abs_amount DESC NULLS LAST
         LIMIT {}",
        placeholders, limit
    );
    let mut bound = years.to_vec();
    if bound.is_empty() {
        bound.push(String::new());
    }
    query_table(conn, &sql, &param_refs(&bound))
}

pub fn write_unmapped_report(conn: &Connection, cfg: &Config) -> Result<Table> {
    let t = unmapped_report(
        conn,
        &cfg.reports.unmapped_years,
        cfg.reports.unmapped_limit,
    )?;
    t.write_csv(
        &cfg.paths
            .outputs_dir
            .join("top_unmapped_subcodes_by_abs_amount.csv"),
    )?;
    Ok(t)
}

/// Join-key strategies compared by `join_diagnostics`: (name, key columns).
pub const JOIN_STRATEGIES: [(&str, &[&str]); 4] = [
    ("fy+sub_code", &["fy", "sub_code"]),
    ("fy+table_id+sub_code", &["fy", "table_id", "sub_code"]),
    (
        "fy+worksheet_name+table_id+sub_code",
        &["fy", "worksheet_name", "table_id", "sub_code"],
    ),
    ("fy+ws_key+sub_code", &["fy", "ws_key", "sub_code"]),
];

/// Unmatched fact rows per (fy, sector) for each candidate join key.
///
/// The dimension is reduced to distinct keys first so a key shared by several
/// worksheets does not multiply fact rows.
pub fn join_diagnostics(conn: &Connection) -> Result<Table> {
    let mut out = Table::new(&["strategy", "fy", "sector", "fact_rows", "unmatched_rows"]);
    for (name, keys) in JOIN_STRATEGIES {
        let key_list = keys.join(", ");
        let on = keys
            .iter()
            .map(|k| format!("f.{k} = d.{k}"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT
               f.fy,
               f.sector,
               CAST(COUNT(*) AS BIGINT) AS fact_rows,
               CAST(SUM(CASE WHEN d.matched IS NULL THEN 1 ELSE 0 END) AS BIGINT) AS unmatched_rows
             FROM (SELECT *, {ws} AS ws_key FROM fact_tru_tac) f
             LEFT JOIN (
               SELECT DISTINCT {key_list}, 1 AS matched FROM dim_tac_subcodes_ws
             ) d ON {on}
             GROUP BY 1, 2
             ORDER BY 1, 2",
            ws = ws_key_sql("worksheet_name"),
        );
        let t = query_table(conn, &sql, &[])?;
        for row in t.rows {
            let mut r: Vec<Value> = vec![Value::from(name)];
            r.extend(row);
            out.push(r);
        }
    }
    Ok(out)
}

pub fn write_join_diagnostics(conn: &Connection, cfg: &Config) -> Result<Table> {
    load_subcode_dim(conn, cfg)?;
    let t = join_diagnostics(conn)?;
    t.write_csv(&cfg.paths.outputs_dir.join("join_key_diagnostics.csv"))?;
    Ok(t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FactRecord;
    use crate::store::{create_fact_table, insert_facts, open_mem_db};
    use std::fs;

    fn fact(org: &str, ws: &str, sub: &str, amount: f64) -> FactRecord {
        FactRecord {
            org_name_raw: org.into(),
            sector: "Trust".into(),
            fy: "2022-23".into(),
            worksheet_name: Some(ws.into()),
            table_id: Some("1".into()),
            main_code: Some("A02CY01".into()),
            sub_code: Some(sub.into()),
            row_number: Some(10),
            amount: Some(amount),
            source_file: "TAC_Trusts_2022-23.xlsx".into(),
            schema_version: "2022-23".into(),
        }
    }

    fn setup() -> Result<(tempfile::TempDir, Config, Connection)> {
        let dir = tempfile::tempdir()?;
        let mut cfg = Config::default();
        cfg.paths.mappings_dir = dir.path().join("mappings");
        cfg.paths.outputs_dir = dir.path().join("outputs");
        fs::create_dir_all(&cfg.paths.mappings_dir)?;
        fs::write(
            cfg.paths.subcode_dim(),
            "fy,worksheet_name,sub_code,subcode_label,table_id,source_file\n\
             2022-23,TAC02 - SoCI,SOC0100,Operating income from patient care,1,ill.xlsx\n",
        )?;

        let conn = open_mem_db()?;
        create_fact_table(&conn)?;
        insert_facts(
            &conn,
            &[
                fact("Alpha NHS Trust", "TAC02 SoCI", "SOC0100", 300.0),
                fact("Alpha NHS Trust", "TAC02 SoCI", "SOC0999", -100.0),
            ],
        )?;
        Ok((dir, cfg, conn))
    }

    #[test]
    fn enrich_matches_on_normalized_worksheet() -> Result<()> {
        let (_dir, cfg, conn) = setup()?;
        let qc = enrich(&conn, &cfg)?;
        assert_eq!(qc.len(), 1);
        let row = &qc.rows[0];
        assert_eq!(row[qc.column_index("unmapped_rows")?], Value::Int(1));
        assert_eq!(row[qc.column_index("total_rows")?], Value::Int(2));
        assert_eq!(row[qc.column_index("share_abs_unmapped")?], Value::Float(0.25));

        let labelled = query_table(
            &conn,
            "SELECT subcode_label, org_name_canonical, provider_id FROM fact_tru_tac_enriched
             WHERE sub_code = 'SOC0100'",
            &[],
        )?;
        assert_eq!(
            labelled.rows[0],
            vec![
                Value::from("Operating income from patient care"),
                Value::from("Alpha NHS Trust"),
                Value::Null
            ]
        );
        assert!(cfg.paths.outputs_dir.join("mapping_qc.csv").exists());

        let unmapped = unmapped_report(&conn, &cfg.reports.unmapped_years, 10)?;
        assert_eq!(unmapped.len(), 1);
        assert_eq!(unmapped.rows[0][4], Value::from("SOC0999"));
        Ok(())
    }

    #[test]
    fn diagnostics_cover_every_strategy() -> Result<()> {
        let (_dir, cfg, conn) = setup()?;
        let t = write_join_diagnostics(&conn, &cfg)?;
        assert_eq!(t.len(), JOIN_STRATEGIES.len());
        let unmatched: Vec<i64> = t
            .rows
            .iter()
            .map(|r| r[4].as_f64().unwrap_or(-1.0) as i64)
            .collect();
        // exact worksheet names differ ("TAC02 - SoCI" vs "TAC02 SoCI")
        assert_eq!(unmatched, vec![1, 1, 2, 1]);
        Ok(())
    }
}
