// src/mapping/provider.rs

use anyhow::Result;
use duckdb::Connection;
use std::path::Path;

use crate::output::Table;
use crate::store::query_table;

const PROVIDER_SEED_SQL: &str = "
SELECT
  sector,
  org_name_raw,
  MIN(fy) AS first_fy_seen,
  MAX(fy) AS last_fy_seen,
  CAST(COUNT(*) AS BIGINT) AS rows
FROM fact_tru_tac
GROUP BY 1, 2
ORDER BY sector, org_name_raw";

/// One row per (sector, organisation) seen in the fact table, with the years it appears.
pub fn provider_seed(conn: &Connection) -> Result<Table> {
    query_table(conn, PROVIDER_SEED_SQL, &[])
}

/// Write `dim_provider_seed.csv`, the starting point for the hand-kept provider dimension.
pub fn build_provider_seed(conn: &Connection, out: &Path) -> Result<Table> {
    let seed = provider_seed(conn)?;
    seed.write_csv(out)?;
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Value;
    use crate::schema::FactRecord;
    use crate::store::{create_fact_table, insert_facts, open_mem_db};

    fn fact(org: &str, fy: &str) -> FactRecord {
        FactRecord {
            org_name_raw: org.into(),
            sector: "FT".into(),
            fy: fy.into(),
            worksheet_name: None,
            table_id: None,
            main_code: None,
            sub_code: None,
            row_number: None,
            amount: Some(1.0),
            source_file: format!("TAC_FTs_{}.xlsx", fy),
            schema_version: fy.into(),
        }
    }

    #[test]
    fn seed_spans_first_and_last_year() -> Result<()> {
        let conn = open_mem_db()?;
        create_fact_table(&conn)?;
        insert_facts(
            &conn,
            &[
                fact("Beta NHS FT", "2022-23"),
                fact("Alpha NHS FT", "2023-24"),
                fact("Alpha NHS FT", "2020-21"),
            ],
        )?;
        let seed = provider_seed(&conn)?;
        assert_eq!(
            seed.columns,
            vec!["sector", "org_name_raw", "first_fy_seen", "last_fy_seen", "rows"]
        );
        assert_eq!(
            seed.rows[0],
            vec![
                Value::from("FT"),
                Value::from("Alpha NHS FT"),
                Value::from("2020-21"),
                Value::from("2023-24"),
                Value::Int(2),
            ]
        );
        assert_eq!(seed.len(), 2);
        Ok(())
    }
}
