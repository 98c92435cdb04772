// src/store/duck.rs

use anyhow::{Context, Result};
use duckdb::{types::Value as DuckValue, Connection, ToSql};
use std::path::Path;
use tracing::debug;

use crate::output::{Table, Value};
use crate::schema::{FactRecord, FACT_TABLE_DDL};

/// Name of the canonical fact table.
pub const FACT_TABLE: &str = "fact_tru_tac";
/// Name of the fact table joined with provider and subcode labels.
pub const ENRICHED_TABLE: &str = "fact_tru_tac_enriched";

/// Open a DuckDB database on disk at `path`, creating the file if it doesn't exist.
pub fn open_db(path: &Path) -> Result<Connection> {
    crate::output::ensure_parent(path)?;
    let conn =
        Connection::open(path).with_context(|| format!("opening DuckDB {}", path.display()))?;
    Ok(conn)
}

/// Open an existing database; a missing file means an earlier step was skipped.
pub fn open_existing_db(path: &Path) -> Result<Connection> {
    if !path.exists() {
        anyhow::bail!(
            "DuckDB file {} not found; run `build-canonical` first",
            path.display()
        );
    }
    open_db(path)
}

/// Open a DuckDB in-memory database
pub fn open_mem_db() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    Ok(conn)
}

/// Single-quoted SQL string literal.
pub fn sql_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// SQL literal for a filesystem path (DuckDB accepts forward slashes everywhere).
pub fn sql_path(p: &Path) -> String {
    sql_quote(&p.to_string_lossy().replace('\\', "/"))
}

/// Prepare the `fact_tru_tac` table in the given connection
pub fn create_fact_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(FACT_TABLE_DDL)?;
    Ok(())
}

/// Insert rows via Appender::append_rows in bulk, using arrays of &dyn ToSql
pub fn insert_facts(conn: &Connection, rows: &[FactRecord]) -> Result<usize> {
    let mut appender = conn.appender(FACT_TABLE)?;
    appender.append_rows(rows.iter().map(|r| {
        [
            &r.org_name_raw as &dyn ToSql,
            &r.sector as &dyn ToSql,
            &r.fy as &dyn ToSql,
            &r.worksheet_name as &dyn ToSql,
            &r.table_id as &dyn ToSql,
            &r.main_code as &dyn ToSql,
            &r.sub_code as &dyn ToSql,
            &r.row_number as &dyn ToSql,
            &r.amount as &dyn ToSql,
            &r.source_file as &dyn ToSql,
            &r.schema_version as &dyn ToSql,
        ]
    }))?;
    appender.flush()?;
    Ok(rows.len())
}

/// Replace `fact_tru_tac` with the contents of the Parquet file. Returns the row count.
pub fn load_fact_from_parquet(conn: &Connection, parquet: &Path) -> Result<i64> {
    let sql = format!(
        "CREATE OR REPLACE TABLE {} AS SELECT * FROM read_parquet({});",
        FACT_TABLE,
        sql_path(parquet)
    );
    conn.execute_batch(&sql)
        .with_context(|| format!("loading {} into DuckDB", parquet.display()))?;
    count_rows(conn, FACT_TABLE)
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {};", table), [], |r| r.get(0))?;
    Ok(n)
}

/// Base tables and views in the main schema, sorted by name.
pub fn list_tables(conn: &Connection) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT table_name, table_type FROM information_schema.tables
         WHERE table_schema = 'main' ORDER BY table_name",
    )?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = ?",
        [name],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

/// `(column_name, data_type)` pairs of a table, in ordinal order.
pub fn describe_table(conn: &Connection, table: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT column_name, data_type FROM information_schema.columns
         WHERE table_name = ? ORDER BY ordinal_position",
    )?;
    let rows = stmt.query_map([table], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn convert(v: DuckValue) -> Value {
    match v {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Int(b as i64),
        DuckValue::TinyInt(i) => Value::Int(i.into()),
        DuckValue::SmallInt(i) => Value::Int(i.into()),
        DuckValue::Int(i) => Value::Int(i.into()),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::HugeInt(i) => Value::Float(i as f64),
        DuckValue::UTinyInt(i) => Value::Int(i.into()),
        DuckValue::USmallInt(i) => Value::Int(i.into()),
        DuckValue::UInt(i) => Value::Int(i.into()),
        DuckValue::UBigInt(i) => Value::Float(i as f64),
        DuckValue::Float(f) => Value::Float(f.into()),
        DuckValue::Double(f) => Value::Float(f),
        DuckValue::Text(s) => Value::Text(s),
        other => Value::Text(format!("{:?}", other)),
    }
}

/// Run `sql` with bound parameters and collect the whole result as a `Table`.
pub fn query_table(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<Table> {
    let mut stmt = conn
        .prepare(sql)
        .with_context(|| format!("preparing query:\n{}", sql))?;
    let mut rows = stmt.query(params)?;
    let columns = rows
        .as_ref()
        .map(|s| s.column_names())
        .unwrap_or_default();

    let mut table = Table::new(&columns);
    while let Some(row) = rows.next()? {
        let mut out = Vec::with_capacity(columns.len());
        for i in 0..columns.len() {
            out.push(convert(row.get::<_, DuckValue>(i)?));
        }
        table.push(out);
    }
    debug!(rows = table.len(), "query returned");
    Ok(table)
}

/// Owned parameter list, for queries whose parameter count depends on input.
pub fn param_refs(values: &[String]) -> Vec<&dyn ToSql> {
    values.iter().map(|v| v as &dyn ToSql).collect()
}
