//! Persistence of the fact table: a Parquet file plus an embedded DuckDB
//! database that every downstream command queries.

pub mod duck;
pub mod parquet;

pub use duck::{
    count_rows, create_fact_table, describe_table, insert_facts, list_tables, load_fact_from_parquet, open_db,
    open_existing_db, open_mem_db, param_refs, query_table, sql_path, sql_quote, table_exists,
    ENRICHED_TABLE, FACT_TABLE,
};
pub use self::parquet::{parquet_row_count, read_fact_parquet, write_fact_parquet};
