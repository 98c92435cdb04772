use anyhow::Result;
use clap::Parser;
use nhstac::{
    config::Config,
    store::{count_rows, describe_table, list_tables, open_existing_db},
};
use std::path::PathBuf;

/// List the tables of the analysis database with row counts and columns.
#[derive(Parser, Debug)]
#[command(name = "explore_db")]
struct Args {
    /// DuckDB file; defaults to the configured tru_tac.duckdb
    db: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let path = match args.db {
        Some(p) => p,
        None => Config::load(None)?.paths.duckdb(),
    };
    let conn = open_existing_db(&path)?;

    println!("=== {} ===", path.display());
    let tables = list_tables(&conn)?;
    if tables.is_empty() {
        println!("(no tables)");
    }
    for (name, kind) in tables {
        let n = count_rows(&conn, &name)?;
        println!();
        println!("{} [{}] {} rows", name, kind, n);
        for (col, ty) in describe_table(&conn, &name)? {
            println!("  - {:<24} {}", col, ty);
        }
    }
    Ok(())
}
