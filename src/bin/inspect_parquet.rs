use anyhow::{Context, Result};
use clap::Parser;
use nhstac::{canonical::qc_summary, store::read_fact_parquet};
use parquet::file::metadata::RowGroupMetaData;
use parquet::file::reader::{FileReader, SerializedFileReader};
use std::{fs::File, path::PathBuf};

/// Print the layout of a fact Parquet file and its first rows.
#[derive(Parser, Debug)]
#[command(name = "inspect_parquet")]
struct Args {
    /// Parquet file, usually Data/canonical/fact_tru_tac.parquet
    file: PathBuf,
    /// Number of fact rows to print
    #[arg(default_value_t = 10)]
    rows: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // 1) footer metadata
    let file = File::open(&args.file).with_context(|| format!("opening {}", args.file.display()))?;
    let reader = SerializedFileReader::new(file)?;
    let meta = reader.metadata();
    let file_meta = meta.file_metadata();
    let size = std::fs::metadata(&args.file)?.len();

    println!("=== {} ===", args.file.display());
    println!("Created by:   {}", file_meta.created_by().unwrap_or("<unknown>"));
    println!("Rows:         {}", file_meta.num_rows());
    println!("Row groups:   {}", meta.num_row_groups());
    println!("Size on disk: {} bytes", size);
    println!();

    // 2) columns
    println!("=== Columns ===");
    for col in file_meta.schema_descr().columns() {
        let logical = col
            .logical_type()
            .map_or("<none>".to_string(), |lt| format!("{:?}", lt));
        println!(
            "- {:<16} | {:<10} | {:<12} | nullable: {}",
            col.name(),
            format!("{:?}", col.physical_type()),
            logical,
            col.self_type().is_optional()
        );
    }
    println!();

    // 3) row groups
    for i in 0..meta.num_row_groups() {
        print_row_group(i, meta.row_group(i));
    }

    // 4) sample records and per-year totals
    let records = read_fact_parquet(&args.file)?;
    println!("=== First {} of {} records ===", args.rows.min(records.len()), records.len());
    for r in records.iter().take(args.rows) {
        println!(
            "{} | {:<5} | {} | {} | {} | {} | {}",
            r.fy,
            r.sector,
            r.org_name_raw,
            r.worksheet_name.as_deref().unwrap_or(""),
            r.sub_code.as_deref().unwrap_or(""),
            r.row_number.map(|n| n.to_string()).unwrap_or_default(),
            r.amount.map(|a| a.to_string()).unwrap_or_default()
        );
    }
    println!();

    println!("=== Rows by year and sector ===");
    for q in qc_summary(&records) {
        println!(
            "{} {:<5} rows={:<8} amount_non_null={:<8} amount_sum={:.0}",
            q.fy, q.sector, q.rows, q.amount_non_null, q.amount_sum
        );
    }
    Ok(())
}

fn print_row_group(idx: usize, rg: &RowGroupMetaData) {
    println!(
        "--- Row group {}: {} rows, {} bytes uncompressed ---",
        idx,
        rg.num_rows(),
        rg.total_byte_size()
    );
    for col in rg.columns() {
        let nulls = col
            .statistics()
            .and_then(|s| s.null_count_opt())
            .map_or("?".to_string(), |n| n.to_string());
        println!(
            "  {:<16} {:?} compressed={} uncompressed={} nulls={}",
            col.column_descr().name(),
            col.compression(),
            col.compressed_size(),
            col.uncompressed_size(),
            nulls
        );
    }
    println!();
}
