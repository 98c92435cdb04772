// src/canonical.rs

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, io::Write, path::Path};
use tracing::{info, instrument};

use crate::config::Config;
use crate::ingest::{extract_tac_workbook, list_workbooks, parse_tac_filename};
use crate::schema::FactRecord;
use crate::store::{self, FACT_TABLE};

/// Per (fy, sector) quality summary of an extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcRow {
    pub fy: String,
    pub sector: String,
    pub rows: usize,
    pub amount_non_null: usize,
    pub amount_sum: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSummary {
    pub file: String,
    pub sector: String,
    pub fy: String,
    pub rows: usize,
}

/// Written next to the Parquet file after every successful build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildManifest {
    pub built_at: DateTime<Utc>,
    pub parquet: String,
    pub duckdb: String,
    pub total_rows: usize,
    pub sources: Vec<SourceSummary>,
    pub qc: Vec<QcRow>,
}

pub fn qc_summary(records: &[FactRecord]) -> Vec<QcRow> {
    let mut by_key: BTreeMap<(String, String), QcRow> = BTreeMap::new();
    for r in records {
        let e = by_key
            .entry((r.fy.clone(), r.sector.clone()))
            .or_insert_with(|| QcRow {
                fy: r.fy.clone(),
                sector: r.sector.clone(),
                rows: 0,
                amount_non_null: 0,
                amount_sum: 0.0,
            });
        e.rows += 1;
        if let Some(a) = r.amount {
            e.amount_non_null += 1;
            e.amount_sum += a;
        }
    }
    by_key.into_values().collect()
}

/// Extract every raw TAC workbook and persist the combined fact table as
/// Parquet plus a DuckDB table.
#[instrument(level = "info", skip(cfg))]
pub fn build_canonical(cfg: &Config) -> Result<BuildManifest> {
    let paths = &cfg.paths;

    // 1) discover
    let files = list_workbooks(&paths.raw_dir, "TAC_*.xlsx")?;
    if files.is_empty() {
        bail!("No TAC_*.xlsx files found in {}", paths.raw_dir.display());
    }
    let mut sources = Vec::with_capacity(files.len());
    for f in &files {
        let file = f
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let (sector, fy) = parse_tac_filename(&file)?;
        sources.push(SourceSummary {
            file,
            sector: sector.to_string(),
            fy,
            rows: 0,
        });
    }
    info!("found {} raw workbooks", files.len());

    // 2) extract in parallel; collect keeps filename order
    let per_file: Vec<Vec<FactRecord>> = files
        .par_iter()
        .map(|path| extract_tac_workbook(path, &cfg.ingest))
        .collect::<Result<Vec<_>>>()?;

    for (src, rows) in sources.iter_mut().zip(&per_file) {
        src.rows = rows.len();
    }

    // 3) concatenate
    let records: Vec<FactRecord> = per_file.into_iter().flatten().collect();

    // 4) QC
    let qc = qc_summary(&records);
    for q in &qc {
        info!(
            "QC {} {:<5} rows={} amount_non_null={} amount_sum={:.0}",
            q.fy, q.sector, q.rows, q.amount_non_null, q.amount_sum
        );
    }

    // 5) Parquet, verified from the footer
    let parquet = paths.fact_parquet();
    store::write_fact_parquet(&parquet, &records)?;
    let written = store::parquet_row_count(&parquet)?;
    if written as usize != records.len() {
        bail!(
            "{} holds {} rows but {} were extracted",
            parquet.display(),
            written,
            records.len()
        );
    }
    info!("Wrote: {} ({} rows)", parquet.display(), written);

    // 6) DuckDB
    let db_path = paths.duckdb();
    let conn = store::open_db(&db_path)?;
    let loaded = store::load_fact_from_parquet(&conn, &parquet)?;
    info!("DuckDB: {} table {} ({} rows)", db_path.display(), FACT_TABLE, loaded);

    let manifest = BuildManifest {
        built_at: Utc::now(),
        parquet: parquet.display().to_string(),
        duckdb: db_path.display().to_string(),
        total_rows: records.len(),
        sources,
        qc,
    };
    write_manifest(&paths.build_manifest(), &manifest)?;
    Ok(manifest)
}

fn write_manifest(path: &Path, manifest: &BuildManifest) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let mut tmp = fs::File::create(&tmp_path)
        .with_context(|| format!("creating {}", tmp_path.display()))?;
    serde_json::to_writer_pretty(&mut tmp, manifest).context("serializing build manifest")?;
    tmp.write_all(b"\n")?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {} -> {}", tmp_path.display(), path.display()))?;
    Ok(())
}
