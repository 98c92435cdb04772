// src/store/parquet.rs

use anyhow::{Context, Result};
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    basic::Compression,
    file::{
        properties::WriterProperties,
        reader::{FileReader, SerializedFileReader},
    },
};
use std::{
    fs::{self, File},
    io::BufWriter,
    path::Path,
};
use tracing::debug;

use crate::schema::{fact_arrow_schema, from_record_batch, to_record_batch, FactRecord};

/// Rows per Arrow batch handed to the writer.
const BATCH_ROWS: usize = 64 * 1024;

/// Write the fact rows to `path` via a `.tmp` sibling and an atomic rename.
/// Returns the number of rows written.
pub fn write_fact_parquet(path: &Path, records: &[FactRecord]) -> Result<usize> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("parquet.tmp");

    // 1) writer on the tmp file
    let tmp_file = File::create(&tmp_path)
        .with_context(|| format!("could not create temporary file `{}`", tmp_path.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(BufWriter::new(tmp_file), fact_arrow_schema(), Some(props))
        .context("initializing Parquet writer")?;

    // 2) batches
    for chunk in records.chunks(BATCH_ROWS) {
        let batch = to_record_batch(chunk)?;
        writer.write(&batch).context("writing batch to Parquet")?;
    }
    writer.close().context("closing Parquet writer")?;

    // 3) publish
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "failed to rename `{}` to `{}`",
            tmp_path.display(),
            path.display()
        )
    })?;
    debug!(rows = records.len(), path = %path.display(), "wrote fact parquet");
    Ok(records.len())
}

/// Read every fact row back from a Parquet file.
pub fn read_fact_parquet(path: &Path) -> Result<Vec<FactRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading Parquet metadata of {}", path.display()))?
        .build()?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch.context("decoding Parquet batch")?;
        out.extend(from_record_batch(&batch)?);
    }
    Ok(out)
}

/// Row count from the file footer, without decoding any data pages.
pub fn parquet_row_count(path: &Path) -> Result<i64> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = SerializedFileReader::new(file)
        .with_context(|| format!("reading Parquet footer of {}", path.display()))?;
    Ok(reader.metadata().file_metadata().num_rows())
}
