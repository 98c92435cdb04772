// src/schema/fact.rs

use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{Array, ArrayRef, Float64Array, Int64Array, StringArray},
    datatypes::{DataType, Field, Schema as ArrowSchema},
    record_batch::RecordBatch,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One line item reported by one organisation for one financial year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub org_name_raw: String,
    pub sector: String,
    pub fy: String,
    pub worksheet_name: Option<String>,
    pub table_id: Option<String>,
    pub main_code: Option<String>,
    pub sub_code: Option<String>,
    pub row_number: Option<i64>,
    pub amount: Option<f64>,
    pub source_file: String,
    pub schema_version: String,
}

/// Column order shared by the Parquet file and the DuckDB table.
pub const FACT_COLUMNS: [&str; 11] = [
    "org_name_raw",
    "sector",
    "fy",
    "worksheet_name",
    "table_id",
    "main_code",
    "sub_code",
    "row_number",
    "amount",
    "source_file",
    "schema_version",
];

/// Arrow schema of the canonical fact table.
pub fn fact_arrow_schema() -> Arc<ArrowSchema> {
    Arc::new(ArrowSchema::new(vec![
        Field::new("org_name_raw", DataType::Utf8, false),
        Field::new("sector", DataType::Utf8, false),
        Field::new("fy", DataType::Utf8, false),
        Field::new("worksheet_name", DataType::Utf8, true),
        Field::new("table_id", DataType::Utf8, true),
        Field::new("main_code", DataType::Utf8, true),
        Field::new("sub_code", DataType::Utf8, true),
        Field::new("row_number", DataType::Int64, true),
        Field::new("amount", DataType::Float64, true),
        Field::new("source_file", DataType::Utf8, false),
        Field::new("schema_version", DataType::Utf8, false),
    ]))
}

/// DDL for `fact_tru_tac`, matching `fact_arrow_schema`.
pub const FACT_TABLE_DDL: &str = "CREATE TABLE IF NOT EXISTS fact_tru_tac(
    org_name_raw VARCHAR NOT NULL,
    sector VARCHAR NOT NULL,
    fy VARCHAR NOT NULL,
    worksheet_name VARCHAR,
    table_id VARCHAR,
    main_code VARCHAR,
    sub_code VARCHAR,
    row_number BIGINT,
    amount DOUBLE,
    source_file VARCHAR NOT NULL,
    schema_version VARCHAR NOT NULL
);";

/// Convert a slice of records into one Arrow batch.
pub fn to_record_batch(records: &[FactRecord]) -> Result<RecordBatch> {
    fn strings<'a>(it: impl Iterator<Item = &'a str>) -> ArrayRef {
        Arc::new(StringArray::from_iter_values(it))
    }
    fn opt_strings<'a>(it: impl Iterator<Item = Option<&'a str>>) -> ArrayRef {
        Arc::new(it.collect::<StringArray>())
    }

    let columns: Vec<ArrayRef> = vec![
        strings(records.iter().map(|r| r.org_name_raw.as_str())),
        strings(records.iter().map(|r| r.sector.as_str())),
        strings(records.iter().map(|r| r.fy.as_str())),
        opt_strings(records.iter().map(|r| r.worksheet_name.as_deref())),
        opt_strings(records.iter().map(|r| r.table_id.as_deref())),
        opt_strings(records.iter().map(|r| r.main_code.as_deref())),
        opt_strings(records.iter().map(|r| r.sub_code.as_deref())),
        Arc::new(records.iter().map(|r| r.row_number).collect::<Int64Array>()),
        Arc::new(records.iter().map(|r| r.amount).collect::<Float64Array>()),
        strings(records.iter().map(|r| r.source_file.as_str())),
        strings(records.iter().map(|r| r.schema_version.as_str())),
    ];

    RecordBatch::try_new(fact_arrow_schema(), columns).context("building fact record batch")
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("fact batch has no column `{}`", name))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("fact column `{}` has unexpected type", name))
}

/// Read records back out of a batch produced by `to_record_batch`.
pub fn from_record_batch(batch: &RecordBatch) -> Result<Vec<FactRecord>> {
    let org = column::<StringArray>(batch, "org_name_raw")?;
    let sector = column::<StringArray>(batch, "sector")?;
    let fy = column::<StringArray>(batch, "fy")?;
    let ws = column::<StringArray>(batch, "worksheet_name")?;
    let table = column::<StringArray>(batch, "table_id")?;
    let main = column::<StringArray>(batch, "main_code")?;
    let sub = column::<StringArray>(batch, "sub_code")?;
    let row = column::<Int64Array>(batch, "row_number")?;
    let amount = column::<Float64Array>(batch, "amount")?;
    let source = column::<StringArray>(batch, "source_file")?;
    let version = column::<StringArray>(batch, "schema_version")?;

    let opt_str = |a: &StringArray, i: usize| (!a.is_null(i)).then(|| a.value(i).to_string());

    Ok((0..batch.num_rows())
        .map(|i| FactRecord {
            org_name_raw: org.value(i).to_string(),
            sector: sector.value(i).to_string(),
            fy: fy.value(i).to_string(),
            worksheet_name: opt_str(ws, i),
            table_id: opt_str(table, i),
            main_code: opt_str(main, i),
            sub_code: opt_str(sub, i),
            row_number: (!row.is_null(i)).then(|| row.value(i)),
            amount: (!amount.is_null(i)).then(|| amount.value(i)),
            source_file: source.value(i).to_string(),
            schema_version: version.value(i).to_string(),
        })
        .collect())
}
