pub mod fact;

pub use fact::{
    fact_arrow_schema, from_record_batch, to_record_batch, FactRecord, FACT_COLUMNS,
    FACT_TABLE_DDL,
};
