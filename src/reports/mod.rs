//! Spending reports over the fact table: code discovery by label, category
//! aggregations, per-bed normalisation and z-score outlier lists.

pub mod codes;
pub mod consultancy;
pub mod flourish;
pub mod it_consultancy;
pub mod pfi;
pub mod stats;
pub mod top_lines;

pub use codes::{search_codes, CodeHit, CodeSearch};
pub use consultancy::run_consultancy;
pub use flourish::export_pfi;
pub use it_consultancy::run_it_consultancy;
pub use pfi::run_pfi;
pub use top_lines::write_top_lines;
