//! Dimension tables that give the fact table its labels: subcode descriptions
//! per year, line definitions and provider identities.

pub mod lines;
pub mod provider;
pub mod subcodes;

pub use lines::{build_line_dim, build_line_seed, LineKey, LineRow, LineSeedRow};
pub use provider::build_provider_seed;
pub use subcodes::{build_subcode_dim, SubcodeRow, SUBCODE_RE};
