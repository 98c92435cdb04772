// src/config.rs

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};
use tracing::info;

/// Environment variable consulted when no `--config` flag is given.
pub const CONFIG_ENV: &str = "NHSTAC_CONFIG";

/// Top-level configuration. Every field has a default so an absent or partial
/// YAML file still yields the standard relative layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub ingest: IngestConfig,
    pub reports: ReportsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    pub raw_dir: PathBuf,
    pub reference_dir: PathBuf,
    pub activity_dir: PathBuf,
    pub canonical_dir: PathBuf,
    pub analysis_dir: PathBuf,
    pub mappings_dir: PathBuf,
    pub outputs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("Data/raw"),
            reference_dir: PathBuf::from("Data/reference"),
            activity_dir: PathBuf::from("Data/activity"),
            canonical_dir: PathBuf::from("Data/canonical"),
            analysis_dir: PathBuf::from("Data/analysis"),
            mappings_dir: PathBuf::from("mappings"),
            outputs_dir: PathBuf::from("outputs"),
        }
    }
}

impl PathsConfig {
    pub fn fact_parquet(&self) -> PathBuf {
        self.canonical_dir.join("fact_tru_tac.parquet")
    }

    pub fn duckdb(&self) -> PathBuf {
        self.canonical_dir.join("tru_tac.duckdb")
    }

    pub fn build_manifest(&self) -> PathBuf {
        self.canonical_dir.join("build_manifest.json")
    }

    pub fn subcode_dim(&self) -> PathBuf {
        self.mappings_dir.join("dim_tac_subcodes_by_year.csv")
    }

    pub fn line_dim(&self) -> PathBuf {
        self.mappings_dir.join("dim_tac_lines.csv")
    }

    pub fn line_seed(&self) -> PathBuf {
        self.mappings_dir.join("dim_tac_lines_seed.csv")
    }

    pub fn provider_dim(&self) -> PathBuf {
        self.mappings_dir.join("dim_provider.csv")
    }

    pub fn provider_seed(&self) -> PathBuf {
        self.mappings_dir.join("dim_provider_seed.csv")
    }

    pub fn postcodes(&self) -> PathBuf {
        self.reference_dir.join("trust_postcodes.csv")
    }

    pub fn beds_matched(&self) -> PathBuf {
        self.analysis_dir
            .join("activity_integrated")
            .join("beds_matched.csv")
    }

    /// Output directory for a named report, e.g. `Data/analysis/pfi_analysis`.
    pub fn report_dir(&self, report: &str) -> PathBuf {
        self.analysis_dir.join(report)
    }
}

/// Thresholds for the spreadsheet sniffing heuristics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Rows scanned when looking for a header row.
    pub header_scan_rows: usize,
    /// Columns scanned when looking for a header row.
    pub header_scan_cols: usize,
    /// Minimum keyword hits for a row to count as the header of a TAC sheet.
    pub header_min_score: usize,
    /// Rows scanned when looking for the subcode column in illustrative files.
    pub subcode_scan_rows: usize,
    /// Rows below a candidate header inspected for subcode-looking values.
    pub subcode_lookahead: usize,
    /// Subcode-looking values needed before a column is accepted.
    pub subcode_min_hits: usize,
    /// Rows scanned for a `Table ID` label.
    pub table_id_scan_rows: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            header_scan_rows: 60,
            header_scan_cols: 60,
            header_min_score: 3,
            subcode_scan_rows: 40,
            subcode_lookahead: 14,
            subcode_min_hits: 3,
            table_id_scan_rows: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportsConfig {
    /// Financial years covered by the unmapped-subcode report.
    pub unmapped_years: Vec<String>,
    pub unmapped_limit: usize,
    pub top_lines_per_sector: usize,
    /// Financial year for the top-lines report; latest in the fact table when unset.
    pub top_lines_fy: Option<String>,
    /// |z| above which an organisation is reported as an outlier.
    pub outlier_z: f64,
    pub categories: CategoryTerms,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            unmapped_years: ["2019-20", "2020-21", "2021-22", "2022-23", "2023-24"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            unmapped_limit: 300,
            top_lines_per_sector: 750,
            top_lines_fy: None,
            outlier_z: 2.0,
            categories: CategoryTerms::default(),
        }
    }
}

/// Label search terms per spending category. Matching is a case-insensitive
/// substring test against subcode labels.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CategoryTerms {
    pub pfi: Vec<String>,
    pub pfi_fallback: Vec<String>,
    pub it: Vec<String>,
    pub consultancy: Vec<String>,
    pub consultancy_broad: Vec<String>,
    pub intangibles: Vec<String>,
    pub intangibles_worksheet: String,
    pub operating_income: Vec<String>,
    pub income_worksheet: String,
}

fn terms(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for CategoryTerms {
    fn default() -> Self {
        Self {
            pfi: terms(&["pfi", "private finance", "finance lease", "service concession"]),
            pfi_fallback: terms(&["lease", "finance cost", "capital charge"]),
            it: terms(&[
                "it ",
                " it",
                "digital",
                "technology",
                "information",
                "computer",
                "software",
                "hardware",
                "system",
            ]),
            consultancy: terms(&["consult", "advisory"]),
            consultancy_broad: terms(&["consult", "advisory", "professional"]),
            intangibles: terms(&["software", "licence", "license"]),
            intangibles_worksheet: "TAC13 Intangibles".into(),
            operating_income: terms(&["operating income"]),
            income_worksheet: "TAC02 SoCI".into(),
        }
    }
}

impl Config {
    /// Load from `path`, or from `$NHSTAC_CONFIG`, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = env::var_os(CONFIG_ENV).map(PathBuf::from);
        let chosen = path.map(Path::to_path_buf).or(from_env);

        match chosen {
            Some(p) => {
                let text = fs::read_to_string(&p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                let cfg = Self::from_yaml(&text)
                    .with_context(|| format!("parsing config {}", p.display()))?;
                info!(config = %p.display(), "loaded configuration");
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() -> Result<()> {
        let cfg = Config::from_yaml(
            "paths:\n  raw_dir: /tmp/raw\nreports:\n  outlier_z: 3.0\n",
        )?;
        assert_eq!(cfg.paths.raw_dir, PathBuf::from("/tmp/raw"));
        assert_eq!(cfg.paths.mappings_dir, PathBuf::from("mappings"));
        assert_eq!(cfg.reports.outlier_z, 3.0);
        assert_eq!(cfg.reports.unmapped_limit, 300);
        assert_eq!(cfg.reports.categories.consultancy, vec!["consult", "advisory"]);
        Ok(())
    }

    #[test]
    fn empty_yaml_is_default() -> Result<()> {
        assert_eq!(Config::from_yaml("  \n")?, Config::default());
        Ok(())
    }

    #[test]
    fn derived_paths_live_under_configured_dirs() {
        let cfg = Config::default();
        assert_eq!(
            cfg.paths.fact_parquet(),
            PathBuf::from("Data/canonical/fact_tru_tac.parquet")
        );
        assert_eq!(
            cfg.paths.beds_matched(),
            PathBuf::from("Data/analysis/activity_integrated/beds_matched.csv")
        );
    }
}
