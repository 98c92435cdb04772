// src/ingest/workbook.rs

use anyhow::{anyhow, bail, Context, Result};
use calamine::{open_workbook_auto, Reader, Sheets};
use glob::glob;
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use super::grid::Grid;
use super::header::norm_key;

/// An opened spreadsheet plus the name it was opened from (for messages).
pub struct Workbook {
    name: String,
    sheets: Sheets<BufReader<File>>,
}

impl Workbook {
    pub fn open(path: &Path) -> Result<Self> {
        let sheets = open_workbook_auto(path)
            .with_context(|| format!("opening workbook {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { name, sheets })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.sheet_names()
    }

    pub fn grid(&mut self, sheet: &str) -> Result<Grid> {
        let range = self
            .sheets
            .worksheet_range(sheet)
            .map_err(|e| anyhow!("{}: reading sheet '{}': {}", self.name, sheet, e))?;
        Ok(Grid::from_range(&range))
    }
}

/// Files in `dir` matching `pattern`, sorted by path. Office lock files (`~$...`) are skipped.
pub fn list_workbooks(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let full = format!("{}/{}", dir.display(), pattern);
    let mut paths: Vec<PathBuf> = glob(&full)
        .with_context(|| format!("Failed to read glob pattern '{}'", full))?
        .filter_map(|entry| entry.ok())
        .filter(|p| {
            p.file_name()
                .map(|n| !n.to_string_lossy().starts_with("~$"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    Ok(paths)
}

/// First sheet whose normalized name equals the normalized `target`.
pub fn find_sheet(names: &[String], target: &str, source: &str) -> Result<String> {
    let want = norm_key(target);
    names
        .iter()
        .find(|s| norm_key(s) == want)
        .cloned()
        .ok_or_else(|| {
            anyhow!(
                "{}: could not find a '{}' sheet. Available sheets: {:?}",
                source,
                target,
                names
            )
        })
}

/// Sheet whose normalized name contains the most keywords.
///
/// Ties resolve to the name that sorts last.
pub fn find_sheet_by_keywords(names: &[String], keywords: &[&str], source: &str) -> Result<String> {
    let kw: Vec<String> = keywords.iter().map(|k| norm_key(k)).collect();
    let mut scored: Vec<(usize, &String)> = names
        .iter()
        .filter_map(|s| {
            let ns = norm_key(s);
            let score = kw.iter().filter(|k| ns.contains(k.as_str())).count();
            (score > 0).then_some((score, s))
        })
        .collect();

    if scored.is_empty() {
        bail!(
            "{}: could not find a sheet matching {:?}. Available sheets: {:?}",
            source,
            keywords,
            names
        );
    }
    scored.sort();
    Ok(scored[scored.len() - 1].1.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn listing_is_sorted_and_skips_lock_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["TAC_Trusts_2021-22.xlsx", "TAC_FTs_2021-22.xlsx", "~$TAC_FTs_2022-23.xlsx", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"")?;
        }
        let found: Vec<String> = list_workbooks(dir.path(), "TAC_*.xlsx")?
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        assert_eq!(found, vec!["TAC_FTs_2021-22.xlsx", "TAC_Trusts_2021-22.xlsx"]);
        Ok(())
    }

    #[test]
    fn fuzzy_sheet_match_ignores_case_and_spacing() -> Result<()> {
        let sheets = names(&["Contents", "ALL_DATA ", "Notes"]);
        assert_eq!(find_sheet(&sheets, "All data", "x.xlsx")?, "ALL_DATA ");
        let err = find_sheet(&sheets, "Pivot", "x.xlsx").unwrap_err();
        assert!(err.to_string().contains("Contents"));
        Ok(())
    }

    #[test]
    fn keyword_scoring_prefers_more_hits() -> Result<()> {
        let kw = ["mapping", "schedule", "lookup", "code"];
        let sheets = names(&["Front", "Code lookup", "Mapping schedule codes", "Notes"]);
        assert_eq!(find_sheet_by_keywords(&sheets, &kw, "x")?, "Mapping schedule codes");

        // equal scores resolve to the name sorting last
        let tied = names(&["Code lookup", "Mapping schedule"]);
        assert_eq!(find_sheet_by_keywords(&tied, &kw, "x")?, "Mapping schedule");
        assert!(find_sheet_by_keywords(&names(&["Front"]), &["mapping"], "x").is_err());
        Ok(())
    }
}
