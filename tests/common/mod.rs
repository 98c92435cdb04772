// tests/common/mod.rs
#![allow(dead_code)]

use anyhow::Result;
use nhstac::config::Config;
use std::{fs, io::Write, path::Path};
use zip::write::FileOptions;
use zip::CompressionMethod;

/// A worksheet cell for the fixture writer.
#[derive(Debug, Clone)]
pub enum Cell {
    Empty,
    Text(String),
    Num(f64),
}

pub fn t(s: &str) -> Cell {
    Cell::Text(s.to_string())
}

pub fn n(v: f64) -> Cell {
    Cell::Num(v)
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn column_name(mut c: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (c % 26) as u8);
        if c < 26 {
            break;
        }
        c = c / 26 - 1;
    }
    name.reverse();
    String::from_utf8(name).unwrap()
}

fn sheet_xml(rows: &[Vec<Cell>]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );
    for (r, row) in rows.iter().enumerate() {
        xml.push_str(&format!(r#"<row r="{}">"#, r + 1));
        for (c, cell) in row.iter().enumerate() {
            let at = format!("{}{}", column_name(c), r + 1);
            match cell {
                Cell::Empty => {}
                Cell::Text(s) => xml.push_str(&format!(
                    r#"<c r="{}" t="inlineStr"><is><t>{}</t></is></c>"#,
                    at,
                    escape(s)
                )),
                Cell::Num(v) => xml.push_str(&format!(r#"<c r="{}"><v>{}</v></c>"#, at, v)),
            }
        }
        xml.push_str("</row>");
    }
    xml.push_str("</sheetData></worksheet>");
    xml
}

/// Minimal xlsx package with inline-string cells, one part per sheet.
pub fn write_xlsx(path: &Path, sheets: &[(&str, Vec<Vec<Cell>>)]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut content_types = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>"#,
    );
    let mut workbook = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets>"#,
    );
    let mut rels = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
    );
    for (i, (name, _)) in sheets.iter().enumerate() {
        let id = i + 1;
        content_types.push_str(&format!(
            r#"<Override PartName="/xl/worksheets/sheet{}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#,
            id
        ));
        workbook.push_str(&format!(
            r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
            escape(name),
            id,
            id
        ));
        rels.push_str(&format!(
            r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{}.xml"/>"#,
            id, id
        ));
    }
    content_types.push_str("</Types>");
    workbook.push_str("</sheets></workbook>");
    rels.push_str("</Relationships>");
    let root_rels = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

    let file = fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options: FileOptions<'_, ()> =
        FileOptions::default().compression_method(CompressionMethod::Stored);
    let mut add = |name: &str, body: &str| -> Result<()> {
        zip.start_file(name, options)?;
        zip.write_all(body.as_bytes())?;
        Ok(())
    };
    add("[Content_Types].xml", &content_types)?;
    add("_rels/.rels", root_rels)?;
    add("xl/workbook.xml", &workbook)?;
    add("xl/_rels/workbook.xml.rels", &rels)?;
    for (i, (_, rows)) in sheets.iter().enumerate() {
        add(&format!("xl/worksheets/sheet{}.xml", i + 1), &sheet_xml(rows))?;
    }
    zip.finish()?;
    Ok(())
}

/// Config whose every directory lives under `root`.
pub fn config_in(root: &Path) -> Config {
    let mut cfg = Config::default();
    let p = &mut cfg.paths;
    p.raw_dir = root.join("Data/raw");
    p.reference_dir = root.join("Data/reference");
    p.activity_dir = root.join("Data/activity");
    p.canonical_dir = root.join("Data/canonical");
    p.analysis_dir = root.join("Data/analysis");
    p.mappings_dir = root.join("mappings");
    p.outputs_dir = root.join("outputs");
    cfg
}

/// One "All data" line: (worksheet, table, main code, row, subcode, org, amount).
pub type FactLine<'a> = (&'a str, f64, &'a str, f64, &'a str, &'a str, f64);

/// Raw TAC workbook with a title row above the header, as the published files have.
pub fn write_tac(path: &Path, org_header: &str, amount_header: &str, lines: &[FactLine<'_>]) -> Result<()> {
    let mut rows = vec![
        vec![t("Trust Accounts Consolidation: All data")],
        vec![],
        vec![
            t("WorkSheetName"),
            t("TableID"),
            t("MainCode"),
            t("RowNumber"),
            t("SubCode"),
            t(org_header),
            t(amount_header),
        ],
    ];
    for (ws, table, main, row, sub, org, amount) in lines {
        rows.push(vec![t(ws), n(*table), t(main), n(*row), t(sub), t(org), n(*amount)]);
    }
    write_xlsx(path, &[("Cover", vec![vec![t("Cover sheet")]]), ("All data", rows)])
}

/// Illustrative workbook sheet: a "Table ID" row, a header row, then label/subcode rows.
pub fn illustrative_sheet(table_id: f64, lines: &[(&str, &str)]) -> Vec<Vec<Cell>> {
    let mut rows = vec![
        vec![t("Table ID"), n(table_id)],
        vec![t("Description"), t("Subcode")],
    ];
    for (label, code) in lines {
        rows.push(vec![t(label), t(code)]);
    }
    rows
}
