use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use roxmltree::Document;
use zip::ZipArchive;

/// Paragraph text of a DOCX file, one paragraph per line.
pub fn extract_docx_text(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("failed to open DOCX: {}", path.display()))?;
    let mut archive = ZipArchive::new(file).context("DOCX is not a valid ZIP archive")?;

    let mut document_xml = String::new();
    archive
        .by_name("word/document.xml")
        .context("DOCX missing word/document.xml")?
        .read_to_string(&mut document_xml)
        .context("failed to read word/document.xml")?;

    paragraphs_from_xml(&document_xml)
}

fn paragraphs_from_xml(xml: &str) -> Result<String> {
    let doc = Document::parse(xml).context("failed to parse DOCX XML")?;

    let paragraphs: Vec<String> = doc
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == "p")
        .map(|paragraph| {
            paragraph
                .descendants()
                .filter(|node| node.is_element() && node.tag_name().name() == "t")
                .filter_map(|node| node.text())
                .collect::<Vec<_>>()
                .join("")
        })
        .filter(|text| !text.trim().is_empty())
        .collect();

    Ok(paragraphs.join("\n"))
}
