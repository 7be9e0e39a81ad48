//! Adapter around the DemoCleaner analyzer binary.
//!
//! The binary prints a quasi-XML document on stdout. Two host quirks have to
//! be undone before parsing: trailing garbage after the closing root tag, and
//! numeric character references below the XML 1.0 permitted range (DeFRaG
//! player names love control characters). The latter are tunnelled through
//! the parser as `@<hex>;` markers and decoded afterwards.

use std::collections::BTreeMap;
use std::path::{
    Path,
    PathBuf,
};
use std::process::Command;

use anyhow::{
    Context,
    Result,
    anyhow,
    bail,
};
use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;

/// `{element_name -> {attribute_name -> attribute_value}}` over the root's
/// children.
pub type DemoMetadata = BTreeMap<String, BTreeMap<String, String>>;

const END_MARKER: &str = "</demoFile>";
const BENIGN_STDERR: &[u8] = b"Could not set X locale modifiers\n";

static NUMERIC_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").expect("numeric ref regex"));
static ESCAPE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([0-9a-fA-F]+);").expect("escape marker regex"));
static RAW_ELEMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"<raw .* />").expect("raw regex"));

/// Extracts structured metadata from a demo file.
pub trait MetadataAnalyzer: Send + Sync {
    fn analyze(&self, demo_file: &Path) -> Result<DemoMetadata>;
}

#[derive(Debug, Clone)]
pub struct DemoAnalyzer {
    democleaner_exe: PathBuf,
}

impl DemoAnalyzer {
    pub fn new(democleaner_exe: impl Into<PathBuf>) -> Self {
        Self {
            democleaner_exe: democleaner_exe.into(),
        }
    }
}

impl MetadataAnalyzer for DemoAnalyzer {
    fn analyze(&self, demo_file: &Path) -> Result<DemoMetadata> {
        let output = Command::new(&self.democleaner_exe)
            .arg("--xml")
            .arg(demo_file)
            .output()
            .with_context(|| {
                format!(
                    "failed to run demo analyzer {} on {}",
                    self.democleaner_exe.display(),
                    demo_file.display()
                )
            })?;
        check_stderr(&output.stderr)?;
        parse_document(&String::from_utf8_lossy(&output.stdout))
            .with_context(|| format!("failed to parse analyzer output for {}", demo_file.display()))
    }
}

/// Any stderr output other than the known benign locale-modifier warning is
/// fatal: the analyzer does not reliably signal errors in its exit status.
fn check_stderr(stderr: &[u8]) -> Result<()> {
    if stderr.is_empty() || stderr == BENIGN_STDERR {
        return Ok(());
    }
    bail!(
        "demo analyzer wrote to stderr: {}",
        String::from_utf8_lossy(stderr)
    )
}

pub(crate) fn parse_document(stdout: &str) -> Result<DemoMetadata> {
    let trimmed = trim_trailing_noise(stdout);
    let cleaned = RAW_ELEMENT.replace_all(trimmed, "");
    let escaped = escape_low_refs(&cleaned);

    let mut reader = Reader::from_str(&escaped);
    let mut metadata = DemoMetadata::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                if depth == 1 {
                    collect_element(&element, &mut metadata)?;
                }
                depth += 1;
            }
            Ok(Event::Empty(element)) => {
                if depth == 1 {
                    collect_element(&element, &mut metadata)?;
                }
            }
            Ok(Event::End(_)) => depth = depth.saturating_sub(1),
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(anyhow!("invalid analyzer XML: {err}")),
        }
    }
    Ok(metadata)
}

fn collect_element(
    element: &quick_xml::events::BytesStart<'_>,
    metadata: &mut DemoMetadata,
) -> Result<()> {
    let name = unescape_markers(&String::from_utf8_lossy(element.name().as_ref()));
    let mut attributes = BTreeMap::new();
    for attribute in element.attributes() {
        let attribute = attribute.map_err(|err| anyhow!("invalid analyzer attribute: {err}"))?;
        let key = unescape_markers(&String::from_utf8_lossy(attribute.key.as_ref()));
        let value = attribute
            .unescape_value()
            .map_err(|err| anyhow!("invalid analyzer attribute value: {err}"))?;
        attributes.insert(key, unescape_markers(&value));
    }
    metadata.insert(name, attributes);
    Ok(())
}

/// Cuts everything after the last closing root tag; some hosts append
/// runtime chatter to stdout after the document.
fn trim_trailing_noise(stdout: &str) -> &str {
    match stdout.rfind(END_MARKER) {
        Some(pos) => &stdout[..pos + END_MARKER.len()],
        None => stdout,
    }
}

/// Pre-escape pass: literal `@` becomes `@40;`, and every numeric character
/// reference whose code point XML 1.0 forbids becomes `@<hex>;` so the
/// parser never sees it.
fn escape_low_refs(input: &str) -> String {
    let at_escaped = input.replace('@', "@40;");
    NUMERIC_REF
        .replace_all(&at_escaped, |caps: &regex::Captures<'_>| {
            let body = &caps[1];
            let code_point = match body.strip_prefix('x') {
                Some(hex) => u32::from_str_radix(hex, 16),
                None => body.parse::<u32>(),
            };
            match code_point {
                Ok(cp) if is_forbidden_code_point(cp) => format!("@{cp:x};"),
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Post-parse pass: decode every `@<hex>;` marker back to its character.
fn unescape_markers(input: &str) -> String {
    ESCAPE_MARKER
        .replace_all(input, |caps: &regex::Captures<'_>| {
            u32::from_str_radix(&caps[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn is_forbidden_code_point(cp: u32) -> bool {
    cp < 0x20 && !matches!(cp, 0x9 | 0xA | 0xD)
}
