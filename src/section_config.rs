//! Section config parser/writer (spec component B).
//!
//! Reads and writes the flat `storage.cfg` text format:
//!
//! ```text
//! <type>: <storeid>
//!         key value
//!         key value
//! ```
//!
//! This module is purely textual: every property value is stored as the
//! already-encoded string (sets comma-joined, booleans as `0`/`1`); the
//! plugin registry (component C) is responsible for producing those strings
//! from typed values before a section is handed to `serialize`, and for
//! decoding them back on the way out.

use crate::model::ConfigDigest;
use crate::error::StorageError;
use std::collections::BTreeMap;

pub const LOCAL_STORAGE_ID: &str = "local";
pub const LOCAL_STORAGE_PATH: &str = "/var/lib/vz";

/// One parsed `<type>: <storeid>` section with its indented key/value body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSection {
    pub type_name: String,
    pub storeid: String,
    pub properties: BTreeMap<String, String>,
}

impl RawSection {
    pub fn new(type_name: impl Into<String>, storeid: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            storeid: storeid.into(),
            properties: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionConfigFile {
    pub sections: Vec<RawSection>,
    pub digest: ConfigDigest,
}

impl SectionConfigFile {
    pub fn find(&self, storeid: &str) -> Option<&RawSection> {
        self.sections.iter().find(|s| s.storeid == storeid)
    }

    pub fn find_mut(&mut self, storeid: &str) -> Option<&mut RawSection> {
        self.sections.iter_mut().find(|s| s.storeid == storeid)
    }
}

/// Parses `storage.cfg` text. Duplicate storeids keep the last occurrence
/// and log a warning. Always guarantees a `local` entry afterwards.
pub fn parse(text: &str) -> Result<SectionConfigFile, StorageError> {
    let mut sections: Vec<RawSection> = Vec::new();
    let mut current: Option<RawSection> = None;

    for (lineno, raw_line) in text.lines().enumerate() {
        if raw_line.trim().is_empty() || raw_line.trim_start().starts_with('#') {
            continue;
        }
        let is_header = !raw_line.starts_with(char::is_whitespace);
        if is_header {
            if let Some(section) = current.take() {
                push_or_replace(&mut sections, section);
            }
            let (type_name, storeid) = raw_line.split_once(':').ok_or_else(|| {
                StorageError::invalid_input(format!(
                    "storage.cfg:{}: expected '<type>: <storeid>'",
                    lineno + 1
                ))
            })?;
            current = Some(RawSection::new(type_name.trim(), storeid.trim()));
        } else {
            let section = current.as_mut().ok_or_else(|| {
                StorageError::invalid_input(format!(
                    "storage.cfg:{}: indented line outside of a section",
                    lineno + 1
                ))
            })?;
            let trimmed = raw_line.trim();
            let (key, value) = trimmed.split_once(char::is_whitespace).unwrap_or((trimmed, ""));
            section
                .properties
                .insert(key.to_string(), value.trim().to_string());
        }
    }
    if let Some(section) = current.take() {
        push_or_replace(&mut sections, section);
    }

    ensure_local_entry(&mut sections);

    let digest = ConfigDigest::of(text.as_bytes());
    Ok(SectionConfigFile { sections, digest })
}

fn push_or_replace(sections: &mut Vec<RawSection>, section: RawSection) {
    if let Some(existing) = sections.iter_mut().find(|s| s.storeid == section.storeid) {
        log::warn!(
            "storage.cfg: duplicate storage ID '{}', last definition wins",
            section.storeid
        );
        *existing = section;
    } else {
        sections.push(section);
    }
}

/// Ensures the invariant from spec §3 holds: exactly one `local`/`dir`
/// entry, path fixed, never disabled, never node-restricted, content
/// always including `rootdir` and `vztmpl`.
pub fn ensure_local_entry(sections: &mut Vec<RawSection>) {
    if let Some(local) = sections.iter_mut().find(|s| s.storeid == LOCAL_STORAGE_ID) {
        local.type_name = "dir".to_string();
        local
            .properties
            .entry("path".to_string())
            .or_insert_with(|| LOCAL_STORAGE_PATH.to_string());
        local.properties.remove("disable");
        local.properties.remove("nodes");
        let mut content: Vec<&str> = local
            .properties
            .get("content")
            .map(|c| c.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        for required in ["rootdir", "vztmpl"] {
            if !content.contains(&required) {
                content.push(required);
            }
        }
        content.sort_unstable();
        content.dedup();
        local
            .properties
            .insert("content".to_string(), content.join(","));
    } else {
        let mut local = RawSection::new("dir", LOCAL_STORAGE_ID);
        local
            .properties
            .insert("path".to_string(), LOCAL_STORAGE_PATH.to_string());
        local
            .properties
            .insert("content".to_string(), "images,rootdir,vztmpl".to_string());
        sections.push(local);
    }
}

/// Serializes sections in stable sorted order by storeid, with properties
/// ordered `type`, then the rest alphabetically. Returns the raw bytes; the
/// caller computes a fresh digest from them via `ConfigDigest::of`.
pub fn serialize(sections: &[RawSection]) -> String {
    let mut ordered: Vec<&RawSection> = sections.iter().collect();
    ordered.sort_by(|a, b| a.storeid.cmp(&b.storeid));

    let mut out = String::new();
    for section in ordered {
        out.push_str(&section.type_name);
        out.push_str(": ");
        out.push_str(&section.storeid);
        out.push('\n');
        for (key, value) in &section.properties {
            out.push('\t');
            out.push_str(key);
            out.push(' ');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "dir: mydir\n\tpath /srv/x\n\tcontent images,iso\n\n";

    #[test]
    fn parses_sample_and_injects_local() {
        let parsed = parse(SAMPLE).unwrap();
        let mydir = parsed.find("mydir").unwrap();
        assert_eq!(mydir.type_name, "dir");
        assert_eq!(mydir.properties.get("path").unwrap(), "/srv/x");

        let local = parsed.find(LOCAL_STORAGE_ID).unwrap();
        let content = local.properties.get("content").unwrap();
        assert!(content.contains("rootdir"));
        assert!(content.contains("vztmpl"));
    }

    #[test]
    fn duplicate_storeid_last_wins() {
        let text = "dir: mydir\n\tpath /a\n\ndir: mydir\n\tpath /b\n\n";
        let parsed = parse(text).unwrap();
        assert_eq!(
            parsed.find("mydir").unwrap().properties.get("path").unwrap(),
            "/b"
        );
        assert_eq!(parsed.sections.iter().filter(|s| s.storeid == "mydir").count(), 1);
    }

    #[test]
    fn write_then_parse_roundtrips_modulo_local_injection() {
        let parsed = parse(SAMPLE).unwrap();
        let text = serialize(&parsed.sections);
        let reparsed = parse(&text).unwrap();
        assert_eq!(reparsed.find("mydir"), parsed.find("mydir"));
        assert_eq!(reparsed.sections.len(), parsed.sections.len());
    }

    #[test]
    fn writer_orders_sections_and_local_is_always_present() {
        let text = serialize(&[RawSection::new("dir", "zeta")]);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.sections[0].storeid, LOCAL_STORAGE_ID);
        assert_eq!(parsed.sections[1].storeid, "zeta");
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let text = "dir: mydir\n\tpath /srv/x\n\tfrobnicate yes\n\n";
        let parsed = parse(text).unwrap();
        let written = serialize(&parsed.sections);
        assert!(written.contains("frobnicate yes"));
    }

    #[test]
    fn digest_changes_when_bytes_change() {
        let a = parse(SAMPLE).unwrap();
        let b = parse("dir: other\n\tpath /q\n\n").unwrap();
        assert_ne!(a.digest, b.digest);
    }
}
