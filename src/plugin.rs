//! Plugin registry & schema assembler (spec component C).
//!
//! Each storage type registers a [`PluginDescriptor`]: its allowed content
//! set, optional allowed format set, and the option descriptors that are
//! either `fixed` (settable only on create) or `optional`. The registry is
//! a process-global table, built once and treated as immutable afterwards
//! (design notes §9) so no locking is needed to read it.

use crate::error::StorageError;
use crate::model::ContentType;
use crate::volume_id::ImageFormat;
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct ContentModes {
    pub allowed: BTreeSet<ContentType>,
    pub default: BTreeSet<ContentType>,
}

#[derive(Debug, Clone)]
pub struct FormatModes {
    pub allowed: BTreeSet<ImageFormat>,
    pub default: ImageFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionDescriptor {
    pub name: &'static str,
    pub fixed: bool,
    pub required: bool,
}

impl OptionDescriptor {
    pub const fn fixed(name: &'static str, required: bool) -> Self {
        Self {
            name,
            fixed: true,
            required,
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            fixed: false,
            required: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub type_name: &'static str,
    pub content_modes: ContentModes,
    pub format_modes: Option<FormatModes>,
    pub options: Vec<OptionDescriptor>,
}

impl PluginDescriptor {
    fn common_keys() -> &'static [&'static str] {
        &["type", "storage", "content", "nodes", "disable", "shared", "maxfiles", "format", "digest"]
    }

    /// `check_config(storeid, params, create, strict)`: fills defaults,
    /// validates content/nodes/format and required fixed options, and
    /// rejects unknown keys when `strict`. Returns the encoded property
    /// map ready to hand to `section_config::serialize`.
    pub fn check_config(
        &self,
        params: &BTreeMap<String, String>,
        create: bool,
        strict: bool,
        known_nodes: Option<&BTreeSet<String>>,
    ) -> Result<BTreeMap<String, String>, StorageError> {
        if strict {
            let mut allowed: BTreeSet<&str> = Self::common_keys().iter().copied().collect();
            allowed.extend(self.options.iter().map(|o| o.name));
            for key in params.keys() {
                if key == "type" || key == "storage" {
                    continue;
                }
                if !allowed.contains(key.as_str()) {
                    return Err(StorageError::invalid_input(format!(
                        "unknown option '{key}' for storage type '{}'",
                        self.type_name
                    )));
                }
            }
        }

        if create {
            for opt in self.options.iter().filter(|o| o.fixed && o.required) {
                if !params.contains_key(opt.name) {
                    return Err(StorageError::invalid_input(format!(
                        "missing required option '{}' for storage type '{}'",
                        opt.name, self.type_name
                    )));
                }
            }
        } else {
            for opt in self.options.iter().filter(|o| o.fixed) {
                if params.contains_key(opt.name) {
                    return Err(StorageError::precondition(format!(
                        "option '{}' is fixed and cannot be changed after create",
                        opt.name
                    )));
                }
            }
        }

        let mut out = params.clone();

        let content = match params.get("content") {
            Some(raw) => {
                let decoded = decode_content(raw, &self.content_modes.allowed)?;
                encode_content(&decoded)
            }
            None => encode_content(&self.content_modes.default),
        };
        out.insert("content".to_string(), content);

        if let Some(raw) = params.get("nodes") {
            let decoded = decode_nodes(raw, known_nodes)?;
            out.insert("nodes".to_string(), encode_nodes(&decoded));
        }

        if let Some(modes) = &self.format_modes {
            let fmt = match params.get("format") {
                Some(raw) => {
                    let fmt: ImageFormat = raw.parse()?;
                    if !modes.allowed.contains(&fmt) {
                        return Err(StorageError::invalid_input(format!(
                            "format '{raw}' is not allowed for storage type '{}'",
                            self.type_name
                        )));
                    }
                    fmt
                }
                None => modes.default,
            };
            out.insert("format".to_string(), fmt.to_string());
        } else if params.contains_key("format") {
            return Err(StorageError::invalid_input(format!(
                "storage type '{}' does not support a default format",
                self.type_name
            )));
        }

        if let Some(raw) = params.get("disable") {
            out.insert("disable".to_string(), encode_bool(decode_bool(raw)?));
        }
        if let Some(raw) = params.get("shared") {
            out.insert("shared".to_string(), encode_bool(decode_bool(raw)?));
        }

        Ok(out)
    }

    /// JSON schema for `create`: union of common descriptors plus this
    /// type's options; `type`/`storage` required, fixed options required
    /// where declared, unknown keys rejected.
    pub fn create_schema(&self) -> serde_json::Value {
        self.schema(true)
    }

    /// JSON schema for `update`: same union minus `fixed` options, plus an
    /// optional `digest` for optimistic concurrency.
    pub fn update_schema(&self) -> serde_json::Value {
        self.schema(false)
    }

    fn schema(&self, for_create: bool) -> serde_json::Value {
        use serde_json::json;
        let mut properties = serde_json::Map::new();
        properties.insert("type".into(), json!({ "type": "string", "const": self.type_name }));
        properties.insert("storage".into(), json!({ "type": "string" }));
        properties.insert("content".into(), json!({ "type": "string" }));
        properties.insert("nodes".into(), json!({ "type": "string" }));
        properties.insert("disable".into(), json!({ "type": "boolean" }));
        properties.insert("shared".into(), json!({ "type": "boolean" }));
        properties.insert("maxfiles".into(), json!({ "type": "integer", "minimum": 0 }));
        if self.format_modes.is_some() {
            properties.insert("format".into(), json!({ "type": "string" }));
        }
        if !for_create {
            properties.insert("digest".into(), json!({ "type": "string" }));
        }

        let mut required = vec!["type".to_string(), "storage".to_string()];
        for opt in &self.options {
            if for_create && opt.fixed {
                properties.insert(opt.name.into(), json!({ "type": "string" }));
                if opt.required {
                    required.push(opt.name.to_string());
                }
            } else if !opt.fixed {
                properties.insert(opt.name.into(), json!({ "type": "string" }));
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

pub fn decode_content(
    raw: &str,
    allowed: &BTreeSet<ContentType>,
) -> Result<BTreeSet<ContentType>, StorageError> {
    let mut set = BTreeSet::new();
    for token in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let ct: ContentType = token.parse()?;
        if !allowed.contains(&ct) {
            return Err(StorageError::invalid_input(format!(
                "content type '{token}' is not allowed for this storage type"
            )));
        }
        set.insert(ct);
    }
    if set.contains(&ContentType::None) && set.len() > 1 {
        return Err(StorageError::invalid_input(
            "content type 'none' cannot be combined with any other content type".to_string(),
        ));
    }
    Ok(set)
}

pub fn encode_content(set: &BTreeSet<ContentType>) -> String {
    set.iter().map(|c| c.wire_name()).collect::<Vec<_>>().join(",")
}

pub fn decode_nodes(
    raw: &str,
    known_nodes: Option<&BTreeSet<String>>,
) -> Result<BTreeSet<String>, StorageError> {
    let mut set = BTreeSet::new();
    for token in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Some(known) = known_nodes {
            if !known.contains(token) {
                return Err(StorageError::invalid_input(format!(
                    "unknown node '{token}'"
                )));
            }
        }
        set.insert(token.to_string());
    }
    Ok(set)
}

pub fn encode_nodes(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(",")
}

pub fn decode_bool(raw: &str) -> Result<bool, StorageError> {
    match raw {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(StorageError::invalid_input(format!(
            "expected '0' or '1', got '{other}'"
        ))),
    }
}

pub fn encode_bool(value: bool) -> String {
    if value { "1" } else { "0" }.to_string()
}

fn dir_descriptor() -> PluginDescriptor {
    PluginDescriptor {
        type_name: "dir",
        content_modes: ContentModes {
            allowed: [
                ContentType::Images,
                ContentType::RootDir,
                ContentType::Iso,
                ContentType::VzTmpl,
                ContentType::Backup,
                ContentType::None,
            ]
            .into_iter()
            .collect(),
            default: [ContentType::Images].into_iter().collect(),
        },
        format_modes: Some(FormatModes {
            allowed: [ImageFormat::Raw, ImageFormat::Qcow2, ImageFormat::Vmdk]
                .into_iter()
                .collect(),
            default: ImageFormat::Raw,
        }),
        options: vec![
            OptionDescriptor::fixed("path", true),
        ],
    }
}

fn zfspool_descriptor() -> PluginDescriptor {
    PluginDescriptor {
        type_name: "zfspool",
        content_modes: ContentModes {
            allowed: [ContentType::Images, ContentType::RootDir, ContentType::None]
                .into_iter()
                .collect(),
            default: [ContentType::Images, ContentType::RootDir].into_iter().collect(),
        },
        format_modes: Some(FormatModes {
            allowed: [ImageFormat::Raw].into_iter().collect(),
            default: ImageFormat::Raw,
        }),
        options: vec![
            OptionDescriptor::fixed("pool", true),
            OptionDescriptor::optional("blocksize"),
            OptionDescriptor::optional("sparse"),
        ],
    }
}

fn lvm_descriptor() -> PluginDescriptor {
    PluginDescriptor {
        type_name: "lvm",
        content_modes: ContentModes {
            allowed: [ContentType::Images, ContentType::None].into_iter().collect(),
            default: [ContentType::Images].into_iter().collect(),
        },
        format_modes: Some(FormatModes {
            allowed: [ImageFormat::Raw].into_iter().collect(),
            default: ImageFormat::Raw,
        }),
        options: vec![
            OptionDescriptor::fixed("vgname", true),
            OptionDescriptor::fixed("base", false),
        ],
    }
}

fn iscsi_descriptor() -> PluginDescriptor {
    PluginDescriptor {
        type_name: "iscsi",
        content_modes: ContentModes {
            allowed: [ContentType::Images, ContentType::None].into_iter().collect(),
            default: [ContentType::Images].into_iter().collect(),
        },
        format_modes: Some(FormatModes {
            allowed: [ImageFormat::Raw].into_iter().collect(),
            default: ImageFormat::Raw,
        }),
        options: vec![
            OptionDescriptor::fixed("portal", true),
            OptionDescriptor::fixed("target", true),
        ],
    }
}

fn nfs_descriptor() -> PluginDescriptor {
    PluginDescriptor {
        type_name: "nfs",
        content_modes: ContentModes {
            allowed: [
                ContentType::Images,
                ContentType::Iso,
                ContentType::VzTmpl,
                ContentType::Backup,
                ContentType::RootDir,
                ContentType::None,
            ]
            .into_iter()
            .collect(),
            default: [ContentType::Images].into_iter().collect(),
        },
        format_modes: Some(FormatModes {
            allowed: [ImageFormat::Raw, ImageFormat::Qcow2, ImageFormat::Vmdk]
                .into_iter()
                .collect(),
            default: ImageFormat::Raw,
        }),
        options: vec![
            OptionDescriptor::fixed("server", true),
            OptionDescriptor::fixed("export", true),
        ],
    }
}

fn glusterfs_descriptor() -> PluginDescriptor {
    PluginDescriptor {
        type_name: "glusterfs",
        content_modes: ContentModes {
            allowed: [
                ContentType::Images,
                ContentType::Iso,
                ContentType::VzTmpl,
                ContentType::Backup,
                ContentType::None,
            ]
            .into_iter()
            .collect(),
            default: [ContentType::Images].into_iter().collect(),
        },
        format_modes: Some(FormatModes {
            allowed: [ImageFormat::Raw, ImageFormat::Qcow2].into_iter().collect(),
            default: ImageFormat::Raw,
        }),
        options: vec![
            OptionDescriptor::fixed("server", true),
            OptionDescriptor::fixed("volume", true),
        ],
    }
}

fn nexenta_descriptor() -> PluginDescriptor {
    PluginDescriptor {
        type_name: "nexenta",
        content_modes: ContentModes {
            allowed: [ContentType::Images, ContentType::None].into_iter().collect(),
            default: [ContentType::Images].into_iter().collect(),
        },
        format_modes: Some(FormatModes {
            allowed: [ImageFormat::Raw].into_iter().collect(),
            default: ImageFormat::Raw,
        }),
        options: vec![
            OptionDescriptor::fixed("portal", true),
            OptionDescriptor::fixed("pool", true),
            OptionDescriptor::fixed("login", true),
            OptionDescriptor::fixed("password", true),
        ],
    }
}

/// Process-global, immutable after first access. Only `dir` and `zfspool`
/// have a real driver behind them (modules F/G); the rest are registered so
/// their config can be validated and round-tripped even though the core
/// does not implement their I/O (spec §1 OUT OF SCOPE / §6 "Nexenta-style
/// backends... the core treats these as opaque drivers").
pub static REGISTRY: Lazy<BTreeMap<&'static str, PluginDescriptor>> = Lazy::new(|| {
    let mut map = BTreeMap::new();
    for descriptor in [
        dir_descriptor(),
        zfspool_descriptor(),
        lvm_descriptor(),
        iscsi_descriptor(),
        nfs_descriptor(),
        glusterfs_descriptor(),
        nexenta_descriptor(),
    ] {
        map.insert(descriptor.type_name, descriptor);
    }
    map
});

pub fn lookup(type_name: &str) -> Result<&'static PluginDescriptor, StorageError> {
    REGISTRY
        .get(type_name)
        .ok_or_else(|| StorageError::invalid_input(format!("unknown storage type '{type_name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_create_schema_requires_path() {
        let descriptor = lookup("dir").unwrap();
        let schema = descriptor.create_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v == "path"));
    }

    #[test]
    fn update_schema_drops_fixed_and_adds_digest() {
        let descriptor = lookup("dir").unwrap();
        let schema = descriptor.update_schema();
        assert!(schema["properties"].get("digest").is_some());
        let required = schema["required"].as_array().unwrap();
        assert!(!required.iter().any(|v| v == "path"));
    }

    #[test]
    fn check_config_rejects_unknown_key() {
        let descriptor = lookup("dir").unwrap();
        let mut params = BTreeMap::new();
        params.insert("path".to_string(), "/srv/x".to_string());
        params.insert("bogus".to_string(), "1".to_string());
        let err = descriptor.check_config(&params, true, true, None).unwrap_err();
        assert!(err.to_string().contains("unknown option"));
    }

    #[test]
    fn check_config_fills_content_default() {
        let descriptor = lookup("dir").unwrap();
        let mut params = BTreeMap::new();
        params.insert("path".to_string(), "/srv/x".to_string());
        let out = descriptor.check_config(&params, true, true, None).unwrap();
        assert_eq!(out.get("content").unwrap(), "images");
    }

    #[test]
    fn check_config_rejects_fixed_on_update() {
        let descriptor = lookup("dir").unwrap();
        let mut params = BTreeMap::new();
        params.insert("path".to_string(), "/srv/y".to_string());
        let err = descriptor.check_config(&params, false, true, None).unwrap_err();
        assert!(err.to_string().contains("fixed"));
    }

    #[test]
    fn none_cannot_combine_with_other_content() {
        let allowed: BTreeSet<ContentType> = [ContentType::Images, ContentType::None].into_iter().collect();
        assert!(decode_content("images,none", &allowed).is_err());
        assert!(decode_content("none", &allowed).is_ok());
    }

    #[test]
    fn format_rejected_outside_allowed_set() {
        let descriptor = lookup("zfspool").unwrap();
        let mut params = BTreeMap::new();
        params.insert("pool".to_string(), "tank".to_string());
        params.insert("format".to_string(), "qcow2".to_string());
        assert!(descriptor.check_config(&params, true, true, None).is_err());
    }
}
