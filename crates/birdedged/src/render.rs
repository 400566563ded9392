//! Worker configuration rendering.
//!
//! The worker reads an INI file (`[section]` headers, `key = value` lines).
//! The operator provides a template with the fixed pipeline sections; every
//! restart cycle the daemon projects the [`SourceRegistry`] onto a copy of
//! that template and writes the result where the worker will read it.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::RenderError;
use crate::registry::{Source, SourceRegistry, SOURCE_KIND_AUDIO_URI, SOURCE_PREFIX};

/// Sections whose `batch-size` must equal the number of enabled sources.
pub const BATCHED_SECTIONS: [&str; 2] = ["streammux", "audio-classifier"];

const KEY_ENABLE: &str = "enable";
const KEY_TYPE: &str = "type";
const KEY_URI: &str = "uri";
const KEY_NUM_SOURCES: &str = "num-sources";
const KEY_GPU_ID: &str = "gpu-id";
const KEY_LATENCY: &str = "latency";
const KEY_BATCH_SIZE: &str = "batch-size";

/// A named, ordered list of key/value pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set `key`, replacing an existing value in place or appending.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, existing)) => *existing = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Ordered INI document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    sections: Vec<Section>,
}

impl IniDocument {
    /// Parse INI text. Accepts `key = value`, `key=value` and `key: value`;
    /// `#` and `;` start comment lines. Keys outside any section are dropped.
    pub fn parse(text: &str) -> Self {
        let mut doc = Self::default();
        let mut current: Option<String> = None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                doc.section_mut(name);
                current = Some(name.to_string());
                continue;
            }

            let Some((key, value)) = split_entry(line) else {
                warn!(line = lineno + 1, text = raw, "ignoring template line without a value");
                continue;
            };

            match &current {
                Some(section) => doc.set(section, key, value),
                None => warn!(line = lineno + 1, key, "ignoring template key outside a section"),
            }
        }

        doc
    }

    /// Read and parse the template at `path`.
    pub fn load(path: &Path) -> Result<Self, RenderError> {
        let text = std::fs::read_to_string(path).map_err(|source| RenderError::TemplateRead {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Section `name`, appended if absent.
    pub fn section_mut(&mut self, name: &str) -> &mut Section {
        let index = match self.sections.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                self.sections.push(Section::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[index]
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section).and_then(|s| s.get(key))
    }

    pub fn set(&mut self, section: &str, key: &str, value: impl Into<String>) {
        self.section_mut(section).set(key, value);
    }

    /// Sources listed in the document (`source<N>` sections).
    pub fn sources(&self) -> Vec<Source> {
        self.sections
            .iter()
            .filter(|s| is_source_section(&s.name))
            .map(source_from_section)
            .collect()
    }

    /// Serialize as `key = value` lines, one blank line after each section.
    pub fn to_ini_string(&self) -> String {
        let mut output = String::new();
        for section in &self.sections {
            output.push_str(&format!("[{}]\n", section.name));
            for (key, value) in section.entries() {
                output.push_str(&format!("{key} = {value}\n"));
            }
            output.push('\n');
        }
        output
    }
}

fn split_entry(line: &str) -> Option<(&str, &str)> {
    let split_at = line.find(['=', ':'])?;
    let key = line[..split_at].trim();
    if key.is_empty() {
        return None;
    }
    Some((key, line[split_at + 1..].trim()))
}

fn is_source_section(name: &str) -> bool {
    name.strip_prefix(SOURCE_PREFIX)
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn source_from_section(section: &Section) -> Source {
    let number = |key: &str, default: u32| {
        section
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    };

    Source {
        id: section.name.clone(),
        uri: section.get(KEY_URI).unwrap_or_default().to_string(),
        enabled: section.get(KEY_ENABLE).is_some_and(|v| v == "1"),
        kind: number(KEY_TYPE, SOURCE_KIND_AUDIO_URI),
        gpu_id: number(KEY_GPU_ID, 1),
        latency_ms: number(KEY_LATENCY, 20),
        stream_count: number(KEY_NUM_SOURCES, 1),
    }
}

/// Project the registry onto a copy of `template`.
///
/// Identical registry state always yields identical text: section order is
/// the template's followed by sources in registry order, and key order within
/// a section is fixed.
pub fn render(template: &IniDocument, registry: &SourceRegistry) -> String {
    let mut doc = template.clone();

    for source in registry.snapshot() {
        let section = doc.section_mut(&source.id);
        section.set(KEY_ENABLE, if source.enabled { "1" } else { "0" });
        section.set(KEY_TYPE, source.kind.to_string());
        section.set(KEY_URI, source.uri.as_str());
        section.set(KEY_NUM_SOURCES, source.stream_count.to_string());
        section.set(KEY_GPU_ID, source.gpu_id.to_string());
        section.set(KEY_LATENCY, source.latency_ms.to_string());
    }

    let batch_size = registry.active_count().to_string();
    for name in BATCHED_SECTIONS {
        doc.set(name, KEY_BATCH_SIZE, batch_size.as_str());
    }

    doc.to_ini_string()
}

/// Replace `path` with `contents` so a concurrently starting reader sees
/// either the old file or the new one, never a partial write.
pub fn write_atomic(path: &Path, contents: &str) -> Result<(), RenderError> {
    let write_err = |source| RenderError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
    tmp.write_all(contents.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    Ok(())
}

/// Template plus destination: everything needed to produce the worker config.
#[derive(Debug, Clone)]
pub struct ConfigRenderer {
    template: IniDocument,
    export_path: PathBuf,
}

impl ConfigRenderer {
    pub fn new(template: IniDocument, export_path: impl Into<PathBuf>) -> Self {
        Self {
            template,
            export_path: export_path.into(),
        }
    }

    pub fn render(&self, registry: &SourceRegistry) -> String {
        render(&self.template, registry)
    }

    /// Render and atomically write the worker config, returning its path.
    pub fn write(&self, registry: &SourceRegistry) -> Result<&Path, RenderError> {
        let text = self.render(registry);
        debug!(path = %self.export_path.display(), sources = registry.len(), "writing worker config");
        write_atomic(&self.export_path, &text)?;
        Ok(&self.export_path)
    }
}
