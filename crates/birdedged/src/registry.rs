//! Source registry - the audio streams the worker is configured to consume.
//!
//! Sources are keyed by a stable `source<N>` id and are never removed: a
//! station that disappears is disabled, and when it shows up again it gets
//! its old id back.
//!
//! Identity is resolved by substring containment of the endpoint host (or
//! the URL reported by the worker) inside a stored `uri`. This matches how
//! existing deployments behave, but it is a known correctness risk: a host
//! whose name is a substring of another host's (`10.0.0.5` vs `10.0.0.50`)
//! resolves to the wrong source.
//!
//! A classification's `source_id` N is attributed to the section `source<N>`.
//! The worker itself numbers only the enabled sources, so once an earlier
//! source is disabled its detections are credited to the wrong station.
//! This is the same attribution existing deployments use.

use tracing::{debug, warn};

/// DeepStream source type for an audio URI.
pub const SOURCE_KIND_AUDIO_URI: u32 = 7;

const DEFAULT_GPU_ID: u32 = 1;
const DEFAULT_LATENCY_MS: u32 = 20;
const DEFAULT_STREAM_COUNT: u32 = 1;

/// Section name prefix shared by every source.
pub const SOURCE_PREFIX: &str = "source";

/// One audio endpoint the worker streams from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: String,
    pub uri: String,
    pub enabled: bool,
    pub kind: u32,
    pub gpu_id: u32,
    pub latency_ms: u32,
    pub stream_count: u32,
}

impl Source {
    /// Station identifier: the host portion of the uri.
    pub fn station(&self) -> &str {
        station_of(&self.uri)
    }
}

/// Host portion of a stream uri (`http://10.0.0.5:8080/stream.wav` -> `10.0.0.5`).
pub fn station_of(uri: &str) -> &str {
    let rest = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
    let end = rest.find([':', '/']).unwrap_or(rest.len());
    &rest[..end]
}

/// Uri the worker uses to pull audio from a discovered station.
pub fn stream_uri(host: &str, port: u16) -> String {
    format!("http://{host}:{port}/stream.wav")
}

/// Id the worker uses for a source in its output (`source_id: 3` -> `source3`).
pub fn source_id(index: u32) -> String {
    format!("{SOURCE_PREFIX}{index}")
}

/// Insertion-ordered collection of sources.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry, typically with the sources listed in the template.
    pub fn from_sources(sources: impl IntoIterator<Item = Source>) -> Self {
        let mut registry = Self::new();
        for source in sources {
            if source.uri.is_empty() {
                warn!(id = %source.id, "source has no uri, detections carry no station");
            }
            if registry.get(&source.id).is_some() {
                warn!(id = %source.id, "duplicate source id, keeping the first");
                continue;
            }
            registry.sources.push(source);
        }
        registry
    }

    /// Register (or re-enable) the stream served at `host:port`.
    ///
    /// Returns the id of the source, which is stable across repeated calls
    /// for the same endpoint.
    pub fn upsert(&mut self, host: &str, port: u16) -> String {
        let index = match self.find(host) {
            Some(index) => index,
            None => {
                let id = self.next_id();
                debug!(%id, host, "allocating new source");
                self.sources.push(Source {
                    id,
                    uri: String::new(),
                    enabled: false,
                    kind: SOURCE_KIND_AUDIO_URI,
                    gpu_id: DEFAULT_GPU_ID,
                    latency_ms: DEFAULT_LATENCY_MS,
                    stream_count: DEFAULT_STREAM_COUNT,
                });
                self.sources.len() - 1
            }
        };

        let source = &mut self.sources[index];
        source.uri = stream_uri(host, port);
        source.kind = SOURCE_KIND_AUDIO_URI;
        source.gpu_id = DEFAULT_GPU_ID;
        source.latency_ms = DEFAULT_LATENCY_MS;
        source.stream_count = DEFAULT_STREAM_COUNT;
        source.enabled = true;
        source.id.clone()
    }

    /// Disable the source announced by `host`. Returns its id, or `None`
    /// when no source matches.
    pub fn disable(&mut self, host: &str) -> Option<String> {
        self.disable_matching(host)
    }

    /// Disable the source a worker connection error refers to.
    pub fn disable_by_uri(&mut self, uri: &str) -> Option<String> {
        self.disable_matching(uri)
    }

    /// Number of enabled sources.
    pub fn active_count(&self) -> usize {
        self.sources.iter().filter(|s| s.enabled).count()
    }

    /// All sources in insertion order.
    pub fn snapshot(&self) -> &[Source] {
        &self.sources
    }

    pub fn get(&self, id: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn disable_matching(&mut self, needle: &str) -> Option<String> {
        match self.find(needle) {
            Some(index) => {
                let source = &mut self.sources[index];
                source.enabled = false;
                Some(source.id.clone())
            }
            None => {
                warn!(needle, "no source matches, nothing to disable");
                None
            }
        }
    }

    fn find(&self, needle: &str) -> Option<usize> {
        if needle.is_empty() {
            return None;
        }
        self.sources.iter().position(|s| s.uri.contains(needle))
    }

    fn next_id(&self) -> String {
        let mut index = self.sources.len() as u32;
        loop {
            let id = source_id(index);
            if self.get(&id).is_none() {
                return id;
            }
            index += 1;
        }
    }
}
