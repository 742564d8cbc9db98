use indexmap::IndexMap;
use std::collections::HashMap;

/// A single proxy node as parsed from an airport subscription.
///
/// `params` holds every trailing `k=v` attribute for lookup and overwrite;
/// `param_string` keeps the original comma-joined attribute text so the
/// publisher can reproduce the upstream ordering byte-for-byte.
#[derive(Debug, Clone)]
pub struct Node {
    pub origin_name: String,
    pub kind: String,
    pub server: String,
    /// Kept verbatim as text to avoid lossy reformatting.
    pub port: String,
    pub params: IndexMap<String, String>,
    pub param_string: String,
    /// Airport name this node was fetched under.
    pub source: String,
    /// Two-letter egress country code, empty until egress succeeds.
    pub iso: String,
    pub emoji: String,
}

impl Node {
    /// Dedup identity. Two nodes with the same protocol, server and port
    /// are the same physical endpoint regardless of which airport sold them.
    pub fn dedup_key(&self) -> String {
        format!("{}|{}|{}", self.kind, self.server, self.port)
    }
}

/// Per-airport counters for one pipeline run.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stat {
    pub total: usize,
    pub duplicated: usize,
    pub failed: usize,
}

/// The single mutable datum threaded through the pipeline. Each stage owns
/// it exclusively for the duration of the stage.
#[derive(Debug, Default)]
pub struct UpdateContext {
    pub nodes: Vec<Node>,
    pub stats: HashMap<String, Stat>,
}

impl UpdateContext {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            stats: HashMap::new(),
        }
    }

    pub fn stat_mut(&mut self, source: &str) -> &mut Stat {
        self.stats.entry(source.to_string()).or_default()
    }
}
