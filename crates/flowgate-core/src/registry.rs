//! Tool registry — the queryable view of which server offers which tool.
//!
//! Readers take a cheap `Arc` snapshot; writers build a new map and swap it
//! in, so a query never observes a half-applied discovery.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::models::tool_server::ToolDescriptor;

/// One `(tool, owner)` row.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolRegistryEntry {
    pub tool_name: String,
    pub owner_server_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
    pub stale: bool,
}

#[derive(Debug, Clone, Default)]
struct ServerTools {
    tools: Vec<ToolDescriptor>,
    /// Last known capabilities of a server that is no longer connected.
    stale: bool,
}

type Snapshot = Arc<HashMap<String, ServerTools>>;

#[derive(Default)]
pub struct ToolRegistry {
    snapshot: RwLock<Snapshot>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Snapshot {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut HashMap<String, ServerTools>)) {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }

    /// Replace the server's tool set with the result of a fresh discovery.
    pub fn register_tools(&self, server_id: &str, tools: Vec<ToolDescriptor>) {
        tracing::debug!("[ToolRegistry] {} now offers {} tool(s)", server_id, tools.len());
        self.update(|map| {
            map.insert(server_id.to_string(), ServerTools { tools, stale: false });
        });
    }

    /// Keep the server's tools for auditing but hide them from default listings.
    pub fn mark_stale(&self, server_id: &str) {
        self.update(|map| {
            if let Some(entry) = map.get_mut(server_id) {
                entry.stale = true;
            }
        });
    }

    pub fn remove_server(&self, server_id: &str) {
        self.update(|map| {
            map.remove(server_id);
        });
    }

    /// Tool name → owning server ids. Stale servers are left out unless asked for.
    pub fn list_all_tools(&self, include_stale: bool) -> BTreeMap<String, BTreeSet<String>> {
        let snapshot = self.current();
        let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (server_id, entry) in snapshot.iter() {
            if entry.stale && !include_stale {
                continue;
            }
            for tool in &entry.tools {
                out.entry(tool.name.clone())
                    .or_default()
                    .insert(server_id.clone());
            }
        }
        out
    }

    /// The server's last discovered tools, stale or not.
    pub fn list_tools(&self, server_id: &str) -> Vec<ToolDescriptor> {
        self.current()
            .get(server_id)
            .map(|entry| entry.tools.clone())
            .unwrap_or_default()
    }

    /// Non-stale owners of a tool, sorted by server id.
    pub fn owners(&self, tool_name: &str) -> Vec<String> {
        self.list_all_tools(false)
            .remove(tool_name)
            .map(|owners| owners.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn is_stale(&self, server_id: &str) -> Option<bool> {
        self.current().get(server_id).map(|entry| entry.stale)
    }

    /// Flat rows, optionally filtered to one server, ordered by tool then owner.
    pub fn entries(&self, server_id: Option<&str>, include_stale: bool) -> Vec<ToolRegistryEntry> {
        let snapshot = self.current();
        let mut rows: Vec<ToolRegistryEntry> = snapshot
            .iter()
            .filter(|(id, entry)| {
                server_id.map_or(true, |s| s == id.as_str()) && (include_stale || !entry.stale)
            })
            .flat_map(|(id, entry)| {
                entry.tools.iter().map(move |tool| ToolRegistryEntry {
                    tool_name: tool.name.clone(),
                    owner_server_id: id.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                    stale: entry.stale,
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            a.tool_name
                .cmp(&b.tool_name)
                .then_with(|| a.owner_server_id.cmp(&b.owner_server_id))
        });
        rows
    }
}
