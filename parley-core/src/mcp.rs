// ABOUTME: Project-local MCP server catalog loaded from .mcp.json.
// ABOUTME: Resolves server names referenced by agents into engine server specs.

use anyhow::{Context, Result};
use parley_engine::McpServerSpec;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

pub const MCP_DESCRIPTOR_FILE: &str = ".mcp.json";

#[derive(Debug, Deserialize)]
struct McpDescriptor {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: BTreeMap<String, McpServerSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct McpCatalog {
    servers: BTreeMap<String, McpServerSpec>,
}

impl McpCatalog {
    /// Load `<project_dir>/.mcp.json`; a missing file yields an empty catalog
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(MCP_DESCRIPTOR_FILE);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No MCP descriptor file");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let catalog = Self::parse(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        tracing::info!(
            path = %path.display(),
            servers = catalog.servers.len(),
            "Loaded MCP server catalog"
        );
        Ok(catalog)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let descriptor: McpDescriptor = serde_json::from_str(content)?;
        Ok(Self {
            servers: descriptor.mcp_servers,
        })
    }

    pub fn from_servers(servers: BTreeMap<String, McpServerSpec>) -> Self {
        Self { servers }
    }

    pub fn names(&self) -> Vec<&str> {
        self.servers.keys().map(|k| k.as_str()).collect()
    }

    /// Look up each requested server, skipping unknown names with a warning
    pub fn select(&self, names: &[String]) -> BTreeMap<String, McpServerSpec> {
        let mut selected = BTreeMap::new();
        for name in names {
            match self.servers.get(name) {
                Some(spec) => {
                    selected.insert(name.clone(), spec.clone());
                }
                None => tracing::warn!(server = %name, "MCP server not found in descriptor, skipping"),
            }
        }
        selected
    }
}
