// ABOUTME: Wires a loaded Config into a ready orchestrator: store, engine, audit, skills, MCP, policy.
// ABOUTME: Shared by the HTTP server and the CLI so both run turns the same way.

use anyhow::{Context, Result};
use parley_core::audit::{AuditSink, JsonlAuditSink, NoopAuditSink};
use parley_core::config::Config;
use parley_core::mcp::McpCatalog;
use parley_core::policy::ToolPermissionPolicy;
use parley_core::resolver::ResolverDefaults;
use parley_core::skills::DirectorySkillSync;
use parley_core::{ContentStore, EngineRegistry, Orchestrator, SqliteStore};
use std::sync::Arc;

/// Open (or create) the session database under the workspace
pub fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let workspace = config.workspace_dir();
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;
    let store = SqliteStore::open(config.database_path())?;
    tracing::debug!(path = %config.database_path().display(), "Session store opened");
    Ok(Arc::new(store))
}

/// Build the orchestrator described by `config` on top of `store`.
///
/// Must run inside a tokio runtime because the engine spawns its worker here.
pub fn build_orchestrator(config: &Config, store: Arc<dyn ContentStore>) -> Result<Orchestrator> {
    let engine = EngineRegistry::default()
        .create(&config.engine.engine_type, &config.engine.factory_config())
        .context("Failed to create engine")?;

    let audit: Arc<dyn AuditSink> = if config.audit.enabled {
        Arc::new(JsonlAuditSink::new(config.audit_dir())?)
    } else {
        Arc::new(NoopAuditSink)
    };

    let catalog = match McpCatalog::load(&config.project_dir()) {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "Ignoring unreadable MCP descriptor");
            McpCatalog::default()
        }
    };

    tracing::info!(
        engine = engine.name(),
        model = %config.defaults.model,
        audit = config.audit.enabled,
        mcp_servers = catalog.names().len(),
        skills_dir = %config.skills_dir().display(),
        "Orchestrator configured"
    );

    Ok(Orchestrator::new(store, engine)
        .with_audit(audit)
        .with_skill_sync(Arc::new(DirectorySkillSync::new(config.skills_dir())))
        .with_policy(ToolPermissionPolicy::new(config.policy.unmatched_tools))
        .with_defaults(ResolverDefaults {
            model: config.defaults.model.clone(),
            allowed_tools: config.defaults.allowed_tools.clone(),
            sessions_root: config.sessions_root(),
        })
        .with_mcp_catalog(catalog))
}
