//! Instance configuration: schema, TOML loading, and validation.
//!
//! A configuration names the registered agents by role. Roles are unique
//! by construction (they are the map key) and consensus waits on exactly
//! this set, so a stale configuration entry will stall claims until the
//! agent is removed or starts bidding.

use crate::bid::BidType;
use crate::error::{GavelError, GavelResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const SUPPORTED_VERSION: &str = "1.0";
const MAX_ROLE_LEN: usize = 64;

/// Top-level instance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Schema version; only `"1.0"` is accepted.
    pub version: String,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Role → agent definition. The key is the agent's role and name.
    pub agents: BTreeMap<String, AgentConfig>,
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Review feedback rounds allowed per logical thread. 0 = unlimited.
    #[serde(default = "default_max_review_iterations")]
    pub max_review_iterations: u32,
}

fn default_max_review_iterations() -> u32 {
    3
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_review_iterations: default_max_review_iterations(),
        }
    }
}

/// How an agent participates in granting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// The agent only bids; exclusive wins launch an ephemeral worker
    /// container instead of notifying the agent.
    Controller,
}

/// Workspace mount mode for agent and worker containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    Ro,
    Rw,
}

/// Workspace settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub mode: WorkspaceMode,
}

/// Container reuse strategy for long-lived agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStrategy {
    Reuse,
    FreshPerCall,
}

/// Resource limits for an agent container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
}

/// Ephemeral worker settings for controller agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Image launched per granted claim.
    pub image: String,
    /// Per-role concurrency cap.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Tool command run inside the worker.
    pub command: Vec<String>,
    #[serde(default)]
    pub workspace: Option<WorkspaceConfig>,
}

fn default_max_concurrent() -> usize {
    1
}

/// Health-check settings for an agent container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
}

/// One agent definition, keyed by role in [`InstanceConfig::agents`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub image: String,
    /// Optional build context for locally-built images.
    #[serde(default)]
    pub build: Option<String>,
    /// Tool command executed for granted work.
    pub command: Vec<String>,
    /// Bid-script command; stdin = target artefact JSON, stdout line one =
    /// bid type.
    #[serde(default)]
    pub bid_script: Option<Vec<String>>,
    #[serde(default)]
    pub workspace: Option<WorkspaceConfig>,
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub strategy: Option<AgentStrategy>,
    /// Static bid when no bid script is configured (or as its fallback).
    #[serde(default)]
    pub bidding_strategy: Option<BidType>,
    /// Extra `KEY=VALUE` pairs for the agent container.
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub resources: Option<ResourceConfig>,
    /// Free-form prompt material, opaque to the core.
    #[serde(default)]
    pub prompts: Option<serde_json::Value>,
    #[serde(default)]
    pub mode: Option<AgentMode>,
    #[serde(default)]
    pub worker: Option<WorkerConfig>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

impl AgentConfig {
    /// Whether this agent is a controller (bids only; work runs in
    /// ephemeral workers).
    pub fn is_controller(&self) -> bool {
        matches!(self.mode, Some(AgentMode::Controller))
    }
}

impl InstanceConfig {
    /// Parse and validate a TOML configuration document.
    pub fn from_toml_str(input: &str) -> GavelResult<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| GavelError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse, and validate a TOML configuration file.
    pub fn from_toml_file(path: &Path) -> GavelResult<Self> {
        let input = std::fs::read_to_string(path).map_err(|e| {
            GavelError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&input)
    }

    /// Validate the schema rules that serde cannot express.
    pub fn validate(&self) -> GavelResult<()> {
        if self.version != SUPPORTED_VERSION {
            return Err(GavelError::Config(format!(
                "unsupported config version '{}' (expected '{SUPPORTED_VERSION}')",
                self.version
            )));
        }
        if self.agents.is_empty() {
            return Err(GavelError::Config("no agents configured".to_string()));
        }
        for (role, agent) in &self.agents {
            validate_role_name(role)?;
            if agent.bid_script.is_none() && agent.bidding_strategy.is_none() {
                return Err(GavelError::Config(format!(
                    "agent '{role}': either bid_script or bidding_strategy is required"
                )));
            }
            if let Some(script) = &agent.bid_script {
                if script.is_empty() {
                    return Err(GavelError::Config(format!(
                        "agent '{role}': bid_script must not be empty"
                    )));
                }
            }
            if agent.is_controller() && agent.worker.is_none() {
                return Err(GavelError::Config(format!(
                    "agent '{role}': mode = \"controller\" requires a worker table"
                )));
            }
            if let Some(worker) = &agent.worker {
                if worker.max_concurrent == 0 {
                    return Err(GavelError::Config(format!(
                        "agent '{role}': worker.max_concurrent must be at least 1"
                    )));
                }
            }
        }
        Ok(())
    }

    /// All registered agent names, sorted. Consensus waits on exactly this
    /// set.
    pub fn agent_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    /// The role an agent name maps to, if the agent is registered.
    ///
    /// Agent names equal their role key, but every conversion routes
    /// through here to keep the two concepts distinct.
    pub fn role_of(&self, agent: &str) -> Option<&str> {
        self.agents.get_key_value(agent).map(|(role, _)| role.as_str())
    }

    /// The agent registered for a role, if any.
    pub fn agent_for_role(&self, role: &str) -> Option<&AgentConfig> {
        self.agents.get(role)
    }

    /// Roles whose agents run in controller mode, sorted.
    pub fn controller_roles(&self) -> Vec<String> {
        self.agents
            .iter()
            .filter(|(_, a)| a.is_controller())
            .map(|(role, _)| role.clone())
            .collect()
    }
}

fn validate_role_name(role: &str) -> GavelResult<()> {
    if role.is_empty() {
        return Err(GavelError::Config("agent role must not be empty".to_string()));
    }
    if role.len() > MAX_ROLE_LEN {
        return Err(GavelError::Config(format!(
            "agent role '{role}' exceeds {MAX_ROLE_LEN} characters"
        )));
    }
    if !role.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(GavelError::Config(format!(
            "agent role '{role}' may only contain alphanumerics and hyphens"
        )));
    }
    Ok(())
}
