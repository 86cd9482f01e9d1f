//! Agent engine wiring and settings.

use crate::executor::{WorkExecutor, WorkItem};
use crate::watcher::ClaimWatcher;
use gavel_blackboard::Blackboard;
use gavel_core::{BidType, ClaimStatus, GavelError, GavelResult, GrantType};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

const DEFAULT_WORKSPACE: &str = "/workspace";
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_OUTPUT_CAP: usize = 10 * 1024 * 1024;

/// Identity and execution settings for one agent.
///
/// Inside worker containers these come from the launch environment
/// ([`AgentSettings::from_env`]); tests build them directly.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub instance: String,
    /// Agent name; equals the configured role.
    pub agent_name: String,
    /// Tool command for granted work.
    pub command: Vec<String>,
    pub bid_script: Option<Vec<String>>,
    pub bidding_strategy: Option<BidType>,
    pub workspace_dir: PathBuf,
    /// Domain type whose payloads are verified with `git cat-file -e`.
    pub commit_validator_type: Option<String>,
    pub tool_timeout: Duration,
    /// Per-stream stdout/stderr byte cap.
    pub output_cap: usize,
}

impl AgentSettings {
    /// Settings with defaults: `/workspace`, a 5 minute tool timeout,
    /// 10 MiB output caps, no bid script, no commit validator.
    pub fn new(
        instance: impl Into<String>,
        agent_name: impl Into<String>,
        command: Vec<String>,
    ) -> Self {
        Self {
            instance: instance.into(),
            agent_name: agent_name.into(),
            command,
            bid_script: None,
            bidding_strategy: None,
            workspace_dir: PathBuf::from(DEFAULT_WORKSPACE),
            commit_validator_type: None,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            output_cap: DEFAULT_OUTPUT_CAP,
        }
    }

    /// Read settings from the worker-launch environment contract:
    /// `INSTANCE_NAME`, `AGENT_NAME`, `AGENT_COMMAND` (JSON array),
    /// `AGENT_BID_SCRIPT` (JSON array, optional), `BIDDING_STRATEGY`
    /// (optional).
    pub fn from_env() -> GavelResult<Self> {
        let instance = require_env("INSTANCE_NAME")?;
        let agent_name = require_env("AGENT_NAME")?;
        let command: Vec<String> = serde_json::from_str(&require_env("AGENT_COMMAND")?)
            .map_err(|e| GavelError::Config(format!("AGENT_COMMAND is not a JSON array: {e}")))?;

        let mut settings = Self::new(instance, agent_name, command);
        if let Ok(raw) = std::env::var("AGENT_BID_SCRIPT") {
            settings.bid_script = Some(serde_json::from_str(&raw).map_err(|e| {
                GavelError::Config(format!("AGENT_BID_SCRIPT is not a JSON array: {e}"))
            })?);
        }
        if let Ok(raw) = std::env::var("BIDDING_STRATEGY") {
            settings.bidding_strategy = Some(BidType::parse(&raw).ok_or_else(|| {
                GavelError::Config(format!("unknown BIDDING_STRATEGY '{raw}'"))
            })?);
        }
        Ok(settings)
    }

    /// Set the bid-script command.
    pub fn with_bid_script(mut self, script: Vec<String>) -> Self {
        self.bid_script = Some(script);
        self
    }

    /// Set the static bidding strategy.
    pub fn with_bidding_strategy(mut self, strategy: BidType) -> Self {
        self.bidding_strategy = Some(strategy);
        self
    }

    /// Set the working directory for tool subprocesses.
    pub fn with_workspace(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_dir = dir.into();
        self
    }

    /// Set the domain type whose payloads are verified as git objects.
    pub fn with_commit_validator(mut self, artefact_type: impl Into<String>) -> Self {
        self.commit_validator_type = Some(artefact_type.into());
        self
    }

    /// Set the tool subprocess timeout.
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }
}

fn require_env(key: &str) -> GavelResult<String> {
    std::env::var(key).map_err(|_| GavelError::Config(format!("{key} is not set")))
}

/// The agent worker engine: claim watcher + work executor over a
/// capacity-1 queue.
pub struct AgentEngine {
    blackboard: Arc<dyn Blackboard>,
    settings: AgentSettings,
    shutdown: CancellationToken,
}

impl AgentEngine {
    /// Build an engine for one agent identity.
    pub fn new(
        blackboard: Arc<dyn Blackboard>,
        settings: AgentSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            blackboard,
            settings,
            shutdown,
        }
    }

    /// Run watcher and executor until shutdown.
    pub async fn run(&self) -> GavelResult<()> {
        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(1);
        let watcher = ClaimWatcher::new(
            Arc::clone(&self.blackboard),
            self.settings.clone(),
            self.shutdown.clone(),
        );
        let executor = WorkExecutor::new(
            Arc::clone(&self.blackboard),
            self.settings.clone(),
            self.shutdown.clone(),
        );

        info!(agent = %self.settings.agent_name, instance = %self.settings.instance, "agent engine starting");
        let watch = watcher.run(work_tx);
        let work = async {
            executor.run(work_rx).await;
            Ok::<(), GavelError>(())
        };
        tokio::try_join!(watch, work)?;
        Ok(())
    }

    /// One-shot worker mode: execute a single granted claim and return.
    /// This is the entrypoint worker containers run with
    /// `--execute-claim <id>`.
    pub async fn execute_claim(&self, claim_id: Uuid) -> GavelResult<()> {
        let claim = self.blackboard.get_claim(claim_id).await?;
        let me = self.settings.agent_name.as_str();

        let claim_type = if claim.status == ClaimStatus::PendingAssignment
            && claim.granted_exclusive_agent.as_deref() == Some(me)
        {
            GrantType::Exclusive
        } else {
            claim
                .grant_for(me)
                .map(GrantType::from)
                .ok_or_else(|| {
                    GavelError::Agent(format!("claim {claim_id} does not grant agent '{me}'"))
                })?
        };

        let executor = WorkExecutor::new(
            Arc::clone(&self.blackboard),
            self.settings.clone(),
            self.shutdown.clone(),
        );
        executor.execute(&WorkItem { claim, claim_type }).await
    }
}
