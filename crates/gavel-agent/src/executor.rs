//! Work execution: drive the agent tool subprocess and post results.
//!
//! The executor owns the subprocess contract: tool input JSON on stdin
//! (closed after write), exactly one JSON object on stdout, exit 0, 5
//! minute timeout, 10 MiB output caps. Every failure path produces a
//! Failure artefact with structured diagnostics and the executor moves on
//! to the next work item.

use crate::context::assemble_context;
use crate::engine::AgentSettings;
use gavel_blackboard::Blackboard;
use gavel_core::{Artefact, Claim, ClaimStatus, GavelResult, GrantType, StructuralType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const FAILURE_TYPE: &str = "ToolFailure";
const STDOUT_SNIPPET_MAX: usize = 50_000;
const STDERR_SNIPPET_MAX: usize = 10_000;

/// One granted claim handed from the watcher to the executor.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub claim: Claim,
    pub claim_type: GrantType,
}

/// JSON handed to the tool on stdin.
#[derive(Serialize)]
struct ToolInput<'a> {
    claim_type: String,
    target_artefact: &'a Artefact,
    context_chain: &'a [Artefact],
}

/// JSON the tool must print on stdout.
#[derive(Debug, Deserialize)]
struct ToolOutput {
    artefact_type: String,
    artefact_payload: String,
    summary: String,
    #[serde(default)]
    structural_type: Option<StructuralType>,
}

/// Structured diagnostics carried by ToolFailure artefacts.
#[derive(Debug, Serialize)]
struct Diagnostics {
    reason: String,
    exit_code: Option<i64>,
    stdout: String,
    stderr: String,
    error: String,
}

impl Diagnostics {
    fn new(reason: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: error.into(),
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}... [truncated, {} total bytes]", &s[..max_len], s.len())
    }
}

/// Executes granted work items one at a time.
pub struct WorkExecutor {
    blackboard: Arc<dyn Blackboard>,
    settings: AgentSettings,
    shutdown: CancellationToken,
}

impl WorkExecutor {
    /// Build an executor for one agent identity.
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

    /// Drain the work queue until shutdown.
    pub async fn run(&self, mut work_rx: mpsc::Receiver<WorkItem>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                item = work_rx.recv() => match item {
                    Some(item) => {
                        if let Err(e) = self.execute(&item).await {
                            error!(claim_id = %item.claim.id, error = %e, "work execution failed");
                        }
                    }
                    None => return,
                },
            }
        }
    }

    /// Execute one granted claim end to end.
    pub async fn execute(&self, item: &WorkItem) -> GavelResult<()> {
        let claim = &item.claim;
        let target = match self.blackboard.get_artefact(claim.artefact_id).await {
            Ok(target) => target,
            Err(e) => {
                return self
                    .post_failure(
                        claim,
                        Diagnostics::new("target artefact fetch failed", e.to_string()),
                    )
                    .await;
            }
        };

        let context = assemble_context(self.blackboard.as_ref(), &target, claim).await;
        let input = ToolInput {
            claim_type: item.claim_type.to_string(),
            target_artefact: &target,
            context_chain: &context,
        };
        let input_json = serde_json::to_string(&input)?;

        info!(
            claim_id = %claim.id,
            claim_type = %item.claim_type,
            context_len = context.len(),
            "executing claim"
        );

        let output = match self.run_tool(&input_json).await {
            Ok(output) => output,
            Err(diag) => return self.post_failure(claim, diag).await,
        };

        if let Some(validator) = &self.settings.commit_validator_type {
            if output.artefact_type == *validator {
                if let Err(reason) =
                    validate_commit(&self.settings.workspace_dir, &output.artefact_payload).await
                {
                    return self
                        .post_failure(
                            claim,
                            Diagnostics::new("commit validation failed", reason),
                        )
                        .await;
                }
            }
        }

        self.create_result_artefact(claim, &target, output).await
    }

    /// Spawn the tool subprocess and enforce the I/O contract.
    async fn run_tool(&self, input: &str) -> Result<ToolOutput, Diagnostics> {
        let Some((program, args)) = self.settings.command.split_first() else {
            return Err(Diagnostics::new("no tool command configured", ""));
        };

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .current_dir(&self.settings.workspace_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Diagnostics::new("tool spawn failed", e.to_string()))?;

        // Owned stdin writer; dropping the handle closes the pipe.
        let stdin = child.stdin.take();
        let stdin_payload = input.to_string();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(stdin_payload.as_bytes()).await {
                    debug!(error = %e, "tool stdin write failed");
                }
            }
        });

        let cap = self.settings.output_cap;
        let stdout_handle = child
            .stdout
            .take()
            .map(|r| tokio::spawn(read_capped(r, cap)));
        let stderr_handle = child
            .stderr
            .take()
            .map(|r| tokio::spawn(read_capped(r, cap)));

        let mut timed_out = false;
        let status = tokio::select! {
            _ = self.shutdown.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(Diagnostics::new("tool cancelled by shutdown", ""));
            }
            waited = tokio::time::timeout(self.settings.tool_timeout, child.wait()) => {
                match waited {
                    Ok(Ok(status)) => Some(status),
                    Ok(Err(e)) => {
                        return Err(Diagnostics::new("tool wait failed", e.to_string()));
                    }
                    Err(_) => {
                        timed_out = true;
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        None
                    }
                }
            }
        };

        let _ = writer.await;
        let (stdout, stdout_truncated) = match stdout_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Default::default(),
        };
        let (stderr, stderr_truncated) = match stderr_handle {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Default::default(),
        };
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        let snip = |diag: Diagnostics| Diagnostics {
            stdout: truncate(&stdout, STDOUT_SNIPPET_MAX),
            stderr: truncate(&stderr, STDERR_SNIPPET_MAX),
            ..diag
        };

        if timed_out {
            return Err(snip(Diagnostics::new(
                format!(
                    "tool timed out after {}s",
                    self.settings.tool_timeout.as_secs()
                ),
                "",
            )));
        }

        let exit_code = status.and_then(|s| s.code()).map(i64::from);
        if exit_code != Some(0) {
            let mut diag = snip(Diagnostics::new("tool exited with non-zero status", ""));
            diag.exit_code = exit_code;
            return Err(diag);
        }

        if stdout_truncated || stderr_truncated {
            return Err(snip(Diagnostics::new(
                "tool output exceeded size cap",
                format!("cap is {} bytes per stream", cap),
            )));
        }

        match serde_json::from_str::<ToolOutput>(stdout.trim()) {
            Ok(output) => Ok(output),
            Err(e) => Err(snip(Diagnostics::new(
                "tool output is not a single JSON object",
                e.to_string(),
            ))),
        }
    }

    /// Post the result artefact: rework for pre-assigned claims, a fresh
    /// thread otherwise.
    async fn create_result_artefact(
        &self,
        claim: &Claim,
        target: &Artefact,
        output: ToolOutput,
    ) -> GavelResult<()> {
        let artefact = if claim.status == ClaimStatus::PendingAssignment {
            if output.artefact_type != target.artefact_type {
                debug!(
                    produced = %output.artefact_type,
                    kept = %target.artefact_type,
                    "rework keeps the target's domain type"
                );
            }
            let mut sources = vec![target.id];
            sources.extend(claim.additional_context_ids.iter().copied());
            Artefact::next_version(
                target,
                output.artefact_payload,
                sources,
                &self.settings.agent_name,
            )
        } else {
            Artefact::new_thread(
                output.structural_type.unwrap_or(StructuralType::Standard),
                output.artefact_type,
                output.artefact_payload,
                vec![claim.artefact_id],
                &self.settings.agent_name,
            )
        };

        self.blackboard.create_artefact(&artefact).await?;
        self.blackboard
            .add_version_to_thread(artefact.logical_id, artefact.id, artefact.version)
            .await?;
        info!(
            claim_id = %claim.id,
            artefact_id = %artefact.id,
            version = artefact.version,
            summary = %output.summary,
            "result artefact posted"
        );
        Ok(())
    }

    async fn post_failure(&self, claim: &Claim, diag: Diagnostics) -> GavelResult<()> {
        warn!(claim_id = %claim.id, reason = %diag.reason, "posting failure artefact");
        let artefact = Artefact::failure(
            FAILURE_TYPE,
            serde_json::to_string(&diag)?,
            vec![claim.artefact_id],
            &self.settings.agent_name,
        );
        self.blackboard.create_artefact(&artefact).await?;
        self.blackboard
            .add_version_to_thread(artefact.logical_id, artefact.id, artefact.version)
            .await
    }
}

/// Read a stream up to `cap` bytes; past the cap, keep draining (so the
/// child never stalls on a full pipe) but discard and mark truncated.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return (buf, truncated),
            Ok(n) => {
                if truncated {
                    continue;
                }
                if buf.len() + n > cap {
                    buf.extend_from_slice(&chunk[..cap - buf.len()]);
                    truncated = true;
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
            Err(_) => return (buf, truncated),
        }
    }
}

/// Verify a commit-like payload exists in the workspace repository.
async fn validate_commit(workspace: &Path, payload: &str) -> Result<(), String> {
    let object = payload.trim();
    if object.is_empty() {
        return Err("empty commit reference".to_string());
    }
    let output = tokio::process::Command::new("git")
        .args(["cat-file", "-e", object])
        .current_dir(workspace)
        .output()
        .await
        .map_err(|e| format!("git cat-file spawn failed: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "git cat-file -e {object} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gavel_blackboard::{MemoryBlackboard, Subscription};
    use std::time::Duration;

    fn settings(command: Vec<String>) -> AgentSettings {
        AgentSettings::new("test", "coder", command)
            .with_workspace(std::env::temp_dir())
            .with_tool_timeout(Duration::from_secs(5))
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn seeded_claim(bb: &MemoryBlackboard) -> (Claim, Artefact) {
        let target = Artefact::new_thread(
            StructuralType::Standard,
            "GoalDefined",
            "build the thing",
            vec![],
            "cli",
        );
        bb.create_artefact(&target).await.unwrap();
        bb.add_version_to_thread(target.logical_id, target.id, target.version)
            .await
            .unwrap();
        let claim = Claim::for_artefact(target.id);
        bb.create_claim(&claim).await.unwrap();
        (claim, target)
    }

    /// Subscribe before executing; everything published afterwards can be
    /// drained synchronously once the executor returns.
    async fn watch(bb: &MemoryBlackboard) -> Subscription {
        bb.subscribe(&bb.keys().artefact_events()).await.unwrap()
    }

    fn drain(sub: &mut Subscription) -> Vec<Artefact> {
        let mut produced = Vec::new();
        while let Ok(payload) = sub.messages.try_recv() {
            produced.push(serde_json::from_str(&payload).unwrap());
        }
        produced
    }

    #[tokio::test]
    async fn test_happy_path_posts_new_thread_artefact() {
        let bb = Arc::new(MemoryBlackboard::new("test"));
        let (claim, target) = seeded_claim(&bb).await;
        let mut events = watch(&bb).await;

        let tool = sh(
            r#"cat > /dev/null; echo '{"artefact_type":"CodeCommit","artefact_payload":"abc123","summary":"did the thing"}'"#,
        );
        let executor = WorkExecutor::new(bb.clone(), settings(tool), CancellationToken::new());
        executor
            .execute(&WorkItem {
                claim: claim.clone(),
                claim_type: GrantType::Exclusive,
            })
            .await
            .unwrap();

        let produced = drain(&mut events);
        assert_eq!(produced.len(), 1);
        let result = &produced[0];
        assert_eq!(result.artefact_type, "CodeCommit");
        assert_eq!(result.version, 1);
        assert_eq!(result.logical_id, result.id);
        assert_eq!(result.source_artefacts, vec![target.id]);
        assert_eq!(result.produced_by_role, "coder");
        assert_eq!(result.payload, "abc123");
    }

    #[tokio::test]
    async fn test_rework_bumps_version_and_sources() {
        let bb = Arc::new(MemoryBlackboard::new("test"));
        let (_, target) = seeded_claim(&bb).await;
        let review_id = uuid::Uuid::new_v4();
        let feedback_claim = Claim::for_feedback(target.id, "coder", vec![review_id]);
        bb.create_assignment_claim(&feedback_claim).await.unwrap();
        let mut events = watch(&bb).await;

        let tool = sh(
            r#"cat > /dev/null; echo '{"artefact_type":"GoalDefined","artefact_payload":"v2 body","summary":"reworked"}'"#,
        );
        let executor = WorkExecutor::new(bb.clone(), settings(tool), CancellationToken::new());
        executor
            .execute(&WorkItem {
                claim: feedback_claim,
                claim_type: GrantType::Exclusive,
            })
            .await
            .unwrap();

        let produced = drain(&mut events);
        assert_eq!(produced.len(), 1);
        let rework = &produced[0];
        assert_eq!(rework.logical_id, target.logical_id);
        assert_eq!(rework.version, 2);
        assert_eq!(rework.artefact_type, target.artefact_type);
        assert_eq!(rework.source_artefacts, vec![target.id, review_id]);

        let (latest_id, version) = bb.latest_version(target.logical_id).await.unwrap().unwrap();
        assert_eq!((latest_id, version), (rework.id, 2));
    }

    #[tokio::test]
    async fn test_nonzero_exit_posts_failure() {
        let bb = Arc::new(MemoryBlackboard::new("test"));
        let (claim, target) = seeded_claim(&bb).await;
        let mut events = watch(&bb).await;

        let tool = sh("cat > /dev/null; echo oops >&2; exit 7");
        let executor = WorkExecutor::new(bb.clone(), settings(tool), CancellationToken::new());
        executor
            .execute(&WorkItem {
                claim,
                claim_type: GrantType::Exclusive,
            })
            .await
            .unwrap();

        let produced = drain(&mut events);
        assert_eq!(produced.len(), 1);
        let failure = &produced[0];
        assert_eq!(failure.structural_type, StructuralType::Failure);
        assert_eq!(failure.artefact_type, FAILURE_TYPE);
        assert_eq!(failure.source_artefacts, vec![target.id]);
        let diag: serde_json::Value = serde_json::from_str(&failure.payload).unwrap();
        assert_eq!(diag["exit_code"], 7);
        assert!(diag["stderr"].as_str().unwrap().contains("oops"));
    }

    #[tokio::test]
    async fn test_malformed_output_posts_failure() {
        let bb = Arc::new(MemoryBlackboard::new("test"));
        let (claim, _) = seeded_claim(&bb).await;
        let mut events = watch(&bb).await;

        let tool = sh("cat > /dev/null; echo not-json");
        let executor = WorkExecutor::new(bb.clone(), settings(tool), CancellationToken::new());
        executor
            .execute(&WorkItem {
                claim,
                claim_type: GrantType::Exclusive,
            })
            .await
            .unwrap();

        let produced = drain(&mut events);
        let diag: serde_json::Value = serde_json::from_str(&produced[0].payload).unwrap();
        assert!(diag["reason"]
            .as_str()
            .unwrap()
            .contains("not a single JSON object"));
    }

    #[tokio::test]
    async fn test_trailing_junk_after_json_is_malformed() {
        let bb = Arc::new(MemoryBlackboard::new("test"));
        let (claim, _) = seeded_claim(&bb).await;
        let mut events = watch(&bb).await;

        let tool = sh(
            r#"cat > /dev/null; echo '{"artefact_type":"A","artefact_payload":"p","summary":"s"} extra'"#,
        );
        let executor = WorkExecutor::new(bb.clone(), settings(tool), CancellationToken::new());
        executor
            .execute(&WorkItem {
                claim,
                claim_type: GrantType::Exclusive,
            })
            .await
            .unwrap();

        let produced = drain(&mut events);
        assert_eq!(produced[0].artefact_type, FAILURE_TYPE);
    }

    #[tokio::test]
    async fn test_timeout_posts_failure() {
        let bb = Arc::new(MemoryBlackboard::new("test"));
        let (claim, _) = seeded_claim(&bb).await;
        let mut events = watch(&bb).await;

        let tool = sh("cat > /dev/null; sleep 30");
        let executor = WorkExecutor::new(
            bb.clone(),
            settings(tool).with_tool_timeout(Duration::from_millis(200)),
            CancellationToken::new(),
        );
        executor
            .execute(&WorkItem {
                claim,
                claim_type: GrantType::Exclusive,
            })
            .await
            .unwrap();

        let produced = drain(&mut events);
        let diag: serde_json::Value = serde_json::from_str(&produced[0].payload).unwrap();
        assert!(diag["reason"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_oversize_output_posts_failure() {
        let bb = Arc::new(MemoryBlackboard::new("test"));
        let (claim, _) = seeded_claim(&bb).await;
        let mut events = watch(&bb).await;

        // ~64 KiB of output against a 1 KiB cap.
        let tool = sh("cat > /dev/null; head -c 65536 /dev/zero | tr '\\0' 'x'");
        let mut s = settings(tool);
        s.output_cap = 1024;
        let executor = WorkExecutor::new(bb.clone(), s, CancellationToken::new());
        executor
            .execute(&WorkItem {
                claim,
                claim_type: GrantType::Exclusive,
            })
            .await
            .unwrap();

        let produced = drain(&mut events);
        let diag: serde_json::Value = serde_json::from_str(&produced[0].payload).unwrap();
        assert!(diag["reason"].as_str().unwrap().contains("size cap"));
    }

    #[tokio::test]
    async fn test_tool_receives_input_envelope() {
        let bb = Arc::new(MemoryBlackboard::new("test"));
        let (claim, _) = seeded_claim(&bb).await;
        let mut events = watch(&bb).await;

        // The tool checks the envelope fields before answering.
        let tool = sh(
            r#"input=$(cat); echo "$input" | grep -q '"claim_type":"exclusive"' && echo "$input" | grep -q '"target_artefact"' && echo '{"artefact_type":"Checked","artefact_payload":"ok","summary":"s"}' || exit 9"#,
        );
        let executor = WorkExecutor::new(bb.clone(), settings(tool), CancellationToken::new());
        executor
            .execute(&WorkItem {
                claim,
                claim_type: GrantType::Exclusive,
            })
            .await
            .unwrap();

        let produced = drain(&mut events);
        assert_eq!(produced[0].artefact_type, "Checked");
    }

    #[tokio::test]
    async fn test_commit_validation_failure_short_circuits() {
        let bb = Arc::new(MemoryBlackboard::new("test"));
        let (claim, _) = seeded_claim(&bb).await;
        let mut events = watch(&bb).await;

        // The workspace is not a git repository, so cat-file must fail.
        let workspace = tempfile::tempdir().unwrap();
        let tool = sh(
            r#"cat > /dev/null; echo '{"artefact_type":"CodeCommit","artefact_payload":"0123456789abcdef","summary":"s"}'"#,
        );
        let s = settings(tool)
            .with_workspace(workspace.path())
            .with_commit_validator("CodeCommit");
        let executor = WorkExecutor::new(bb.clone(), s, CancellationToken::new());
        executor
            .execute(&WorkItem {
                claim,
                claim_type: GrantType::Exclusive,
            })
            .await
            .unwrap();

        let produced = drain(&mut events);
        assert_eq!(produced[0].artefact_type, FAILURE_TYPE);
        let diag: serde_json::Value = serde_json::from_str(&produced[0].payload).unwrap();
        assert!(diag["reason"]
            .as_str()
            .unwrap()
            .contains("commit validation failed"));
    }

    #[tokio::test]
    async fn test_missing_target_posts_failure() {
        let bb = Arc::new(MemoryBlackboard::new("test"));
        let claim = Claim::for_artefact(uuid::Uuid::new_v4());
        let mut events = watch(&bb).await;

        let executor = WorkExecutor::new(
            bb.clone(),
            settings(sh("true")),
            CancellationToken::new(),
        );
        executor
            .execute(&WorkItem {
                claim,
                claim_type: GrantType::Exclusive,
            })
            .await
            .unwrap();

        let produced = drain(&mut events);
        let diag: serde_json::Value = serde_json::from_str(&produced[0].payload).unwrap();
        assert!(diag["reason"].as_str().unwrap().contains("fetch failed"));
    }
}
