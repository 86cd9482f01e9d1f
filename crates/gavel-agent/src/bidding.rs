//! Bid decisions.
//!
//! A configured bid script receives the target artefact JSON on stdin and
//! must print exactly one of `review|claim|exclusive|ignore` on its first
//! stdout line and exit 0. Anything else falls back to the static
//! strategy, or `ignore` when none is configured.

use gavel_core::BidType;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Decide this agent's bid for a target artefact.
pub async fn decide_bid(
    artefact_json: &str,
    bid_script: Option<&[String]>,
    fallback: Option<BidType>,
) -> BidType {
    if let Some(script) = bid_script {
        match run_bid_script(script, artefact_json).await {
            Ok(bid) => return bid,
            Err(reason) => {
                warn!(reason = %reason, "bid script failed; using fallback strategy");
            }
        }
    }
    fallback.unwrap_or(BidType::Ignore)
}

async fn run_bid_script(script: &[String], artefact_json: &str) -> Result<BidType, String> {
    let (program, args) = script
        .split_first()
        .ok_or_else(|| "empty bid script".to_string())?;

    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("spawn failed: {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(artefact_json.as_bytes())
            .await
            .map_err(|e| format!("stdin write failed: {e}"))?;
        // Closing stdin signals end of input.
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("wait failed: {e}"))?;
    if !output.status.success() {
        return Err(format!("exit status {:?}", output.status.code()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let first_line = stdout.lines().next().unwrap_or_default();
    let bid = BidType::parse(first_line)
        .ok_or_else(|| format!("unrecognised bid output '{first_line}'"))?;
    debug!(bid = %bid, "bid script decided");
    Ok(bid)
}
