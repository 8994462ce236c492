//! Backend gateway: the only place phoque executes processes
//!
//! [`Gateway`] is the seam between the reconciliation logic and the live
//! packet filter. [`IptablesGateway`] runs the configured iptables binary
//! (elevated when needed); tests substitute an in-memory recorder.
//!
//! No retries are performed. A non-zero exit is reported verbatim as
//! [`Error::Backend`], except that a delete which matched nothing is
//! reported as [`ExecOutcome::Missing`] so cleanup stays idempotent.

use crate::core::compiler::{IptablesCommand, Verb};
use crate::core::error::{Error, Result};
use crate::core::firewall::Chain;
use std::future::Future;
use std::process::Stdio;
use tracing::{debug, error, warn};

/// Result of a command the backend accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The entry was appended or removed
    Applied,
    /// A delete found no matching entry (treated as success)
    Missing,
}

/// Executes compiled commands against the packet filter
pub trait Gateway: Send + Sync {
    /// Runs one command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] on a non-zero exit that is not a
    /// missing-entry delete, or another error if the process could not run.
    fn execute(&self, command: &IptablesCommand)
    -> impl Future<Output = Result<ExecOutcome>> + Send;

    /// Lists a chain's entries in `iptables -S` form, policy line included.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if the listing fails.
    fn list_chain(&self, chain: Chain) -> impl Future<Output = Result<Vec<String>>> + Send;
}

/// Returns `true` if iptables' diagnostic means "no such entry to delete".
///
/// A missing chain, target or match module is a real failure: the delete
/// never looked for the entry.
pub fn is_missing_entry(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    if lower.contains("no chain/target/match by that name") || lower.contains("chain '") {
        return false;
    }
    lower.contains("does a matching rule exist")
        || lower.contains("bad rule")
        || lower.contains("does not exist")
}

/// [`Gateway`] backed by the iptables command-line tool
#[derive(Debug, Clone)]
pub struct IptablesGateway {
    program: String,
}

impl IptablesGateway {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, args: &[String]) -> Result<std::process::Output> {
        let mut cmd = crate::elevation::create_elevated_iptables_command(&self.program, args)
            .map_err(|e| Error::Elevation(e.to_string()))?;

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                error!("Failed to spawn {}: {e}", self.program);
                Error::Internal(format!("Failed to spawn {}: {e}", self.program))
            })
    }

    fn backend_error(&self, args: &[String], output: &std::process::Output) -> Error {
        Error::Backend {
            command: format!("{} {}", self.program, args.join(" ")),
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

impl Gateway for IptablesGateway {
    async fn execute(&self, command: &IptablesCommand) -> Result<ExecOutcome> {
        let args = command.to_args();
        debug!(chain = %command.chain(), "{} {}", self.program, args.join(" "));

        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(ExecOutcome::Applied);
        }

        let err = self.backend_error(&args, &output);
        if command.verb() == Verb::Delete
            && err.backend_stderr().is_some_and(is_missing_entry)
        {
            debug!(tag = command.tag().unwrap_or_default(), "Delete matched no live entry");
            return Ok(ExecOutcome::Missing);
        }

        warn!("{err}");
        Err(err)
    }

    async fn list_chain(&self, chain: Chain) -> Result<Vec<String>> {
        let args = vec!["-S".to_string(), chain.as_str().to_string()];
        let output = self.run(&args).await?;

        if !output.status.success() {
            let err = self.backend_error(&args, &output);
            warn!("Listing {chain} failed: {err}");
            return Err(err);
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}
