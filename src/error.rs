//! Error taxonomy for the image build pipeline.
//!
//! Every stage returns [`Result`]; only the pipeline controller decides
//! whether an error ends the run and only the controller starts teardown.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, BuildError>;

/// One failed attempt against a mirror endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedAttempt {
    pub endpoint: String,
    pub reason: String,
}

/// Errors produced by pipeline stages.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Every mirror endpoint failed. Retried across the list before surfacing.
    #[error("all {} mirror attempt(s) failed: {}", .attempts.len(), summarize_attempts(.attempts))]
    RetryableFetch { attempts: Vec<FailedAttempt> },

    /// Host is not fit to build (tool, privilege, disk space, network).
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A package the image cannot work without failed to install.
    #[error("essential package install failed ({}): {detail}", .packages.join(", "))]
    EssentialInstall { packages: Vec<String>, detail: String },

    /// A stage finished but the artifact it should have produced is missing.
    #[error("postcondition failed: {0}")]
    Postcondition(String),

    /// An external tool exited non-zero, could not be spawned, or timed out.
    #[error("{tool} failed (exit code {code}){}", fmt_stderr(.stderr))]
    ToolInvocation {
        tool: String,
        code: i32,
        stderr: String,
    },

    /// Operator interrupt or cancellation.
    #[error("interrupted")]
    Interrupted,

    /// Another build holds the build directory lock.
    #[error("build directory is locked by another process: {}", .path.display())]
    Locked { path: PathBuf },

    /// Invalid configuration or build context.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem failure with the operation and path that triggered it.
    #[error("{op} '{}': {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A non-fatal package failure. Never propagated; reported in the run summary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("optional package '{package}' skipped: {detail}")]
pub struct OptionalInstallError {
    pub package: String,
    pub detail: String,
}

impl BuildError {
    /// Build an [`BuildError::Io`] from an operation label and path.
    pub fn io(op: &'static str, path: impl AsRef<Path>, source: io::Error) -> Self {
        BuildError::Io {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether repeating the failed operation may succeed.
    ///
    /// Network-facing failures and tool failures reporting transient network
    /// conditions qualify; everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        match self {
            BuildError::RetryableFetch { .. } => true,
            BuildError::ToolInvocation { stderr, .. } => looks_transient(stderr),
            _ => false,
        }
    }

    /// Short machine-readable category used in summaries and exit codes.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::RetryableFetch { .. } => "fetch",
            BuildError::Precondition(_) => "precondition",
            BuildError::EssentialInstall { .. } => "essential_install",
            BuildError::Postcondition(_) => "postcondition",
            BuildError::ToolInvocation { .. } => "tool_invocation",
            BuildError::Interrupted => "interrupted",
            BuildError::Locked { .. } => "locked",
            BuildError::Config(_) => "config",
            BuildError::Io { .. } => "io",
        }
    }
}

/// Heuristic for network/index staleness in tool output.
pub(crate) fn looks_transient(output: &str) -> bool {
    let msg = output.to_lowercase();
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("temporary failure")
        || msg.contains("temporarily unavailable")
        || msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("could not resolve")
        || msg.contains("hash sum mismatch")
        || msg.contains("try again")
        || msg.contains("503")
        || msg.contains("502")
        || msg.contains("504")
}

fn summarize_attempts(attempts: &[FailedAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("[{}: {}]", a.endpoint, a.reason))
        .collect::<Vec<_>>()
        .join(" ")
}

fn fmt_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{}", trimmed)
    }
}
