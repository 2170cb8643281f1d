//! Run summary: what was built, what was skipped, and why a run failed.
//!
//! Written as JSON next to the image on success and on failure, and printed
//! in human form by the CLI.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::state::State;
use crate::artifact::iso::ImageArtifact;
use crate::context::BuildContext;
use crate::error::{BuildError, FailedAttempt, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Building,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub name: String,
    pub version: String,
    pub distro: String,
    pub release: String,
    pub status: RunStatus,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub states: Vec<State>,
    pub failed_stage: Option<State>,
    pub error_kind: Option<&'static str>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
    pub mirror: Option<String>,
    pub failed_fetch_attempts: Vec<FailedAttempt>,
    pub rootfs_from_cache: bool,
    pub installed_packages: Vec<String>,
    pub skipped_packages: Vec<String>,
    pub kernel_version: Option<String>,
    /// Every kernel found in the rootfs, including the ones not chosen.
    pub kernel_candidates: Vec<String>,
    pub unmounted: usize,
    pub artifact: Option<ImageArtifact>,
}

pub fn now_utc() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

impl RunSummary {
    pub fn new(ctx: &BuildContext) -> Self {
        Self {
            name: ctx.name.clone(),
            version: ctx.version.clone(),
            distro: ctx.distro.clone(),
            release: ctx.release.clone(),
            status: RunStatus::Building,
            created_at_utc: now_utc(),
            finished_at_utc: None,
            states: Vec::new(),
            failed_stage: None,
            error_kind: None,
            error: None,
            warnings: Vec::new(),
            mirror: None,
            failed_fetch_attempts: Vec::new(),
            rootfs_from_cache: false,
            installed_packages: Vec::new(),
            skipped_packages: Vec::new(),
            kernel_version: None,
            kernel_candidates: Vec::new(),
            unmounted: 0,
            artifact: None,
        }
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        if !self.warnings.contains(&message) {
            self.warnings.push(message);
        }
    }

    pub fn finish_success(&mut self, states: &[State]) {
        self.status = RunStatus::Success;
        self.states = states.to_vec();
        self.finished_at_utc = Some(now_utc());
    }

    pub fn finish_failed(&mut self, states: &[State], stage: State, error: &BuildError) {
        self.status = RunStatus::Failed;
        self.states = states.to_vec();
        self.failed_stage = Some(stage);
        self.error_kind = Some(error.kind());
        self.error = Some(error.to_string());
        self.finished_at_utc = Some(now_utc());
    }

    /// Write as pretty JSON via a temp file and rename.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BuildError::io("creating directory", parent, e))?;
        }
        let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
        let payload = serde_json::to_vec_pretty(self).map_err(|e| {
            BuildError::io(
                "serializing run summary",
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;
        fs::write(&tmp, payload).map_err(|e| BuildError::io("writing", &tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| BuildError::io("renaming", &tmp, e))?;
        Ok(())
    }

    /// Multi-line report for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let status = match self.status {
            RunStatus::Building => "BUILDING",
            RunStatus::Success => "SUCCESS",
            RunStatus::Failed => "FAILED",
        };
        let _ = writeln!(out, "{} {} ({} {}): {}", self.name, self.version, self.distro, self.release, status);
        if let (Some(stage), Some(error)) = (self.failed_stage, &self.error) {
            let _ = writeln!(out, "  stage {} failed: {}", stage, error);
        }
        if let Some(artifact) = &self.artifact {
            let _ = writeln!(out, "  image:   {}", artifact.path.display());
            let _ = writeln!(
                out,
                "  size:    {} bytes ({} MiB)",
                artifact.size,
                artifact.size / (1024 * 1024)
            );
            let _ = writeln!(out, "  sha256:  {}", artifact.sha256);
            let _ = writeln!(out, "  boot:    {}", artifact.boot_modes.join("+"));
        }
        if let Some(kernel) = &self.kernel_version {
            if self.kernel_candidates.len() > 1 {
                let _ = writeln!(
                    out,
                    "  kernel:  {} (newest of {})",
                    kernel,
                    self.kernel_candidates.join(", ")
                );
            } else {
                let _ = writeln!(out, "  kernel:  {}", kernel);
            }
        }
        if let Some(mirror) = &self.mirror {
            let _ = writeln!(out, "  mirror:  {}", mirror);
        } else if self.rootfs_from_cache {
            let _ = writeln!(out, "  rootfs:  reused from cache");
        }
        if !self.skipped_packages.is_empty() {
            let _ = writeln!(out, "  skipped: {}", self.skipped_packages.join(", "));
        }
        if !self.warnings.is_empty() {
            let _ = writeln!(out, "  warnings:");
            for warning in &self.warnings {
                let _ = writeln!(out, "    - {}", warning);
            }
        }
        out
    }
}
