//! Package transactions inside the build root.
//!
//! Index refresh is retried with backoff. Essential packages go in one
//! transaction whose failure is fatal; optional packages are installed one
//! at a time so a missing scanner signature package only drops itself.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::buildroot::BuildRoot;
use crate::cancel::CancelToken;
use crate::context::{PackageManager, PackageSet};
use crate::error::{BuildError, OptionalInstallError, Result};
use crate::process::Cmd;
use crate::retry::RetryPolicy;

/// Requested versus actually installed packages.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
    pub requested: Vec<String>,
    /// Everything the package database reports installed afterwards.
    pub installed: BTreeSet<String>,
    #[serde(skip)]
    pub skipped: Vec<OptionalInstallError>,
}

impl InstallReport {
    pub fn is_installed(&self, package: &str) -> bool {
        self.installed.contains(package)
    }

    pub fn skipped_names(&self) -> Vec<&str> {
        self.skipped.iter().map(|s| s.package.as_str()).collect()
    }
}

/// Refresh, install essentials, then optionals. Only essential failures
/// and interrupts are returned as errors.
pub fn install(root: &BuildRoot<'_>, set: &PackageSet, cancel: &CancelToken) -> Result<InstallReport> {
    let manager = set.manager;

    let refresh = RetryPolicy::new(set.refresh_attempts, set.refresh_backoff)
        .retry_if(|e| matches!(e, BuildError::ToolInvocation { .. }));
    refresh.run("package index refresh", cancel, |attempt| {
        info!(%manager, attempt, "refreshing package index");
        root.run(refresh_cmd(manager).timeout(set.refresh_timeout))
    })?;

    cancel.check()?;
    info!(%manager, packages = ?set.essential, "installing essential packages");
    let result = root.execute(install_cmd(manager, &set.essential).timeout(set.install_timeout))?;
    if !result.success() {
        return Err(BuildError::EssentialInstall {
            packages: set.essential.clone(),
            detail: tail(&result.stderr, 6),
        });
    }

    let mut skipped = Vec::new();
    for package in &set.optional {
        cancel.check()?;
        let result = root.execute(
            install_cmd(manager, std::slice::from_ref(package)).timeout(set.install_timeout),
        )?;
        if result.success() {
            info!(package = %package, "optional package installed");
        } else {
            let skip = OptionalInstallError {
                package: package.clone(),
                detail: tail(&result.stderr, 2),
            };
            warn!("{}", skip);
            skipped.push(skip);
        }
    }

    let listing = root.run(query_cmd(manager))?;
    let installed = parse_installed(manager, &listing.stdout);

    let missing: Vec<String> = set
        .essential
        .iter()
        .filter(|p| !installed.contains(p.as_str()))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(BuildError::EssentialInstall {
            packages: missing,
            detail: "transaction succeeded but the package database does not list them".into(),
        });
    }

    for package in &set.optional {
        let already_skipped = skipped.iter().any(|s| &s.package == package);
        if !already_skipped && !installed.contains(package.as_str()) {
            let skip = OptionalInstallError {
                package: package.clone(),
                detail: "not present in package database after install".into(),
            };
            warn!("{}", skip);
            skipped.push(skip);
        }
    }

    let cleaned = root.execute(clean_cmd(manager))?;
    if !cleaned.success() {
        warn!(%manager, "package cache cleanup failed: {}", cleaned.stderr_trimmed());
    }

    let mut requested = set.essential.clone();
    requested.extend(set.optional.iter().cloned());
    info!(
        requested = requested.len(),
        installed = installed.len(),
        skipped = skipped.len(),
        "package installation complete"
    );
    Ok(InstallReport {
        requested,
        installed,
        skipped,
    })
}

pub fn refresh_cmd(manager: PackageManager) -> Cmd {
    match manager {
        PackageManager::Apt => Cmd::new("apt-get")
            .args(["-o", "Acquire::Retries=3", "update"])
            .env("DEBIAN_FRONTEND", "noninteractive"),
        PackageManager::Apk => Cmd::new("apk").arg("update"),
        PackageManager::Dnf => Cmd::new("dnf").args(["-y", "makecache"]),
    }
}

pub fn install_cmd(manager: PackageManager, packages: &[String]) -> Cmd {
    let cmd = match manager {
        PackageManager::Apt => Cmd::new("apt-get")
            .args(["install", "-y", "--no-install-recommends"])
            .env("DEBIAN_FRONTEND", "noninteractive"),
        PackageManager::Apk => Cmd::new("apk").args(["add", "--no-progress"]),
        PackageManager::Dnf => Cmd::new("dnf")
            .args(["-y", "install", "--setopt=install_weak_deps=False"]),
    };
    cmd.args(packages).progress("package install")
}

pub fn query_cmd(manager: PackageManager) -> Cmd {
    match manager {
        PackageManager::Apt => Cmd::new("dpkg-query").args(["-W", "-f=${Package}\t${Status}\n"]),
        PackageManager::Apk => Cmd::new("apk").arg("info"),
        PackageManager::Dnf => Cmd::new("rpm").args(["-qa", "--qf", "%{NAME}\n"]),
    }
}

fn clean_cmd(manager: PackageManager) -> Cmd {
    match manager {
        PackageManager::Apt => Cmd::new("apt-get").arg("clean"),
        PackageManager::Apk => Cmd::new("apk").args(["cache", "clean"]),
        PackageManager::Dnf => Cmd::new("dnf").args(["clean", "all"]),
    }
}

/// Names of installed packages from the query command's output.
pub fn parse_installed(manager: PackageManager, output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            match manager {
                PackageManager::Apt => {
                    let (name, status) = line.split_once('\t')?;
                    (status.trim() == "install ok installed").then(|| name.trim().to_string())
                }
                PackageManager::Apk | PackageManager::Dnf => Some(line.to_string()),
            }
        })
        .collect()
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
