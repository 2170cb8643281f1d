//! Pipeline controller.
//!
//! Drives one build through the stage sequence, owns the build lock and the
//! build root, and is the only place that decides a run is over. Whatever
//! happens, the run passes through [`State::TearingDown`], which releases
//! the build root and verifies nothing is left mounted under the rootfs.
//!
//! The build root's pseudo-filesystems are released as soon as boot assets
//! exist: the compressor has to see the tree without `/proc`, `/sys` and
//! `/dev` attached.

pub mod state;
pub mod summary;

use std::fs;
use std::path::Path;
use std::thread;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::artifact::boot_assets;
use crate::artifact::bootloader::{self, BootloaderConfig};
use crate::artifact::iso::{self, AssemblyInputs, ImageArtifact};
use crate::artifact::squashfs::{self, CompressedFilesystem};
use crate::buildroot::{sweep_stale_mounts, BuildRoot, Mounter, TeardownReport, UnmountOutcome};
use crate::cancel::CancelToken;
use crate::context::{BuildContext, BuildLayout};
use crate::error::{BuildError, Result};
use crate::lock::BuildLock;
use crate::mirror::Fetcher;
use crate::overlay;
use crate::packages;
use crate::preflight::{self, HostProbe};
use crate::process::Executor;
use crate::rootfs;

pub use state::{State, StateMachine};
pub use summary::{RunStatus, RunSummary};

/// Host services the pipeline runs against.
#[derive(Clone, Copy)]
pub struct Host<'a> {
    pub exec: &'a dyn Executor,
    pub mounter: &'a dyn Mounter,
    pub fetcher: &'a dyn Fetcher,
    pub probe: &'a dyn HostProbe,
}

/// A run that ended in [`State::Failed`].
#[derive(Debug, Error)]
#[error("stage {stage} failed: {error}")]
pub struct PipelineFailure {
    pub stage: State,
    #[source]
    pub error: BuildError,
    pub summary: Box<RunSummary>,
}

pub struct Pipeline<'a> {
    ctx: &'a BuildContext,
    host: Host<'a>,
    cancel: CancelToken,
    machine: StateMachine,
    summary: RunSummary,
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: &'a BuildContext, host: Host<'a>, cancel: CancelToken) -> Self {
        Self {
            ctx,
            host,
            cancel,
            machine: StateMachine::new(),
            summary: RunSummary::new(ctx),
        }
    }

    /// Run to completion. The summary file is written either way.
    pub fn run(mut self) -> std::result::Result<RunSummary, PipelineFailure> {
        info!(
            name = %self.ctx.name,
            version = %self.ctx.version,
            distro = %self.ctx.distro,
            release = %self.ctx.release,
            "starting image build"
        );

        let mut root: Option<BuildRoot<'a>> = None;
        let mut lock: Option<BuildLock> = None;
        let outcome = self.execute(&mut root, &mut lock);

        let last_stage = self.machine.current();
        if let Err(e) = &outcome {
            error!(stage = %last_stage, kind = e.kind(), error = %e, "stage failed");
        }
        self.machine.transition(State::TearingDown);
        let teardown = self.tear_down(root.take(), lock.is_some(), outcome.is_ok());

        let result = match (outcome, teardown) {
            (Ok(artifact), Ok(())) => {
                self.summary.artifact = Some(artifact);
                Ok(())
            }
            (Ok(artifact), Err(e)) => {
                // The image exists, but success cannot be claimed with mounts left behind.
                self.summary.artifact = Some(artifact);
                Err((State::TearingDown, e))
            }
            (Err(e), Ok(())) => Err((last_stage, e)),
            (Err(e), Err(teardown_err)) => {
                self.summary
                    .warn(format!("teardown after failure incomplete: {}", teardown_err));
                Err((last_stage, e))
            }
        };

        let summary_path = self.ctx.summary_path();
        match result {
            Ok(()) => {
                self.machine.transition(State::Done);
                self.summary.finish_success(self.machine.visited());
                self.persist_summary(&summary_path);
                info!(summary = %summary_path.display(), "build complete");
                drop(lock);
                Ok(self.summary)
            }
            Err((stage, error)) => {
                self.machine.transition(State::Failed);
                self.summary
                    .finish_failed(self.machine.visited(), stage, &error);
                self.persist_summary(&summary_path);
                drop(lock);
                Err(PipelineFailure {
                    stage,
                    error,
                    summary: Box::new(self.summary),
                })
            }
        }
    }

    fn advance(&mut self, to: State) -> Result<()> {
        self.cancel.check()?;
        self.machine.transition(to);
        Ok(())
    }

    fn execute(
        &mut self,
        root: &mut Option<BuildRoot<'a>>,
        lock: &mut Option<BuildLock>,
    ) -> Result<ImageArtifact> {
        let ctx = self.ctx;
        let host = self.host;
        let layout = ctx.layout();

        self.advance(State::Preflight)?;
        let report = preflight::verify(ctx, host.probe)?;
        for warning in report.warnings() {
            self.summary.warn(warning);
        }
        *lock = Some(BuildLock::acquire(&ctx.build_dir)?);
        let stale = sweep_stale_mounts(&layout.rootfs, host.mounter)?;
        if !stale.is_empty() {
            self.summary.warn(format!(
                "unmounted {} stale mount(s) left under {} by an earlier run",
                stale.len(),
                layout.rootfs.display()
            ));
        }

        self.advance(State::Acquiring)?;
        let acquired = rootfs::acquire(ctx, host.exec, host.fetcher, host.mounter, &self.cancel)?;
        self.summary.mirror = acquired.endpoint.clone();
        self.summary.rootfs_from_cache = acquired.from_cache;
        for attempt in &acquired.failed_attempts {
            self.summary
                .warn(format!("mirror {} failed: {}", attempt.endpoint, attempt.reason));
        }
        self.summary.failed_fetch_attempts = acquired.failed_attempts.clone();

        self.advance(State::BuildRootActive)?;
        let active = root.insert(BuildRoot::activate(
            &acquired.rootfs,
            ctx.packages.manager,
            host.exec,
            host.mounter,
        )?);

        self.advance(State::Installing)?;
        let installed = packages::install(active, &ctx.packages, &self.cancel)?;
        self.summary.installed_packages = installed.installed.iter().cloned().collect();
        self.summary.skipped_packages = installed
            .skipped_names()
            .into_iter()
            .map(String::from)
            .collect();
        for skip in &installed.skipped {
            self.summary.warn(skip.to_string());
        }

        self.advance(State::Composing)?;
        let (bundle, archive) = overlay::compose_to_build_dir(ctx)?;
        self.summary.warn(bundle.placeholder_warning());
        if ctx.overlay.merge_into_rootfs {
            bundle.apply_to(active.root())?;
            info!(rootfs = %active.root().display(), "overlay merged into rootfs");
        }

        self.advance(State::GeneratingBoot)?;
        let boot = boot_assets::generate(active, ctx.packages.manager, &self.cancel)?;
        self.summary.kernel_version = Some(boot.kernel_version.clone());
        self.summary.kernel_candidates = boot.available_versions.clone();

        if let Some(active) = root.take() {
            let report = active.teardown()?;
            self.note_teardown(report);
        }

        self.advance(State::CompressingConfiguring)?;
        let (compressed, loader) = compress_and_configure(ctx, host.exec, &acquired.rootfs, &layout)?;
        for warning in &loader.warnings {
            self.summary.warn(warning.clone());
        }

        self.advance(State::Assembling)?;
        let inputs = AssemblyInputs {
            boot: &boot,
            filesystem: &compressed,
            bootloader: &loader,
            overlay_archive: ctx.overlay.ship_in_image.then_some(archive.as_path()),
        };
        iso::assemble(ctx, &inputs, host.exec)
    }

    /// Release the build root if still held and make sure nothing remains
    /// mounted under the rootfs. Without the lock the rootfs may belong to
    /// another run, so it is left alone.
    fn tear_down(&mut self, root: Option<BuildRoot<'a>>, holds_lock: bool, succeeded: bool) -> Result<()> {
        let mut failures = Vec::new();

        if let Some(active) = root {
            match active.teardown() {
                Ok(report) => self.note_teardown(report),
                Err(e) => failures.push(e.to_string()),
            }
        }
        if !holds_lock {
            return finish_teardown(failures);
        }

        let rootfs = self.ctx.layout().rootfs;
        match self.host.mounter.mounts_under(&rootfs) {
            Ok(left) => {
                for target in left {
                    match self.host.mounter.unmount(&target) {
                        Ok(UnmountOutcome::Clean) => self.summary.unmounted += 1,
                        Ok(UnmountOutcome::Lazy) => {
                            self.summary.unmounted += 1;
                            self.summary
                                .warn(format!("{} required a lazy unmount", target.display()));
                        }
                        Err(e) => failures.push(format!("{}: {}", target.display(), e)),
                    }
                }
            }
            Err(e) => failures.push(format!("listing mounts under {}: {}", rootfs.display(), e)),
        }

        let layout = self.ctx.layout();
        if !succeeded {
            // A half-built rootfs must never be picked up as a cache.
            let marker = layout.root.join(rootfs::ACQUISITION_MARKER);
            if let Err(e) = fs::remove_file(&marker) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    failures.push(format!("removing {}: {}", marker.display(), e));
                }
            }
        } else if failures.is_empty() && !self.ctx.keep_build_dir {
            remove_work_tree(&layout);
        }
        finish_teardown(failures)
    }

    fn note_teardown(&mut self, report: TeardownReport) {
        self.summary.unmounted += report.unmounted.len();
        for warning in report.warnings {
            self.summary.warn(warning);
        }
    }

    fn persist_summary(&self, path: &Path) {
        if let Err(e) = self.summary.write(path) {
            error!(path = %path.display(), error = %e, "failed to write run summary");
        }
    }
}

fn finish_teardown(failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(BuildError::Postcondition(format!(
            "build root teardown incomplete: {}",
            failures.join("; ")
        )))
    }
}

/// Compression and bootloader staging touch disjoint parts of the rootfs.
fn compress_and_configure(
    ctx: &BuildContext,
    exec: &dyn Executor,
    rootfs: &Path,
    layout: &BuildLayout,
) -> Result<(CompressedFilesystem, BootloaderConfig)> {
    let (compressed, loader) = thread::scope(|s| {
        let compressor =
            s.spawn(|| squashfs::compress(rootfs, &layout.compressed, &ctx.compression, exec));
        let loader = bootloader::configure(ctx, rootfs, &layout.bootloader);
        let compressed = compressor.join().unwrap_or_else(|_| {
            Err(BuildError::Postcondition(
                "compression thread panicked".to_string(),
            ))
        });
        (compressed, loader)
    });
    Ok((compressed?, loader?))
}

/// Drop intermediate trees after a successful run. The rootfs cache goes too.
fn remove_work_tree(layout: &BuildLayout) {
    for dir in [
        &layout.rootfs,
        &layout.downloads,
        &layout.bootloader,
        &layout.iso_root,
        &layout.overlay,
    ] {
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(dir) {
                warn!(path = %dir.display(), error = %e, "could not remove build tree");
            }
        }
    }
    let _ = fs::remove_file(&layout.compressed);
    let _ = fs::remove_file(layout.root.join(rootfs::ACQUISITION_MARKER));
}
