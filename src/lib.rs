//! Build pipeline for the CyberXP-OS live image.
//!
//! Turns a declarative [`BuildContext`] into one hybrid BIOS/UEFI ISO:
//!
//! ```text
//! config (TOML) ──► BuildContext
//!                        │
//!   Preflight ─► Acquiring ─► BuildRootActive ─► Installing ─► Composing
//!                                                                  │
//!   Done ◄─ TearingDown ◄─ Assembling ◄─ Compressing+Configuring ◄─ GeneratingBoot
//! ```
//!
//! Every external tool runs through a [`process::Executor`]; mounts go
//! through a [`buildroot::Mounter`]; downloads through a [`mirror::Fetcher`];
//! host checks through a [`preflight::HostProbe`]. The binary wires in the
//! system implementations, tests wire in fakes.

pub mod artifact;
pub mod buildroot;
pub mod cancel;
pub mod config;
pub mod context;
pub mod error;
pub mod lock;
pub mod mirror;
pub mod overlay;
pub mod packages;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod retry;
pub mod rootfs;

pub use cancel::CancelToken;
pub use context::BuildContext;
pub use error::{BuildError, Result};
pub use pipeline::{Host, Pipeline, PipelineFailure, RunSummary, State};
