//! Ordered mirror fallback.
//!
//! Endpoints are tried in list order; the first attempt that completes and
//! leaves a non-empty artifact wins. Every failed attempt is recorded, and
//! its partial output is discarded before the next endpoint is tried.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::error::{BuildError, FailedAttempt, Result};
use crate::retry::RetryPolicy;

const USER_AGENT: &str = concat!("cyberxp-builder/", env!("CARGO_PKG_VERSION"));

/// Downloads one URL to a local file. Replaced by fakes in tests.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &Path, timeout: Duration) -> Result<()>;
}

/// HTTP(S) fetcher.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BuildError::Precondition(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path, timeout: Duration) -> Result<()> {
        let failed = |reason: String| BuildError::RetryableFetch {
            attempts: vec![FailedAttempt {
                endpoint: url.to_string(),
                reason,
            }],
        };

        let mut response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(|e| failed(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }

        // Download to a temp file first so a cut connection never looks complete.
        let temp_path = dest.with_extension("part");
        let mut file =
            File::create(&temp_path).map_err(|e| BuildError::io("creating", &temp_path, e))?;
        if let Err(e) = io::copy(&mut response, &mut file) {
            let _ = fs::remove_file(&temp_path);
            return Err(failed(format!("transfer interrupted: {}", e)));
        }
        fs::rename(&temp_path, dest).map_err(|e| BuildError::io("renaming", &temp_path, e))?;
        Ok(())
    }
}

/// The accepted artifact plus every attempt that failed before it.
#[derive(Debug)]
pub struct Resolved<T> {
    pub endpoint: String,
    pub value: T,
    pub failed: Vec<FailedAttempt>,
}

/// Tries endpoints in order until one yields a usable artifact at `dest`.
pub struct MirrorResolver<'a> {
    endpoints: &'a [String],
    timeout: Duration,
    policy: RetryPolicy,
    cancel: &'a CancelToken,
}

impl<'a> MirrorResolver<'a> {
    pub fn new(endpoints: &'a [String], timeout: Duration, cancel: &'a CancelToken) -> Self {
        Self {
            endpoints,
            timeout,
            policy: RetryPolicy::once().retry_if(|e| !matches!(e, BuildError::Interrupted)),
            cancel,
        }
    }

    /// Attempts per endpoint before moving on to the next one.
    pub fn attempts_per_endpoint(mut self, attempts: u32, backoff: Duration) -> Self {
        self.policy = RetryPolicy::new(attempts, backoff)
            .retry_if(|e| !matches!(e, BuildError::Interrupted));
        self
    }

    /// Run `op(endpoint, dest, timeout)` against each endpoint in turn.
    ///
    /// An attempt counts as successful only when `op` returns `Ok` and `dest`
    /// is a non-empty file or a directory with at least one entry.
    pub fn resolve<T, F>(&self, dest: &Path, mut op: F) -> Result<Resolved<T>>
    where
        F: FnMut(&str, &Path, Duration) -> Result<T>,
    {
        let mut failed = Vec::new();

        for endpoint in self.endpoints {
            let outcome = self.policy.run("mirror", self.cancel, |attempt| {
                info!(endpoint = %endpoint, attempt, "fetching");
                let result = op(endpoint, dest, self.timeout).and_then(|value| {
                    if artifact_is_usable(dest) {
                        Ok(value)
                    } else {
                        Err(BuildError::Postcondition(format!(
                            "empty artifact at {}",
                            dest.display()
                        )))
                    }
                });
                if let Err(ref err) = result {
                    if !matches!(err, BuildError::Interrupted) {
                        warn!(endpoint = %endpoint, attempt, error = %err, "mirror attempt failed");
                        failed.push(FailedAttempt {
                            endpoint: endpoint.clone(),
                            reason: attempt_reason(err),
                        });
                        discard_partial(dest);
                    }
                }
                result
            });

            match outcome {
                Ok(value) => {
                    info!(endpoint = %endpoint, failed_attempts = failed.len(), "mirror accepted");
                    return Ok(Resolved {
                        endpoint: endpoint.clone(),
                        value,
                        failed,
                    });
                }
                Err(BuildError::Interrupted) => {
                    discard_partial(dest);
                    return Err(BuildError::Interrupted);
                }
                Err(_) => continue,
            }
        }

        Err(BuildError::RetryableFetch { attempts: failed })
    }
}

/// Non-empty file, or directory with at least one entry.
pub fn artifact_is_usable(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta.len() > 0,
        Ok(meta) if meta.is_dir() => fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false),
        _ => false,
    }
}

/// Remove whatever a failed attempt left behind.
pub fn discard_partial(path: &Path) {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            let _ = fs::remove_dir_all(path);
        }
        Ok(_) => {
            let _ = fs::remove_file(path);
        }
        Err(_) => {}
    }
    let _ = fs::remove_file(path.with_extension("part"));
}

fn attempt_reason(err: &BuildError) -> String {
    match err {
        // Unwrap the single-attempt wrapper the fetcher produces.
        BuildError::RetryableFetch { attempts } if attempts.len() == 1 => {
            attempts[0].reason.clone()
        }
        other => other.to_string(),
    }
}
