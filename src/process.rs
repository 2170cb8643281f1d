//! Centralized command execution with consistent error handling.
//!
//! Every external tool the pipeline touches (package managers inside the
//! build root, mount, mksquashfs, xorriso, mtools) is described by a [`Cmd`]
//! and executed through an [`Executor`]. The system executor enforces
//! timeouts, honours cancellation, and reports elapsed time for long runs.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{BuildError, Result};

/// Result of a command execution.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Exit code, or -1 if terminated by signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder describing one external command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    error_prefix: Option<String>,
    progress_label: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            timeout: None,
            allow_fail: false,
            error_prefix: None,
            progress_label: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Bound the wall-clock time. Used for network-dependent tools only.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Log periodic "still running" lines under this label.
    pub fn progress(mut self, label: impl AsRef<str>) -> Self {
        self.progress_label = Some(label.as_ref().to_string());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_envs(&self) -> &[(String, String)] {
        &self.envs
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn get_progress_label(&self) -> Option<&str> {
        self.progress_label.as_deref()
    }

    /// Wrap this command so it runs with `root` as its filesystem root.
    pub fn chrooted(self, root: &Path) -> Cmd {
        let mut args = Vec::with_capacity(self.args.len() + 2);
        args.push(root.to_string_lossy().into_owned());
        args.push(self.program);
        args.extend(self.args);
        Cmd {
            program: "chroot".to_string(),
            args,
            ..self
        }
    }

    /// `program arg1 arg2 ...` for logs.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Execute and turn non-zero exits into [`BuildError::ToolInvocation`].
    pub fn run(self, executor: &dyn Executor) -> Result<CommandResult> {
        let result = executor.execute(&self)?;
        if !self.allow_fail && !result.success() {
            let tool = match &self.error_prefix {
                Some(prefix) => prefix.clone(),
                None => format!("'{}'", self.tool_name()),
            };
            return Err(BuildError::ToolInvocation {
                tool,
                code: result.code,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }

    /// The tool actually being run, looking through a `chroot` wrapper.
    fn tool_name(&self) -> &str {
        if self.program == "chroot" {
            if let Some(inner) = self.args.get(1) {
                return inner;
            }
        }
        &self.program
    }
}

/// Runs commands. Replaced by scripted fakes in tests.
pub trait Executor: Send + Sync {
    /// Run `cmd` to completion and capture its output.
    ///
    /// Returns `Err` only when the command could not be run to completion
    /// (spawn failure, timeout, cancellation); a non-zero exit is an `Ok`.
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult>;
}

/// Executor backed by real processes.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    cancel: CancelToken,
    poll_interval: Duration,
    heartbeat: Duration,
}

impl SystemExecutor {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            poll_interval: Duration::from_millis(100),
            heartbeat: Duration::from_secs(30),
        }
    }

    /// Interval between "still running" log lines for labelled commands.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

impl Executor for SystemExecutor {
    fn execute(&self, cmd: &Cmd) -> Result<CommandResult> {
        self.cancel.check()?;
        debug!(command = %cmd.display_line(), "exec");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &cmd.envs {
            command.env(key, value);
        }
        if let Some(ref dir) = cmd.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| BuildError::ToolInvocation {
            tool: cmd.program.clone(),
            code: -1,
            stderr: format!("failed to execute '{}': {}. Is it installed?", cmd.program, e),
        })?;

        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let started = Instant::now();
        let mut last_beat = started;
        let code = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status.code().unwrap_or(-1),
                Ok(None) => {}
                Err(e) => {
                    kill_quietly(&mut child);
                    return Err(BuildError::ToolInvocation {
                        tool: cmd.program.clone(),
                        code: -1,
                        stderr: format!("waiting for process failed: {}", e),
                    });
                }
            }

            if self.cancel.is_cancelled() {
                kill_quietly(&mut child);
                return Err(BuildError::Interrupted);
            }

            if let Some(limit) = cmd.timeout {
                if started.elapsed() >= limit {
                    kill_quietly(&mut child);
                    return Err(BuildError::ToolInvocation {
                        tool: cmd.program.clone(),
                        code: -1,
                        stderr: format!("timed out after {}s", limit.as_secs()),
                    });
                }
            }

            if let Some(label) = cmd.progress_label.as_deref() {
                if last_beat.elapsed() >= self.heartbeat {
                    info!(
                        step = label,
                        elapsed_secs = started.elapsed().as_secs(),
                        "still running"
                    );
                    last_beat = Instant::now();
                }
            }

            thread::sleep(self.poll_interval);
        };

        if let Some(label) = cmd.progress_label.as_deref() {
            info!(
                step = label,
                elapsed_secs = started.elapsed().as_secs(),
                "finished"
            );
        }

        Ok(CommandResult {
            code,
            stdout: join_reader(stdout_reader),
            stderr: join_reader(stderr_reader),
        })
    }
}

type Reader = Option<thread::JoinHandle<Vec<u8>>>;

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Reader {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn join_reader(reader: Reader) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn kill_quietly(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Check if a program exists in PATH.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec() -> SystemExecutor {
        SystemExecutor::new(CancelToken::new())
    }

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run(&exec()).unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_trimmed(), "hello");
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let err = Cmd::new("ls")
            .arg("/nonexistent_path_12345")
            .run(&exec())
            .unwrap_err();
        match err {
            BuildError::ToolInvocation { tool, stderr, .. } => {
                assert_eq!(tool, "'ls'");
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    struct ExitsWith(i32);

    impl Executor for ExitsWith {
        fn execute(&self, _cmd: &Cmd) -> Result<CommandResult> {
            Ok(CommandResult {
                code: self.0,
                stdout: String::new(),
                stderr: "E: Unable to locate package".to_string(),
            })
        }
    }

    #[test]
    fn test_chrooted_failure_names_inner_tool() {
        let err = Cmd::new("apt-get")
            .args(["install", "-y", "nmap"])
            .chrooted(Path::new("/build/rootfs"))
            .run(&ExitsWith(100))
            .unwrap_err();
        match err {
            BuildError::ToolInvocation { tool, code, .. } => {
                assert_eq!(tool, "'apt-get'");
                assert_eq!(code, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_allow_fail() {
        let result = Cmd::new("false").allow_fail().run(&exec()).unwrap();
        assert!(!result.success());
        assert_eq!(result.code, 1);
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("custom build step")
            .run(&exec())
            .unwrap_err();
        assert!(err.to_string().starts_with("custom build step failed"));
    }

    #[test]
    fn test_env_and_dir() {
        let result = Cmd::new("sh")
            .args(["-c", "echo $GREETING; pwd"])
            .env("GREETING", "hi")
            .dir(Path::new("/"))
            .run(&exec())
            .unwrap();
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(lines, vec!["hi", "/"]);
    }

    #[test]
    fn test_timeout_kills_child() {
        let started = Instant::now();
        let err = Cmd::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(300))
            .run(&exec())
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_cancel_before_spawn() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = Cmd::new("echo")
            .run(&SystemExecutor::new(cancel))
            .unwrap_err();
        assert!(matches!(err, BuildError::Interrupted));
    }

    #[test]
    fn test_chrooted_wraps_program() {
        let cmd = Cmd::new("apt-get")
            .args(["install", "-y"])
            .chrooted(Path::new("/build/rootfs"));
        assert_eq!(cmd.program(), "chroot");
        assert_eq!(
            cmd.get_args(),
            &["/build/rootfs", "apt-get", "install", "-y"]
        );
        assert_eq!(cmd.tool_name(), "apt-get");
    }

    #[test]
    fn test_exists() {
        assert!(exists("sh"));
        assert!(!exists("nonexistent_program_12345"));
    }
}
