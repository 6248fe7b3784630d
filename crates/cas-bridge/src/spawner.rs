//! Worker spawn strategies.
//!
//! The spawner only starts the process and passes it the port to connect
//! back on. Everything after that (monitoring, handshake) belongs to the bridge.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::error::SpawnError;

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    /// Start the worker, telling it to connect to `127.0.0.1:port`.
    fn spawn(&self, port: u16) -> Result<Child, SpawnError>;
}

fn configure(cmd: &mut Command) {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
}

/// Runs a prebuilt worker executable as `<path> [extra_args..] <port>`.
#[derive(Debug, Clone)]
pub struct ExecutableSpawner {
    pub path: PathBuf,
    pub extra_args: Vec<OsString>,
}

impl ExecutableSpawner {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.extra_args.push(arg.into());
        self
    }
}

impl WorkerSpawner for ExecutableSpawner {
    fn spawn(&self, port: u16) -> Result<Child, SpawnError> {
        tracing::debug!(path = %self.path.display(), port, "Spawning worker executable");
        let mut cmd = Command::new(&self.path);
        cmd.args(&self.extra_args).arg(port.to_string());
        configure(&mut cmd);
        Ok(cmd.spawn()?)
    }
}

/// Runs the worker from source through an interpreter inside a virtualenv.
///
/// `<root>/<venv>/bin/<interpreter> <root>/<script> <port>` (`Scripts` instead
/// of `bin` on Windows).
#[derive(Debug, Clone)]
pub struct SourceSpawner {
    pub root_dir: PathBuf,
    pub interpreter: String,
    pub venv: PathBuf,
    pub script: PathBuf,
}

impl SourceSpawner {
    pub fn new(root_dir: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            interpreter: "python".to_string(),
            venv: PathBuf::from(".venv"),
            script: script.into(),
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_venv(mut self, venv: impl Into<PathBuf>) -> Self {
        self.venv = venv.into();
        self
    }

    pub fn interpreter_path(&self) -> PathBuf {
        let bin_dir = if cfg!(windows) { "Scripts" } else { "bin" };
        let mut path = self.root_dir.join(&self.venv).join(bin_dir).join(&self.interpreter);
        if cfg!(windows) && path.extension().is_none() {
            path.set_extension("exe");
        }
        path
    }

    pub fn script_path(&self) -> PathBuf {
        self.root_dir.join(&self.script)
    }
}

impl WorkerSpawner for SourceSpawner {
    fn spawn(&self, port: u16) -> Result<Child, SpawnError> {
        let interpreter = self.interpreter_path();
        let script = self.script_path();
        if !Path::new(&script).exists() {
            return Err(SpawnError::Other(format!(
                "worker script not found: {}",
                script.display()
            )));
        }

        tracing::debug!(
            interpreter = %interpreter.display(),
            script = %script.display(),
            port,
            "Spawning worker from source"
        );
        let mut cmd = Command::new(&interpreter);
        cmd.arg(&script).arg(port.to_string()).current_dir(&self.root_dir);
        configure(&mut cmd);
        Ok(cmd.spawn()?)
    }
}
