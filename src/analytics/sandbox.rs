//! Code Sandbox
//!
//! `CodeSandbox` is the capability the analytics engine runs generated code
//! through. `ProcessSandbox` is the bundled implementation: a Python
//! interpreter started under bubblewrap with private network, mount, pid and
//! ipc namespaces. Only `/usr`, the system library directories and a
//! throwaway working directory holding `data.json` are visible. Kernel
//! resource limits cap memory, CPU time, open files and file size, and
//! stdout/stderr are read through a fixed-size window. When no confinement
//! tool is available the sandbox refuses to run.

use crate::config::AgentConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

const ARTIFACT_EXTENSIONS: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("svg", "image/svg+xml"),
    ("csv", "text/csv"),
];
const STDERR_TAIL: usize = 2000;
/// Mount point of the workspace inside the sandbox
const SANDBOX_DIR: &str = "/work";
const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const SYSTEM_DIRS: &[&str] = &["/bin", "/sbin", "/lib", "/lib32", "/lib64"];

/// File produced by sandboxed code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub mime_type: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxOutput {
    pub stdout: String,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxFailureKind {
    /// Workspace, confinement or interpreter could not be set up
    Setup,
    Timeout,
    /// Code ran and exited non-zero
    Crashed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxFailure {
    pub kind: SandboxFailureKind,
    pub message: String,
}

impl SandboxFailure {
    pub fn new(kind: SandboxFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for SandboxFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Isolated execution of generated analysis code
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    /// Run `code` with `data` available as `data.json`.
    async fn run(&self, code: &str, data: &Value) -> Result<SandboxOutput, SandboxFailure>;
}

/// How the interpreter process is confined
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confinement {
    /// bubblewrap binary: unshares every namespace, network included
    Bubblewrap(PathBuf),
    /// No supported tool on this host; every run is refused
    Unavailable,
}

impl Confinement {
    pub fn detect() -> Self {
        if !cfg!(target_os = "linux") {
            return Confinement::Unavailable;
        }
        match find_executable("bwrap") {
            Some(path) => Confinement::Bubblewrap(path),
            None => Confinement::Unavailable,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Confinement::Bubblewrap(_))
    }
}

fn find_executable(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Kernel resource ceilings applied to the sandboxed process tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Address space (RLIMIT_AS)
    pub memory_bytes: u64,
    /// CPU seconds (RLIMIT_CPU)
    pub cpu_seconds: u64,
    /// Open descriptors (RLIMIT_NOFILE)
    pub open_files: u64,
    /// Largest file the code may write (RLIMIT_FSIZE)
    pub file_size_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 2048 * 1024 * 1024,
            cpu_seconds: 60,
            open_files: 64,
            file_size_bytes: 64 * 1024 * 1024,
        }
    }
}

#[cfg(unix)]
fn apply_limits(limits: ResourceLimits) -> std::io::Result<()> {
    let ceilings = [
        (libc::RLIMIT_AS, limits.memory_bytes),
        (libc::RLIMIT_CPU, limits.cpu_seconds),
        (libc::RLIMIT_NOFILE, limits.open_files),
        (libc::RLIMIT_FSIZE, limits.file_size_bytes),
    ];
    for (resource, value) in ceilings {
        let rlim = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        // SAFETY: setrlimit only reads `rlim`, and is async-signal-safe.
        if unsafe { libc::setrlimit(resource, &rlim) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Removes the sandbox directory when dropped
struct Workspace(PathBuf);

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            debug!("Could not remove sandbox dir {}: {}", self.0.display(), e);
        }
    }
}

/// Bytes read from a child stream, up to the output cap
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn text(&self) -> String {
        let text = String::from_utf8_lossy(&self.bytes).to_string();
        if self.truncated {
            format!("{}\n[output truncated]", text)
        } else {
            text
        }
    }
}

/// Keep the first `limit` bytes and discard the rest, so a chatty child
/// never blocks on a full pipe nor grows our memory.
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> std::io::Result<Captured> {
    let Some(mut reader) = reader else {
        return Ok(Captured::default());
    };
    let mut bytes = Vec::new();
    (&mut reader).take(limit as u64).read_to_end(&mut bytes).await?;
    let dropped = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(Captured {
        bytes,
        truncated: dropped > 0,
    })
}

pub struct ProcessSandbox {
    interpreter: PathBuf,
    confinement: Confinement,
    read_only_paths: Vec<PathBuf>,
    work_root: PathBuf,
    timeout: Duration,
    limits: ResourceLimits,
    max_output_bytes: usize,
}

impl ProcessSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self {
            interpreter: PathBuf::from("python3"),
            confinement: Confinement::detect(),
            read_only_paths: Vec::new(),
            work_root: std::env::temp_dir(),
            timeout,
            limits: ResourceLimits {
                cpu_seconds: timeout.as_secs() + 1,
                ..ResourceLimits::default()
            },
            max_output_bytes: 64 * 1024,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let mut sandbox = Self::new(config.sandbox_timeout());
        sandbox.limits.memory_bytes = config.sandbox_memory_mb * 1024 * 1024;
        sandbox
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_confinement(mut self, confinement: Confinement) -> Self {
        self.confinement = confinement;
        self
    }

    /// Expose an extra host path read-only, e.g. an interpreter outside /usr.
    pub fn with_read_only_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.read_only_paths.push(path.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn confinement(&self) -> &Confinement {
        &self.confinement
    }

    fn prepare(&self, code: &str, data: &Value) -> std::io::Result<Workspace> {
        let dir = self.work_root.join(format!("nl2sql_sandbox_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        let workspace = Workspace(dir);
        std::fs::write(workspace.0.join("data.json"), serde_json::to_vec(data)?)?;
        std::fs::write(workspace.0.join("analysis.py"), code)?;
        Ok(workspace)
    }

    fn command(&self, bwrap: &Path, workspace: &Path) -> Command {
        let mut command = Command::new(bwrap);
        command
            .args(["--unshare-all", "--die-with-parent", "--new-session"])
            .args(["--ro-bind", "/usr", "/usr"]);
        for &dir in SYSTEM_DIRS {
            command.args(["--ro-bind-try", dir, dir]);
        }
        for path in &self.read_only_paths {
            command.arg("--ro-bind-try").arg(path).arg(path);
        }
        command
            .args(["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"])
            .arg("--bind")
            .arg(workspace)
            .arg(SANDBOX_DIR)
            .args(["--chdir", SANDBOX_DIR, "--"])
            .arg(&self.interpreter)
            .args(["-I", "analysis.py"])
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", SANDBOX_DIR)
            .env("MPLBACKEND", "Agg")
            .env("OPENBLAS_NUM_THREADS", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let limits = self.limits;
            // SAFETY: the hook only calls setrlimit between fork and exec.
            unsafe {
                command.pre_exec(move || apply_limits(limits));
            }
        }
        command
    }
}

fn collect_artifacts(dir: &Path) -> std::io::Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let Some((_, mime)) = ARTIFACT_EXTENSIONS.iter().find(|(e, _)| *e == ext) else {
            continue;
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        artifacts.push(Artifact {
            name,
            mime_type: mime.to_string(),
            bytes: std::fs::read(&path)?,
        });
    }
    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(artifacts)
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[async_trait]
impl CodeSandbox for ProcessSandbox {
    async fn run(&self, code: &str, data: &Value) -> Result<SandboxOutput, SandboxFailure> {
        let Confinement::Bubblewrap(bwrap) = &self.confinement else {
            return Err(SandboxFailure::new(
                SandboxFailureKind::Setup,
                "refusing to run generated code unconfined: bubblewrap (bwrap) is not installed",
            ));
        };

        let workspace = self.prepare(code, data).map_err(|e| {
            SandboxFailure::new(SandboxFailureKind::Setup, format!("workspace setup failed: {}", e))
        })?;

        let mut child = self.command(bwrap, &workspace.0).spawn().map_err(|e| {
            SandboxFailure::new(
                SandboxFailureKind::Setup,
                format!("failed to start {}: {}", bwrap.display(), e),
            )
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.max_output_bytes;
        let collect = async {
            let (stdout, stderr, status) = tokio::join!(
                read_capped(stdout, limit),
                read_capped(stderr, limit),
                child.wait()
            );
            Ok::<_, std::io::Error>((stdout?, stderr?, status?))
        };

        // Dropping the child on timeout kills it.
        let (stdout, stderr, status) = match tokio::time::timeout(self.timeout, collect).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SandboxFailure::new(
                    SandboxFailureKind::Setup,
                    format!("failed to collect output: {}", e),
                ))
            }
            Err(_) => {
                warn!("Sandbox run exceeded {}ms, killed", self.timeout.as_millis());
                return Err(SandboxFailure::new(
                    SandboxFailureKind::Timeout,
                    format!("code exceeded the {}ms time limit", self.timeout.as_millis()),
                ));
            }
        };

        if !status.success() {
            let stderr = stderr.text();
            let stderr = stderr.trim();
            // bwrap reports its own setup problems with a "bwrap:" prefix.
            let kind = if stderr.starts_with("bwrap:") {
                SandboxFailureKind::Setup
            } else {
                SandboxFailureKind::Crashed
            };
            return Err(SandboxFailure::new(
                kind,
                format!("exit status {}: {}", status, tail(stderr, STDERR_TAIL)),
            ));
        }

        let artifacts = collect_artifacts(&workspace.0).map_err(|e| {
            SandboxFailure::new(SandboxFailureKind::Setup, format!("failed to read artifacts: {}", e))
        })?;
        Ok(SandboxOutput {
            stdout: stdout.text(),
            artifacts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A sandbox that can actually run Python on this host, if any
    async fn confined(timeout: Duration) -> Option<ProcessSandbox> {
        let sandbox = ProcessSandbox::new(timeout);
        if !sandbox.confinement().is_available() {
            return None;
        }
        match sandbox.run("print('ok')", &json!([])).await {
            Ok(output) if output.stdout.trim() == "ok" => Some(sandbox),
            _ => None,
        }
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("héllo", 4), "llo");
        assert_eq!(tail("ok", 10), "ok");
    }

    #[tokio::test]
    async fn test_unconfined_host_refuses_to_run() {
        let sandbox = ProcessSandbox::new(Duration::from_secs(5)).with_confinement(Confinement::Unavailable);
        let err = sandbox.run("print(1)", &json!([])).await.unwrap_err();
        assert_eq!(err.kind, SandboxFailureKind::Setup);
        assert!(err.message.contains("unconfined"));
    }

    #[tokio::test]
    async fn test_missing_confinement_binary_is_setup_failure() {
        let sandbox = ProcessSandbox::new(Duration::from_secs(5))
            .with_confinement(Confinement::Bubblewrap(PathBuf::from("/definitely/not/bwrap")));
        let err = sandbox.run("print(1)", &json!([])).await.unwrap_err();
        assert_eq!(err.kind, SandboxFailureKind::Setup);
    }

    #[tokio::test]
    async fn test_read_capped_discards_overflow() {
        let flood = vec![b'x'; 1 << 20];
        let captured = read_capped(Some(&flood[..]), 1024).await.unwrap();
        assert_eq!(captured.bytes.len(), 1024);
        assert!(captured.truncated);
        assert!(captured.text().ends_with("[output truncated]"));

        let small = read_capped(Some(&b"hello"[..]), 1024).await.unwrap();
        assert_eq!(small.text(), "hello");
        assert!(!small.truncated);
    }

    #[test]
    fn test_limits_follow_config() {
        let config = AgentConfig {
            sandbox_timeout_ms: 30_000,
            sandbox_memory_mb: 512,
            ..AgentConfig::default()
        };
        let sandbox = ProcessSandbox::from_config(&config);
        assert_eq!(sandbox.limits.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(sandbox.limits.cpu_seconds, 31);
    }

    #[tokio::test]
    async fn test_python_reads_data_and_writes_artifact() {
        let Some(sandbox) = confined(Duration::from_secs(10)).await else {
            return;
        };
        let code = "import json\nrows = json.load(open('data.json'))\nprint(sum(r['n'] for r in rows))\nopen('out.csv', 'w').write('n\\n3\\n')\n";
        let output = sandbox
            .run(code, &json!([{"n": 1}, {"n": 2}]))
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "3");
        assert_eq!(output.artifacts.len(), 1);
        assert_eq!(output.artifacts[0].mime_type, "text/csv");
    }

    #[tokio::test]
    async fn test_host_files_are_not_visible() {
        let Some(sandbox) = confined(Duration::from_secs(10)).await else {
            return;
        };
        let err = sandbox
            .run("print(open('/etc/passwd').read())\n", &json!([]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SandboxFailureKind::Crashed);
        assert!(err.message.contains("FileNotFoundError"));
    }

    #[tokio::test]
    async fn test_network_is_unreachable() {
        let Some(sandbox) = confined(Duration::from_secs(10)).await else {
            return;
        };
        let code = "import socket\ntry:\n    socket.create_connection(('1.1.1.1', 53), timeout=2)\n    print('connected')\nexcept OSError as e:\n    print('blocked', type(e).__name__)\n";
        let output = sandbox.run(code, &json!([])).await.unwrap();
        assert!(output.stdout.starts_with("blocked"), "got {}", output.stdout);
    }

    #[tokio::test]
    async fn test_output_flood_is_truncated() {
        let Some(sandbox) = confined(Duration::from_secs(10)).await else {
            return;
        };
        let sandbox = sandbox.with_max_output_bytes(4096);
        let output = sandbox
            .run("import sys\nfor _ in range(200):\n    sys.stdout.write('x' * 100000)\n", &json!([]))
            .await
            .unwrap();
        assert!(output.stdout.len() < 4096 + 64);
        assert!(output.stdout.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn test_python_timeout_and_crash() {
        let Some(sandbox) = confined(Duration::from_secs(10)).await else {
            return;
        };
        let crash = sandbox.run("raise ValueError('bad data')\n", &json!([])).await.unwrap_err();
        assert_eq!(crash.kind, SandboxFailureKind::Crashed);
        assert!(crash.message.contains("bad data"));

        let slow = ProcessSandbox::new(Duration::from_millis(500));
        let err = slow.run("import time\ntime.sleep(5)\n", &json!([])).await.unwrap_err();
        assert_eq!(err.kind, SandboxFailureKind::Timeout);
    }
}
