//! Sandbox executor — runs approved skill code in an isolated subprocess.
//!
//! The security model is additive: the child's environment is built from an
//! empty base (`env_clear`) and receives exactly the declared secrets and
//! invocation arguments plus the runtime minimum (PATH, HOME, TMPDIR
//! pointing at a per-invocation scratch directory). The parent's ambient
//! environment — which holds chat credentials — is never forwarded.
//!
//! Two interchangeable modes sit behind one contract:
//!   direct    — interpreter argv + code path; used when the broker itself
//!               already runs inside an outer isolation boundary
//!   container — isolation wrapper argv + allow-list and limit flags +
//!               code path; the wrapper enforces network/fs/memory/cpu
//!
//! Output capture is bounded per stream; the wall-clock timeout kills the
//! child and reports the sentinel exit code. The per-invocation directory
//! (code file + scratch) is removed on every exit path.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::{SandboxConfig, SandboxMode};
use crate::request::{ExecutionResult, TIMEOUT_EXIT_CODE};

/// Per-stream capture limit: 1 MB, truncated with a marker on overflow.
const MAX_STREAM_BYTES: usize = 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Everything a single run needs. Secrets and args become the child's
/// entire environment (plus the runtime minimum).
pub struct Invocation {
    pub code: Vec<u8>,
    pub secrets: BTreeMap<String, Vec<u8>>,
    pub args: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub network: Vec<String>,
}

#[derive(Debug)]
pub enum SandboxError {
    /// Run directory or code file could not be prepared.
    Setup(String),
    /// The subprocess could not be spawned or awaited.
    Launch(String),
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup(e) => write!(f, "sandbox setup failed: {e}"),
            Self::Launch(e) => write!(f, "sandbox launch failed: {e}"),
        }
    }
}

impl std::error::Error for SandboxError {}

pub struct SandboxExecutor {
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Runs one invocation to completion (or timeout).
    ///
    /// `fingerprint` names the code for the run directory; the directory is
    /// unique per invocation so parallel runs of the same code never
    /// collide.
    pub async fn execute(
        &self,
        fingerprint: &str,
        invocation: Invocation,
    ) -> Result<ExecutionResult, SandboxError> {
        let run_dir = self.config.run_dir.join(format!(
            "{}-{}",
            &fingerprint[..fingerprint.len().min(12)],
            crate::request::fresh_id()
        ));
        let result = self.run_in(&run_dir, invocation).await;
        if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to clean run dir {}: {e}", run_dir.display());
            }
        }
        result
    }

    async fn run_in(
        &self,
        run_dir: &Path,
        invocation: Invocation,
    ) -> Result<ExecutionResult, SandboxError> {
        let scratch = run_dir.join("scratch");
        let code_path = run_dir.join("skill.code");
        prepare_dirs(run_dir, &scratch, &code_path, &invocation.code)
            .await
            .map_err(|e| SandboxError::Setup(e.to_string()))?;

        let argv = build_argv(&self.config, &invocation.network, &scratch, &code_path);
        debug!("Sandbox argv: {argv:?}");
        if argv.len() < 2 {
            return Err(SandboxError::Setup("empty sandbox argv".to_string()));
        }

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.current_dir(&scratch);

        // Additive environment from an empty base — never inherit-and-redact
        cmd.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", &scratch);
        cmd.env("TMPDIR", &scratch);
        for (name, value) in &invocation.args {
            cmd.env(name, value);
        }
        for (name, value) in &invocation.secrets {
            use std::os::unix::ffi::OsStrExt;
            cmd.env(name, std::ffi::OsStr::from_bytes(value));
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // No orphans if this future is cancelled
        cmd.kill_on_drop(true);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Launch(format!("spawn '{}': {e}", argv[0])))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Launch("stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Launch("stderr not captured".to_string()))?;

        let deadline = Duration::from_secs(invocation.timeout_secs.max(1));
        let run = async {
            let (out, err) = tokio::join!(
                read_bounded(&mut stdout, MAX_STREAM_BYTES),
                read_bounded(&mut stderr, MAX_STREAM_BYTES),
            );
            let status = child.wait().await;
            (status, out, err)
        };

        match tokio::time::timeout(deadline, run).await {
            Ok((status, (out, out_full), (err, err_full))) => {
                let status = status.map_err(|e| SandboxError::Launch(format!("wait: {e}")))?;
                let exit_code = status.code().unwrap_or(-1);
                Ok(ExecutionResult {
                    success: status.success(),
                    exit_code,
                    stdout: render_stream(out, out_full),
                    stderr: render_stream(err, err_full),
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed-out child: {e}");
                }
                let _ = child.wait().await;
                Ok(ExecutionResult {
                    success: false,
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout: String::new(),
                    stderr: format!(
                        "[terminated: exceeded {}s wall-clock timeout]",
                        invocation.timeout_secs
                    ),
                    duration_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }
}

/// Creates the run layout: private dir, scratch subdir, code file readable
/// only by the owner.
async fn prepare_dirs(
    run_dir: &Path,
    scratch: &Path,
    code_path: &Path,
    code: &[u8],
) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::create_dir_all(scratch).await?;
    tokio::fs::set_permissions(run_dir, std::fs::Permissions::from_mode(0o700)).await?;
    tokio::fs::write(code_path, code).await?;
    tokio::fs::set_permissions(code_path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

/// Assembles the child argv for the configured mode.
fn build_argv(
    config: &SandboxConfig,
    network: &[String],
    scratch: &Path,
    code_path: &Path,
) -> Vec<String> {
    let mut argv: Vec<String> = match config.mode {
        SandboxMode::Direct => config.interpreter.clone(),
        SandboxMode::Container => {
            let mut argv = config.container_cmd.clone();
            // Empty allow-list means no network; the wrapper's default
            argv.push(format!("--allow-net={}", network.join(",")));
            argv.push(format!("--memory-limit-mb={}", config.memory_limit_mb));
            argv.push(format!("--cpu-limit={}", config.cpu_limit));
            argv.push(format!("--scratch={}", scratch.display()));
            argv.push("--".to_string());
            argv
        }
    };
    argv.push(code_path.display().to_string());
    argv
}

/// Reads up to `limit` bytes; returns `(bytes, complete)` where `complete`
/// is false when the stream was cut at the limit.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    limit: usize,
) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return (buf, true),
            Ok(n) => {
                if buf.len() + n > limit {
                    let take = limit - buf.len();
                    buf.extend_from_slice(&chunk[..take]);
                    return (buf, false);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

fn render_stream(bytes: Vec<u8>, complete: bool) -> String {
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if !complete {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use tempfile::TempDir;

    /// Direct-mode executor driving /bin/sh, scoped to a temp run dir.
    fn sh_executor() -> (SandboxExecutor, TempDir) {
        let tmp = TempDir::new().unwrap();
        let config = SandboxConfig {
            mode: SandboxMode::Direct,
            interpreter: vec!["/bin/sh".to_string()],
            run_dir: tmp.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        (SandboxExecutor::new(config), tmp)
    }

    fn invocation(code: &str, timeout_secs: u64) -> Invocation {
        Invocation {
            code: code.as_bytes().to_vec(),
            secrets: BTreeMap::new(),
            args: BTreeMap::new(),
            timeout_secs,
            network: vec![],
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_zero() {
        let (exec, _tmp) = sh_executor();
        let result = exec
            .execute("fp1", invocation("printf HELLO", 30))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "HELLO");
        assert_eq!(result.stderr, "");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_success() {
        let (exec, _tmp) = sh_executor();
        let result = exec
            .execute("fp2", invocation("echo oops >&2; exit 7", 30))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let (exec, _tmp) = sh_executor();
        let result = exec
            .execute("fp3", invocation("sleep 5", 1))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(
            (1000..1500).contains(&result.duration_ms),
            "duration {}ms outside timeout window",
            result.duration_ms
        );
    }

    #[tokio::test]
    async fn test_environment_is_additive_only() {
        std::env::set_var("SKILLGATE_PARENT_TOKEN", "chat-credential");
        let (exec, _tmp) = sh_executor();
        let mut inv = invocation("env | sort", 30);
        inv.secrets
            .insert("API_KEY".to_string(), b"sk-sentinel".to_vec());
        inv.args
            .insert("TARGET".to_string(), "staging".to_string());
        let result = exec.execute("fp4", inv).await.unwrap();
        assert!(result.success);
        // Declared names present
        assert!(result.stdout.contains("API_KEY=sk-sentinel"));
        assert!(result.stdout.contains("TARGET=staging"));
        // Runtime minimum present
        assert!(result.stdout.contains("PATH="));
        assert!(result.stdout.contains("HOME="));
        // Parent credentials absent
        assert!(!result.stdout.contains("SKILLGATE_PARENT_TOKEN"));
        assert!(!result.stdout.contains("chat-credential"));
    }

    #[tokio::test]
    async fn test_home_and_tmpdir_point_at_scratch() {
        let (exec, _tmp) = sh_executor();
        let result = exec
            .execute(
                "fp5",
                invocation("printf %s \"$HOME\" ; [ \"$HOME\" = \"$TMPDIR\" ] || exit 3", 30),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.stdout.ends_with("/scratch"));
    }

    #[tokio::test]
    async fn test_scratch_is_writable() {
        let (exec, _tmp) = sh_executor();
        let result = exec
            .execute("fp6", invocation("echo data > \"$TMPDIR/f\" && cat \"$TMPDIR/f\"", 30))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "data\n");
    }

    #[tokio::test]
    async fn test_run_dir_cleaned_up() {
        let (exec, tmp) = sh_executor();
        exec.execute("fp7", invocation("printf x", 30))
            .await
            .unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "run dir not removed: {leftovers:?}");
    }

    #[tokio::test]
    async fn test_run_dir_cleaned_up_after_timeout() {
        let (exec, tmp) = sh_executor();
        exec.execute("fp8", invocation("sleep 5", 1)).await.unwrap();
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_stdout_truncated_with_marker() {
        let (exec, _tmp) = sh_executor();
        // ~2 MB of output against the 1 MB cap
        let result = exec
            .execute(
                "fp9",
                invocation(
                    "i=0; while [ $i -lt 2048 ]; do head -c 1024 /dev/zero | tr '\\0' 'a'; i=$((i+1)); done",
                    30,
                ),
            )
            .await
            .unwrap();
        assert!(result.stdout.ends_with(TRUNCATION_MARKER));
        assert!(result.stdout.len() <= MAX_STREAM_BYTES + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_launch_error() {
        let tmp = TempDir::new().unwrap();
        let config = SandboxConfig {
            mode: SandboxMode::Direct,
            interpreter: vec!["/nonexistent/interpreter".to_string()],
            run_dir: tmp.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        let exec = SandboxExecutor::new(config);
        let err = exec
            .execute("fp10", invocation("printf x", 30))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Launch(_)));
    }

    #[test]
    fn test_container_argv_carries_allow_list_and_limits() {
        let config = SandboxConfig {
            mode: SandboxMode::Container,
            container_cmd: vec!["skillbox".to_string(), "--profile".to_string(), "strict".to_string()],
            memory_limit_mb: 512,
            cpu_limit: 1.5,
            ..SandboxConfig::default()
        };
        let argv = build_argv(
            &config,
            &["api.example".to_string(), "cdn.example".to_string()],
            Path::new("/runs/x/scratch"),
            Path::new("/runs/x/skill.code"),
        );
        assert_eq!(argv[0], "skillbox");
        assert!(argv.contains(&"--allow-net=api.example,cdn.example".to_string()));
        assert!(argv.contains(&"--memory-limit-mb=512".to_string()));
        assert!(argv.contains(&"--cpu-limit=1.5".to_string()));
        assert_eq!(argv.last().unwrap(), "/runs/x/skill.code");
        // Code path comes after the flag terminator
        let sep = argv.iter().position(|a| a == "--").unwrap();
        assert!(sep < argv.len() - 1);
    }

    #[test]
    fn test_container_argv_empty_network_means_none() {
        let config = SandboxConfig {
            mode: SandboxMode::Container,
            ..SandboxConfig::default()
        };
        let argv = build_argv(&config, &[], Path::new("/s"), Path::new("/c"));
        assert!(argv.contains(&"--allow-net=".to_string()));
    }

    #[test]
    fn test_direct_argv_is_interpreter_plus_path() {
        let config = SandboxConfig {
            mode: SandboxMode::Direct,
            interpreter: vec!["/usr/bin/python3".to_string(), "-I".to_string()],
            ..SandboxConfig::default()
        };
        let argv = build_argv(&config, &[], Path::new("/s"), Path::new("/c/skill.code"));
        assert_eq!(argv, vec!["/usr/bin/python3", "-I", "/c/skill.code"]);
    }
}
