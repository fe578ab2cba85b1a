use crate::config::{Endpoint, SignConfig};
use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("output reader thread panicked")]
    ReaderPanic,
}

/// Classification of one subprocess invocation. Only the exit code decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecResult {
    Success,
    Failure(String),
    Timeout,
}

impl ExecResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecResult::Success)
    }

    pub fn describe(&self) -> String {
        match self {
            ExecResult::Success => "success".to_string(),
            ExecResult::Failure(reason) => reason.clone(),
            ExecResult::Timeout => "timed out".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Execution {
    pub result: ExecResult,
    pub stdout: String,
    pub stderr: String,
}

impl Execution {
    fn failed(reason: String) -> Self {
        Execution {
            result: ExecResult::Failure(reason),
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Reaps the child on every exit path.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn wait_timeout(&mut self, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
        let status = self.child.wait_timeout(timeout)?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut p| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join(handle: Option<JoinHandle<String>>) -> Result<String, ToolError> {
    match handle {
        Some(h) => h.join().map_err(|_| ToolError::ReaderPanic),
        None => Ok(String::new()),
    }
}

/// Readers get this long to hit EOF after a kill. A grandchild that
/// inherited the pipes keeps them open; its reader is then detached.
const READER_GRACE: Duration = Duration::from_secs(2);

fn join_within(handle: Option<JoinHandle<String>>, grace: Duration) -> String {
    let Some(h) = handle else {
        return String::new();
    };
    let deadline = Instant::now() + grace;
    while !h.is_finished() {
        if Instant::now() >= deadline {
            debug!("output reader still attached after kill, detaching");
            return String::new();
        }
        thread::sleep(Duration::from_millis(20));
    }
    h.join().unwrap_or_default()
}

fn spawn_and_wait(
    program: &Path,
    args: &[OsString],
    search_path: Option<&OsStr>,
    timeout: Duration,
) -> Result<Execution, ToolError> {
    let name = program.display().to_string();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(p) = search_path {
        cmd.env("PATH", p);
    }

    let child = cmd.spawn().map_err(|source| ToolError::Spawn {
        program: name.clone(),
        source,
    })?;
    let mut guard = ChildGuard {
        child,
        reaped: false,
    };

    // Đọc pipe song song để tránh deadlock khi output > pipe buffer
    let stdout = drain(guard.child.stdout.take());
    let stderr = drain(guard.child.stderr.take());

    let status = guard.wait_timeout(timeout).map_err(|source| ToolError::Wait {
        program: name.clone(),
        source,
    })?;

    let Some(status) = status else {
        guard.kill();
        return Ok(Execution {
            result: ExecResult::Timeout,
            stdout: join_within(stdout, READER_GRACE),
            stderr: join_within(stderr, READER_GRACE),
        });
    };

    let stdout = join(stdout)?;
    let stderr = join(stderr)?;

    let result = if status.success() {
        ExecResult::Success
    } else {
        match status.code() {
            Some(code) => ExecResult::Failure(format!("exit code {code}")),
            None => ExecResult::Failure("terminated by signal".to_string()),
        }
    };

    Ok(Execution {
        result,
        stdout,
        stderr,
    })
}

/// Run `program` with a hard deadline. Never returns an error: launch and
/// wait faults become `ExecResult::Failure`.
pub fn run_process(
    program: &Path,
    args: &[OsString],
    search_path: Option<&OsStr>,
    timeout: Duration,
    quiet: bool,
) -> Execution {
    let exec = match spawn_and_wait(program, args, search_path, timeout) {
        Ok(e) => e,
        Err(e) => Execution::failed(e.to_string()),
    };

    if !quiet {
        let out = exec.stdout.trim();
        if !out.is_empty() {
            info!("      Output: {}", out);
        }
        let err = exec.stderr.trim();
        if !err.is_empty() {
            warn!("      Error: {}", err);
        }
        match &exec.result {
            ExecResult::Success => {}
            ExecResult::Timeout => warn!("      TIMEOUT: process took too long, killed"),
            ExecResult::Failure(reason) => warn!("      {}", reason),
        }
    }

    exec
}

/// PATH with `dir` appended, unless it is already present.
pub fn path_with_dir(current: Option<&OsStr>, dir: &Path) -> (OsString, bool) {
    let mut paths: Vec<PathBuf> = current
        .map(|c| std::env::split_paths(c).collect())
        .unwrap_or_default();

    if paths.iter().any(|p| p == dir) {
        let joined = current.map(|c| c.to_os_string()).unwrap_or_default();
        return (joined, false);
    }

    paths.push(dir.to_path_buf());
    match std::env::join_paths(paths) {
        Ok(joined) => (joined, true),
        Err(_) => (current.map(|c| c.to_os_string()).unwrap_or_default(), false),
    }
}

pub fn sign_args(digest: &str, url: &str, thumbprint: &str, file: &Path) -> Vec<OsString> {
    vec![
        "sign".into(),
        "/fd".into(),
        digest.into(),
        "/tr".into(),
        url.into(),
        "/td".into(),
        digest.into(),
        "/sha1".into(),
        thumbprint.into(),
        file.as_os_str().to_os_string(),
    ]
}

pub fn verify_args(file: &Path) -> Vec<OsString> {
    vec!["verify".into(), "/pa".into(), file.as_os_str().to_os_string()]
}

pub fn remove_args(file: &Path) -> Vec<OsString> {
    vec!["remove".into(), "/s".into(), file.as_os_str().to_os_string()]
}

/// The external signing utility as seen by the policy layer.
pub trait SignTool: Send + Sync {
    fn sign(&self, file: &Path, endpoint: &Endpoint, quiet: bool) -> ExecResult;

    /// Read-only probe: is the file currently signed?
    fn verify(&self, file: &Path) -> bool;

    fn remove(&self, file: &Path) -> ExecResult;
}

pub struct ProcessTool {
    program: PathBuf,
    thumbprint: String,
    digest: String,
    sign_timeout: Duration,
    verify_timeout: Duration,
    search_path: Option<OsString>,
}

impl ProcessTool {
    pub fn from_config(cfg: &SignConfig) -> Self {
        let search_path = cfg.tool_path.parent().filter(|d| !d.as_os_str().is_empty()).map(|dir| {
            let current = std::env::var_os("PATH");
            let (joined, appended) = path_with_dir(current.as_deref(), dir);
            if appended {
                info!("Added to PATH: {}", dir.display());
            }
            joined
        });

        ProcessTool {
            program: cfg.tool_path.clone(),
            thumbprint: cfg.thumbprint.clone(),
            digest: cfg.digest.clone(),
            sign_timeout: cfg.sign_timeout(),
            verify_timeout: cfg.verify_timeout(),
            search_path,
        }
    }
}

impl SignTool for ProcessTool {
    fn sign(&self, file: &Path, endpoint: &Endpoint, quiet: bool) -> ExecResult {
        let args = sign_args(&self.digest, &endpoint.url, &self.thumbprint, file);
        run_process(&self.program, &args, self.search_path.as_deref(), self.sign_timeout, quiet).result
    }

    fn verify(&self, file: &Path) -> bool {
        let exec = run_process(
            &self.program,
            &verify_args(file),
            self.search_path.as_deref(),
            self.verify_timeout,
            true,
        );
        debug!("verify {} => {:?}", file.display(), exec.result);
        exec.result.is_success()
    }

    fn remove(&self, file: &Path) -> ExecResult {
        run_process(
            &self.program,
            &remove_args(file),
            self.search_path.as_deref(),
            self.sign_timeout,
            false,
        )
        .result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_grammar() {
        let file = Path::new("/tmp/app.exe");
        let args = sign_args("SHA256", "http://ts.example", "ABCD", file);
        let joined: Vec<String> = args.iter().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(
            joined,
            vec![
                "sign", "/fd", "SHA256", "/tr", "http://ts.example", "/td", "SHA256", "/sha1", "ABCD",
                "/tmp/app.exe"
            ]
        );
        assert_eq!(verify_args(file)[..2], [OsString::from("verify"), OsString::from("/pa")]);
        assert_eq!(remove_args(file)[..2], [OsString::from("remove"), OsString::from("/s")]);
    }

    #[test]
    fn path_append_is_idempotent() {
        let dir = Path::new("/opt/kits/bin");
        let base = std::env::join_paths([Path::new("/usr/bin"), Path::new("/bin")]).unwrap();

        let (once, appended) = path_with_dir(Some(base.as_os_str()), dir);
        assert!(appended);
        assert!(std::env::split_paths(&once).any(|p| p == dir));

        let (twice, appended_again) = path_with_dir(Some(once.as_os_str()), dir);
        assert!(!appended_again);
        assert_eq!(once, twice);

        let (fresh, appended) = path_with_dir(None, dir);
        assert!(appended);
        assert_eq!(fresh, OsString::from("/opt/kits/bin"));
    }

    #[test]
    fn launch_failure_is_a_failure_not_a_panic() {
        let exec = run_process(
            Path::new("/definitely/not/here/signtool"),
            &[],
            None,
            Duration::from_secs(1),
            true,
        );
        assert!(matches!(exec.result, ExecResult::Failure(_)));
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Vec<OsString> {
        vec!["-c".into(), script.into()]
    }

    #[cfg(unix)]
    #[test]
    fn exit_code_is_authoritative_and_output_captured() {
        let ok = run_process(Path::new("sh"), &sh("echo hello; echo oops 1>&2"), None, Duration::from_secs(5), true);
        assert_eq!(ok.result, ExecResult::Success);
        assert_eq!(ok.stdout.trim(), "hello");
        assert_eq!(ok.stderr.trim(), "oops");

        let bad = run_process(Path::new("sh"), &sh("echo Successfully signed; exit 3"), None, Duration::from_secs(5), true);
        assert_eq!(bad.result, ExecResult::Failure("exit code 3".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_child_without_blocking_siblings() {
        let started = Instant::now();
        let (slow, fast) = thread::scope(|s| {
            let slow = s.spawn(|| {
                run_process(Path::new("sh"), &sh("exec sleep 30"), None, Duration::from_millis(300), true)
            });
            let fast = s.spawn(|| {
                let t = Instant::now();
                let e = run_process(Path::new("sh"), &sh("exit 0"), None, Duration::from_secs(10), true);
                (e, t.elapsed())
            });
            (slow.join().unwrap(), fast.join().unwrap())
        });

        assert_eq!(slow.result, ExecResult::Timeout);
        assert_eq!(fast.0.result, ExecResult::Success);
        assert!(fast.1 < Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_keeps_partial_output() {
        let exec = run_process(
            Path::new("sh"),
            &sh("echo partial; exec sleep 30"),
            None,
            Duration::from_millis(300),
            true,
        );
        assert_eq!(exec.result, ExecResult::Timeout);
        assert_eq!(exec.stdout.trim(), "partial");
    }

    #[cfg(unix)]
    #[test]
    fn timeout_with_orphaned_pipe_holder_returns_promptly() {
        let started = Instant::now();
        let exec = run_process(
            Path::new("sh"),
            &sh("sleep 8 & exec sleep 30"),
            None,
            Duration::from_millis(300),
            true,
        );
        assert_eq!(exec.result, ExecResult::Timeout);
        // two readers, each bounded by the grace period
        assert!(started.elapsed() < Duration::from_secs(6), "{:?}", started.elapsed());
    }
}
