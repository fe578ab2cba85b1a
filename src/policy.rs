use crate::config::Endpoint;
use crate::fs_scan::stat_candidate;
use crate::invoker::{ExecResult, SignTool};
use crate::stats::RunState;
use crate::types::{Job, Operation, Outcome};
use std::io::ErrorKind;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackResult<'e> {
    Signed(&'e Endpoint),
    Exhausted { last_error: String },
}

fn file_name(p: &Path) -> String {
    p.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| p.display().to_string())
}

/// Everything a worker needs to carry one job to a terminal state.
pub struct Signer<'a> {
    pub tool: &'a dyn SignTool,
    pub endpoints: &'a [Endpoint],
    pub state: &'a RunState,
}

impl<'a> Signer<'a> {
    /// Try each endpoint in order, stop at the first success.
    pub fn sign_with_fallback(&self, path: &Path) -> FallbackResult<'a> {
        let mut last_error = "no timestamp endpoints configured".to_string();

        for endpoint in self.endpoints {
            info!("  Attempting signature with: {}", endpoint.name);
            let attempt = panic::catch_unwind(AssertUnwindSafe(|| self.tool.sign(path, endpoint, false)));
            let result = attempt.unwrap_or_else(|_| ExecResult::Failure("signing attempt panicked".to_string()));
            if result.is_success() {
                info!("  SUCCESS: Signed with {}", endpoint.name);
                return FallbackResult::Signed(endpoint);
            }
            warn!("  Failed with {} ({})", endpoint.name, result.describe());
            last_error = format!("Failed with {}: {}", endpoint.name, result.describe());
        }

        FallbackResult::Exhausted { last_error }
    }

    /// One quiet attempt against the first endpoint, to surface credential
    /// prompts before the bulk pass. A success completes the file's job.
    pub fn preflight(&self, path: &Path) -> bool {
        info!("TEST SIGNING: {}", file_name(path));

        let Some(first) = self.endpoints.first() else {
            warn!("  WARNING: no timestamp endpoint configured, skipping test signing");
            return false;
        };

        if self.tool.sign(path, first, true).is_success() {
            info!("  SUCCESS: test signing worked with {}", first.name);
            self.state.record_signed(path, &first.name);
            true
        } else {
            warn!("  WARNING: Password prompt may appear for each file");
            false
        }
    }

    pub fn run_job(&self, job: &Job) -> Outcome {
        match job.operation {
            Operation::Sign => self.run_sign_job(job),
            Operation::RemoveSignature => self.run_remove_job(job),
        }
    }

    fn run_sign_job(&self, job: &Job) -> Outcome {
        let path = job.path.as_path();
        let name = file_name(path);

        let outcome = match stat_candidate(path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Outcome::Skipped {
                reason: "file not found".to_string(),
            },
            Err(e) => Outcome::Failed {
                reason: format!("cannot access file: {e}"),
                retryable: false,
            },
            Ok(c) if c.size == 0 => Outcome::Skipped {
                reason: "empty file".to_string(),
            },
            Ok(_) if !job.is_retry && self.tool.verify(path) => Outcome::Skipped {
                reason: "already signed".to_string(),
            },
            Ok(c) => {
                debug!("candidate {} ({}, {} bytes)", c.path.display(), c.extension, c.size);
                let retry_tag = if job.is_retry { " [RETRY]" } else { "" };
                info!("PROCESSING: {}{}", name, retry_tag);
                if let Some(dir) = path.parent() {
                    info!("  Location: {}", dir.display());
                }

                match self.sign_with_fallback(path) {
                    FallbackResult::Signed(endpoint) => {
                        self.state.record_signed(path, &endpoint.name);
                        return Outcome::Success;
                    }
                    FallbackResult::Exhausted { last_error } => Outcome::Failed {
                        reason: last_error,
                        retryable: true,
                    },
                }
            }
        };

        match &outcome {
            Outcome::Skipped { reason } => info!("SKIPPED: {} ({})", name, reason),
            Outcome::Failed { reason, .. } => {
                warn!("FAILED: Could not sign {}", name);
                warn!("  Last error: {}", reason);
            }
            Outcome::Success => {}
        }
        self.state.record(path, &outcome);
        outcome
    }

    fn run_remove_job(&self, job: &Job) -> Outcome {
        let path = job.path.as_path();
        let name = file_name(path);
        info!("REMOVING SIGNATURE: {}", name);

        let result = self.tool.remove(path);
        let outcome = if result.is_success() {
            info!("SUCCESS: File unsigned - {}", name);
            Outcome::Success
        } else if !self.tool.verify(path) {
            info!("SKIPPED: File has no signature to remove - {}", name);
            Outcome::Skipped {
                reason: "no signature to remove".to_string(),
            }
        } else {
            warn!("FAILED: Could not remove signature from {}", name);
            Outcome::Failed {
                reason: result.describe(),
                retryable: false,
            }
        };

        self.state.record(path, &outcome);
        outcome
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted stand-in for the signing utility.
    #[derive(Default)]
    pub struct FakeTool {
        /// endpoint urls that always fail
        pub failing_endpoints: HashSet<String>,
        /// files that every endpoint refuses to sign
        pub unsignable: HashSet<PathBuf>,
        /// fail the first N sign attempts of a file, then succeed
        pub fail_first: HashMap<PathBuf, usize>,
        pub signed: Mutex<HashSet<PathBuf>>,
        pub remove_fails: bool,
        pub sign_calls: Mutex<Vec<(PathBuf, String)>>,
        pub verify_calls: AtomicUsize,
        pub remove_calls: AtomicUsize,
    }

    impl FakeTool {
        pub fn mark_signed(&self, p: &Path) {
            self.signed.lock().unwrap().insert(p.to_path_buf());
        }

        pub fn sign_count(&self, p: &Path) -> usize {
            self.sign_calls.lock().unwrap().iter().filter(|(f, _)| f == p).count()
        }

        pub fn total_sign_calls(&self) -> usize {
            self.sign_calls.lock().unwrap().len()
        }
    }

    impl SignTool for FakeTool {
        fn sign(&self, file: &Path, endpoint: &Endpoint, _quiet: bool) -> ExecResult {
            let attempt = {
                let mut calls = self.sign_calls.lock().unwrap();
                calls.push((file.to_path_buf(), endpoint.url.clone()));
                calls.iter().filter(|(f, _)| f == file).count()
            };

            let scripted_fail = self.fail_first.get(file).is_some_and(|n| attempt <= *n);
            if self.unsignable.contains(file) || scripted_fail || self.failing_endpoints.contains(&endpoint.url) {
                return ExecResult::Failure("exit code 1".to_string());
            }
            self.mark_signed(file);
            ExecResult::Success
        }

        fn verify(&self, file: &Path) -> bool {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            self.signed.lock().unwrap().contains(file)
        }

        fn remove(&self, file: &Path) -> ExecResult {
            self.remove_calls.fetch_add(1, Ordering::SeqCst);
            let mut signed = self.signed.lock().unwrap();
            if self.remove_fails || !signed.contains(file) {
                return ExecResult::Failure("exit code 1".to_string());
            }
            signed.remove(file);
            ExecResult::Success
        }
    }

    pub fn endpoints(names: &[&str]) -> Vec<Endpoint> {
        names
            .iter()
            .map(|n| Endpoint {
                url: format!("http://{}.example", n.to_lowercase()),
                name: n.to_string(),
            })
            .collect()
    }
}
