use crate::config::CredentialCheck;
use crate::invoker::run_process;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Pre-flight gate: the signing certificate must be present in the
/// user's store before any file is touched.
pub trait CredentialStore {
    fn has_credential(&self, thumbprint: &str) -> bool;
}

/// Asks a store lookup command (certutil by default); exit code 0 means found.
pub struct CommandStore {
    check: CredentialCheck,
}

impl CommandStore {
    pub fn new(check: CredentialCheck) -> Self {
        CommandStore { check }
    }

    fn args_for(&self, thumbprint: &str) -> Vec<OsString> {
        self.check
            .args
            .iter()
            .map(|a| OsString::from(a.replace("{thumbprint}", thumbprint)))
            .collect()
    }
}

impl CredentialStore for CommandStore {
    fn has_credential(&self, thumbprint: &str) -> bool {
        if !self.check.enabled {
            info!("Certificate check disabled in config");
            return true;
        }
        if thumbprint.trim().is_empty() {
            return false;
        }

        let exec = run_process(
            &PathBuf::from(&self.check.program),
            &self.args_for(thumbprint),
            None,
            CHECK_TIMEOUT,
            true,
        );
        debug!("certificate lookup {} => {:?}", self.check.program, exec.result);
        exec.result.is_success()
    }
}
