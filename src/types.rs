use std::path::PathBuf;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Operation {
    Sign,
    RemoveSignature,
}

impl Operation {
    pub fn label(self) -> &'static str {
        match self {
            Operation::Sign => "SIGN FILES",
            Operation::RemoveSignature => "REMOVE SIGNATURES",
        }
    }
}

/// What the command line asked for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    SingleFile {
        path: PathBuf,
    },
    Directory {
        root: PathBuf,
        recursive: bool,
        /// normalized ".ext" form, lowercase
        extensions: Vec<String>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunRequest {
    pub target: Target,
    pub operation: Operation,
}

#[derive(Clone, Debug)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub extension: String,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct Job {
    pub path: PathBuf,
    pub operation: Operation,
    /// retry jobs skip the already-signed probe
    pub is_retry: bool,
}

impl Job {
    pub fn new(path: PathBuf, operation: Operation) -> Self {
        Job {
            path,
            operation,
            is_retry: false,
        }
    }

    pub fn retry(path: PathBuf) -> Self {
        Job {
            path,
            operation: Operation::Sign,
            is_retry: true,
        }
    }
}

/// Terminal classification of one job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Success,
    Failed {
        reason: String,
        /// sign failures re-enter the single retry pass
        retryable: bool,
    },
    Skipped {
        reason: String,
    },
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RunSummary {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.success + self.failed + self.skipped
    }
}
