use crate::policy::Signer;
use crate::types::{Job, Outcome};
use anyhow::{Result, anyhow};
use rayon::prelude::*;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// One pass: every job runs exactly once on a bounded pool.
/// Completion order is not defined.
pub fn run_pass(signer: &Signer<'_>, jobs: &[Job], workers: usize) -> Result<()> {
    if jobs.is_empty() {
        return Ok(());
    }

    let workers = workers.max(1).min(jobs.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("sign-worker-{i}"))
        .build()
        .map_err(|e| anyhow!("rayon threadpool build failed: {}", e))?;

    info!("STARTING PARALLEL PROCESSING WITH {} THREADS ({} jobs)", workers, jobs.len());

    pool.install(|| {
        jobs.par_iter().for_each(|job| {
            // panic trong 1 job không được kéo sập cả pool
            let run = panic::catch_unwind(AssertUnwindSafe(|| signer.run_job(job)));
            if run.is_err() {
                error!("UNEXPECTED ERROR with {}", job.path.display());
                signer.state.record(
                    &job.path,
                    &Outcome::Failed {
                        reason: "worker panicked".to_string(),
                        retryable: false,
                    },
                );
            }
        })
    });

    Ok(())
}

/// Re-run failed sign jobs once. There is never a second retry pass.
pub fn retry_failed(signer: &Signer<'_>, workers: usize) -> Result<usize> {
    let batch: Vec<PathBuf> = signer.state.take_retry_batch();
    if batch.is_empty() {
        return Ok(0);
    }

    warn!("RETRYING {} FAILED FILES...", batch.len());
    let jobs: Vec<Job> = batch.into_iter().map(Job::retry).collect();
    run_pass(signer, &jobs, workers)?;
    Ok(jobs.len())
}
