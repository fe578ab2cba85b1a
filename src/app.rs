use crate::args::{ParsedArgs, RawTarget};
use crate::config::SignConfig;
use crate::fs_scan::{self, SearchResult};
use crate::hw::HwInfo;
use crate::policy::Signer;
use crate::types::{Job, Operation, RunRequest, RunSummary, Target};
use crate::{autotune, pool};

use anyhow::{Result, anyhow};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub struct AppConfig {
    pub sign: SignConfig,
    pub workers: Option<usize>,
    pub hw: HwInfo,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Discover,
    Probe,
    BulkExecute,
    Retry,
    Report,
}

/* =========================
   Target resolution
   ========================= */

/// Console chooser for ambiguous smart-search results (1-indexed).
pub fn prompt_selection(term: &str, candidates: &[PathBuf]) -> Option<usize> {
    println!("Multiple files matching '{}' found. Select one of the following:", term);
    for (i, c) in candidates.iter().enumerate() {
        println!("{}. {}", i + 1, c.display());
    }
    print!("\nEnter selection (1-{}): ", candidates.len());
    let _ = io::stdout().flush();

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    line.trim().parse().ok()
}

/// Turn parsed arguments into a concrete request. `choose` decides
/// ambiguous smart searches.
pub fn resolve_request(
    parsed: ParsedArgs,
    search_extensions: &[String],
    choose: &mut dyn FnMut(&str, &[PathBuf]) -> Option<usize>,
) -> Result<RunRequest> {
    let target = match parsed.target {
        RawTarget::File(path) => Target::SingleFile {
            path: fs_scan::absolute(&path),
        },
        RawTarget::Directory { root, recursive } => Target::Directory {
            root,
            recursive,
            extensions: parsed.extensions,
        },
        RawTarget::Search { root, term } => {
            let path = match fs_scan::smart_find(&root, &term, search_extensions)? {
                SearchResult::NotFound => {
                    return Err(anyhow!("No files found matching '{}' in {}", term, root.display()));
                }
                SearchResult::Resolved(p) => {
                    info!("Found: {}", p.display());
                    p
                }
                SearchResult::Ambiguous(list) => {
                    let picked = choose(&term, &list).and_then(|n| fs_scan::pick_candidate(&list, n));
                    let p = picked.ok_or_else(|| anyhow!("Invalid selection"))?;
                    info!("Selected: {}", p.display());
                    p
                }
            };
            Target::SingleFile { path }
        }
    };

    Ok(RunRequest {
        target,
        operation: parsed.operation,
    })
}

/* =========================
   Mode controller
   ========================= */

struct Controller {
    visited: Vec<Phase>,
}

impl Controller {
    fn enter(&mut self, phase: Phase) {
        debug!("phase -> {:?}", phase);
        self.visited.push(phase);
    }
}

/// Probe on the representative file. Returns true when the probe itself
/// completed that file's job.
fn probe(ctl: &mut Controller, signer: &Signer<'_>, file: &Path) -> bool {
    ctl.enter(Phase::Probe);
    if signer.tool.verify(file) {
        info!("TEST SIGNING skipped: {} is already signed", file.display());
        return false;
    }
    info!("TESTING WITH FIRST FILE TO HANDLE PASSWORD PROMPT...");
    signer.preflight(file)
}

fn execute_phases(
    ctl: &mut Controller,
    cfg: &AppConfig,
    request: &RunRequest,
    signer: &Signer<'_>,
) -> Result<()> {
    let operation = request.operation;

    let files: Vec<PathBuf> = match &request.target {
        Target::SingleFile { path } => {
            let path = fs_scan::absolute(path);
            info!("PROCESSING SINGLE FILE: {} ({})", path.display(), operation.label());
            if !path.is_file() {
                error!("File does not exist: {}", path.display());
                return Ok(());
            }
            vec![path]
        }
        Target::Directory {
            root,
            recursive,
            extensions,
        } => {
            ctl.enter(Phase::Discover);
            info!(
                "SCANNING DIRECTORY: {} ({}, {})",
                root.display(),
                if *recursive { "Recursive" } else { "Non-Recursive" },
                operation.label()
            );
            if !root.is_dir() {
                error!("Directory does not exist: {}", root.display());
                return Ok(());
            }

            let found = fs_scan::discover_files(root, *recursive, extensions, &cfg.sign.name_filters);
            if found.is_empty() {
                info!("No files found matching extensions: {}", extensions.join(", "));
                return Ok(());
            }
            info!("FOUND {} FILES TO PROCESS", found.len());
            found
        }
    };

    let workers = autotune::auto_tune_workers(&cfg.hw, cfg.sign.worker_multiplier, files.len(), cfg.workers);

    let bulk: &[PathBuf] = match operation {
        Operation::RemoveSignature => files.as_slice(),
        Operation::Sign => {
            if probe(ctl, signer, &files[0]) {
                &files[1..]
            } else {
                files.as_slice()
            }
        }
    };

    ctl.enter(Phase::BulkExecute);
    let jobs: Vec<Job> = bulk.iter().map(|f| Job::new(f.clone(), operation)).collect();
    pool::run_pass(signer, &jobs, workers)?;

    // chỉ retry khi ký, không retry remove
    if operation == Operation::Sign && signer.state.has_retryable() {
        ctl.enter(Phase::Retry);
        pool::retry_failed(signer, workers)?;
    }

    Ok(())
}

/// Idle -> ... -> Report. Report is reached even after a fault.
pub fn execute(cfg: &AppConfig, request: &RunRequest, signer: &Signer<'_>) -> (RunSummary, Vec<Phase>) {
    let mut ctl = Controller {
        visited: vec![Phase::Idle],
    };

    if let Err(e) = execute_phases(&mut ctl, cfg, request, signer) {
        error!("CRITICAL ERROR: {:#}", e);
    }

    ctl.enter(Phase::Report);
    for f in signer.state.signed_files() {
        debug!("done: {}", f.display());
    }
    let summary = signer.state.summary();
    print_summary(cfg, request.operation, &summary, signer.state.log_path());
    (summary, ctl.visited)
}

/* =========================
   Console output
   ========================= */

pub fn print_banner(cfg: &SignConfig) {
    println!("==================================================");
    println!("             Bulk Code Signing Tool");
    println!("==================================================");
    println!("Thumbprint: {}", cfg.thumbprint);
    println!("SignTool  : {}", cfg.tool_path.display());
    let names: Vec<&str> = cfg.endpoints.iter().map(|e| e.name.as_str()).collect();
    println!("Endpoints : {}", names.join(" -> "));
    println!();
}

pub fn print_usage() {
    println!("USAGE:");
    println!("  bulksign -dr <directory>           # Recursive directory scan");
    println!("  bulksign -d <directory>            # Non-recursive directory scan");
    println!("  bulksign -exe <file.exe>           # Sign single EXE file");
    println!("  bulksign -dll <file.dll>           # Sign single DLL file");
    println!("  bulksign -file <path>              # Sign any single file");
    println!("  bulksign <directory> <filename>    # Smart search and sign");
    println!("  bulksign -remove <file>            # Remove signature from single file");
    println!("  bulksign -remove-dr <directory>    # Remove signatures recursively");
    println!("  bulksign -remove-d <directory>     # Remove signatures non-recursively");
    println!();
    println!("OPTIONAL FILE TYPE FILTERS (can combine multiple):");
    println!("  -types exe,dll,msi,sys,ocx,cab,cat");
    println!();
    println!("GLOBAL OPTIONS (before the command):");
    println!("  --config <file.yaml>  --workers <n>  --tool <signtool>  --thumbprint <sha1>  --log-file <path>  --verbose");
}

fn print_summary(cfg: &AppConfig, operation: Operation, s: &RunSummary, log_path: &Path) {
    let done = match operation {
        Operation::Sign => "signed",
        Operation::RemoveSignature => "unsigned",
    };
    let log_abs = std::path::absolute(log_path).unwrap_or_else(|_| log_path.to_path_buf());

    println!();
    println!("SIGNING SUMMARY");
    println!("===============");
    println!("Successfully {}: {}", done, s.success);
    println!("Failed: {}", s.failed);
    println!("Skipped: {}", s.skipped);
    println!("Total processed: {}", s.total());
    println!();
    println!("Log file: {}", log_abs.display());
    println!("Timestamp Server Priority:");
    for ep in &cfg.sign.endpoints {
        println!("-> {}", ep.name);
    }
    if s.failed > 0 {
        warn!("{} file(s) could not be processed", s.failed);
    }
}
