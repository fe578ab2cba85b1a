mod app;
mod args;
mod autotune;
mod config;
mod credential;
mod fs_scan;
mod hw;
mod invoker;
mod policy;
mod pool;
mod stats;
mod types;

use anyhow::Result;
use clap::Parser;
use credential::{CommandStore, CredentialStore};
use std::path::PathBuf;
use time::UtcOffset;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Bulk code signing driver for signtool",
    disable_help_flag = true
)]
struct Cli {
    /// YAML config (default: ./bulksign.yaml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    workers: Option<usize>,

    /// signtool executable
    #[arg(long)]
    tool: Option<PathBuf>,

    #[arg(long)]
    thumbprint: Option<String>,

    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    verbose: bool,

    /// -dr <dir> | -d <dir> | -exe <file> | -remove <file> | <dir> <name> ...
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    command: Vec<String>,
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("bulksign=debug,warn")
        } else {
            EnvFilter::new("bulksign=info,warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn main() -> Result<()> {
    // offset phải lấy trước khi có thread khác
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);

    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut sign_cfg = config::load_config(cli.config.as_deref())?;
    if let Some(t) = cli.tool {
        sign_cfg.tool_path = t;
    }
    if let Some(t) = cli.thumbprint {
        sign_cfg.thumbprint = t;
    }
    if let Some(l) = cli.log_file {
        sign_cfg.log_file = l;
    }

    app::print_banner(&sign_cfg);

    let store = CommandStore::new(sign_cfg.credential_check.clone());
    if !store.has_credential(&sign_cfg.thumbprint) {
        warn!("Signing certificate not found. Skipping code signing.");
        return Ok(());
    }

    let parsed = match args::parse_args(&cli.command, &sign_cfg.default_extensions) {
        Ok(args::Invocation::Help) => {
            app::print_usage();
            return Ok(());
        }
        Ok(args::Invocation::Run(p)) => p,
        Err(e) => {
            error!("Invalid arguments: {}", e);
            println!();
            app::print_usage();
            return Ok(());
        }
    };

    let request = match app::resolve_request(parsed, &sign_cfg.search_extensions, &mut app::prompt_selection) {
        Ok(r) => r,
        Err(e) => {
            error!("{:#}", e);
            println!();
            app::print_usage();
            return Ok(());
        }
    };

    let tool = invoker::ProcessTool::from_config(&sign_cfg);
    let state = stats::RunState::new(sign_cfg.log_file.clone(), offset);

    let cfg = app::AppConfig {
        sign: sign_cfg,
        workers: cli.workers,
        hw: hw::detect_hw(),
    };
    let signer = policy::Signer {
        tool: &tool,
        endpoints: &cfg.sign.endpoints,
        state: &state,
    };

    let (_, phases) = app::execute(&cfg, &request, &signer);
    debug!("phase trail: {:?}", phases);
    Ok(())
}
