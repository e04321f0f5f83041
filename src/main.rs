//! stackrecon CLI entrypoint.
//!
//! This is the main entrypoint for the stackrecon command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackrecon::cli::{Cli, Commands, OutputFormatter, StateCommands};
use stackrecon::config::{
    ConfigParser, ConfigValidator, StackConfig, StateBackend, find_config_file,
};
use stackrecon::error::{Result, StackError};
use stackrecon::graph::GraphBuilder;
use stackrecon::planner::CancelToken;
use stackrecon::provider::{CloudProvider, HttpProvider, SimulatedProvider};
use stackrecon::reconciler::Reconciler;
use stackrecon::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for an apply where at least one step failed.
const EXIT_STEPS_FAILED: u8 = 2;

/// Exit code for a drift check that could not reach the provider.
const EXIT_PROVIDER_UNREACHABLE: u8 = 3;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` with `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => cmd_validate(config, warnings),
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, expect_plan } => {
            cmd_apply(config, yes, expect_plan.as_deref(), &formatter).await
        }
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Writes a starter stack document.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("stack.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack document already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/stack.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", state_entry.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|l| l.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# stackrecon")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit stack.yaml to describe your resources");
    eprintln!("  2. Run 'stackrecon validate' to check the document");
    eprintln!("  3. Run 'stackrecon plan' to see what will change");
    eprintln!("  4. Run 'stackrecon apply' to reconcile");

    Ok(())
}

/// Validates the stack document and its graph.
fn cmd_validate(config_path: Option<&Path>, show_warnings: bool) -> Result<ExitCode> {
    let (config, _) = load_config(config_path)?;

    let result = ConfigValidator::new().check(&config);
    for error in &result.errors {
        eprintln!("  ✗ {error}");
    }
    if show_warnings {
        for warning in &result.warnings {
            eprintln!("  ⚠ {warning}");
        }
    }

    if !result.is_valid() {
        eprintln!("\n{} error(s) found.", result.error_count());
        return Ok(ExitCode::FAILURE);
    }

    let graph = GraphBuilder::new().build(&config)?;

    eprintln!("Stack document is valid!");
    eprintln!("\nStack summary:");
    eprintln!("  Stack: {}", config.qualified_name());
    eprintln!("  Resources: {}", graph.len());
    eprintln!("  Outputs: {}", graph.outputs().len());
    if !show_warnings && result.warning_count() > 0 {
        eprintln!("  Warnings: {} (use --warnings to show)", result.warning_count());
    }
    Ok(ExitCode::SUCCESS)
}

/// Computes and shows the plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store, base_dir) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config, &base_dir).await?;

    let planned = Reconciler::new(&config, store.as_ref(), provider.provider)
        .plan()
        .await?;
    eprintln!("{}", formatter.format_plan(&planned.plan, detailed));

    Ok(ExitCode::SUCCESS)
}

/// Plans and applies.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    expect_plan: Option<&str>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store, base_dir) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config, &base_dir).await?;

    let cancel = CancelToken::new();
    let reconciler = Reconciler::new(&config, store.as_ref(), provider.provider.clone())
        .with_cancel_token(cancel.clone());

    // Without a pinned fingerprint, show the plan and pin what was shown.
    let shown_fingerprint = if expect_plan.is_none() {
        let planned = reconciler.plan().await?;
        if planned.plan.is_empty() {
            eprintln!("{}", formatter.format_plan(&planned.plan, false));
            return Ok(ExitCode::SUCCESS);
        }
        eprintln!("{}", formatter.format_plan(&planned.plan, false));

        if !auto_approve {
            eprint!("Do you want to apply this plan? [y/N]: ");
            std::io::stderr().flush()?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if !input.trim().eq_ignore_ascii_case("y") {
                eprintln!("Apply cancelled.");
                return Ok(ExitCode::SUCCESS);
            }
        }
        Some(planned.plan.fingerprint)
    } else {
        None
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight steps");
            cancel.cancel();
        }
    });

    let result = reconciler
        .apply(expect_plan.or(shown_fingerprint.as_deref()))
        .await;
    provider.persist().await?;
    let report = result?;
    eprintln!("{}", formatter.format_apply(&report));

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_STEPS_FAILED))
    }
}

/// Checks for drift.
async fn cmd_drift(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (config, store, base_dir) = load_config_and_state(config_path).await?;
    let provider = create_provider(&config, &base_dir).await?;

    match Reconciler::new(&config, store.as_ref(), provider.provider)
        .check_drift()
        .await
    {
        Ok(report) => {
            eprintln!("{}", formatter.format_drift(&report));
            Ok(ExitCode::SUCCESS)
        }
        Err(StackError::Provider(e)) if e.is_unreachable() => {
            eprintln!("Error: provider unreachable: {e}");
            Ok(ExitCode::from(EXIT_PROVIDER_UNREACHABLE))
        }
        Err(e) => Err(e),
    }
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (_config, store, _) = load_config_and_state(config_path).await?;

    match command {
        StateCommands::Show => {
            let snapshot = store.snapshot_all().await?;
            let lock = store.lock_info().await?;
            eprintln!(
                "{}",
                formatter.format_state(store.backend_type(), &snapshot, lock.as_ref())
            );
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or("")).await?;
            eprintln!("State locked: {} (holder {})", lock.lock_id, lock.holder);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the stack document path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.to_path_buf()))
}

/// Loads the stack document with `.env` and environment overrides applied.
fn load_config(config_path: Option<&Path>) -> Result<(StackConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading stack from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, base_dir))
}

/// Directory for local state, relative to the stack document.
fn local_state_dir(config: &StackConfig, base_dir: &Path) -> PathBuf {
    config
        .state
        .path
        .as_ref()
        .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(p))
}

/// Loads and validates the stack document, then opens its state store.
async fn load_config_and_state(
    config_path: Option<&Path>,
) -> Result<(StackConfig, Box<dyn StateStore>, PathBuf)> {
    let (config, base_dir) = load_config(config_path)?;

    ConfigValidator::new().validate(&config)?;

    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => Box::new(LocalStateStore::with_base_dir(local_state_dir(
            &config, &base_dir,
        ))),
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| StackError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Box::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };

    Ok((config, store, base_dir))
}

/// File the simulated provider's resources are kept in between runs.
const SIMULATED_PROVIDER_FILE: &str = "simulated-provider.json";

/// The provider for one command, plus where to save it if it is simulated.
struct ProviderHandle {
    provider: Arc<dyn CloudProvider>,
    simulated: Option<(Arc<SimulatedProvider>, PathBuf)>,
}

impl ProviderHandle {
    /// Saves the simulated provider's resources; no-op for a real endpoint.
    async fn persist(&self) -> Result<()> {
        match &self.simulated {
            Some((provider, path)) => provider.save(path).await,
            None => Ok(()),
        }
    }
}

/// Creates the provider named by the stack document.
///
/// Without an endpoint the in-process provider is used, loaded from and
/// saved next to the local state so successive runs see the same resources.
async fn create_provider(config: &StackConfig, base_dir: &Path) -> Result<ProviderHandle> {
    if let Some(endpoint) = &config.provider.endpoint {
        let provider = HttpProvider::with_timeout(
            endpoint,
            ConfigParser::provider_token(),
            config.provider.timeout_secs,
        )?;
        return Ok(ProviderHandle {
            provider: Arc::new(provider),
            simulated: None,
        });
    }

    let path = local_state_dir(config, base_dir).join(SIMULATED_PROVIDER_FILE);
    warn!(
        "No provider endpoint configured; using the simulated provider ({})",
        path.display()
    );
    let simulated = Arc::new(SimulatedProvider::load(&path).await?);
    Ok(ProviderHandle {
        provider: simulated.clone(),
        simulated: Some((simulated, path)),
    })
}
