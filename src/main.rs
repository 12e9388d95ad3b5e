//! rds-reconcile CLI entrypoint.
//!
//! This is the main entrypoint for the rds-reconcile command-line tool.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use rds_reconcile::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use rds_reconcile::component::MysqlMode;
use rds_reconcile::config::{
    ConfigParser, ConfigValidator, ProgramConfig, ProviderKind, StateBackend, find_config_file,
};
use rds_reconcile::error::{ConfigError, ReconcileToolError, Result};
use rds_reconcile::provider::{HttpProvider, Provider, SecretStore, SimulatedProvider};
use rds_reconcile::reconciler::{ApplyOptions, Reconciler};
use rds_reconcile::state::{LocalStateStore, S3StateStore, STATE_DIR, StateEntry, StateStore, generate_holder_id};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system. `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

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

/// Main async entry point. Returns the process exit code.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| 0),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, &formatter).await,
        Commands::Apply {
            yes,
            accept_corrupt,
            concurrency,
        } => cmd_apply(config_path, yes, accept_corrupt, concurrency, &formatter, cli.output).await,
        Commands::Destroy { yes, accept_corrupt } => {
            cmd_destroy(config_path, yes, accept_corrupt, &formatter, cli.output).await
        }
        Commands::Outputs { show_secrets } => cmd_outputs(config_path, show_secrets, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Initialize a new program.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new program in: {}", path.display());

    let config_path = path.join("rds-reconcile.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Program file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/rds-reconcile.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(STATE_DIR) {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# rds-reconcile")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(STATE_DIR) {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProgram initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Edit rds-reconcile.yaml to declare your databases");
    eprintln!("  2. Run 'rds-reconcile validate' to check the program");
    eprintln!("  3. Run 'rds-reconcile plan' to preview changes");
    eprintln!("  4. Run 'rds-reconcile apply' to provision");

    Ok(())
}

/// Validate the program file. Reports every problem, not just the first.
fn cmd_validate(config_path: Option<&PathBuf>, show_warnings: bool, formatter: &OutputFormatter) -> Result<u8> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating program: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    println!("{}", formatter.format_validation(&config, &result, show_warnings));

    Ok(if result.is_valid() { 0 } else { 2 })
}

/// Show the plan.
async fn cmd_plan(config_path: Option<&PathBuf>, detailed: bool, formatter: &OutputFormatter) -> Result<u8> {
    let reconciler = load_reconciler(config_path, None).await?;
    let plan = reconciler.plan().await?;
    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(0)
}

/// Apply the program.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    accept_corrupt: bool,
    concurrency: Option<usize>,
    formatter: &OutputFormatter,
    format: OutputFormat,
) -> Result<u8> {
    let reconciler = load_reconciler(config_path, concurrency).await?;
    print_dev_messages(&reconciler);

    let plan = reconciler.plan().await?;
    if !plan.has_changes() {
        println!("{}", formatter.format_plan(&plan, false));
        return Ok(0);
    }

    if !auto_approve {
        if format == OutputFormat::Text {
            println!("{}", formatter.format_plan(&plan, false));
        }
        if !confirm("Do you want to apply these changes? [y/N] ", |answer| {
            answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
        })? {
            eprintln!("Apply cancelled.");
            return Ok(0);
        }
    }

    let cancel = install_interrupt_handler();
    let reconciler = reconciler.with_cancellation(cancel);
    let result = reconciler.apply(ApplyOptions { accept_corrupt }).await?;

    println!("{}", formatter.format_report(&result.report));
    Ok(result.exit_code())
}

/// Destroy every resource recorded in state.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    accept_corrupt: bool,
    formatter: &OutputFormatter,
    format: OutputFormat,
) -> Result<u8> {
    let reconciler = load_reconciler(config_path, None).await?;

    let plan = reconciler.plan_destroy().await?;
    if !plan.has_changes() {
        println!("Nothing to destroy.");
        return Ok(0);
    }

    if !auto_approve {
        if format == OutputFormat::Text {
            println!("{}", formatter.format_plan(&plan, false));
        }
        eprintln!("WARNING: This will delete every resource recorded for this program.");
        if !confirm("Type 'destroy' to confirm: ", |answer| answer == "destroy")? {
            eprintln!("Destroy cancelled.");
            return Ok(0);
        }
    }

    let cancel = install_interrupt_handler();
    let reconciler = reconciler.with_cancellation(cancel);
    let result = reconciler.destroy(ApplyOptions { accept_corrupt }).await?;

    println!("{}", formatter.format_report(&result.report));
    Ok(result.exit_code())
}

/// Show database connection attributes.
async fn cmd_outputs(config_path: Option<&PathBuf>, show_secrets: bool, formatter: &OutputFormatter) -> Result<u8> {
    let reconciler = load_reconciler(config_path, None).await?;
    let outputs = reconciler.outputs().await?;
    println!("{}", formatter.format_outputs(&outputs, show_secrets));
    Ok(0)
}

/// State management commands.
async fn cmd_state(config_path: Option<&PathBuf>, command: StateCommands, formatter: &OutputFormatter) -> Result<u8> {
    let (_config, state_store) = load_config_and_state(config_path).await?;

    match command {
        StateCommands::List => {
            let snapshot = state_store.snapshot().await?;
            println!("{}", formatter.format_state(&snapshot));
        }
        StateCommands::Show { name } => {
            let snapshot = state_store.snapshot().await?;
            match snapshot.entry(&name) {
                Some(StateEntry::Present(state)) => println!("{}", formatter.format_resource(state)),
                Some(StateEntry::Corrupt { message }) => {
                    eprintln!("State entry for {name} is unreadable: {message}");
                    return Ok(1);
                }
                None => {
                    eprintln!("No state recorded for {name}.");
                    return Ok(1);
                }
            }
        }
        StateCommands::Rm { name } => {
            let holder = generate_holder_id();
            let lock = state_store.acquire_lock(&holder, "state rm").await?;
            let removed = state_store.remove(&name).await;
            state_store.release_lock(&lock.lock_id).await?;
            removed?;
            warn!("Removed {name} from state; the remote resource was not deleted");
            eprintln!("Removed {name} from state.");
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = state_store.acquire_lock(&holder, "manual").await?;
            eprintln!("State locked: {}", lock.lock_id);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = state_store.get_lock_info().await? {
                    state_store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                state_store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(2);
            }
        }
    }

    Ok(0)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the program file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory holding the program file.
fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn parser_for(config_file: &Path) -> ConfigParser {
    ConfigParser::new().with_base_path(config_dir(config_file))
}

/// Loads the program and creates the state store it names.
async fn load_config_and_state(config_path: Option<&PathBuf>) -> Result<(ProgramConfig, Arc<dyn StateStore>)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading program from: {}", config_file.display());

    let parser = parser_for(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    ConfigValidator::new().validate(&config)?;

    let state_store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config.state.path.as_ref().map_or_else(
                || {
                    config_dir(&config_file)
                        .join(STATE_DIR)
                        .join(&config.program.stage)
                },
                PathBuf::from,
            );
            debug!("Using local state at {}", path.display());
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| ReconcileToolError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Arc::new(S3StateStore::new(bucket, prefix, region).await)
        }
    };

    Ok((config, state_store))
}

/// Creates the provider named by the program. One instance serves both
/// resource operations and secret lookups.
fn create_provider(config: &ProgramConfig) -> Result<(Arc<dyn Provider>, Arc<dyn SecretStore>)> {
    match config.provider.kind {
        ProviderKind::Simulated => {
            warn!("Using the simulated provider: no real resources will be created");
            let provider = Arc::new(SimulatedProvider::new());
            let secrets: Arc<dyn SecretStore> = provider.clone();
            let provider: Arc<dyn Provider> = provider;
            Ok((provider, secrets))
        }
        ProviderKind::Http => {
            let endpoint = config
                .provider
                .endpoint
                .as_deref()
                .ok_or_else(|| ReconcileToolError::internal("provider endpoint not configured"))?;
            let token = ConfigParser::get_provider_token();
            let provider = Arc::new(match config.provider.timeout_secs {
                Some(secs) => HttpProvider::with_timeout(endpoint, token, secs)?,
                None => HttpProvider::new(endpoint, token)?,
            });
            let secrets: Arc<dyn SecretStore> = provider.clone();
            let provider: Arc<dyn Provider> = provider;
            Ok((provider, secrets))
        }
    }
}

/// Loads everything a command needs to plan or apply.
async fn load_reconciler(config_path: Option<&PathBuf>, concurrency: Option<usize>) -> Result<Reconciler> {
    let (mut config, state_store) = load_config_and_state(config_path).await?;
    if let Some(limit) = concurrency {
        if limit == 0 {
            return Err(ConfigError::validation("Concurrency must be at least 1", "--concurrency").into());
        }
        config.execution.concurrency = limit;
    }
    let (provider, secrets) = create_provider(&config)?;
    debug!("State backend: {}, provider: {}", state_store.backend_type(), provider.name());
    Reconciler::new(config, state_store, provider, secrets)
}

/// Prints the connection reminder for databases running against a local server.
fn print_dev_messages(reconciler: &Reconciler) {
    for database in &reconciler.declarations().databases {
        if let MysqlMode::LocalDev(local) = database.mode() {
            eprintln!("{}: {}\n", database.name(), local.dev_message());
        }
    }
}

/// Cancels the returned token on Ctrl-C. In-flight operations finish; no new
/// ones start.
fn install_interrupt_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; waiting for in-flight operations to finish");
            child.cancel();
        }
    });
    token
}

/// Prompts on stderr and reads one line from stdin.
fn confirm(prompt: &str, accept: impl Fn(&str) -> bool) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let mut input = String::new();
    std::io::stdin().lock().read_line(&mut input)?;
    Ok(accept(input.trim()))
}
