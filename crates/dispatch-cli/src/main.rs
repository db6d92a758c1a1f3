use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::builder::FalseyValueParser;
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser};
use dispatch_core::config::{
    DEFAULT_CONTAINER, DEFAULT_INTERVAL_SECS, DEFAULT_TABLE, DEFAULT_WORKDIR,
};
use dispatch_core::{
    BackendConfig, CycleDriver, DispatchConfig, DockerBackend, PostgrestStore, RunMode, StopSignal,
};

#[derive(Parser)]
#[command(
    name = "dispatch",
    about = "Run pending actions from a record store inside a container and write back the results",
    version
)]
struct Cli {
    /// Base URL of the record store (PostgREST / Supabase)
    #[arg(long, env = "SUPABASE_URL")]
    store_url: Option<String>,

    /// API key for the record store
    #[arg(long, env = "SUPABASE_KEY", hide_env_values = true)]
    store_key: Option<String>,

    /// Collection holding the action records
    #[arg(long, env = "DISPATCH_TABLE", default_value = DEFAULT_TABLE)]
    table: String,

    /// Name of the running container commands are executed in
    #[arg(long, env = "DISPATCH_CONTAINER", default_value = DEFAULT_CONTAINER)]
    container: String,

    /// Working directory inside the container
    #[arg(long, env = "DISPATCH_WORKDIR", default_value = DEFAULT_WORKDIR)]
    workdir: String,

    /// Container CLI binary
    #[arg(long, env = "DISPATCH_DOCKER", default_value = "docker")]
    docker: PathBuf,

    /// Keep polling instead of exiting after one pass
    #[arg(long, env = "DISPATCH_CONTINUOUS", value_parser = FalseyValueParser::new())]
    continuous: bool,

    /// Seconds between passes in continuous mode
    #[arg(long, env = "DISPATCH_INTERVAL", default_value_t = DEFAULT_INTERVAL_SECS)]
    interval: u64,

    /// Pause after each action, in milliseconds
    #[arg(long, env = "DISPATCH_RECORD_DELAY_MS", default_value_t = 2000)]
    record_delay_ms: u64,

    /// Default log level (RUST_LOG directives still apply)
    #[arg(long, env = "DISPATCH_LOG", default_value = "info")]
    log_level: tracing::Level,
}

impl Cli {
    /// Fall back to the variable names older deployments set, for options
    /// given neither as a flag nor through their `DISPATCH_*` variable.
    fn apply_legacy_env(&mut self, matches: &ArgMatches) -> anyhow::Result<()> {
        if defaulted(matches, "container") {
            if let Ok(name) = std::env::var("KALI_CONTAINER_NAME") {
                self.container = name;
            }
        }
        if defaulted(matches, "continuous") {
            if let Ok(value) = std::env::var("CONTINUOUS_MODE") {
                self.continuous = value.trim().eq_ignore_ascii_case("true");
            }
        }
        if defaulted(matches, "interval") {
            if let Ok(value) = std::env::var("CHECK_INTERVAL") {
                self.interval = value
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid CHECK_INTERVAL '{value}'"))?;
            }
        }
        Ok(())
    }
}

fn defaulted(matches: &ArgMatches, id: &str) -> bool {
    matches!(
        matches.value_source(id),
        None | Some(ValueSource::DefaultValue)
    )
}

fn main() {
    let matches = Cli::command().get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(cli.log_level.into()),
        )
        .with_target(false)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli, &matches) {
        tracing::error!("fatal error: {e:#}");
        std::process::exit(1);
    }
}

fn run(mut cli: Cli, matches: &ArgMatches) -> anyhow::Result<()> {
    cli.apply_legacy_env(matches)?;

    let mode = if cli.continuous {
        RunMode::Continuous {
            interval: Duration::from_secs(cli.interval),
        }
    } else {
        RunMode::Once
    };

    let config = DispatchConfig::new(
        cli.store_url,
        cli.store_key,
        Some(cli.table),
        BackendConfig {
            container: cli.container,
            workdir: cli.workdir,
            docker_bin: cli.docker,
        },
        mode,
        Duration::from_millis(cli.record_delay_ms),
    )
    .context("invalid configuration")?;

    let store = PostgrestStore::new(&config.store).context("failed to create store client")?;
    let backend = DockerBackend::new(&config.backend);
    let version = backend.ping().context("container backend unreachable")?;
    tracing::info!(
        docker = %version,
        container = backend.container(),
        table = %config.store.table,
        "container backend ready"
    );

    let driver = CycleDriver::new(store, backend, config.record_delay);
    match config.mode {
        RunMode::Once => {
            let processed = driver.process_pending_actions();
            tracing::info!(processed, "completed processing actions");
        }
        RunMode::Continuous { interval } => {
            let stop = StopSignal::install_interrupt_handler()?;
            let summary = driver.run_continuous(interval, &stop);
            tracing::info!(
                passes = summary.passes,
                processed = summary.processed,
                faults = summary.faults,
                "monitoring finished"
            );
        }
    }
    Ok(())
}
