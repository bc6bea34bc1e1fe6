#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bastion_controllers::network::tcp_probe;
use bastion_controllers::{register_all, Mode, Ports};
use bastion_resources::config::{MachineConfigSpec, MACHINE_CONFIG_ID};
use bastion_resources::network::TcpProbeSpec;
use bastion_resources::ResourceRegistry;
use bastion_runtime::{Runtime, RuntimeOptions, SystemClock};
use bastion_store::{safe, State, StateOptions};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Owner of resources seeded by the daemon itself.
const CONFIG_OWNER: &str = "bastiond";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "bastiond", version, about = "Bastion machine daemon")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run all controllers against a machine config until Ctrl-C
    Run {
        /// Machine config YAML
        #[arg(long = "config", env = "BASTION_CONFIG")]
        config: PathBuf,
        /// metal or container
        #[arg(long = "mode", env = "BASTION_MODE", default_value = "metal", value_parser = Mode::from_str)]
        mode: Mode,
        /// Directory for volumes and the trusted roots bundle
        #[arg(long = "state-dir", env = "BASTION_STATE_DIR", default_value = "/var/lib/bastion")]
        state_dir: PathBuf,
        /// Events buffered per watcher
        #[arg(long = "watch-buffer", env = "BASTION_WATCH_BUFFER", default_value_t = 128)]
        watch_buffer: usize,
    },
    /// List registered resource kinds
    Kinds,
    /// Run a single TCP probe
    Probe {
        /// host:port
        endpoint: String,
        /// Connect timeout in milliseconds
        #[arg(long = "timeout-ms", default_value_t = 10_000)]
        timeout_ms: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("BASTION_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BASTION_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid BASTION_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_config(path: &Path) -> Result<MachineConfigSpec> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("error reading {}", path.display()))?;
    MachineConfigSpec::from_yaml(&raw).with_context(|| format!("error parsing {}", path.display()))
}

fn seed_config(state: &State, cfg: MachineConfigSpec) -> Result<()> {
    safe::modify::<MachineConfigSpec, _, _, anyhow::Error>(&state.as_owner(CONFIG_OWNER), MACHINE_CONFIG_ID, |spec| {
        *spec = cfg.clone();
        Ok(())
    })
    .context("error seeding machine config")?;
    Ok(())
}

async fn run(config: &Path, mode: Mode, state_dir: &Path, watch_buffer: usize) -> Result<()> {
    let cfg = load_config(config)?;
    let state = Arc::new(State::with_options(ResourceRegistry::with_all(), StateOptions { watch_buffer }));
    seed_config(&state, cfg)?;

    let ports = Ports::new(Arc::new(SystemClock), mode, state_dir);
    let mut rt = Runtime::with_options(Arc::clone(&state), RuntimeOptions::default());
    register_all(&mut rt, &ports).context("error registering controllers")?;
    info!(mode = %mode, state_dir = %state_dir.display(), config = %config.display(), "bastiond starting");

    let ctx = CancellationToken::new();
    let mut task = tokio::spawn(rt.run(ctx.clone()));
    tokio::select! {
        res = &mut task => {
            res.context("runtime task panicked")?;
            warn!("runtime exited before shutdown was requested");
            return Ok(());
        }
        res = signal::ctrl_c() => {
            res.context("error waiting for Ctrl-C")?;
            info!("Ctrl-C received; shutting down controllers");
        }
    }
    ctx.cancel();
    match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
        Ok(res) => res.context("runtime task panicked")?,
        Err(_) => error!(grace_secs = SHUTDOWN_GRACE.as_secs(), "controllers did not stop in time"),
    }
    Ok(())
}

fn print_kinds(output: Output) -> Result<()> {
    let registry = ResourceRegistry::with_all();
    match output {
        Output::Human => {
            println!("{:<10} {:<28} KIND", "NAMESPACE", "NAME");
            for k in registry.iter() {
                println!("{:<10} {:<28} {}", k.namespace, k.name, k.kind);
            }
        }
        Output::Json => {
            let kinds: Vec<_> = registry.iter().collect();
            println!("{}", serde_json::to_string_pretty(&kinds)?);
        }
    }
    Ok(())
}

async fn probe(output: Output, endpoint: String, timeout: Duration) -> Result<()> {
    let spec = TcpProbeSpec { endpoint, timeout };
    let res = tcp_probe(&spec, &SystemClock).await;
    match output {
        Output::Human => match &res {
            Ok(()) => println!("{}: ok", spec.endpoint),
            Err(e) => println!("{}: {e}", spec.endpoint),
        },
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Row<'a> { endpoint: &'a str, success: bool, error: Option<&'a str> }
            let row = Row { endpoint: &spec.endpoint, success: res.is_ok(), error: res.as_ref().err().map(String::as_str) };
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
    }
    if res.is_err() {
        bail!("probe of {} failed", spec.endpoint);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, mode, state_dir, watch_buffer } => run(&config, mode, &state_dir, watch_buffer).await,
        Commands::Kinds => print_kinds(cli.output),
        Commands::Probe { endpoint, timeout_ms } => probe(cli.output, endpoint, Duration::from_millis(timeout_ms)).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from(["bastiond", "run", "--config", "/etc/bastion.yaml", "--mode", "container"]).unwrap();
        match cli.command {
            Commands::Run { config, mode, watch_buffer, .. } => {
                assert_eq!(config, PathBuf::from("/etc/bastion.yaml"));
                assert_eq!(mode, Mode::Container);
                assert_eq!(watch_buffer, 128);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["bastiond", "run", "--config", "x", "--mode", "vm"]).is_err());
    }

    #[test]
    fn config_is_seeded_into_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.yaml");
        std::fs::write(&path, "machine:\n  type: worker\n  token: abc.def\n").unwrap();
        let state = State::new(ResourceRegistry::with_all());
        seed_config(&state, load_config(&path).unwrap()).unwrap();

        let cfg = safe::get::<MachineConfigSpec, _>(&state, MACHINE_CONFIG_ID).unwrap();
        assert_eq!(cfg.spec.machine.token, "abc.def");
        assert_eq!(cfg.metadata.owner, CONFIG_OWNER);
    }

    #[test]
    fn unknown_config_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine.yaml");
        std::fs::write(&path, "machine:\n  tpye: worker\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("unknown field"), "{err:#}");
    }
}
