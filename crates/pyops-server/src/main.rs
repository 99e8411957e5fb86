use clap::Parser;
use pyops_server::config::ServiceConfig;
use pyops_server::{shutdown, App, ServerError};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "pyops-server",
    version,
    about = "Loopback control plane for isolated Python environments"
)]
struct Cli {
    /// Config file (default: ~/.config/pyops/pyops.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// Loopback address to bind.
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Environment root, in priority order. Repeatable; replaces configured roots.
    #[arg(long = "root")]
    roots: Vec<PathBuf>,

    /// Interpreter used to create new environments.
    #[arg(long)]
    base_python: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(self, mut config: ServiceConfig) -> ServiceConfig {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if !self.roots.is_empty() {
            config.roots = self.roots;
        }
        if let Some(python) = self.base_python {
            config.base_python = python;
        }
        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match serve(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn serve(cli: Cli) -> Result<(), ServerError> {
    let config = ServiceConfig::load_or_default(cli.config.as_deref())?;
    let config = cli.apply(config).expanded();
    config.validate()?;

    let app = App::from_config(&config)?;
    if let Err(e) = std::fs::create_dir_all(app.registry.default_root()) {
        warn!(
            "cannot create default root {}: {e}",
            app.registry.default_root().display()
        );
    }
    for root in app.registry.roots() {
        info!("environment root: {}", root.display());
    }
    info!("protected environments: {}", config.protected.join(", "));

    shutdown::install_signal_handler();
    pyops_server::run_server(&Arc::new(app), config.addr())
}
