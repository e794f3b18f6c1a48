use clap::Parser;
use icap_engine::config::{ListenerConfig, ServerConfig};
use icap_engine::error::IcapResult;
use icap_engine::{DEFAULT_PORT, IcapServer, VERSION};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "icapd",
    about = "ICAP content-adaptation server",
    long_about = "Serves the ICAP services described by a JSON configuration file. \
                  SIGHUP reloads the file and restarts every listener; Ctrl-C or SIGTERM stops the server."
)]
struct Args {
    /// JSON configuration file; without it a single echo service is started
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Bind address of the default echo service
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port of the default echo service
    #[arg(short = 'p', long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Keep connections of the default echo service alive instead of pooling them
    #[arg(long = "keep-alive", action = clap::ArgAction::SetTrue)]
    keep_alive: bool,

    /// Log level used when RUST_LOG is not set (error|warn|info|debug|trace)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn load_config(&self) -> IcapResult<ServerConfig> {
        match &self.config {
            Some(path) => ServerConfig::load(path),
            None => {
                let listener = ListenerConfig::new("echo")
                    .with_bind(&self.bind)
                    .with_port(self.port)
                    .with_keep_alive(self.keep_alive);
                let config = ServerConfig {
                    listeners: vec![listener],
                };
                config.validate()?;
                Ok(config)
            }
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_level);
    info!(version = VERSION, "starting icapd");
    debug!("Arguments: {:?}", args);

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "cannot load configuration");
            return ExitCode::FAILURE;
        }
    };

    let mut server = match IcapServer::start(&config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "no ICAP listener could be started");
            return ExitCode::FAILURE;
        }
    };

    let outcome = supervise(&args, &mut server).await;
    if !server.shutdown().await {
        warn!("some sessions were still running at exit");
    }
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "icapd stopped");
            ExitCode::FAILURE
        }
    }
}

/// Waits for termination, restarting the server on every SIGHUP.
#[cfg(unix)]
async fn supervise(args: &Args, server: &mut IcapServer) -> IcapResult<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = terminate.recv() => return Ok(()),
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                match args.load_config() {
                    Ok(config) => {
                        if let Err(e) = server.restart(&config).await {
                            if server.listeners().is_empty() {
                                return Err(e);
                            }
                            error!(error = %e, "restart failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "keeping the running configuration"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn supervise(_args: &Args, _server: &mut IcapServer) -> IcapResult<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
