use clap::{Args, Parser, Subcommand};
use portcullis::config::{GatewayConfig, InstancePaths, ENV_KEY, ENV_PORT, ENV_SECRET};
use portcullis::control::{send_command, ControlChannel};
use portcullis::error::GatewayError;
use portcullis::ipc::{ControlCommand, ControlReply};
use portcullis::supervisor::{WorkerPool, WorkerSpec};
use portcullis::sync::{ConfigSource, ConfigSynchronizer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "portcullis", version, about = "Self-hosted API gateway control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway master and its worker pool
    Start(StartArgs),
    /// Stop a running instance
    Stop(InstanceArgs),
    /// Roll the worker pool of a running instance
    Reload(InstanceArgs),
    /// Report how many workers a running instance has
    Status(InstanceArgs),
    /// Internal: run as a worker process
    #[command(hide = true)]
    Worker(InstanceArgs),
}

#[derive(Args)]
struct StartArgs {
    /// Instance configuration directory
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Override the worker listening port
    #[arg(long)]
    port: Option<u16>,

    /// Override the worker pool size
    #[arg(long)]
    workers: Option<usize>,

    /// Remote configuration source URL
    #[arg(long)]
    config_url: Option<String>,

    /// Key authenticating the remote configuration fetch
    #[arg(long)]
    key: Option<String>,

    /// Secret authenticating the remote configuration fetch
    #[arg(long)]
    secret: Option<String>,
}

#[derive(Args)]
struct InstanceArgs {
    /// Instance configuration directory
    #[arg(long)]
    config_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Worker stdout is a message pipe to the master, so worker logs must
    // go to stderr. The master logs to stdout like any other service.
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("portcullis=info".parse().expect("valid log directive"));
    if matches!(cli.command, Command::Worker(_)) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Command::Start(args) => start(args).await,
        Command::Stop(args) => stop(InstancePaths::resolve(args.config_dir)).await,
        Command::Reload(args) => reload(InstancePaths::resolve(args.config_dir)).await,
        Command::Status(args) => status(InstancePaths::resolve(args.config_dir)).await,
        Command::Worker(args) => {
            let paths = InstancePaths::resolve(args.config_dir);
            portcullis::worker::run(paths.config_dir().to_path_buf()).await?;
            Ok(())
        }
    }
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    let paths = InstancePaths::resolve(args.config_dir);
    std::fs::create_dir_all(paths.config_dir())?;

    // The bootstrap file may point at a remote source; a --config-url flag
    // wins over it.
    let bootstrap = GatewayConfig::load(&paths.source_path()).ok();
    let config_url = args
        .config_url
        .or_else(|| bootstrap.as_ref().and_then(|c| c.gateway.config_url.clone()));
    let source = match config_url {
        Some(url) => {
            let key = args
                .key
                .or_else(|| std::env::var(ENV_KEY).ok())
                .unwrap_or_default();
            let secret = args
                .secret
                .or_else(|| std::env::var(ENV_SECRET).ok())
                .unwrap_or_default();
            ConfigSource::Remote { url, key, secret }
        }
        None => ConfigSource::File(paths.source_path()),
    };

    let synchronizer = ConfigSynchronizer::new(
        source.clone(),
        paths.cache_path(),
        paths.socket_path(),
        std::time::Duration::from_secs(portcullis::config::DEFAULT_POLL_INTERVAL_SECS),
    );
    let fetched = match synchronizer.initial_config().await {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Cannot resolve a configuration to start with");
            return Err(err.into());
        }
    };

    // CLI overrides stay in memory (the port travels to workers through the
    // environment); the cache keeps the snapshot exactly as fetched so the
    // poller's comparison and the next start's fallback see the source's
    // own content.
    let mut config = fetched.clone();
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    if let Some(workers) = args.workers {
        config.gateway.workers = Some(workers);
    }
    config.uid = Some(uuid::Uuid::new_v4().to_string());

    info!(
        config_dir = %paths.config_dir().display(),
        port = config.gateway.port,
        workers = config.gateway.num_workers(),
        uid = config.uid.as_deref(),
        "Starting gateway"
    );

    let spec = worker_spec(&paths, config.gateway.port)?;
    let pool = WorkerPool::new(spec, config.gateway.num_workers(), config.gateway.ready_when);

    // Bind the control socket before spawning anything so a second start in
    // the same directory fails fast with an actionable message.
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let channel = match ControlChannel::bind(&paths.socket_path(), Arc::clone(&pool), shutdown_tx.clone()) {
        Ok(channel) => channel,
        Err(err @ GatewayError::AlreadyRunning(_)) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
        Err(err) => return Err(err.into()),
    };

    let _pid_file = PidFile::create(&paths.pid_path())?;
    info!(path = %paths.pid_path().display(), "PID file written and locked");

    pool.run()?;
    tokio::spawn(channel.run());

    if config.gateway.disable_config_poll_interval {
        info!("Configuration polling disabled");
    } else {
        let poller = ConfigSynchronizer::new(
            source,
            paths.cache_path(),
            paths.socket_path(),
            config.gateway.poll_interval(),
        );
        tokio::spawn(poller.run(fetched, shutdown_rx.clone()));
    }

    // Wait for a shutdown signal, a stop command over the control socket,
    // or SIGHUP asking for a roll of the pool.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT, shutting down");
                    pool.terminate().await;
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    pool.terminate().await;
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, rolling the worker pool");
                    if let Err(err) = pool.reload().await {
                        warn!(error = %err, "Reload failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Stop command received, shutting down");
                        break;
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                pool.terminate().await;
            }
            _ = shutdown_rx.changed() => {
                info!("Stop command received, shutting down");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // The cached configuration stays behind so the next start can fall back
    // to it; only the instance markers are removed.
    cleanup_file(&paths.socket_path());
    cleanup_file(&paths.pid_path());
    info!("Shutdown complete");
    Ok(())
}

/// Workers are this same binary re-invoked with the hidden subcommand. The
/// listening port rides along in the environment so CLI overrides reach
/// the workers without touching the cached file.
fn worker_spec(paths: &InstancePaths, port: u16) -> anyhow::Result<WorkerSpec> {
    std::env::set_var(ENV_PORT, port.to_string());
    let program = std::env::current_exe()?;
    Ok(WorkerSpec {
        program,
        args: vec![
            "worker".to_string(),
            "--config-dir".to_string(),
            paths.config_dir().display().to_string(),
        ],
    })
}

async fn stop(paths: InstancePaths) -> anyhow::Result<()> {
    match send_command(&paths.socket_path(), ControlCommand::Stop).await {
        Ok(_) => {
            println!("portcullis stopped");
            Ok(())
        }
        Err(GatewayError::NotRunning) => not_running(),
        Err(err) => Err(err.into()),
    }
}

async fn reload(paths: InstancePaths) -> anyhow::Result<()> {
    match send_command(&paths.socket_path(), ControlCommand::Reload).await {
        Ok(ControlReply::Ok) => {
            println!("portcullis reloaded");
            Ok(())
        }
        Ok(ControlReply::Rejected(message)) => {
            eprintln!("reload rejected: {message}");
            std::process::exit(1);
        }
        Ok(reply) => anyhow::bail!("unexpected reply: {reply:?}"),
        Err(GatewayError::NotRunning) => not_running(),
        Err(err) => Err(err.into()),
    }
}

async fn status(paths: InstancePaths) -> anyhow::Result<()> {
    match send_command(&paths.socket_path(), ControlCommand::Status).await {
        Ok(ControlReply::WorkerCount(count)) => {
            println!("portcullis is running with {count} workers");
            Ok(())
        }
        Ok(reply) => anyhow::bail!("unexpected reply: {reply:?}"),
        Err(GatewayError::NotRunning) => not_running(),
        Err(err) => Err(err.into()),
    }
}

fn not_running() -> anyhow::Result<()> {
    eprintln!("portcullis is not running.");
    std::process::exit(1);
}

fn cleanup_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "Failed to remove file");
        }
    }
}

/// PID file handle holding an exclusive lock for the lifetime of the master
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        use std::io::Write;
        writeln!(&file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}
