//! Binary entrypoint for the Meshcitadel CLI.
//!
//! Commands:
//! - `start [--port <path>]` - run the transport against a companion radio
//! - `init` - write a starter `config.toml`
//! - `smoketest --port <path> [-b <baud>] [--timeout <s>]` - handshake once and print device info
//!
//! See the library crate docs for module-level details: `meshcitadel::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};

use meshcitadel::config::Config;

#[derive(Parser)]
#[command(name = "meshcitadel")]
#[command(about = "Mesh transport and reliable delivery for a BBS on MeshCore radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the transport with the built-in loopback responders
    Start {
        /// Companion radio port (e.g., /dev/ttyUSB0); overrides the config
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Open the radio, complete the handshake and print what it reports
    SmokeTest {
        /// Device serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short = 'b', long, default_value_t = 115200)]
        baud: u32,
        /// Seconds to wait before giving up
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port } => {
            let mut config = Config::load(&cli.config).await?;
            config.override_port(port);
            init_logging(&Some(config.clone()), cli.verbose);
            config.validate()?;
            info!("Starting Meshcitadel v{}", env!("CARGO_PKG_VERSION"));
            if let Err(e) = run_transport(config).await {
                error!("transport stopped: {:#}", e);
                std::process::exit(1);
            }
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::SmokeTest { port, baud, timeout } => {
            let pre_config = Config::load(&cli.config).await.ok();
            init_logging(&pre_config, cli.verbose);
            let code = smoke_test(pre_config.unwrap_or_default(), port, baud, timeout).await?;
            std::process::exit(code);
        }
    }

    Ok(())
}

#[cfg(feature = "serial")]
async fn run_transport(config: Config) -> Result<()> {
    use std::sync::Arc;

    use meshcitadel::meshcore::serial::SerialConnector;
    use meshcitadel::meshcore::{LinkConfig, LinkSupervisor};
    use meshcitadel::metrics;
    use meshcitadel::transport::{
        EngineConfig, LoopbackAuthenticator, LoopbackProcessor, MemorySessionManager, TransportEngine,
    };

    let connector = SerialConnector::new(&config.meshcore.port, config.meshcore.baud_rate);
    let (supervisor, link, events) = LinkSupervisor::new(connector, LinkConfig::from(&config.meshcore));
    let link_task = tokio::spawn(supervisor.run());

    let sessions = Arc::new(MemorySessionManager::new(config.session.timeout()));
    let engine = TransportEngine::new(
        EngineConfig::from(&config),
        link.clone(),
        Arc::new(LoopbackProcessor),
        sessions,
        Arc::new(LoopbackAuthenticator),
    );
    let engine_handle = engine.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            engine_handle.shutdown();
        }
    });

    let result = engine.run(events).await;
    link.shutdown();
    let link_result = link_task.await?;
    info!("delivery counters at exit: {:?}", metrics::snapshot());
    result?;
    link_result?;
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn run_transport(_config: Config) -> Result<()> {
    anyhow::bail!("this build has no serial support; rebuild with the 'serial' feature")
}

#[cfg(feature = "serial")]
async fn smoke_test(mut config: Config, port: String, baud: u32, timeout: u64) -> Result<i32> {
    use log::warn;
    use meshcitadel::meshcore::serial::SerialConnector;
    use meshcitadel::meshcore::{LinkConfig, LinkEvent, LinkSupervisor};
    use tokio::time::{timeout as within, Duration};

    config.meshcore.max_reconnect_attempts = 1;
    config.meshcore.advert_interval_hours = 0;
    config.meshcore.manage_contacts = false;
    let mut link_cfg = LinkConfig::from(&config.meshcore);
    link_cfg.handshake_timeout = Duration::from_secs(timeout.max(1));
    let (supervisor, link, mut events) = LinkSupervisor::new(SerialConnector::new(&port, baud), link_cfg);
    let task = tokio::spawn(supervisor.run());
    info!("Starting smoke test on {} @ {} baud", port, baud);

    let outcome = within(Duration::from_secs(timeout), async {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Connected {
                    self_info,
                    device,
                    protocol_version,
                } => return Some((self_info, device, protocol_version)),
                LinkEvent::Fatal { reason, .. } => {
                    warn!("handshake failed: {}", reason);
                    return None;
                }
                _ => {}
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    link.shutdown();
    let _ = task.await;

    let payload = match &outcome {
        Some((self_info, device, protocol_version)) => serde_json::json!({
            "status": "ok",
            "node_name": self_info.name,
            "public_key_prefix": meshcitadel::meshcore::hex_snippet(&self_info.public_key, 6),
            "tx_power": self_info.tx_power,
            "protocol_version": protocol_version,
            "device": device,
            "timeout_seconds": timeout,
        }),
        None => serde_json::json!({
            "status": "incomplete",
            "timeout_seconds": timeout,
        }),
    };
    println!("{}", payload);
    Ok(if outcome.is_some() { 0 } else { 1 })
}

#[cfg(not(feature = "serial"))]
async fn smoke_test(_config: Config, _port: String, _baud: u32, _timeout: u64) -> Result<i32> {
    error!("SmokeTest requires the 'serial' feature");
    Ok(2)
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|file| std::fs::OpenOptions::new().create(true).append(true).open(file).ok());
    let security_path = config.as_ref().and_then(|c| c.logging.security_file.clone());

    match log_file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Foreground runs also echo to the console
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if record.target() == "security" {
                    write_security_line(security_path.as_deref(), &line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if record.target() == "security" {
                    write_security_line(security_path.as_deref(), &line);
                }
                writeln!(fmt, "{}", line)
            });
        }
    }
    let _ = builder.try_init();
}

fn write_security_line(path: Option<&str>, line: &str) {
    use std::io::Write;
    let Some(path) = path else {
        return;
    };
    if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(f, "{}", line);
    }
}
