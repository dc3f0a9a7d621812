//! Binary entrypoint for the Meshmail CLI.
//!
//! Commands:
//! - `start [--port <path>] [--companion-port <path>] [--no-companion]` - run the relay
//! - `init` - create a starter `config.toml` and the data directory
//! - `status [--id <message id>]` - print queue counts, or one outbox row (relay stopped)
//!
//! See the library crate docs for module‑level details: `meshmail::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

use meshmail::config::Config;
use meshmail::mail::node_label;
use meshmail::storage::MessageStore;

#[derive(Parser)]
#[command(name = "meshmail")]
#[command(about = "Store-and-forward mail relay for Meshtastic mesh networks")]
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
    /// Start the relay
    Start {
        /// Gateway radio port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,

        /// Companion serial port (e.g., /dev/ttyACM0)
        #[arg(long)]
        companion_port: Option<String>,

        /// Run without a companion even if one is configured
        #[arg(long)]
        no_companion: bool,
    },
    /// Write a default configuration
    Init,
    /// Show queue statistics (stop the relay first: the store is locked while it runs)
    Status {
        /// Show a single outbox message instead
        #[arg(long)]
        id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            port,
            companion_port,
            no_companion,
        } => {
            let config = Config::load(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            info!("Starting Meshmail v{}", env!("CARGO_PKG_VERSION"));
            run_relay(config, port, companion_port, no_companion).await?;
        }
        Commands::Init => {
            init_logging(None, cli.verbose);
            info!("Initializing new relay configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
            let config = Config::default();
            tokio::fs::create_dir_all(&config.storage.data_dir).await?;
            info!("Data directory ready at {}", config.storage.data_dir);
        }
        Commands::Status { id } => {
            let config = Config::load(&cli.config).await?;
            init_logging(Some(&config), cli.verbose);
            let store = MessageStore::open(config.storage.mail_db_path())?;
            match id {
                Some(id) => match store.get_outbox(&id) {
                    Some(entry) => {
                        println!("Message:   {}", entry.mail.id);
                        println!("To:        {}", node_label(entry.mail.to));
                        println!("From:      {}", node_label(entry.mail.from));
                        println!("Subject:   {}", entry.mail.subject);
                        println!("Status:    {}", entry.status);
                        println!("Hops:      {}", entry.mail.hops);
                        println!("Attempts:  {}", entry.retry_count);
                        if let Some(acker) = entry.acked_by {
                            println!("Acked by:  {}", node_label(acker));
                        }
                    }
                    None => println!("No outbox message with id {}", id),
                },
                None => {
                    let stats = store.stats();
                    println!("Meshmail status ({})", config.storage.mail_db_path().display());
                    println!("  inbox:   {}", stats.inbox);
                    println!("  outbox:  {}", stats.outbox_total());
                    println!("    pending: {}", stats.pending);
                    println!("    sent:    {}", stats.sent);
                    println!("    acked:   {}", stats.acked);
                    println!("    failed:  {}", stats.failed);
                }
            }
        }
    }

    Ok(())
}

#[cfg(feature = "serial")]
async fn run_relay(
    config: Config,
    port: Option<String>,
    companion_port: Option<String>,
    no_companion: bool,
) -> Result<()> {
    use std::sync::Arc;

    use meshmail::relay::Relay;
    use meshmail::transport::packet_channel;
    use meshmail::transport::serial::{bridge_companion_port, open_shared_port, SerialRadio};
    use tokio::sync::watch;

    let store = Arc::new(MessageStore::open(config.storage.mail_db_path())?);

    // CLI overrides config
    let radio_port = port.unwrap_or_else(|| config.meshtastic.port.clone());
    if radio_port.is_empty() {
        return Err(anyhow!("No radio port given (use --port or [meshtastic].port)"));
    }
    let shared = open_shared_port(&radio_port, config.meshtastic.baud_rate).await?;
    info!("Connected to radio on {}", radio_port);

    // The radio reader must run before identity resolution, since MYINFO arrives through it.
    let (io_shutdown_tx, io_shutdown_rx) = watch::channel(false);
    let radio = SerialRadio::new(shared);
    let (packet_tx, packets) = packet_channel();
    let reader = radio.spawn_reader(packet_tx, io_shutdown_rx.clone());

    let relay = match Relay::new(config.relay_settings(), store, radio).await {
        Ok(relay) => relay,
        Err(e) => {
            let _ = io_shutdown_tx.send(true);
            return Err(e.into());
        }
    };

    let companion = if no_companion || !config.companion.enabled {
        None
    } else {
        let path = companion_port.unwrap_or_else(|| config.companion.port.clone());
        match open_shared_port(&path, config.companion.baud_rate).await {
            Ok(port) => {
                info!("Companion attached on {}", path);
                Some(bridge_companion_port(port, io_shutdown_rx.clone()))
            }
            Err(e) => {
                warn!("Companion port unavailable ({}); running without companion", e);
                None
            }
        }
    };

    let handle = match companion {
        Some((stream, _bridge)) => {
            let (read_half, write_half) = tokio::io::split(stream);
            relay.start_with_companion(packets, read_half, write_half)
        }
        None => relay.start(packets),
    };
    info!("Relay running as {}", node_label(handle.engine().local_node()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    handle.shutdown().await;
    let _ = io_shutdown_tx.send(true);
    let _ = reader.await;
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn run_relay(
    _config: Config,
    _port: Option<String>,
    _companion_port: Option<String>,
    _no_companion: bool,
) -> Result<()> {
    Err(anyhow!("This build has no radio transport; rebuild with the 'serial' feature"))
}

fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match verbosity {
        0 => config
            .and_then(|cfg| cfg.logging.level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);
    // sled is chatty at debug
    builder.filter_module("sled", log::LevelFilter::Warn);

    let log_file = config
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Mirror to the console only when someone is watching
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
