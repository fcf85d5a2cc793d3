/// === IMPORTS ===

use std::error::Error;
use std::io::BufRead;
use std::path::PathBuf;

// Command line flags
use clap::Parser;

// - broadcast: Ctrl+C signal
// - mpsc: typed lines from the stdin thread
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use mesh_chat::console::{parse_command, Command, Console};
use mesh_chat::history::MessageHistory;
use mesh_chat::{init_logger, Logger, NodeConfig, PeerNode};


/// === CLI ===

#[derive(Parser, Debug)]
#[command(
    name = "mesh-chat",
    version,
    about = "Decentralized LAN chat. Peers find each other over multicast and relay \
             every message to everyone they are connected to.",
    long_about = None
)]
struct Cli {
    /// Name shown to other peers
    #[arg(short, long)]
    name: Option<String>,

    /// First port to listen on; the next free one is used if it is taken
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// JSON config file; flags given here override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,

    /// Do not announce or listen on the LAN multicast group
    #[arg(long)]
    no_discovery: bool,

    /// Where chat transcripts are written
    #[arg(long, default_value = "history")]
    history_dir: PathBuf,

    /// Do not write a transcript
    #[arg(long)]
    no_history: bool,
}

/// Config file (or defaults), then command line overrides on top.
fn build_config(cli: &Cli) -> mesh_chat::Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)?,
        None => NodeConfig::default(),
    };

    if let Some(name) = &cli.name {
        config.name = name.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logger.log_level = level.clone();
    }
    if cli.no_discovery {
        config.discovery.enabled = false;
    }

    config.validate()?;
    Ok(config)
}


/// === MAIN ===

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    // Build a multi-threaded Tokio runtime based on the `worker_threads` value.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)   // how many threads to use
        .thread_name("mesh-chat-worker")          // helpful for debugging
        .enable_all()                             // turn on I/O, timers, signals
        .build()?;

    // Log lines are tagged with the node's name
    let logger = init_logger(&config.name, &config.logger);

    rt.block_on(run(cli, config, logger))
}

async fn run(cli: Cli, config: NodeConfig, logger: Logger) -> Result<(), Box<dyn Error + Send + Sync>> {
    // 1) Start the node; a failure here (no free port) ends the program
    let (node, mut events) = match PeerNode::start(config, logger.clone()).await {
        Ok(started) => started,
        Err(e) => {
            logger.error(&format!("❌ Could not start node: {}", e));
            return Err(e.into());
        }
    };

    // 2) Transcript, unless disabled. Chat still works without one
    let history = if cli.no_history {
        None
    } else {
        match MessageHistory::start(&cli.history_dir, node.name(), node.listen_port(), logger.clone()) {
            Ok(history) => Some(history),
            Err(e) => {
                logger.warn(&format!("⚠️ Chat history disabled: {}", e));
                None
            }
        }
    };

    let mut console = Console::new(std::io::stdout(), history);
    console.handle_command(Command::Help, &node);

    // 3) Inputs: typed lines, node events, Ctrl+C
    let mut input = spawn_stdin_reader();
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let signal_handle = spawn_shutdown_listener(shutdown_tx, logger.clone());

    loop {
        tokio::select! {
            line = input.recv() => match line {
                Some(line) => {
                    if !console.handle_command(parse_command(&line), &node) {
                        break;
                    }
                }
                // stdin closed
                None => break,
            },

            Some(event) = events.recv() => console.handle_event(event),

            _ = shutdown_rx.recv() => break,
        }
    }

    // 4) Close everything, then show what the shutdown itself reported
    node.shutdown().await;
    while let Ok(event) = events.try_recv() {
        console.handle_event(event);
    }
    console.close();
    signal_handle.abort();

    Ok(())
}

/// Reads stdin on a plain thread: a blocking read there cannot stall the runtime.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Waits for Ctrl+C, then broadcasts the shutdown signal.
fn spawn_shutdown_listener(shutdown_tx: broadcast::Sender<()>, logger: Logger) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            logger.error(&format!("Failed to listen for ctrl_c: {}", e));
            return;
        }
        logger.warn("🛑 Ctrl+C received, shutting down.");
        let _ = shutdown_tx.send(());
    })
}
