use clap::{Parser, Subcommand};
use log::{info, warn};
use pulsewire::config::{KeepaliveSettings, load_settings};
use pulsewire::wire::{ADMIN_TEST_PAYLOAD, KEEPALIVE_FRAME, KEEPALIVE_TAG};
use pulsewire::{Connection, FatalEvent, FrameReceiver, Hooks, KeepaliveConfig, QueuedTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Keepalive and liveness probing for multiplexed duplex sockets
#[derive(Parser)]
#[command(name = "pulsewire")]
#[command(version)]
#[command(about = "Keepalive and liveness probing for multiplexed duplex sockets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the keepalive loop against an in-process simulated server
    Simulate {
        /// TOML file with a [keepalive] table (defaults apply if missing)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stop after this many keepalive pings have been answered
        #[arg(long, default_value_t = 5)]
        rounds: u32,

        /// Leave the first N keepalive pings unanswered
        #[arg(long, default_value_t = 0)]
        drop_pongs: u32,

        /// Answer admin tests with a rejection
        #[arg(long)]
        reject: bool,
    },
}

enum Event {
    Fatal(FatalEvent),
    Timeout(u32),
    Probe(bool),
    RoundsDone,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            config,
            rounds,
            drop_pongs,
            reject,
        } => {
            let config = match resolve_config(config) {
                Ok(config) => config,
                Err(message) => {
                    eprintln!("Error: {}", message);
                    std::process::exit(1);
                }
            };
            if let Some(event) = simulate(config, rounds, drop_pongs, reject).await {
                eprintln!("Connection declared dead: {}", event);
                std::process::exit(2);
            }
        }
    }
}

fn resolve_config(path: Option<PathBuf>) -> Result<KeepaliveConfig, String> {
    let settings = match path {
        Some(path) => load_settings(&path).map_err(|e| e.to_string())?,
        None => KeepaliveSettings::default(),
    };
    settings.validate().map_err(|e| e.to_string())
}

/// Returns the fatal event that ended the run, if any.
async fn simulate(
    config: KeepaliveConfig,
    rounds: u32,
    drop_pongs: u32,
    reject: bool,
) -> Option<FatalEvent> {
    let (events_tx, mut events) = mpsc::unbounded_channel();

    let hooks = {
        let fatal_tx = events_tx.clone();
        let timeout_tx = events_tx.clone();
        let probe_tx = events_tx.clone();
        Hooks::new()
            .on_fatal(move |event| {
                let _ = fatal_tx.send(Event::Fatal(event));
            })
            .on_timeout(move |count| {
                let _ = timeout_tx.send(Event::Timeout(count));
            })
            .on_probe_result(move |result| {
                let _ = probe_tx.send(Event::Probe(result.is_ok()));
            })
    };

    let connection = Arc::new(Connection::new(config, hooks));
    let (transport, rx) = QueuedTransport::new();
    let session = connection.open_session(Arc::new(transport));
    connection.set_logged_in(true);

    let server = Server {
        connection: connection.clone(),
        rounds,
        drop_pongs,
        reject,
        done: events_tx,
    };
    tokio::spawn(server.run(rx));

    let handle = connection.spawn_keepalive(session);

    let mut outcome = None;
    while let Some(event) = events.recv().await {
        match event {
            Event::Timeout(count) => warn!("Timeout #{}", count),
            Event::Probe(ok) => info!("Admin test {}", if ok { "passed" } else { "failed" }),
            Event::RoundsDone => {
                info!("Answered {} keepalive pings", rounds);
                break;
            }
            Event::Fatal(event) => {
                outcome = Some(event);
                break;
            }
        }
    }

    connection.close_session();
    let exit = handle.join().await;
    info!("Keepalive loop exited: {:?}", exit);
    outcome
}

/// In-process stand-in for the remote end of the socket.
struct Server {
    connection: Arc<Connection>,
    rounds: u32,
    drop_pongs: u32,
    reject: bool,
    done: mpsc::UnboundedSender<Event>,
}

impl Server {
    async fn run(self, mut rx: FrameReceiver) {
        let mut pings = 0u32;
        let mut answered = 0u32;

        while let Some(frame) = rx.recv().await {
            let Some(text) = frame.text() else { continue };

            if text == KEEPALIVE_FRAME {
                pings += 1;
                if pings <= self.drop_pongs {
                    info!("Server dropping ping #{}", pings);
                    continue;
                }
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis())
                    .unwrap_or_default();
                self.connection
                    .listeners()
                    .route(KEEPALIVE_TAG, &now_ms.to_string());
                answered += 1;
                if answered == self.rounds {
                    let _ = self.done.send(Event::RoundsDone);
                }
            } else if let Some(tag) = text.strip_suffix(ADMIN_TEST_PAYLOAD) {
                let reply = format!(r#"["Pong",{}]"#, !self.reject);
                self.connection
                    .listeners()
                    .route(tag.trim_end_matches(','), &reply);
            }
        }
    }
}
