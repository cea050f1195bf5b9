mod console;

use anyhow::{Context, Result};
use clap::Parser;
use pairing_session::config::{PairingMode, SessionConfig};
use pairing_session::runtime::{self, Exit};
use pairing_session::telemetry::logging::{self, LogLevel};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use transport_webrtc::{StaticSampleMedia, WebRtcTransportFactory};

#[derive(Parser, Debug)]
#[command(name = "pairing-client")]
#[command(about = "Video chat with a stranger or a named peer through a pairing relay")]
struct Cli {
    /// Relay WebSocket URL (overrides PAIRING_RELAY_URL)
    #[arg(long, short = 'r')]
    relay: Option<String>,

    /// `auto-find` pairs with strangers, `directory` calls peers by name
    #[arg(long, short = 'm')]
    mode: Option<PairingMode>,

    /// Name to join the directory with
    #[arg(long, short = 'u')]
    username: Option<String>,

    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Write logs to a file instead of stderr
    #[arg(long)]
    log_file: Option<std::path::PathBuf>,
}

impl Cli {
    fn apply(self, config: &mut SessionConfig) {
        if let Some(relay) = self.relay {
            config.relay_url = relay;
        }
        if let Some(mode) = self.mode {
            config.pairing_mode = mode;
        }
        if self.username.is_some() {
            config.username = self.username;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if self.log_file.is_some() {
            config.log_file = self.log_file;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = SessionConfig::load().context("invalid PAIRING_* environment")?;
    cli.apply(&mut config);
    logging::init(&config.log_config()).context("failed to initialise logging")?;

    info!(
        relay = %config.relay_url,
        mode = ?config.pairing_mode,
        "starting pairing client"
    );
    let factory = WebRtcTransportFactory::from_config(&config);
    let (runtime, handle, mut events) =
        runtime::connect(&config, Box::new(factory), Box::new(StaticSampleMedia::new()))
            .await
            .with_context(|| format!("could not reach relay at {}", config.relay_url))?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = console::render(&event) {
                println!("{line}");
            }
        }
    });

    let input_handle = handle.clone();
    let input = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "stdin read failed");
                    break;
                }
            };
            match console::parse_line(&line) {
                Ok(Some(intent)) => {
                    if !input_handle.submit(intent) {
                        break;
                    }
                }
                Ok(None) => {}
                Err(message) => eprintln!("{message}"),
            }
        }
        input_handle.shutdown();
    });

    if config.pairing_mode == PairingMode::Directory && config.username.is_none() {
        println!("* type /join <name> to appear in the directory");
    }

    let (_, exit) = runtime.run().await?;
    input.abort();
    let _ = printer.await;
    drop(handle);

    match exit {
        Exit::Shutdown => info!("session closed"),
        Exit::RelayClosed => println!("* relay closed the connection"),
    }
    Ok(())
}
