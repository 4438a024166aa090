//! SimpleCom command line serial terminal

mod session;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use simplecom_core::demo::LoopbackDevice;
use simplecom_core::dispatch::{DispatchEvent, LineEnding};
use simplecom_core::serial::{list_ports, SerialError};
use simplecom_core::settings::{JsonSettingsStore, SettingsStore, TerminalSettings};

use session::Session;

/// Port name used when running against the built-in loopback device
const DEMO_PORT: &str = "demo";

#[derive(Debug, Parser)]
#[command(name = "simplecom", version, about = "Timestamping serial terminal")]
struct Cli {
    /// Settings file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List available serial ports
    Ports,
    /// Show timestamped traffic and send each typed line
    Monitor(ConnectArgs),
    /// Send a batch of commands, one per line
    Send(SendArgs),
    /// Show or clear the command history
    History {
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Debug, Args)]
struct ConnectArgs {
    /// Port to open, e.g. /dev/ttyUSB0 or COM3
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long)]
    baud: Option<u32>,

    /// None, CR, LF or CR+LF
    #[arg(short = 'e', long)]
    line_ending: Option<LineEnding>,

    /// Talk to an in-process echo device instead of real hardware
    #[arg(long)]
    demo: bool,
}

#[derive(Debug, Args)]
struct SendArgs {
    #[command(flatten)]
    connect: ConnectArgs,

    /// Pause between lines in milliseconds
    #[arg(short, long)]
    interval: Option<u64>,

    /// Read the batch from a file
    #[arg(short, long, conflicts_with = "text")]
    file: Option<PathBuf>,

    /// Commands to send; each argument is one line
    text: Vec<String>,

    /// How long to keep showing replies after the batch finishes
    #[arg(long, default_value_t = 500)]
    linger_ms: u64,
}

impl ConnectArgs {
    /// Overlay command line choices onto the remembered settings
    fn apply(&self, settings: &mut TerminalSettings) {
        if let Some(port) = &self.port {
            settings.port = Some(port.clone());
        } else if self.demo && settings.port.is_none() {
            settings.port = Some(DEMO_PORT.to_string());
        }
        if let Some(baud) = self.baud {
            settings.baud_rate = baud;
        }
        if let Some(ending) = self.line_ending {
            settings.line_ending = ending;
        }
    }

    fn device(&self) -> Option<LoopbackDevice> {
        self.demo.then(LoopbackDevice::echoing)
    }
}

impl SendArgs {
    fn batch_text(&self, settings: &TerminalSettings) -> Result<String> {
        if let Some(path) = &self.file {
            return std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()));
        }
        if !self.text.is_empty() {
            return Ok(self.text.join("\n"));
        }
        if settings.batch_content.trim().is_empty() {
            bail!("nothing to send; pass commands, --file, or save a batch first");
        }
        Ok(settings.batch_content.clone())
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(path: Option<PathBuf>) -> Result<JsonSettingsStore> {
    match path {
        Some(path) => Ok(JsonSettingsStore::new(path)),
        None => JsonSettingsStore::default_location().context("locating settings directory"),
    }
}

fn save_settings(store: &JsonSettingsStore, settings: &TerminalSettings) {
    if let Err(e) = store.save(settings) {
        tracing::warn!("Failed to save settings to {}: {}", store.path().display(), e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let store = open_store(cli.settings)?;
    let mut settings = store.load()?;

    match cli.command {
        Command::Ports => {
            let ports = list_ports();
            if ports.is_empty() {
                eprintln!("No serial ports found");
            }
            for port in ports {
                println!("{}\t{}", port.id, port.label);
            }
        }
        Command::History { clear } => {
            if clear {
                settings.history.clear();
                store.save(&settings)?;
            } else {
                for entry in settings.history.entries() {
                    println!("{}", entry);
                }
            }
        }
        Command::Monitor(args) => {
            args.apply(&mut settings);
            let session = Session::connect(&settings, args.device())?;
            let outcome = monitor(&session, settings.line_ending).await;
            settings.history = session.close();
            save_settings(&store, &settings);
            outcome?;
        }
        Command::Send(args) => {
            args.connect.apply(&mut settings);
            if let Some(interval) = args.interval {
                settings.set_batch_interval(interval);
            }
            let text = args.batch_text(&settings)?;
            settings.batch_content = text.clone();

            let session = Session::connect(&settings, args.connect.device())?;
            let outcome = session
                .send_batch(&text, settings.line_ending, settings.batch_interval_ms)
                .await;
            if matches!(outcome, Ok(Some(DispatchEvent::Completed { .. }))) {
                tokio::time::sleep(Duration::from_millis(args.linger_ms)).await;
            }
            settings.history = session.close();
            save_settings(&store, &settings);

            match outcome? {
                None => eprintln!("Nothing to send"),
                Some(event @ DispatchEvent::Aborted(_)) => bail!("batch {}", event),
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Interactive loop: every stdin line is sent as a single command
async fn monitor(session: &Session, line_ending: LineEnding) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut link_check = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = link_check.tick() => {
                if !session.is_connected() {
                    bail!("connection lost");
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if line.trim() == "/clear" {
                    session.clear_display();
                    continue;
                }
                match session.queue().start(&line, line_ending, 0) {
                    Ok(_) => {}
                    Err(SerialError::AlreadySending) => eprintln!("Still sending, try again"),
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
        }
    }
    Ok(())
}
