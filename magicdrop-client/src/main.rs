use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    process::ExitCode,
    sync::{Arc, Mutex},
};

use clap::{Parser, Subcommand};
use magicdrop_client::{
    Clipboard, DesktopReceiver, MobileSender, PubSub, ReceiverCommand, ReceiverExit, RelayClient,
    SystemClipboard, TerminalBell,
    config::{ClientConfig, data_dir, log_path, resolve_config, storage_path},
    get_or_create_session,
    receiver::{STATUS_CLICK_TO_COPY, STATUS_COPIED_TO_CLIPBOARD},
    run_receiver,
    sender::STATUS_INVALID_SESSION,
    storage::FileStore,
};
use magicdrop_core::{ChannelName, pairing_link, session_from_link};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;
use url::Url;

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "magicdrop", about = "Send a phone's clipboard to a paired desktop")]
struct ClientArgs {
    /// Relay WebSocket URL; saved for later runs.
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// Origin used to build pairing links; saved for later runs.
    #[arg(long, global = true)]
    origin: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the pairing link and copy whatever the paired phone sends.
    Desktop,
    /// Send this device's clipboard to the desktop named in LINK.
    Mobile { link: String },
    /// Print the pairing link for this installation.
    Link,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = ClientArgs::parse();
    let dir = data_dir();
    init_logging(&log_path(&dir));

    let cfg = match resolve_config(&dir, args.server_url.as_deref(), args.origin.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("config resolution failed: {}", err);
            eprintln!("Failed to start:\n\n{err}");
            return ExitCode::from(2);
        }
    };

    info!(
        server_url = %cfg.server_url,
        origin = %cfg.origin,
        command = ?args.command,
        "client starting"
    );

    let result = match args.command {
        Command::Desktop => run_desktop(&dir, &cfg).await,
        Command::Mobile { link } => run_mobile(&cfg, &link).await,
        Command::Link => print_link(&dir, &cfg),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run_desktop(dir: &Path, cfg: &ClientConfig) -> Result<ExitCode, String> {
    let store = FileStore::new(storage_path(dir));
    let identity = get_or_create_session(&store);
    let origin = cfg.origin_url().map_err(|err| err.to_string())?;
    let link = pairing_link(&origin, &identity.token).map_err(|err| err.to_string())?;

    println!("Magic Drop");
    println!("Open this link on your phone, or scan it as a QR code:\n\n  {link}\n");
    println!("Session: {}", identity.token.short(8));
    if !identity.persisted {
        println!("Session storage is unavailable; this link only works until you quit.");
    }
    println!("Commands: c = copy again, n = scan another, q = quit\n");

    let client = RelayClient::connect(&cfg.server_url)
        .await
        .map_err(|err| err.to_string())?;
    let channel = ChannelName::for_session(&identity.token);
    let subscription = match client.subscribe(&channel).await {
        Ok(subscription) => subscription,
        Err(err) => {
            client.close().await;
            return Err(err.to_string());
        }
    };

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    spawn_command_reader(command_tx.clone());
    let ctrl_c_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = command_tx.send(ReceiverCommand::Quit);
        }
    });

    let mut receiver = DesktopReceiver::new(SystemClipboard::new());
    let exit = run_receiver(&mut receiver, subscription, command_rx, render_receiver).await;

    ctrl_c_task.abort();
    client.close().await;

    match exit {
        ReceiverExit::Quit => Ok(ExitCode::SUCCESS),
        ReceiverExit::SubscriptionClosed => {
            eprintln!("Connection to the relay was lost.");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_mobile(cfg: &ClientConfig, link: &str) -> Result<ExitCode, String> {
    let token = match Url::parse(link.trim())
        .ok()
        .and_then(|url| session_from_link(&url).ok())
    {
        Some(token) => token,
        None => {
            warn!("pairing link rejected");
            println!("{STATUS_INVALID_SESSION}\nPlease scan again.");
            return Ok(ExitCode::from(2));
        }
    };

    let client = RelayClient::connect(&cfg.server_url)
        .await
        .map_err(|err| err.to_string())?;
    let mut sender = MobileSender::new(token, client, SystemClipboard::new(), TerminalBell);
    println!("Session: {}...", sender.token().short(4));

    let outcome = sender.send_clipboard().await;
    println!("{}", sender.status());
    if let Some(text) = sender.last_sent() {
        println!("Sent content: {}", preview_text(text, 60));
    }

    sender.into_pubsub().close().await;
    Ok(match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    })
}

fn print_link(dir: &Path, cfg: &ClientConfig) -> Result<ExitCode, String> {
    let identity = get_or_create_session(&FileStore::new(storage_path(dir)));
    let origin = cfg.origin_url().map_err(|err| err.to_string())?;
    let link = pairing_link(&origin, &identity.token).map_err(|err| err.to_string())?;
    println!("{link}");
    Ok(ExitCode::SUCCESS)
}

// Blocking stdin lives on its own thread so it never holds up runtime shutdown.
fn spawn_command_reader(tx: mpsc::UnboundedSender<ReceiverCommand>) {
    std::thread::spawn(move || {
        for line in io::stdin().lines() {
            let Ok(line) = line else { break };
            let command = match line.trim() {
                "c" | "copy" => ReceiverCommand::ManualCopy,
                "n" | "next" => ReceiverCommand::ScanAnother,
                "q" | "quit" => ReceiverCommand::Quit,
                "" => continue,
                other => {
                    println!("Unknown command {other:?} (c, n, q)");
                    continue;
                }
            };
            if tx.send(command).is_err() {
                break;
            }
        }
    });
}

fn render_receiver<C: Clipboard>(receiver: &DesktopReceiver<C>) {
    println!("[{}]", receiver.status());
    let status = receiver.status();
    if status == STATUS_COPIED_TO_CLIPBOARD || status == STATUS_CLICK_TO_COPY {
        if let Some(content) = receiver.content() {
            println!("----------------------------------------");
            println!("{content}");
            println!("----------------------------------------");
        }
    }
}

fn preview_text(text: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for (index, ch) in text.chars().enumerate() {
        if index >= max_chars {
            out.push('…');
            break;
        }
        out.push(if ch.is_control() { ' ' } else { ch });
    }
    out
}

fn init_logging(log_path: &Path) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let file = log_path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(log_path));
    let file = match file {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .init();
}
