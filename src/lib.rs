use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod idle;
pub mod proxy;
pub mod readiness;
pub mod store;
pub mod supervisor;

use bridge::{CommandBridge, CommandResult, StartDownloadArgs};
use config::ShellConfig;
use events::{EventBus, ShellEvent};
use proxy::server::ProxyServer;
use proxy::ProxyRouter;
use store::{HistoryEntry, Settings, SettingsPatch, SettingsStore};
use supervisor::{SupervisorHandle, SupervisorStatus};

/// Native folder chooser. The dialog lives in the UI layer.
pub trait FolderPicker: Send + Sync {
    fn pick_folders(&self) -> Option<Vec<PathBuf>>;
}

/// Used when no UI is attached: the user never picks anything.
pub struct HeadlessFolderPicker;

impl FolderPicker for HeadlessFolderPicker {
    fn pick_folders(&self) -> Option<Vec<PathBuf>> {
        None
    }
}

/// Auto-update backend. Both calls are fire-and-forget.
pub trait Updater: Send + Sync {
    /// Look for a new release and report it through `events`
    /// (`UpdateAvailable`, later `UpdateDownloaded`).
    fn check_for_update(&self, events: &EventBus);
    fn restart_and_install(&self);
}

pub struct DisabledUpdater;

impl Updater for DisabledUpdater {
    fn check_for_update(&self, _events: &EventBus) {
        info!("update check requested, no update channel configured");
    }

    fn restart_and_install(&self) {
        info!("restart requested, no update pending");
    }
}

/// Everything the UI layer may call. One instance per process.
pub struct Shell {
    settings: Arc<SettingsStore>,
    events: EventBus,
    bridge: CommandBridge,
    folder_picker: Box<dyn FolderPicker>,
    updater: Arc<dyn Updater>,
}

impl Shell {
    /// Open the settings store and spawn the worker supervisor.
    /// Must be called inside a tokio runtime.
    pub fn new(config: &ShellConfig) -> Result<Self> {
        let events = EventBus::new();
        let settings = Arc::new(SettingsStore::open(&config.data_dir));
        info!("settings file: {}", settings.path().display());
        let supervisor =
            SupervisorHandle::spawn(config.worker.clone(), &config.resource_dir, events.clone());
        let bridge = CommandBridge::new(&config.worker, supervisor, settings.clone(), events.clone())
            .context("failed to build the worker client")?;

        Ok(Self {
            settings,
            events,
            bridge,
            folder_picker: Box::new(HeadlessFolderPicker),
            updater: Arc::new(DisabledUpdater),
        })
    }

    pub fn with_folder_picker(mut self, picker: impl FolderPicker + 'static) -> Self {
        self.folder_picker = Box::new(picker);
        self
    }

    pub fn with_updater(mut self, updater: impl Updater + 'static) -> Self {
        self.updater = Arc::new(updater);
        self
    }

    pub fn select_folder(&self) -> Option<Vec<PathBuf>> {
        self.folder_picker.pick_folders()
    }

    /// Reveal `path` in the platform file manager. Failures are only logged.
    pub async fn open_folder(&self, path: &Path) {
        let opener = if cfg!(target_os = "macos") {
            "open"
        } else if cfg!(windows) {
            "explorer"
        } else {
            "xdg-open"
        };

        match tokio::process::Command::new(opener).arg(path).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("{opener} {} exited with {status}", path.display()),
            Err(err) => error!("failed to open {}: {err}", path.display()),
        }
    }

    pub fn get_app_version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn get_config(&self) -> Settings {
        self.settings.snapshot()
    }

    pub fn set_config(&self, patch: SettingsPatch) -> CommandResult<()> {
        match self.settings.apply(patch) {
            Ok(()) => CommandResult::done(),
            Err(err) => CommandResult::fail(err.to_string()),
        }
    }

    pub fn get_history(&self) -> Vec<HistoryEntry> {
        self.settings.history()
    }

    pub fn add_history(&self, entry: HistoryEntry) -> CommandResult<()> {
        match self.settings.add_history(entry) {
            Ok(()) => CommandResult::done(),
            Err(err) => CommandResult::fail(err.to_string()),
        }
    }

    pub fn clear_history(&self) -> CommandResult<()> {
        match self.settings.clear_history() {
            Ok(()) => CommandResult::done(),
            Err(err) => CommandResult::fail(err.to_string()),
        }
    }

    pub async fn start_download(&self, args: StartDownloadArgs) -> CommandResult<Value> {
        self.bridge.start_download(&args.book_id).await
    }

    pub async fn check_status(&self) -> CommandResult<Value> {
        self.bridge.check_status().await
    }

    pub fn check_for_update(&self) {
        let updater = self.updater.clone();
        let events = self.events.clone();
        tokio::spawn(async move { updater.check_for_update(&events) });
    }

    pub fn restart_app(&self) {
        let updater = self.updater.clone();
        tokio::spawn(async move { updater.restart_and_install() });
    }

    pub async fn worker_status(&self) -> CommandResult<SupervisorStatus> {
        self.bridge.supervisor().status().await.into()
    }

    pub async fn stop_worker(&self) -> CommandResult<()> {
        match self.bridge.supervisor().stop().await {
            Ok(()) => CommandResult::done(),
            Err(err) => CommandResult::fail(err.to_string()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShellEvent> {
        self.events.subscribe()
    }

    /// The worker never outlives the shell.
    pub async fn shutdown(&self) {
        info!("shell shutting down");
        self.bridge.supervisor().shutdown().await;
    }
}

#[derive(Parser)]
#[command(name = "tomato_desk", version, about = "Tomato novel downloader shell")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Interactive command loop on stdin (default).
    Shell,
    /// Run the reverse proxy until interrupted.
    Proxy {
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Start one download job and print the result.
    Download { book_id: String },
    /// Print the worker's job status.
    Status,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();

    let config = ShellConfig::load(cli.config.as_deref())?;
    let runtime = tokio::runtime::Runtime::new().context("failed to start the tokio runtime")?;

    runtime.block_on(async move {
        match cli.command.unwrap_or(CliCommand::Shell) {
            CliCommand::Shell => {
                let shell = Shell::new(&config)?;
                let result = command_loop(&shell).await;
                shell.shutdown().await;
                result
            }
            CliCommand::Proxy { listen } => serve_proxy(&config, listen).await,
            CliCommand::Download { book_id } => {
                let shell = Shell::new(&config)?;
                let reply = shell.start_download(StartDownloadArgs { book_id }).await;
                print_json(&reply);
                shell.shutdown().await;
                Ok(())
            }
            CliCommand::Status => {
                let shell = Shell::new(&config)?;
                let reply = shell.check_status().await;
                print_json(&reply);
                shell.shutdown().await;
                Ok(())
            }
        }
    })
}

async fn serve_proxy(config: &ShellConfig, listen: Option<SocketAddr>) -> Result<()> {
    let router = Arc::new(ProxyRouter::from_config(&config.proxy)?);
    let addr = listen.unwrap_or(config.proxy.listen);
    let server = ProxyServer::start(addr, router).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("interrupted, stopping proxy");
    server.shutdown().await;
    Ok(())
}

async fn command_loop(shell: &Shell) -> Result<()> {
    let mut events = shell.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    return Ok(());
                };
                if !dispatch(shell, line.trim()).await {
                    return Ok(());
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_json(&serde_json::json!({ "event": event })),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("dropped {missed} events");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Run one stdin command. Returns false when the loop should end.
async fn dispatch(shell: &Shell, line: &str) -> bool {
    let (command, argument) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "download" => {
            let args = StartDownloadArgs {
                book_id: argument.to_string(),
            };
            print_json(&shell.start_download(args).await);
        }
        "status" => print_json(&shell.check_status().await),
        "worker" => print_json(&shell.worker_status().await),
        "history" => print_json(&shell.get_history()),
        "clear-history" => print_json(&shell.clear_history()),
        "config" => print_json(&shell.get_config()),
        "open" => shell.open_folder(Path::new(argument)).await,
        "version" => println!("{}", shell.get_app_version()),
        "select" => print_json(&shell.select_folder()),
        "update" => shell.check_for_update(),
        "restart" => shell.restart_app(),
        "stop" => print_json(&shell.stop_worker().await),
        "quit" | "exit" => return false,
        other => warn!("unknown command: {other}"),
    }
    true
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{json}"),
        Err(err) => error!("failed to encode reply: {err}"),
    }
}
