//! notebook-client CLI entry point.
//!
//! Runs the cells of a notebook or percent-format script against a kernel
//! service and prints the results.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use notebook_client::connection::{Connector, TcpConnector};
use notebook_client::settings::{self, ClientSettings, Endpoint};
use notebook_client::{
    Cell, CellStore, Credential, ExecutionState, NotebookContent, NotebookEvent, NotebookHandle,
    TOKEN_ENV_VAR,
};
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(name = "notebook-client")]
#[command(about = "Run notebook cells on a remote kernel service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Settings file (default: <config dir>/notebook-client/settings.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute every cell of a notebook (.ipynb/.json) or `# %%` script
    Run {
        file: PathBuf,

        /// Kernel service address, `host:port` or `unix:<path>`
        #[arg(long)]
        endpoint: Option<String>,

        /// Session token (default: $NOTEBOOK_TOKEN)
        #[arg(long)]
        token: Option<String>,

        /// Path the service files the notebook under (default: file name)
        #[arg(long)]
        notebook_path: Option<String>,

        /// Ask the service to save the notebook after the run
        #[arg(long)]
        save: bool,
    },

    /// Show the effective settings
    Config {
        /// Output in JSON format
        #[arg(long)]
        json: bool,

        /// Write the effective settings to the settings file
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let settings_file = cli.config.unwrap_or_else(settings::settings_path);
    let mut settings = settings::load_settings_from(&settings_file);
    info!("Using settings from {}", settings_file.display());

    match cli.command {
        Commands::Run {
            file,
            endpoint,
            token,
            notebook_path,
            save,
        } => {
            if let Some(endpoint) = endpoint {
                settings.endpoint = endpoint;
            }
            let token = match token.or_else(|| std::env::var(TOKEN_ENV_VAR).ok()) {
                Some(token) => token,
                None => bail!("No session token: pass --token or set {}", TOKEN_ENV_VAR),
            };
            let notebook_path = notebook_path.unwrap_or_else(|| {
                file.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| settings.notebook_path.clone())
            });
            let store = load_document(&file, &notebook_path)?;

            match settings.endpoint() {
                Endpoint::Tcp(addr) => {
                    run_notebook(TcpConnector::new(addr), store, &settings, token, save).await
                }
                #[cfg(unix)]
                Endpoint::Unix(path) => {
                    run_notebook(
                        notebook_client::UnixConnector::new(path),
                        store,
                        &settings,
                        token,
                        save,
                    )
                    .await
                }
                #[cfg(not(unix))]
                Endpoint::Unix(_) => bail!("Unix socket endpoints are not supported here"),
            }
        }
        Commands::Config { json, write } => {
            if write {
                settings::save_settings_to(&settings_file, &settings)?;
                println!("Wrote {}", settings_file.display());
            }
            show_config(&settings_file, &settings, json)
        }
    }
}

fn load_document(file: &Path, notebook_path: &str) -> anyhow::Result<CellStore> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let is_json = matches!(
        file.extension().and_then(|e| e.to_str()),
        Some("ipynb") | Some("json")
    );
    let content = if is_json {
        serde_json::from_str::<NotebookContent>(&text)
            .with_context(|| format!("Failed to parse {}", file.display()))?
    } else {
        NotebookContent::from_script(&text)
    };
    Ok(CellStore::from_content(notebook_path, &content))
}

async fn run_notebook<C: Connector>(
    connector: C,
    store: CellStore,
    settings: &ClientSettings,
    token: String,
    save: bool,
) -> anyhow::Result<()> {
    info!("Connecting to {}", settings.endpoint);
    let handle = NotebookHandle::spawn(connector, store, settings.session_options());
    let mut events = handle.events();

    handle
        .connect(Credential::new(token))
        .await
        .context("Failed to open a session")?;

    let cells = handle.cells().await?;
    let mut failures = 0usize;
    for (index, cell) in cells.iter().enumerate() {
        if cell.source.trim().is_empty() {
            continue;
        }
        handle.run_cell(&cell.id).await?;
        let finished = wait_for_cell(&mut events, &cell.id).await?;
        print_cell(index + 1, &finished);
        if finished.execution_state == ExecutionState::Failed {
            failures += 1;
        }
    }

    if save {
        handle.save().await.context("Failed to send save request")?;
        wait_for_save(&mut events).await?;
    }

    handle.disconnect().await?;

    if failures > 0 {
        bail!("{} cell(s) failed", failures);
    }
    Ok(())
}

/// Wait until `cell_id` reaches a terminal state.
async fn wait_for_cell(
    events: &mut broadcast::Receiver<NotebookEvent>,
    cell_id: &str,
) -> anyhow::Result<Cell> {
    loop {
        match events.recv().await {
            Ok(NotebookEvent::CellChanged(cell))
                if cell.id == cell_id
                    && matches!(
                        cell.execution_state,
                        ExecutionState::Completed | ExecutionState::Failed
                    ) =>
            {
                return Ok(cell);
            }
            Ok(NotebookEvent::AuthenticationRequired { reason }) => {
                bail!("Session credential rejected: {}", reason)
            }
            Ok(NotebookEvent::Disconnected { reason }) => {
                eprintln!("Connection lost ({}), waiting for reconnect...", reason);
            }
            Ok(NotebookEvent::ServiceError { message }) => eprintln!("Service error: {}", message),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Missed {} session events", n);
            }
            Err(broadcast::error::RecvError::Closed) => bail!("Session ended unexpectedly"),
        }
    }
}

async fn wait_for_save(events: &mut broadcast::Receiver<NotebookEvent>) -> anyhow::Result<()> {
    loop {
        match events.recv().await {
            Ok(NotebookEvent::Saved { message }) => {
                println!("{}", message.as_deref().unwrap_or("Notebook saved"));
                return Ok(());
            }
            Ok(NotebookEvent::SaveFailed { error }) => bail!("Save failed: {}", error),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => bail!("Session ended unexpectedly"),
        }
    }
}

fn print_cell(number: usize, cell: &Cell) {
    println!("In [{}]:", number);
    for line in cell.source.lines() {
        println!("    {}", line);
    }
    match &cell.error {
        Some(error) => {
            println!("Error [{}]:", number);
            for line in error.lines() {
                println!("    {}", line);
            }
        }
        None if !cell.output.is_empty() => {
            println!("Out [{}]:", number);
            for line in cell.output.lines() {
                println!("    {}", line);
            }
        }
        None => {}
    }
    println!();
}

fn show_config(path: &Path, settings: &ClientSettings, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(settings)?);
        return Ok(());
    }

    println!("Settings file: {}", path.display());
    println!("  Endpoint: {}", settings.endpoint);
    println!("  Notebook path: {}", settings.notebook_path);
    println!("  Connect timeout: {}ms", settings.connect_timeout_ms);
    println!("  Handshake timeout: {}ms", settings.handshake_timeout_ms);
    println!(
        "  Reconnect backoff: {}ms..{}ms (jitter {})",
        settings.reconnect.base_ms, settings.reconnect.max_ms, settings.reconnect.jitter
    );
    match settings.execute_timeout_secs {
        Some(secs) => println!("  Execute timeout: {}s", secs),
        None => println!("  Execute timeout: none"),
    }
    Ok(())
}
