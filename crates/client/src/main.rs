use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use parlor::view::{self, Command, CommandError};
use parlor::{
    ChatClient, ClientError, ClientResult, FileStorage, Session, SessionError, SettingsStore,
};
use parlor_storage::{SqliteBackend, StorageError};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "parlor", version, about = "Realtime chat rooms in the terminal")]
struct Cli {
    /// Settings file. Defaults to `<config dir>/parlor/settings.json`.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Sqlite database, overriding `database_path` from the settings.
    #[arg(long, value_name = "FILE")]
    database: Option<PathBuf>,
    /// Directory for the remembered display name, overriding `data_dir`.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to open chat database at {path:?}: {source}"))]
    OpenBackend {
        stage: &'static str,
        path: PathBuf,
        source: StorageError,
    },
    #[snafu(display("failed to restore session: {source}"))]
    RestoreSession {
        stage: &'static str,
        source: SessionError,
    },
    #[snafu(display("failed to start chat client: {source}"))]
    StartClient {
        stage: &'static str,
        source: ClientError,
    },
    #[snafu(display("failed to read input: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

enum Flow {
    Redraw,
    Quiet,
    Quit,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("parlor: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let settings_store = match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = settings_store.settings();
    init_tracing(&settings.log_filter);
    tracing::info!(config = ?settings_store.config_path(), "settings loaded");

    let database_path = cli
        .database
        .unwrap_or_else(|| settings.database_path.clone());
    let data_dir = cli.data_dir.unwrap_or_else(|| settings.data_dir.clone());

    let backend = SqliteBackend::open(&database_path.display().to_string())
        .await
        .context(OpenBackendSnafu {
            stage: "open-backend",
            path: database_path.clone(),
        })?;
    let session =
        Session::init(Arc::new(FileStorage::new(data_dir))).context(RestoreSessionSnafu {
            stage: "restore-session",
        })?;
    let mut client = ChatClient::start(Arc::new(backend), session)
        .await
        .context(StartClientSnafu {
            stage: "start-client",
        })?;

    match client.enable_copilot(&settings.copilot) {
        Ok(true) => println!("copilot is listening for @copilot mentions"),
        Ok(false) => {}
        Err(error) => tracing::warn!("copilot disabled: {error}"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    redraw(&client);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context(ReadInputSnafu { stage: "read-stdin" })? else {
                    break;
                };
                match execute(&mut client, &settings_store, &line).await {
                    Flow::Redraw => redraw(&client),
                    Flow::Quiet => {}
                    Flow::Quit => break,
                }
            }
            event = client.next_event() => {
                let Some(event) = event else {
                    break;
                };
                match client.handle_event(event).await {
                    Ok(true) => redraw(&client),
                    Ok(false) => {}
                    Err(error) => report(&error),
                }
            }
        }
    }

    client.shutdown();
    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn execute(client: &mut ChatClient, store: &SettingsStore, line: &str) -> Flow {
    let command = match view::parse_command(line) {
        Ok(command) => command,
        Err(CommandError::EmptyLine { .. }) => return Flow::Quiet,
        Err(error) => {
            println!("{error}");
            return Flow::Quiet;
        }
    };

    // Signed out, plain text fills in the session entry form.
    let command = match command {
        Command::Send(text) if !client.session().is_active() => Command::SetName(text),
        other => other,
    };

    match command {
        Command::Quit => Flow::Quit,
        Command::Help => {
            println!("{}", view::HELP);
            Flow::Quiet
        }
        Command::List => Flow::Redraw,
        command => match apply(client, store, command).await {
            Ok(()) => Flow::Redraw,
            Err(error) => {
                report(&error);
                Flow::Quiet
            }
        },
    }
}

async fn apply(
    client: &mut ChatClient,
    store: &SettingsStore,
    command: Command,
) -> ClientResult<()> {
    match command {
        Command::SetName(name) => client.login(&name).await,
        Command::Logout => client.logout(),
        Command::Create(name) => client.create_chat(&name).await.map(|_| ()),
        Command::Select(reference) => {
            let conversation_id = client.resolve_chat(&reference)?;
            client.select_chat(conversation_id).await
        }
        Command::Rename(reference, name) => {
            let conversation_id = client.resolve_chat(&reference)?;
            client.rename_chat(conversation_id, &name).await.map(|_| ())
        }
        Command::Delete(reference) => {
            let conversation_id = client.resolve_chat(&reference)?;
            client.delete_chat(conversation_id).await
        }
        Command::Send(text) => client.send_message(&text).await.map(|_| ()),
        Command::Copilot(enabled) => {
            let copilot = store
                .set_copilot_enabled(enabled)
                .map_err(|source| ClientError::Settings {
                    stage: "toggle-copilot",
                    source,
                })?;
            if client.enable_copilot(&copilot)? {
                println!("copilot is listening for @copilot mentions");
            } else if enabled {
                println!(
                    "copilot needs an api key: set copilot.api_key in {:?} or PARLOR_COPILOT__API_KEY",
                    store.config_path()
                );
            } else {
                println!("copilot is off");
            }
            Ok(())
        }
        Command::List | Command::Help | Command::Quit => Ok(()),
    }
}

fn report(error: &ClientError) {
    if error.is_validation() || error.is_not_found() {
        tracing::warn!("command rejected: {error}");
    } else {
        tracing::error!("command failed: {error}");
    }
    println!("error: {error}");
}

fn redraw(client: &ChatClient) {
    println!("\n{}\n", view::render_screen(client));
}
