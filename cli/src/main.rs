use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use cellscope::nav::Navigator;
use cellscope::state::credentials::FileStorage;
use cellscope::{CellScope, ClientConfig, ClientError, CredentialStore, ErrorDisposition, SessionStatus};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{message} ({code})")]
    Client { code: &'static str, message: String },
    #[error("session expired or missing; run `cellscope login` first")]
    LoginRequired,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl From<ClientError> for CliError {
    fn from(err: ClientError) -> Self {
        tracing::debug!(error = %err, "client error");
        match err.disposition() {
            ErrorDisposition::Redirect(_) => Self::LoginRequired,
            ErrorDisposition::Notify(message) => Self::Client { code: err.error_code(), message },
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "cellscope", about = "CellScope analysis API client")]
struct Cli {
    /// Where the session credential is kept between runs.
    #[arg(long, env = "CELLSCOPE_TOKEN_FILE", default_value = ".cellscope-session.json")]
    token_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and persist the credential.
    Login {
        email: String,
        #[arg(long, env = "CELLSCOPE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Notify the server and forget the stored credential.
    Logout,
    /// Print the verified identity as JSON.
    Whoami,
    /// Print the session status and a display name.
    Status,
    /// Upload an image for cell analysis.
    Upload { path: PathBuf },
    Analysis(AnalysisCommand),
}

#[derive(Args, Debug)]
struct AnalysisCommand {
    #[command(subcommand)]
    command: AnalysisSubcommand,
}

#[derive(Subcommand, Debug)]
enum AnalysisSubcommand {
    Get {
        id: String,
    },
    Create {
        #[arg(long)]
        data: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_env()?;
    let navigator: Arc<dyn Navigator> = Arc::new(|path: &str| tracing::debug!(%path, "navigate"));
    let store = CredentialStore::new(FileStorage::new(cli.token_file));
    let app = CellScope::new(&config, store, navigator)?;

    match cli.command {
        Command::Login { email, password } => run_login(&app, &email, password).await,
        Command::Logout => {
            app.session().logout().await;
            println!("logged out");
            Ok(())
        }
        Command::Whoami => {
            app.session().bootstrap().await;
            let identity = app.session().identity().ok_or(CliError::NotLoggedIn)?;
            print_json(&serde_json::to_value(identity)?)
        }
        Command::Status => run_status(&app).await,
        Command::Upload { path } => run_upload(&app, path).await,
        Command::Analysis(analysis) => run_analysis(&app, analysis).await,
    }
}

async fn run_login(app: &CellScope, email: &str, password: Option<String>) -> Result<(), CliError> {
    let password = match password {
        Some(password) => password,
        None => prompt_password()?,
    };
    let identity = app.session().login(email, &password).await?;
    println!("logged in as {} ({})", identity.display_name, identity.role);
    Ok(())
}

fn prompt_password() -> Result<String, CliError> {
    eprint!("password: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_owned())
}

async fn run_status(app: &CellScope) -> Result<(), CliError> {
    let state = app.session().bootstrap().await;
    let status = match state.status() {
        SessionStatus::Loading => "loading",
        SessionStatus::Authenticated => "authenticated",
        SessionStatus::Anonymous => "anonymous",
    };
    match app.session().display_hint() {
        Some(name) => println!("{status} ({name})"),
        None => println!("{status}"),
    }
    Ok(())
}

async fn run_upload(app: &CellScope, path: PathBuf) -> Result<(), CliError> {
    let bytes = std::fs::read(&path)?;
    let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    let result = app.api().upload_image(&file_name, bytes).await?;
    print_json(&serde_json::to_value(&result)?)?;
    eprintln!("abnormal: {:.1}%", result.abnormal_ratio() * 100.0);
    Ok(())
}

async fn run_analysis(app: &CellScope, analysis: AnalysisCommand) -> Result<(), CliError> {
    let json = match analysis.command {
        AnalysisSubcommand::Get { id } => app.api().get_analysis(&id).await?,
        AnalysisSubcommand::Create { data } => {
            let body = serde_json::from_str::<Value>(&data)?;
            app.api().create_analysis(&body).await?
        }
    };
    print_json(&json)
}

fn print_json(value: &Value) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
