//! TrustLedger CLI - command line access to the TrustLedger API.
//!
//! Logs in, keeps the session on disk (or in the OS keychain), and sends
//! authenticated requests through the same pipeline the dashboard uses.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trustledger_core::api::{Method, NewAccount};
use trustledger_core::config::SessionBackend;
use trustledger_core::{AccessGuard, ApiClient, ApiRequest, ClientConfig, Guarded, Redirector};

/// Daily log file name prefix inside `log_dir`
const LOG_FILE_PREFIX: &str = "trustledger.log";

#[derive(Parser, Debug)]
#[command(name = "trustledger", version, about = "TrustLedger API client")]
struct Cli {
    /// Backend base URL (overrides config and TRUSTLEDGER_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Where to keep the session: file, keyring or memory
    #[arg(long, global = true)]
    session_backend: Option<SessionBackend>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and save the session
    Login {
        #[arg(short, long)]
        username: Option<String>,
    },
    /// Create an account (logs in when the server allows it)
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long, default_value = "citizen")]
        role: String,
        #[arg(long)]
        phone: Option<String>,
    },
    /// End the session
    Logout,
    /// Show whether a session is active
    Status,
    /// Fetch the profile from the server and update the saved session
    Whoami,
    /// Send an authenticated request and print the response body
    Request {
        method: String,
        path: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
}

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug). When a
/// log directory is configured, logs also go to a daily rolling file.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            None
        }
    }
}

/// Tell the user where to go once the session is gone
fn login_hint() -> Arc<dyn Redirector> {
    Arc::new(|target: &str| {
        eprintln!("Not logged in. Run `trustledger login` to sign in ({}).", target);
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = ClientConfig::load()?;
    config.apply_env()?;
    if let Some(ref url) = cli.api_url {
        config.base_url = url.clone();
    }
    if let Some(backend) = cli.session_backend {
        config.session_backend = backend;
    }

    let _log_guard = init_tracing(config.log_dir.as_deref());
    debug!(base_url = %config.base_url, "TrustLedger CLI starting");

    let store = config.session_store()?;
    let api = ApiClient::from_config(&config, store).context("Failed to create API client")?;
    api.session().initialize();

    match cli.command {
        Command::Login { username } => login(&api, &mut config, username).await,
        Command::Register {
            username,
            email,
            first_name,
            last_name,
            role,
            phone,
        } => {
            let password = prompt_password("Password: ")?;
            let password_confirm = prompt_password("Confirm password: ")?;
            let account = NewAccount {
                username,
                email,
                password,
                password_confirm,
                first_name,
                last_name,
                role,
                phone_number: phone,
            };
            match api.session().register(&account).await? {
                Some(user) => println!("Registered and logged in as {}", user.display_name()),
                None => println!("Registered {}. Run `trustledger login` to sign in.", account.username),
            }
            Ok(())
        }
        Command::Logout => {
            api.session().logout().await?;
            println!("Logged out");
            Ok(())
        }
        Command::Status => {
            status(&api, &config);
            Ok(())
        }
        Command::Whoami => {
            if !guarded(&api, &config) {
                return Ok(());
            }
            let user = api.refresh_profile().await?;
            println!("{} <{}>", user.display_name(), user.email);
            if let Some(role) = user.role {
                println!("Role: {}", role.label());
            }
            Ok(())
        }
        Command::Request { method, path, data } => {
            let method = method
                .to_ascii_uppercase()
                .parse::<Method>()
                .with_context(|| format!("Invalid HTTP method: {}", method))?;
            let mut request = ApiRequest::new(method, path);
            if let Some(data) = data {
                let body: serde_json::Value =
                    serde_json::from_str(&data).context("--data must be valid JSON")?;
                request = request.json(&body)?;
            }

            let response = api.send(request).await;
            // A refresh failure ends the session; let the guard say so
            if let Err(ref e) = response {
                if e.is_session_expired() {
                    guarded(&api, &config);
                }
            }
            let response = response?;
            println!("{}", pretty_body(&response.body));
            Ok(())
        }
    }
}

async fn login(api: &ApiClient, config: &mut ClientConfig, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(name) => name,
        None => prompt("Username: ")?,
    };
    let password = prompt_password("Password: ")?;

    let user = api.session().sign_in(&username, &password).await?;
    info!(username = %user.username, "Logged in");
    println!("Logged in as {}", user.display_name());

    config.last_username = Some(username);
    config.save().context("Failed to save config")?;
    Ok(())
}

fn status(api: &ApiClient, config: &ClientConfig) {
    let mut guard = AccessGuard::new(api.session().subscribe(), login_hint(), config.login_entry.clone());
    let view = guard.render(|| api.session().current_session());
    if let Guarded::Content(Some(session)) = view {
        println!("Logged in as {} ({})", session.user.display_name(), session.user.username);
        println!("Backend: {}", config.base_url);
        println!(
            "Session saved: {} ({} min ago)",
            session.saved_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
            session.minutes_since_saved()
        );
    }
}

/// True when the session allows protected commands; prints the login hint otherwise
fn guarded(api: &ApiClient, config: &ClientConfig) -> bool {
    let mut guard = AccessGuard::new(api.session().subscribe(), login_hint(), config.login_entry.clone());
    matches!(guard.render(|| ()), Guarded::Content(()))
}

fn pretty_body(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| body.to_string())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim().to_string();
    if input.is_empty() {
        anyhow::bail!("No input given");
    }
    Ok(input)
}

fn prompt_password(label: &str) -> Result<String> {
    rpassword::prompt_password(label).context("Failed to read password")
}
