use std::sync::Arc;

use clap::{Parser, Subcommand};
use schej_session::config::ConfigError;
use schej_session::identity::IdentityProvider;
use schej_session::net::api::TransportError;
use schej_session::net::types::AUTH_STATUS;
use schej_session::{
    ApiClient, ApiError, ClientConfig, Decision, Environment, NavigationIntent, PlatformContext, ProviderCredential,
    ProviderUser, ReqwestTransport, RouteGuard, RouteTable, SessionError, SessionStore, TokenProvider,
};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("invalid --env value {0:?}; expected development or production")]
    InvalidEnvironment(String),
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
    #[error("request failed: {0}")]
    Api(#[from] ApiError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "schej-cli", about = "schej.it session CLI")]
struct Cli {
    /// `development` or `production`; defaults to `SCHEJ_ENV`.
    #[arg(long)]
    env: Option<String>,

    /// Overrides the base URL of the selected environment.
    #[arg(long)]
    base_url: Option<String>,

    /// Overrides `SCHEJ_USER_AGENT`; mobile agents get a request timeout.
    #[arg(long)]
    user_agent: Option<String>,

    /// Backend session cookie, e.g. `session=...`.
    #[arg(long, env = "SCHEJ_SESSION_COOKIE")]
    session_cookie: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ask the backend whether the cookie session is valid.
    Status,
    /// Load the signed-in user's profile.
    Profile,
    /// Load the signed-in user's created and joined events.
    Events,
    /// Exchange provider tokens for a backend session.
    SignIn {
        #[arg(long, env = "SCHEJ_ID_TOKEN")]
        id_token: String,
        #[arg(long, env = "SCHEJ_ACCESS_TOKEN")]
        access_token: Option<String>,
        #[arg(long, default_value = "cli")]
        uid: String,
    },
    /// End the backend session.
    SignOut,
    /// Run the route guard for a path or route name.
    Authorize {
        target: String,
        #[arg(long)]
        from: Option<String>,
    },
}

struct CliContext {
    config: ClientConfig,
    transport: Arc<ReqwestTransport>,
    api: ApiClient,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = build_context(&cli)?;

    match cli.command {
        Command::Status => run_status(&ctx).await,
        Command::Profile => run_profile(&ctx).await,
        Command::Events => run_events(&ctx).await,
        Command::SignIn { id_token, access_token, uid } => run_sign_in(&ctx, id_token, access_token, uid).await,
        Command::SignOut => run_sign_out(&ctx).await,
        Command::Authorize { target, from } => run_authorize(&ctx, target, from).await,
    }
}

fn build_context(cli: &Cli) -> Result<CliContext, CliError> {
    let mut config = ClientConfig::from_env()?;
    if let Some(env) = &cli.env {
        config.environment =
            env.parse::<Environment>().map_err(|()| CliError::InvalidEnvironment(env.clone()))?;
    }
    if let Some(base_url) = &cli.base_url {
        config = config.with_base_url(base_url);
    }
    if let Some(user_agent) = &cli.user_agent {
        config.user_agent.clone_from(user_agent);
    }

    let transport = match &cli.session_cookie {
        Some(cookie) => ReqwestTransport::with_session_cookie(config.base_url(), cookie)?,
        None => ReqwestTransport::new()?,
    };
    let transport = Arc::new(transport);
    let api = ApiClient::new(transport.clone(), PlatformContext::from_config(&config));
    tracing::debug!(base_url = config.base_url(), environment = ?config.environment, "cli configured");
    Ok(CliContext { config, transport, api })
}

fn session_store(ctx: &CliContext, provider: Arc<dyn IdentityProvider>) -> SessionStore {
    SessionStore::new(ctx.api.clone(), provider).with_timezone_offset(ctx.config.timezone_offset_minutes)
}

async fn run_status(ctx: &CliContext) -> Result<(), CliError> {
    match ctx.api.get(AUTH_STATUS).await {
        Ok(_) => println!("authenticated"),
        Err(ApiError::Http { status, .. }) => println!("unauthenticated (HTTP {status})"),
        Err(error) => return Err(error.into()),
    }
    Ok(())
}

async fn run_profile(ctx: &CliContext) -> Result<(), CliError> {
    let store = session_store(ctx, Arc::new(TokenProvider::new()));
    let user = store.refresh_auth_user().await?;
    print_json(&serde_json::to_value(user)?)
}

async fn run_events(ctx: &CliContext) -> Result<(), CliError> {
    let store = session_store(ctx, Arc::new(TokenProvider::new()));
    store.refresh_auth_user().await?;
    store.get_events().await?;
    let state = store.snapshot();
    print_json(&json!({
        "events": state.created_events,
        "joinedEvents": state.joined_events,
    }))
}

async fn run_sign_in(
    ctx: &CliContext,
    id_token: String,
    access_token: Option<String>,
    uid: String,
) -> Result<(), CliError> {
    let provider = TokenProvider::with_credential(ProviderCredential {
        id_token,
        access_token,
        user: ProviderUser { uid, email: None, display_name: None },
    });
    let store = session_store(ctx, Arc::new(provider));
    let user = store.sign_in_with_google().await?;

    let cookie = ctx.transport.cookies_for(ctx.config.base_url());
    print_json(&json!({ "user": user, "sessionCookie": cookie }))
}

async fn run_sign_out(ctx: &CliContext) -> Result<(), CliError> {
    let store = session_store(ctx, Arc::new(TokenProvider::new()));
    store.sign_out().await?;
    println!("signed out");
    Ok(())
}

async fn run_authorize(ctx: &CliContext, target: String, from: Option<String>) -> Result<(), CliError> {
    let guard = RouteGuard::new(RouteTable::schej(), ctx.api.clone(), Arc::new(TokenProvider::new()))
        .with_uncategorized_policy(ctx.config.uncategorized_routes);
    let mut intent = NavigationIntent::to(target);
    if let Some(from) = from {
        intent = intent.from_route(from);
    }
    match guard.authorize(&intent).await {
        Decision::Proceed => println!("proceed"),
        Decision::Redirect { to } => println!("redirect {to}"),
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
