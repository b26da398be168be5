use std::path::PathBuf;

use clap::Parser;
use reqwest_middleware::ClientBuilder;
use tether_reqwest::AuthenticationMiddleware;
use tether_session::{
    config::SessionConfig, storage::FileStorage, store::TokenStore, IdentityLabel, Secret,
    Session, SessionState,
};

#[derive(Debug, Parser)]
struct Opts {
    /// The base URL of the chat backend's API
    #[arg(short, long, env, default_value = "http://localhost:8000/api/")]
    base_url: String,

    /// The user to log in as
    #[arg(short, long, env)]
    username: IdentityLabel,

    /// The password of the user
    #[arg(short, long, env, hide_env_values = true)]
    password: Secret,

    /// The directory used to persist credentials between runs
    #[arg(short = 'd', long, env, default_value = ".credentials")]
    credentials_dir: PathBuf,

    /// The path, relative to the base URL, to fetch once logged in
    #[arg(short, long, env, default_value = "conversations/")]
    resource: String,

    /// Log out once done
    #[arg(long)]
    logout: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let config = SessionConfig::new(opts.base_url);
    let store = TokenStore::new(FileStorage::new(opts.credentials_dir));
    let session = Session::builder_from_config(config, store)?
        .with_navigator(|route: &str| tracing::warn!(route, "session requires a new login"))
        .build();

    if session.restore().await != SessionState::Authenticated {
        session.login(&opts.username, &opts.password).await?;
    }

    tracing::info!(
        identity = ?session.current_identity(),
        token = format_args!("{:#?}", session.store().get().access_token()),
        "session ready"
    );

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(AuthenticationMiddleware::from_session(&session)?)
        .build();

    let url = reqwest::Url::parse(session.config().base_url())?.join(&opts.resource)?;
    let resp = client.get(url).send().await?;
    let status = resp.status();
    let body = resp.text().await?;

    tracing::info!(status = status.as_u16(), body = %body, "fetched resource");

    if opts.logout {
        session.logout();
        // Give the background logout notification a chance to go out
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }

    Ok(())
}
