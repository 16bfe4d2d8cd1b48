//! Power Platform admin CLI
//!
//! Thin front end over the service clients:
//! 1. Loads configuration (file if present, environment otherwise)
//! 2. Resolves a credential and builds the shared request pipeline
//! 3. Runs one command and prints the result as JSON
//!
//! Ctrl-C cancels the running operation, including any retry or poll wait.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use common::Config;
use powerplatform_api::{
    Client, ClientOptions, DEFAULT_SAFETY_MARGIN, OperationContext, OperationKind,
    ReqwestTransport, SystemClock, TokenCache,
};
use powerplatform_services::{
    ApplicationUserClient, EnvironmentClient, PowerPagesClient, TenantSettingsClient,
    TenantSettingsDto,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: pp-admin [--config PATH] <command>

commands:
  environments                       list environments
  environment <env-id>               show one environment
  users <env-id>                     list application users
  user <env-id> <user-id>            show one application user with roles
  add-user <env-id> <object-id>      add an Entra application as a user
  roles <env-id> [business-unit-id]  list security roles
  websites <env-id>                  list Power Pages websites
  tenant-settings                    show tenant settings
  update-tenant-settings <file>      apply the settings in a JSON file";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Environments,
    Environment(String),
    Users(String),
    User(String, String),
    AddUser(String, String),
    Roles(String, Option<String>),
    Websites(String),
    TenantSettings,
    UpdateTenantSettings(String),
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        let words: Vec<&str> = args.iter().map(String::as_str).collect();
        let command = match words.as_slice() {
            ["environments"] => Command::Environments,
            ["environment", env] => Command::Environment(env.to_string()),
            ["users", env] => Command::Users(env.to_string()),
            ["user", env, user] => Command::User(env.to_string(), user.to_string()),
            ["add-user", env, object] => Command::AddUser(env.to_string(), object.to_string()),
            ["roles", env] => Command::Roles(env.to_string(), None),
            ["roles", env, bu] => Command::Roles(env.to_string(), Some(bu.to_string())),
            ["websites", env] => Command::Websites(env.to_string()),
            ["tenant-settings"] => Command::TenantSettings,
            ["update-tenant-settings", file] => Command::UpdateTenantSettings(file.to_string()),
            _ => bail!("{USAGE}"),
        };
        Ok(command)
    }

    fn kind(&self) -> OperationKind {
        match self {
            Command::AddUser(..) => OperationKind::Create,
            Command::UpdateTenantSettings(_) => OperationKind::Update,
            _ => OperationKind::Read,
        }
    }
}

/// Split `--config PATH` from the remaining arguments.
fn split_args(args: &[String]) -> (Option<&str>, Vec<String>) {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            config = iter.next().map(String::as_str);
        } else {
            rest.push(arg.clone());
        }
    }
    (config, rest)
}

fn load_config(cli_path: Option<&str>) -> Result<Config> {
    let path = Config::resolve_path(cli_path);
    if cli_path.is_none() && !Path::new(&path).exists() {
        info!("no configuration file, using environment only");
        return Config::from_env().context("failed to load config from environment");
    }
    info!(path = %path.display(), "loading configuration");
    Config::load(&path).with_context(|| format!("failed to load config from {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cli_config_path, rest) = split_args(&args);
    let command = Command::parse(&rest)?;

    let config = load_config(cli_config_path)?;
    let cloud = config.cloud_config();
    info!(
        cloud = ?config.cloud.name,
        bapi_host = %cloud.bapi_host,
        "configuration loaded"
    );

    let http = ReqwestTransport::default_client().context("failed to build HTTP client")?;
    let credential = powerplatform_auth::resolve_credential(&config.auth, &cloud, http.clone())
        .context("failed to resolve credentials")?;
    let tokens = Arc::new(TokenCache::new(
        Arc::new(credential),
        Arc::new(SystemClock),
        DEFAULT_SAFETY_MARGIN,
    ));
    let api = Arc::new(
        Client::new(
            Arc::new(ReqwestTransport::new(http)),
            tokens,
            ClientOptions::from_config(&config),
        )
        .context("failed to build API client")?,
    );

    let ctx = OperationContext::for_operation(&config.timeouts, command.kind());
    let cancel = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, canceling");
            cancel.cancel();
        }
    });

    match command {
        Command::Environments => {
            print_json(&EnvironmentClient::new(api, cloud).list(&ctx).await?)?
        }
        Command::Environment(env) => {
            print_json(&EnvironmentClient::new(api, cloud).get(&ctx, &env).await?)?
        }
        Command::Users(env) => {
            print_json(&ApplicationUserClient::new(api, cloud).list(&ctx, &env).await?)?
        }
        Command::User(env, user) => print_json(
            &ApplicationUserClient::new(api, cloud)
                .get(&ctx, &env, &user)
                .await?,
        )?,
        Command::AddUser(env, object) => print_json(
            &ApplicationUserClient::new(api, cloud)
                .create(&ctx, &env, &object)
                .await?,
        )?,
        Command::Roles(env, bu) => print_json(
            &ApplicationUserClient::new(api, cloud)
                .list_roles(&ctx, &env, bu.as_deref())
                .await?,
        )?,
        Command::Websites(env) => {
            print_json(&PowerPagesClient::new(api, cloud).list(&ctx, &env).await?)?
        }
        Command::TenantSettings => {
            print_json(&TenantSettingsClient::new(api, cloud).get(&ctx).await?)?
        }
        Command::UpdateTenantSettings(file) => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {file}"))?;
            let configured: TenantSettingsDto = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse tenant settings in {file}"))?;
            print_json(
                &TenantSettingsClient::new(api, cloud)
                    .update(&ctx, &configured)
                    .await?,
            )?
        }
    }

    Ok(())
}
