//! passerelle - a Matrix session broker for bridge account linking.
//!
//! The broker logs local users into a Matrix homeserver, keeps a room cache
//! reconciled with the server-side room set, and drives a scripted
//! conversation with a mautrix bridge bot to link an external Instagram
//! account: it sends the login command into a private bot room, watches the
//! timeline for the bot's replies, and surfaces the login URL, the success
//! confirmation, and newly bridged rooms as domain events.
//!
//! # Usage
//!
//! ```bash
//! passerelle --config config.yaml --data ./data register alice s3cret
//! passerelle --config config.yaml --data ./data connect alice
//! passerelle --config config.yaml --data ./data status alice
//! ```
//!
//! # Configuration
//!
//! Create a `config.yaml` (see the [`config`] module for the full format):
//!
//! ```yaml
//! homeserver:
//!   base_url: "http://localhost:8008"
//!
//! bridge:
//!   bot_id: "@metabot:localhost"
//!
//! provisioning:
//!   url: "http://localhost:29319"
//!   shared_secret: "change-me"
//! ```
//!
//! Any value can be overridden with a `PASSERELLE_` environment variable,
//! e.g. `PASSERELLE_PROVISIONING__SHARED_SECRET`.
//!
//! # Architecture
//!
//! - [`broker`] - the operation facade external callers use
//! - [`matrix`] - homeserver auth, sync engine, room projection, delivery
//! - [`cache`] - the reconciled local room cache
//! - [`link`] - bot reply matching and timeline watching
//! - [`provisioning`] - client for the bridge provisioning HTTP API
//! - [`events`] - the process-wide domain event bus
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - logging level (default: `info`)

use std::{collections::HashMap, sync::Arc};

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info};
use tokio::sync::broadcast::error::RecvError;

use crate::{
    broker::Broker,
    config::Config,
    events::DomainEvent,
    matrix::session::JsonCredentialStore,
    utils::get_path,
};

mod broker;
mod cache;
mod config;
mod error;
mod events;
mod link;
mod matrix;
mod provisioning;
mod utils;

/// Command-line arguments for the broker.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: String,

    /// Path to the directory for persistent data: stored credentials, the
    /// room cache, and per-user session stores. Contains access tokens, so
    /// keep its permissions tight.
    #[arg(short, long)]
    data: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a new user on the homeserver and store their credentials.
    Register { username: String, password: String },

    /// Log an existing user in, rotating their stored credentials.
    Login { username: String, password: String },

    /// Run one room sync and reconcile the local cache.
    Sync { username: String },

    /// Link the external account: sync, open the bot room, send the login
    /// command, and print the bot's replies until the login is confirmed.
    Connect { username: String },

    /// Show the bridge-link status from the local cache.
    Status { username: String },

    /// Unlink the external account on the bridge, stop any active watch,
    /// and drop the stored credentials.
    Logout { username: String },

    /// Check that the bridge provisioning API is reachable.
    Ping,

    /// Hand external session cookies to the bridge directly, as a JSON
    /// object string.
    BridgeLogin { username: String, cookies: String },

    /// List the user's puppet accounts on the bridge.
    Puppets { username: String },
}

#[tokio::main]
async fn main() {
    // Put logger at info level by default
    let env = Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    info!("starting passerelle {}...", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    let config: Config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config file: {}", e);
            return;
        }
    };

    if let Err(e) = run(args, config).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args, config: Config) -> anyhow::Result<()> {
    let credentials = Arc::new(JsonCredentialStore::new(get_path(
        &args.data,
        "credentials.json",
    )));
    let broker = Broker::new(config, &args.data, Arc::clone(&credentials)).await?;

    match args.command {
        Command::Register { username, password } => {
            let creds = broker.register_user(&username, &password).await?;
            credentials.persist(&creds).await?;
            println!("registered {} as {}", username, creds.user_id);
        }
        Command::Login { username, password } => {
            let creds = broker.login_user(&username, &password).await?;
            credentials.persist(&creds).await?;
            println!("logged in {} as {}", username, creds.user_id);
        }
        Command::Sync { username } => {
            let count = broker.sync_rooms(&username).await?;
            println!("synced {} rooms", count);
        }
        Command::Connect { username } => {
            connect(&broker, &username).await?;
        }
        Command::Status { username } => {
            let status = broker.login_status(&username).await?;
            println!(
                "linked: {} ({} bridged rooms)",
                status.is_linked, status.linked_room_count
            );
            for room in status.rooms {
                println!("  {} {}", room.room_id, room.display_name);
            }
        }
        Command::Logout { username } => {
            broker.disconnect(&username).await;
            let unlinked = broker.provision_logout(&username).await?;
            credentials.remove(&username).await?;
            println!("logged out {} (bridge unlinked: {})", username, unlinked);
        }
        Command::Ping => {
            let reachable = broker.ping_bridge().await?;
            println!("bridge reachable: {}", reachable);
        }
        Command::BridgeLogin { username, cookies } => {
            let cookies: HashMap<String, String> = serde_json::from_str(&cookies)?;
            let response = broker.provision_login(&username, &cookies).await?;
            match response.error {
                Some(error) => println!("bridge login failed: {}", error),
                None => println!(
                    "bridge login ok, puppet: {}",
                    response.puppet_id.as_deref().unwrap_or("unknown")
                ),
            }
        }
        Command::Puppets { username } => {
            let puppets = broker.list_puppets(&username).await?;
            println!("{} puppets", puppets.len());
            for puppet in puppets {
                println!("  {}", puppet.puppet_id.as_deref().unwrap_or("unnamed"));
            }
        }
    }

    Ok(())
}

/// Runs the link flow and follows the event bus until the login is
/// confirmed.
async fn connect<C: crate::matrix::session::CredentialStore>(
    broker: &Broker<C>,
    username: &str,
) -> anyhow::Result<()> {
    // Subscribe before connecting so no early reply is missed.
    let mut events = broker.events();

    let outcome = broker.connect(username).await?;
    println!(
        "watching bot room {} (existed: {}, command encrypted: {})",
        outcome.room_id, outcome.room_existed, outcome.command_encrypted
    );

    loop {
        match events.recv().await {
            Ok(event) if event.user_id() == username => match event {
                DomainEvent::LoginUrlFound { url, .. } => {
                    println!("login url: {}", url);
                }
                DomainEvent::LoginSucceeded { .. } => {
                    println!("login confirmed");
                    broker.disconnect(username).await;
                    break;
                }
                DomainEvent::NewLinkedRoomDetected { room_name, .. } => {
                    println!("new linked room: {}", room_name);
                }
            },
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                info!("event stream lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }

    Ok(())
}
