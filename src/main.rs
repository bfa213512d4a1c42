//! phx-client CLI - join a Phoenix channel from the terminal.
//!
//! This is the main binary entry point. See the `phx_client` library
//! for the core functionality.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use mimalloc::MiMalloc;
use phx_client::{ConnectionState, Presence, Socket, SocketConfig, SocketEvent};
use serde_json::{json, Value};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "phx-client")]
#[command(version)]
#[command(about = "Phoenix Channels client")]
struct Cli {
    /// Config file (JSON). Defaults to the user config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Connection options shared by every subcommand.
#[derive(Args)]
struct ConnectArgs {
    /// Socket URL, e.g. https://example.com/socket
    #[arg(long)]
    url: Option<String>,
    /// Topic to join
    #[arg(long)]
    topic: String,
    /// Socket query parameter (repeatable)
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    params: Vec<(String, String)>,
    /// Join payload as JSON
    #[arg(long, default_value = "{}")]
    join_payload: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a topic and print every event until interrupted
    Listen {
        #[command(flatten)]
        connect: ConnectArgs,
        /// Also track presence and log joins/leaves
        #[arg(long)]
        presence: bool,
    },
    /// Join a topic, push one event and print the reply
    Push {
        #[command(flatten)]
        connect: ConnectArgs,
        /// Event name
        #[arg(long)]
        event: String,
        /// Payload as JSON
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Print the resolved configuration
    Config,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

fn parse_json(raw: &str, what: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{what} is not valid JSON"))
}

fn load_config(path: Option<&PathBuf>) -> Result<SocketConfig> {
    let path = match path {
        Some(path) => path.clone(),
        None => SocketConfig::default_path()?,
    };
    SocketConfig::load(&path)
}

/// Build the socket from config plus command-line overrides, connect it and
/// join the topic.
async fn open(config: SocketConfig, args: &ConnectArgs) -> Result<(Socket, phx_client::Channel)> {
    let mut config = config;
    if let Some(url) = &args.url {
        config.url.clone_from(url);
    }
    config.params.extend(args.params.iter().cloned());
    let join_payload = parse_json(&args.join_payload, "--join-payload")?;

    let socket = Socket::new(config).context("invalid socket configuration")?;
    log::info!("Connecting to {}", socket.endpoint());
    socket.connect();
    if !socket
        .wait_for_state(ConnectionState::Connected, socket.config().connect_timeout)
        .await
    {
        socket.disconnect().await;
        bail!("could not connect to {}", socket.endpoint());
    }

    let channel = socket.channel(&args.topic, join_payload);
    channel.on_error(|error| log::warn!("Channel error: {}", error));
    let reply = channel.join(socket.config().join_timeout).await;
    if !reply.is_ok() {
        socket.disconnect().await;
        bail!("join {} failed: {}", args.topic, reply.response);
    }
    log::info!("Joined {}", args.topic);
    Ok((socket, channel))
}

async fn listen(config: SocketConfig, args: ConnectArgs, with_presence: bool) -> Result<()> {
    let (socket, channel) = open(config, &args).await?;

    let presence = with_presence.then(|| {
        let presence = Presence::new(&channel);
        presence.on_join(|join| {
            println!("{}", json!({"presence": "join", "key": join.key, "metas": join.joined.metas}));
        });
        presence.on_leave(|leave| {
            println!("{}", json!({"presence": "leave", "key": leave.key, "metas": leave.left.metas}));
        });
        presence
    });

    let mut events = socket.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SocketEvent::Message(message)) if message.topic == args.topic => {
                    println!(
                        "{}",
                        json!({"event": message.event.as_str(), "payload": message.payload})
                    );
                }
                Ok(SocketEvent::StateChanged(state)) => log::info!("Socket {}", state),
                Ok(SocketEvent::Error(error)) => log::warn!("Socket error: {}", error),
                Ok(SocketEvent::Message(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Dropped {} socket events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    log::info!("Shutting down...");
    if let Some(presence) = presence {
        presence.dispose();
    }
    channel.leave(socket.config().push_timeout).await;
    socket.disconnect().await;
    Ok(())
}

async fn push(config: SocketConfig, args: ConnectArgs, event: String, payload: &str) -> Result<()> {
    let payload = parse_json(payload, "--payload")?;
    let (socket, channel) = open(config, &args).await?;

    let reply = channel
        .push_await(event, payload, socket.config().push_timeout)
        .await;
    println!(
        "{}",
        json!({"status": reply.status.as_str(), "response": reply.response})
    );

    channel.leave(socket.config().push_timeout).await;
    socket.disconnect().await;
    if !reply.is_ok() {
        bail!("push failed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log to stderr, or to PHX_LOG_FILE so stdout stays clean for piping.
    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    logger.format_timestamp_secs();
    if let Ok(path) = std::env::var("PHX_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        logger.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    logger.init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Listen { connect, presence } => listen(config, connect, presence).await?,
        Commands::Push {
            connect,
            event,
            payload,
        } => push(config, connect, event, &payload).await?,
        Commands::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}
