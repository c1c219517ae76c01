//! CLI for chanbus
//!
//! Subcommands:
//! - `server`: connect the configured backend and serve CoAP
//! - `token`: mint a device credential
//! - `publish`: send one confirmable POST (useful for smoke tests)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chanbus::auth::JwtAuthorizer;
use chanbus::broker::PubSub;
use chanbus::coap::message::{MessageType, Packet, code, option};
use chanbus::coap::{AdapterSettings, start_coap_server};
use chanbus::config::{Settings, load_config, load_config_from};
use chanbus::driver;
use chanbus::utils::logging;
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::{error, info};

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "chanbus", version)]
enum Command {
    /// Start the CoAP adapter
    Server {
        /// Configuration file (default: config/default.toml if present)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print a credential for a thing
    Token {
        /// Publisher identity carried by the credential
        #[arg(long)]
        thing: String,
        /// Channel the credential may use (repeatable)
        #[arg(long = "channel", required = true)]
        channels: Vec<String>,
        #[arg(long, default_value_t = 86_400)]
        ttl_secs: i64,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Publish one message to a running server
    Publish {
        #[arg(long, default_value = "127.0.0.1:5683")]
        addr: String,
        #[arg(long)]
        channel: String,
        /// Credential minted by `token`
        #[arg(long)]
        key: String,
        payload: String,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let result = match Command::parse() {
        Command::Server { config } => run_server(config).await,
        Command::Token {
            thing,
            channels,
            ttl_secs,
            config,
        } => issue_token(&thing, &channels, ttl_secs, config),
        Command::Publish {
            addr,
            channel,
            key,
            payload,
        } => publish(&addr, &channel, &key, payload).await,
    };

    if let Err(e) = result {
        logging::init("error");
        error!("chanbus failed: {}", e);
        std::process::exit(1);
    }
}

fn settings(path: Option<PathBuf>) -> Result<Settings, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => load_config_from(&path)?,
        None => load_config()?,
    })
}

async fn run_server(config: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = settings(config)?;
    logging::init(&config.log.level);

    let driver = driver::connect(&config.broker.url).await?;
    info!(driver = driver.name(), queue = ?config.broker.queue, "broker connected");
    let pubsub = Arc::new(PubSub::with_queue(driver, config.broker.queue.clone()));
    let auth = Arc::new(JwtAuthorizer::new(&config.auth.jwt_secret));

    let addr = config.server_addr();
    tokio::select! {
        res = start_coap_server(&addr, pubsub.clone(), auth, AdapterSettings::from(&config.coap)) => {
            if let Err(e) = res {
                error!("CoAP server failed: {}", e);
            } else {
                error!("CoAP server exited unexpectedly.");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    pubsub.close().await;
    Ok(())
}

fn issue_token(
    thing: &str,
    channels: &[String],
    ttl_secs: i64,
    config: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = settings(config)?;
    let auth = JwtAuthorizer::new(&config.auth.jwt_secret);
    let token = auth.issue(thing, channels, chrono::Duration::seconds(ttl_secs))?;
    println!("{token}");
    Ok(())
}

async fn publish(
    addr: &str,
    channel: &str,
    key: &str,
    payload: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;

    let token = uuid::Uuid::new_v4().as_bytes()[..4].to_vec();
    let message_id = u16::from_be_bytes([token[0], token[1]]);
    let mut request = Packet::new(MessageType::Confirmable, code::POST, message_id)
        .with_token(&token)
        .with_payload(payload.into_bytes());
    for segment in ["channels", channel, "messages"] {
        request.add_option(option::URI_PATH, segment);
    }
    request.add_option(option::URI_QUERY, format!("auth={key}"));
    socket.send(&request.encode()?).await?;

    let mut buf = vec![0u8; 2048];
    let len = tokio::time::timeout(REPLY_TIMEOUT, socket.recv(&mut buf)).await??;
    let reply = Packet::decode(&buf[..len])?;
    println!("{}", code::display(reply.code));
    Ok(())
}
