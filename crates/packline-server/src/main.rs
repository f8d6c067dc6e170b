//! Packline server binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: bind 0.0.0.0:9940, built-in limits
//! packline-server
//!
//! # Explicit bind and a config file; flags override the file
//! packline-server --bind 0.0.0.0:9940 --config packline.toml
//!
//! # Whitelist operator networks
//! packline-server --whitelist 10.0.0.0/8 --whitelist 192.168.1.7
//! ```

use std::sync::Arc;

use clap::Parser;
use packline_core::{AdmissionStore, SlidingWindowLimiter};
use packline_proto::wire::{self, WireWriter};
use packline_server::{
    HandlerAction, HandlerError, HandlerRegistry, Server, ServerConfig, ServerError,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Echo service opcode: replies with the request payload.
const OP_ECHO: u16 = 0x0001;

/// Clock service opcode: replies with the server's Unix milliseconds and
/// its name, encoded through the formatter registry.
const OP_CLOCK: u16 = 0x0002;

/// Goodbye opcode: asks the server to close the connection.
const OP_GOODBYE: u16 = 0x00FF;

/// Packline packet transport server
#[derive(Parser, Debug)]
#[command(name = "packline-server")]
#[command(about = "Binary packet transport server with IP admission control")]
#[command(version)]
struct Args {
    /// Address to bind to (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Maximum concurrent connections (overrides the config file)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Whitelisted address or CIDR block (repeatable)
    #[arg(long = "whitelist")]
    whitelist: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Register the built-in handlers.
fn default_handlers() -> Result<HandlerRegistry, ServerError> {
    let mut registry = HandlerRegistry::new();

    registry.register(OP_ECHO, |ctx| {
        let reply = ctx
            .packet
            .reply(ctx.payload.clone(), ctx.now_ms)
            .map_err(|e| HandlerError(e.to_string()))?;
        Ok(HandlerAction::Reply(reply))
    })?;

    registry.register(OP_CLOCK, |ctx| {
        let mut writer = WireWriter::new();
        wire::global()
            .encode_value(&ctx.now_ms, &mut writer)
            .and_then(|()| {
                wire::global().encode_value(&"packline".to_owned(), &mut writer)
            })
            .map_err(|e| HandlerError(e.to_string()))?;

        let reply = ctx
            .packet
            .reply(writer.freeze(), ctx.now_ms)
            .map_err(|e| HandlerError(e.to_string()))?;
        Ok(HandlerAction::Reply(reply))
    })?;

    registry.register(OP_GOODBYE, |_ctx| Ok(HandlerAction::Close("client goodbye".to_owned())))?;

    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.listener.bind = bind;
    }
    if let Some(max) = args.max_connections {
        config.listener.max_connections = max;
    }

    tracing::info!("packline server starting");
    tracing::info!("binding to {}", config.listener.bind);

    let admission = Arc::new(AdmissionStore::new(config.admission.ban_minutes));
    for entry in &args.whitelist {
        admission.add_to_whitelist(entry)?;
        tracing::info!("whitelisted {}", entry);
    }

    let limiter = SlidingWindowLimiter::new(config.ratelimit_config())?;
    admission.register_criterion(Arc::new(limiter))?;

    let handlers = default_handlers()?;

    let server = Server::bind(config, admission, handlers).await?;
    let handle = server.handle();

    tracing::info!("server listening on {}", server.local_addr()?);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, stopping");
            handle.stop();
        }
    });

    server.run().await?;

    tracing::info!("server stopped");
    Ok(())
}
