//! worldsync-client binary
//!
//! Joins a world server over TCP as one character and keeps the local
//! replica in sync until interrupted. Mostly useful for soak testing a
//! server and for watching the event stream with `RUST_LOG=worldsync=debug`.
//!
//! ## Configuration (env / TOML via `config` crate)
//!
//! | Key                     | Default          | Description                         |
//! |-------------------------|------------------|-------------------------------------|
//! | `WORLDSYNC_SERVER`      | `127.0.0.1:7000` | World server address                |
//! | `WORLDSYNC_TOKEN`       | (required)       | Join token from the account service |
//! | `WORLDSYNC_CHARACTER`   | (required)       | Character to play                   |
//! | `WORLDSYNC_CONFIG`      | `worldsync`      | Config file (TOML/JSON, optional)   |
//! | `WORLDSYNC_TICK_MS`     | `50`             | Engine tick interval                |
//!
//! Engine tunables (`SyncConfig`) are read from the config file and from
//! `WORLDSYNC__<FIELD>` variables, e.g. `WORLDSYNC__TEARDOWN_GRACE_MS=8000`.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::Instrument;
use worldsync::{
    protocol::LeaveReason,
    transport::{read_frame, write_frame},
    AccountApi, ClientEvent, ConnectionEvent, JoinError, JoinResponse, SyncClient, SyncConfig,
    Transport, TransportError,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "worldsync-client", about = "WorldSync headless client", version)]
struct Args {
    /// World server address
    #[arg(long, env = "WORLDSYNC_SERVER", default_value = "127.0.0.1:7000")]
    server: String,

    /// Join token issued by the account service
    #[arg(long, env = "WORLDSYNC_TOKEN")]
    token: String,

    /// Character id to join with
    #[arg(long, env = "WORLDSYNC_CHARACTER")]
    character: String,

    /// Config file name (extension optional)
    #[arg(long, env = "WORLDSYNC_CONFIG", default_value = "worldsync")]
    config: String,

    /// Engine tick interval in milliseconds
    #[arg(long, env = "WORLDSYNC_TICK_MS", default_value_t = 50)]
    tick_ms: u64,
}

fn load_config(path: &str) -> Result<SyncConfig> {
    config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("WORLDSYNC").separator("__"))
        .build()
        .context("reading configuration")?
        .try_deserialize()
        .context("parsing SyncConfig")
}

// ---------------------------------------------------------------------------
// Glue
// ---------------------------------------------------------------------------

/// Hands out the token given on the command line.
struct StaticAccountApi {
    token: String,
}

impl AccountApi for StaticAccountApi {
    async fn request_join(&mut self, _character_id: &str) -> Result<JoinResponse, JoinError> {
        Ok(JoinResponse::Admitted {
            token: self.token.clone(),
        })
    }
}

/// Outbound frames go to the socket writer task.
struct TcpOutbound {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Transport for TcpOutbound {
    fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn close(&mut self) {}
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connection(ConnectionEvent::Queued { position }) => {
            log::info!("Queued at position {}", position)
        }
        ClientEvent::Connection(ConnectionEvent::Left { reason }) => {
            log::info!("Left world: {}", reason)
        }
        ClientEvent::World(e) => tracing::trace!(?e, "world"),
        other => log::debug!("{:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("worldsync=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;

    log::info!(
        "Starting worldsync-client (server='{}', character='{}', region_size={})",
        args.server,
        args.character,
        config.region_size,
    );

    let span = tracing::info_span!("session", character = %args.character);
    run(args, config).instrument(span).await
}

async fn run(args: Args, config: SyncConfig) -> Result<()> {
    let mut client = SyncClient::new(config).context("method schema")?;
    let mut api = StaticAccountApi {
        token: args.token.clone(),
    };
    let ticket = client
        .join(&mut api, &args.character)
        .await
        .context("joining world")?;

    let stream = TcpStream::connect(&args.server)
        .await
        .with_context(|| format!("connecting to {}", args.server))?;
    let (mut reader, mut writer) = stream.into_split();

    // Socket writer: the token frame first, then whatever the engine sends.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
    out_tx
        .send(Bytes::from(ticket.token.into_bytes()))
        .context("queueing token frame")?;
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                log::warn!("Socket write failed: {}", e);
                break;
            }
        }
    });

    // Socket reader feeds frames back to the engine task.
    let (in_tx, mut in_rx) = mpsc::channel::<Bytes>(256);
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => {
                    if in_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Socket read failed: {}", e);
                    break;
                }
            }
        }
    });

    client.connect(Box::new(TcpOutbound { tx: out_tx }), Instant::now());

    let mut handshake = ticket.handshake;
    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    let mut open = true;
    let mut awaiting_handshake = true;

    loop {
        tokio::select! {
            frame = in_rx.recv(), if open => match frame {
                Some(frame) => client.receive_frame(&frame, Instant::now()),
                None => {
                    log::warn!("Connection closed by server");
                    client.transport_closed(Instant::now());
                    open = false;
                }
            },
            id = &mut handshake, if awaiting_handshake => match id {
                Ok(id) => {
                    awaiting_handshake = false;
                    log::info!("Handshake complete, player entity {}", id);
                }
                Err(e) => {
                    log::warn!("Join abandoned: {}", e);
                    break;
                }
            },
            _ = ticker.tick() => {
                let now = Instant::now();
                client.tick(now);
                if open && client.is_stale(now) {
                    log::warn!("No traffic from server, connection looks stale");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("worldsync-client shutting down (SIGINT)");
                client.leave(LeaveReason::Requested);
                for event in client.drain_events() {
                    log_event(&event);
                }
                break;
            }
        }

        for event in client.drain_events() {
            log_event(&event);
        }
        if !client.state().is_active() && client.connection().is_safely_left() {
            break;
        }
    }

    drop(client);
    reader_task.abort();
    let _ = writer_task.await;
    Ok(())
}
