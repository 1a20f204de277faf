use clap::Parser;
use std::sync::Arc;
use tiercache::config::{BackendType, Config};
use tiercache::server::{connect_store, Daemon};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "tiercached", about = "Render cache admin daemon", version)]
struct Args {
  #[arg(long, env = "TIERCACHE_REDIS_URL")]
  redis_url: Option<String>,
  /// Use a process-local store instead of Redis. Nothing else can write to
  /// it, so the admin API only ever sees an empty cache; for smoke tests.
  #[arg(long)]
  memory: bool,
  #[arg(short, long)]
  port: Option<u16>,
  #[arg(long)]
  host: Option<String>,
  #[arg(short, long)]
  config: Option<String>,
  #[arg(long)]
  log_level: Option<String>,
  #[arg(long, env = "TIERCACHE_API_TOKEN")]
  api_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
  let args = Args::parse();

  // Load config: explicit path > auto-detect > defaults
  let mut config = if let Some(path) = &args.config {
    Config::from_file(path)?
  } else {
    Config::find_and_load()?.unwrap_or_default()
  };

  // CLI args override config file
  if let Some(url) = args.redis_url {
    config.redis.url = url;
    config.backend = BackendType::Redis;
  }
  if args.memory {
    config.backend = BackendType::Memory;
  }
  if let Some(port) = args.port {
    config.server.port = port;
  }
  if let Some(host) = args.host {
    config.server.host = host;
  }
  if let Some(level) = args.log_level {
    config.logging.level = level;
  }
  if let Some(token) = args.api_token {
    config.auth.api_token = Some(token);
  }

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let store = connect_store(&config).await?;
  let daemon = Arc::new(Daemon::new(config, store));
  let daemon_clone = daemon.clone();

  // Handle shutdown signals (SIGINT, SIGTERM)
  tokio::spawn(async move {
    shutdown_signal().await;
    daemon_clone.shutdown();
  });

  daemon.run().await?;
  tracing::info!("Shutdown complete");
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!("Failed to listen for Ctrl+C: {}", e);
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut sigterm) => {
        sigterm.recv().await;
      }
      Err(e) => {
        tracing::error!("Failed to install SIGTERM handler: {}", e);
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => tracing::info!("Received SIGINT"),
    _ = terminate => tracing::info!("Received SIGTERM"),
  }
}
