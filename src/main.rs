use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;

use tether::event::EventBus;
use tether::http::Method;
use tether::{
  logging, Config, ControlMessage, HttpClient, Interceptor, OfflineContext, Request,
  ServiceWorker, SyncTrigger,
};

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Offline-first HTTP cache with a durable mutation queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tether/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the configured origin
  #[arg(long)]
  origin: Option<String>,

  /// Treat the network as unreachable
  #[arg(long)]
  offline: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Send a request through the interceptor
  Fetch {
    /// Path or absolute URL
    url: String,

    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,

    /// Extra header, "Name: value"
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// Replay pending operations now
  Sync,
  /// List operations waiting for replay
  Pending,
  /// List operations whose retries are exhausted
  Parked,
  /// Put parked operations back in the queue
  Requeue,
  /// Fetch resources into the static cache (default: configured list)
  Precache { urls: Vec<String> },
  /// Drop response caches, the API cache and user data
  ClearCache,
  /// Delete old synced operations and expired API-cache entries
  Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let config = if let Some(origin) = args.origin {
    Config { origin, ..config }
  } else {
    config
  };
  config.validate()?;

  let _log_guard = logging::init(&config.data_dir()?.join("logs"))?;

  let client = HttpClient::new(&config)?;
  let ctx = OfflineContext::open(config, client)?;
  if args.offline {
    ctx.connectivity.set_online(false);
  }

  match args.command {
    Command::Fetch {
      url,
      method,
      data,
      headers,
    } => fetch(&ctx, &url, &method, data, &headers).await,
    Command::Sync => {
      let sync = ctx.sync_coordinator(EventBus::new(16));
      match sync.sync(SyncTrigger::Manual).await? {
        Some(report) => println!(
          "synced {} of {} ({} failed, {} parked)",
          report.synced, report.processed, report.failed, report.parked
        ),
        None => println!("offline, nothing replayed"),
      }
      Ok(())
    }
    Command::Pending => {
      for op in ctx.queue.list_unsynced()? {
        println!(
          "{:>5}  {:<16} {} {}  retries={}  created={}",
          op.id,
          op.op_type.to_string(),
          op.payload.method,
          op.payload.url,
          op.retry_count,
          op.created_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
      Ok(())
    }
    Command::Parked => {
      for op in ctx.queue.list_parked()? {
        println!(
          "{:>5}  {:<16} {} {}  retries={}  error={}",
          op.id,
          op.op_type.to_string(),
          op.payload.method,
          op.payload.url,
          op.retry_count,
          op.last_error.as_deref().unwrap_or("-")
        );
      }
      Ok(())
    }
    Command::Requeue => {
      let count = ctx.queue.requeue_parked()?;
      println!("requeued {} operations", count);
      Ok(())
    }
    Command::Precache { urls } => {
      let resources = if urls.is_empty() {
        ctx.config.cache.precache.clone()
      } else {
        urls
      };
      ServiceWorker::new(&ctx)?
        .handle_control(ControlMessage::Precache { resources })
        .await
    }
    Command::ClearCache => {
      ServiceWorker::new(&ctx)?
        .handle_control(ControlMessage::ClearCache)
        .await?;
      ctx.queue.clear_caches()?;
      println!("caches cleared");
      Ok(())
    }
    Command::Prune => ctx.sync_coordinator(EventBus::new(16)).prune(),
  }
}

async fn fetch(
  ctx: &OfflineContext<HttpClient>,
  url: &str,
  method: &str,
  data: Option<String>,
  headers: &[String],
) -> Result<()> {
  let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;

  let mut request = Request::new(method, ctx.config.resolve(url)?);
  for header in headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Invalid header '{}', expected 'Name: value'", header))?;
    request = request.with_header(name.trim(), value.trim());
  }
  if let Some(body) = data {
    request = request.with_body(body);
  }

  let interceptor = Interceptor::new(ctx.engine()?, Arc::clone(&ctx.queue), EventBus::new(16));
  let served = interceptor.handle(request).await?;

  eprintln!("{} ({:?})", served.status(), served.source);
  println!("{}", served.response.text_body());
  Ok(())
}
