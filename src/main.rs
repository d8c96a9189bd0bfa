mod cache;
mod config;
mod db;
mod event;
mod http;
mod worker;

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use reqwest::Method;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{CacheLayer, CacheStorage, SqliteStorage, Strategy};
use config::Config;
use db::PayloadStore;
use event::WorkerHost;
use http::{HttpClient, Request, Response};
use worker::{Coordinator, WorkerSettings};

type AppCoordinator = Coordinator<HttpClient, SqliteStorage>;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline cache coordinator for the ticketing web client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Cache the app shell into the current bucket
  Install,
  /// Purge stale buckets and take control
  Activate,
  /// Send requests through the worker, installing and activating it first
  Fetch {
    /// URLs or origin-relative paths
    #[arg(required = true)]
    urls: Vec<String>,

    /// Treat the requests as page navigations
    #[arg(long)]
    navigate: bool,

    /// HTTP method; only GET responses are ever cached
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Print response bodies
    #[arg(long)]
    body: bool,
  },
  /// List cache buckets
  Buckets,
  /// Show the stored API payload for a URL
  Payload { url: String },
}

/// Initialize the tracing subscriber for logging.
///
/// RUST_LOG controls the level (default: warn). The returned guard must live
/// until exit so buffered file output gets flushed.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  let Some(path) = log_file else {
    tracing_subscriber::registry()
      .with(fmt::layer().with_writer(std::io::stderr))
      .with(filter)
      .init();
    return Ok(None);
  };

  let dir = path
    .parent()
    .filter(|p| !p.as_os_str().is_empty())
    .unwrap_or_else(|| Path::new("."));
  let name = path
    .file_name()
    .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(filter)
    .init();

  Ok(Some(guard))
}

fn build_coordinator(config: &Config) -> Result<AppCoordinator> {
  let fetcher = HttpClient::new(&config.network)?;
  let storage = SqliteStorage::open_at(&config.cache_db_path()?)?;
  let payloads = PayloadStore::new(
    config.store_location()?,
    &config.store.name,
    config.store.version,
    &config.store.object_store,
  );

  let layer = CacheLayer::new(
    fetcher,
    storage,
    payloads,
    &config.cache.bucket,
    config.offline_url()?,
  );
  let settings = WorkerSettings {
    core_assets: config.core_asset_urls()?,
    router: config.router()?,
  };
  debug!(routes = settings.router.routes().len(), "routing table loaded");

  Ok(Coordinator::new(layer, settings))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let log_file = args.log_file.as_deref().or(config.logging.file.as_deref());
  let _guard = init_tracing(log_file)?;
  info!(origin = %config.origin, bucket = %config.cache.bucket, "shellcache starting");

  let coordinator = build_coordinator(&config)?;

  match args.command {
    Command::Install => {
      coordinator.install().await?;
      println!(
        "installed {} ({} core assets)",
        config.cache.bucket,
        config.cache.core_assets.len()
      );
    }
    Command::Activate => {
      if !coordinator.resume()? {
        return Err(eyre!(
          "Bucket {} is not installed; run `shellcache install` first",
          config.cache.bucket
        ));
      }
      let purged = coordinator.activate().await?;
      print_purged(&purged);
    }
    Command::Fetch {
      urls,
      navigate,
      method,
      body,
    } => {
      let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;
      let requests = urls
        .iter()
        .map(|u| {
          let url = config.resolve(u)?;
          let request = if navigate {
            Request::navigate(url)
          } else {
            Request::get(url)
          };
          Ok(request.with_method(method.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

      run_fetches(coordinator, requests, body).await?;
    }
    Command::Buckets => {
      let current = coordinator.layer().bucket();
      for summary in coordinator.layer().storage().summaries()? {
        let marker = if summary.name == current { "*" } else { " " };
        let age = summary
          .last_write
          .map(|t| format!("{}m ago", (Utc::now() - t).num_minutes().max(0)))
          .unwrap_or_else(|| "never".to_string());
        println!(
          "{} {:<32} {:>6} entries  last write {}",
          marker, summary.name, summary.entries, age
        );
      }
    }
    Command::Payload { url } => {
      let url = config.resolve(&url)?;
      match coordinator.layer().payloads().try_get(url.as_str())? {
        Some(payload) => println!("{}", serde_json::to_string_pretty(&payload)?),
        None => println!("no stored payload for {}", url),
      }
    }
  }

  Ok(())
}

/// Bring the worker up, dispatch every request concurrently, and wait for all
/// of them to settle before returning.
async fn run_fetches(coordinator: AppCoordinator, requests: Vec<Request>, body: bool) -> Result<()> {
  let installed = coordinator.resume()?;
  let strategies: Vec<Strategy> = requests.iter().map(|r| coordinator.classify(r)).collect();

  let host = WorkerHost::spawn(coordinator);
  if !installed {
    host.install().await?;
  }
  let purged = host.activate().await?;
  print_purged(&purged);

  let urls: Vec<String> = requests.iter().map(|r| r.url.to_string()).collect();
  let responses = join_all(requests.into_iter().map(|r| host.fetch(r))).await;
  host.shutdown().await;

  let mut stdout = std::io::stdout().lock();
  for ((url, strategy), response) in urls.iter().zip(strategies).zip(responses) {
    print_response(&mut stdout, url, strategy, response.as_ref(), body)?;
  }

  Ok(())
}

fn print_purged(purged: &[String]) {
  for name in purged {
    println!("purged {}", name);
  }
}

fn print_response(
  out: &mut impl Write,
  url: &str,
  strategy: Strategy,
  response: Option<&Response>,
  body: bool,
) -> Result<()> {
  match response {
    Some(response) => {
      writeln!(
        out,
        "{} {:<13} {} ({} bytes, {})",
        response.status,
        strategy,
        url,
        response.body.len(),
        response.header("content-type").unwrap_or("no content-type")
      )?;
      if body {
        out.write_all(&response.body)?;
        writeln!(out)?;
      }
    }
    None => writeln!(out, "--- {:<13} {} (no response)", strategy, url)?,
  }
  Ok(())
}
