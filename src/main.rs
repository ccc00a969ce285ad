use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use resource_query::app::App;
use resource_query::cache::{NoopStorage, SqliteStorage};
use resource_query::config::Config;
use resource_query::logging;

#[derive(Parser, Debug)]
#[command(name = "rq")]
#[command(about = "Fetch and watch a users list with cached, cancellable requests")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rq/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// API base URL
  #[arg(short, long)]
  base_url: Option<String>,

  /// Print the list once and exit
  #[arg(long)]
  once: bool,

  /// Do not read or write the result cache
  #[arg(long)]
  no_cache: bool,

  /// Seconds between staleness checks
  #[arg(long)]
  refresh_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(base_url) = args.base_url {
    config.api.base_url = base_url;
  }
  if args.refresh_secs.is_some() {
    config.refresh_secs = args.refresh_secs;
  }
  if args.no_cache {
    config.cache.enabled = false;
  }

  let _log_guard = logging::init(&config.log)?;

  if config.cache.enabled {
    let storage = SqliteStorage::open(config.cache.path.as_deref())?;
    App::new(config, storage, args.once)?.run().await
  } else {
    App::new(config, NoopStorage, args.once)?.run().await
  }
}
