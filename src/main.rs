use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

use tollgate::cache::FetchOptions;
use tollgate::http::RequestOptions;
use tollgate::{logging, Client, Config};

#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(about = "Authenticated, cached API calls from the command line")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tollgate/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the API base URL
  #[arg(long)]
  base_url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// GET a path through the authenticated pipeline
  Get {
    path: String,
    /// Query parameters as key=value
    #[arg(short, long)]
    query: Vec<String>,
  },
  /// Send a mutating request
  Send {
    #[arg(value_enum)]
    method: MutatingMethod,
    path: String,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
    /// Reuse a key when retrying the same logical operation
    #[arg(long)]
    idempotency_key: Option<String>,
  },
  /// Cache-first GET
  Fetch {
    path: String,
    /// Cache key (defaults to the path)
    #[arg(short, long)]
    key: Option<String>,
    /// Time to live in seconds
    #[arg(long)]
    ttl: Option<u64>,
    /// Ignore any cached copy
    #[arg(short, long)]
    force: bool,
  },
  /// Log in with a JSON credentials body
  Login { credentials: String },
  /// Drop tokens and cached data
  Logout,
  /// Print this installation's device id
  DeviceId,
  /// Cache maintenance
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  /// Remove every cached entry
  Clear,
  /// Remove entries whose key starts with a prefix
  Invalidate { prefix: String },
  /// Show cache metadata
  Stats,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MutatingMethod {
  Post,
  Put,
  Patch,
  Delete,
}

impl From<MutatingMethod> for Method {
  fn from(m: MutatingMethod) -> Self {
    match m {
      MutatingMethod::Post => Method::POST,
      MutatingMethod::Put => Method::PUT,
      MutatingMethod::Patch => Method::PATCH,
      MutatingMethod::Delete => Method::DELETE,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = logging::init()?;

  let args = Args::parse();

  let config = Config::load_with_base_url(args.config.as_deref(), args.base_url)?;

  let client = Client::new(&config)?;
  client.set_force_logout_callback(|| {
    eprintln!("Session expired. Run `tollgate login` again.");
  });

  match args.command {
    Command::Get { path, query } => {
      let mut options = RequestOptions::new();
      for pair in query {
        let (k, v) = pair
          .split_once('=')
          .ok_or_else(|| eyre!("Query parameter must be key=value: {}", pair))?;
        options = options.query(k, v);
      }
      let value = client
        .pipeline()
        .request_value(Method::GET, &path, options)
        .await?;
      print_json(&value)?;
    }
    Command::Send {
      method,
      path,
      data,
      idempotency_key,
    } => {
      let mut options = RequestOptions::new();
      if let Some(data) = data {
        let body: Value =
          serde_json::from_str(&data).map_err(|e| eyre!("--data is not valid JSON: {}", e))?;
        options = options.body(body);
      }
      if let Some(key) = idempotency_key {
        options = options.idempotency_key(key);
      }
      let value = client
        .pipeline()
        .request_value(method.into(), &path, options)
        .await?;
      print_json(&value)?;
    }
    Command::Fetch {
      path,
      key,
      ttl,
      force,
    } => {
      let key = key.unwrap_or_else(|| path.clone());
      let mut options = FetchOptions::default().force_refresh(force);
      if let Some(ttl) = ttl {
        options = options.ttl(Duration::from_secs(ttl));
      }
      let fetched = client.get_cached::<Value>(&key, &path, options).await;
      match fetched.data {
        Some(value) => {
          eprintln!(
            "({})",
            if fetched.is_from_cache {
              "cached"
            } else {
              "network"
            }
          );
          print_json(&value)?;
        }
        None => return Err(eyre!("Failed to fetch {}", path)),
      }
    }
    Command::Login { credentials } => {
      let body: Value = serde_json::from_str(&credentials)
        .map_err(|e| eyre!("Credentials are not valid JSON: {}", e))?;
      client.login(body).await?;
      println!("Logged in");
    }
    Command::Logout => {
      client.logout();
      println!("Logged out");
    }
    Command::DeviceId => {
      println!("{}", client.tokens().get_or_create_device_id());
    }
    Command::Cache { action } => match action {
      CacheAction::Clear => {
        client.cache().store().clear_all();
        println!("Cache cleared");
      }
      CacheAction::Invalidate { prefix } => {
        client.cache().invalidate(&prefix);
        println!("Invalidated {}*", prefix);
      }
      CacheAction::Stats => {
        let store = client.cache().store();
        let stats = store.stats();
        println!(
          "in-process entries: {}/{}",
          stats.memory_entries, stats.memory_capacity
        );
        if let Some(meta) = store.metadata() {
          let cleared = chrono::DateTime::from_timestamp_millis(meta.last_cleared)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| meta.last_cleared.to_string());
          println!("schema version: {}", meta.version);
          println!("last cleared: {}", cleared);
        }
      }
    },
  }

  Ok(())
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
