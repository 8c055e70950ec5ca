use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netquery::config::{Config, StorageBackend};
use netquery::{
  Method, MutationOptions, MutationOverrides, Provider, QueryOptions, Refetch, SqliteStorage,
  VariableValue, Variables,
};

#[derive(Parser, Debug)]
#[command(name = "netquery")]
#[command(about = "Query and mutate JSON endpoints through a persistent cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/netquery/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Base url, overrides the config file
  #[arg(short, long)]
  base_url: Option<String>,

  /// Enable debug logging
  #[arg(short, long)]
  debug: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch an endpoint, printing the persisted copy first if there is one
  Get {
    endpoint: String,

    /// Template variable, as name=value
    #[arg(short = 'v', long = "var", value_parser = parse_variable)]
    variables: Vec<(String, VariableValue)>,

    /// Only print the persisted copy, don't contact the server
    #[arg(long)]
    offline: bool,
  },

  /// Send a mutation
  Send {
    endpoint: String,

    #[arg(short, long, default_value = "post")]
    method: Method,

    /// JSON request body
    #[arg(long)]
    body: Option<String>,

    /// Template variable, as name=value
    #[arg(short = 'v', long = "var", value_parser = parse_variable)]
    variables: Vec<(String, VariableValue)>,

    /// Endpoint to refetch afterwards, may be repeated
    #[arg(short, long)]
    refetch: Vec<String>,
  },

  /// Remove every persisted record in the configured namespace
  Purge,

  /// List persisted records
  Storage,
}

fn parse_variable(raw: &str) -> std::result::Result<(String, VariableValue), String> {
  let (name, value) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected name=value, got '{}'", raw))?;
  let value = match value.parse::<i64>() {
    Ok(n) => VariableValue::from(n),
    Err(_) => VariableValue::from(value),
  };
  Ok((name.trim().to_string(), value))
}

/// Initialize logging.
///
/// Filter comes from `--debug`, then RUST_LOG, then defaults to info. Logs
/// go to the configured file if there is one, stderr otherwise.
fn init_tracing(config: &Config, debug: bool) -> Result<Option<WorkerGuard>> {
  let filter = if debug {
    EnvFilter::new("netquery=debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("netquery=info"))
  };

  match &config.log.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
      Ok(None)
    }
  }
}

fn print_json(value: &Value) -> Result<()> {
  let text = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format response: {}", e))?;
  println!("{}", text);
  Ok(())
}

fn to_variables(pairs: Vec<(String, VariableValue)>) -> Variables {
  pairs.into_iter().collect()
}

async fn get(provider: &Provider, endpoint: &str, variables: Variables, offline: bool) -> Result<()> {
  let query = provider.query(endpoint, QueryOptions::default().variables(variables))?;

  let stale = match (query.data(), provider.storage()) {
    (Some(data), _) => Some(data),
    (None, Some(storage)) => storage.read(provider.namespace(), query.key()).await,
    (None, None) => None,
  };
  if let Some(data) = &stale {
    eprintln!("# persisted");
    print_json(data)?;
  }
  if offline {
    return match stale {
      Some(_) => Ok(()),
      None => Err(eyre!("Nothing persisted for {}", query.key())),
    };
  }

  let result = query.fetch().await;
  if let Some(error) = result.error {
    return Err(eyre!("Failed to fetch {}: {}", query.url(), error));
  }
  if stale.is_some() {
    eprintln!("# fresh");
  }
  print_json(&result.data.unwrap_or(Value::Null))
}

async fn send(
  provider: &Provider,
  endpoint: String,
  method: Method,
  body: Option<String>,
  variables: Variables,
  refetch: Vec<String>,
) -> Result<()> {
  let body = body
    .map(|raw| serde_json::from_str::<Value>(&raw))
    .transpose()
    .map_err(|e| eyre!("Failed to parse request body: {}", e))?;

  let refetch = if refetch.is_empty() {
    Refetch::None
  } else {
    Refetch::Endpoints(refetch)
  };
  let mutation = provider.mutation(
    MutationOptions::new(endpoint)
      .method(method)
      .variables(variables)
      .refetch(refetch),
  );

  let overrides = body.map(|body| MutationOverrides::default().body(body));
  match mutation.mutate(overrides).await? {
    Some(data) => print_json(&data),
    None => match mutation.error() {
      Some(error) => Err(eyre!("Mutation failed: {}", error)),
      None => Err(eyre!("Mutation failed")),
    },
  }
}

fn list_storage(config: &Config) -> Result<()> {
  if config.storage.backend != StorageBackend::Sqlite {
    println!("Storage backend {:?} keeps nothing between runs", config.storage.backend);
    return Ok(());
  }

  let storage = match &config.storage.path {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  };

  let records = storage.records()?;
  if records.is_empty() {
    println!("No persisted records");
    return Ok(());
  }
  for record in records {
    println!(
      "{}  {:>8}  {}",
      record.updated_at.format("%Y-%m-%d %H:%M:%S"),
      record.size,
      record.key
    );
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override base url if specified on command line
  let config = if let Some(base_url) = args.base_url {
    Config {
      base_url: Some(base_url),
      ..config
    }
  } else {
    config
  };

  let _guard = init_tracing(&config, args.debug)?;
  tracing::debug!(?config, "Loaded configuration");

  match args.command {
    Command::Get {
      endpoint,
      variables,
      offline,
    } => {
      let provider = Provider::from_config(&config).await?;
      get(&provider, &endpoint, to_variables(variables), offline).await
    }
    Command::Send {
      endpoint,
      method,
      body,
      variables,
      refetch,
    } => {
      let provider = Provider::from_config(&config).await?;
      send(&provider, endpoint, method, body, to_variables(variables), refetch).await
    }
    Command::Purge => {
      let provider = Provider::from_config(&config).await?;
      let removed = provider.purge_persistent_storage().await;
      println!("Removed {} records", removed);
      Ok(())
    }
    Command::Storage => list_storage(&config),
  }
}
