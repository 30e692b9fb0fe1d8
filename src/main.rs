//! logtap command line client

use clap::{Args, Parser, Subcommand};
use logtap::log_parser::parser_for;
use logtap::telemetry::{Fields, Level};
use logtap::{Client, Config, LogtapError, Result, TrackOptions};
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "logtap", version, about = "Send logs and events to a logtap endpoint")]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ConnectionArgs {
    /// Base URL of the ingestion service
    #[arg(long, env = "LOGTAP_BASE_URL", global = true)]
    base_url: Option<String>,

    /// Project identifier
    #[arg(long, env = "LOGTAP_PROJECT_ID", global = true)]
    project_id: Option<String>,

    /// Project key sent as X-Project-Key
    #[arg(long, env = "LOGTAP_PROJECT_KEY", global = true, hide_env_values = true)]
    project_key: Option<String>,

    /// Gzip request bodies
    #[arg(long, global = true)]
    gzip: bool,

    /// Keep undelivered records on disk for the next run
    #[arg(long, global = true)]
    persist: bool,

    /// Queue file used with --persist
    #[arg(long, global = true)]
    queue_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send one log record
    Log {
        /// debug, info, warn, error or fatal
        #[arg(short, long, default_value = "info")]
        level: String,

        message: String,

        /// key=value pair added to the record's fields (repeatable)
        #[arg(short, long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, Value)>,
    },

    /// Send one track event
    Track {
        name: String,

        /// key=value pair added to the event's properties (repeatable)
        #[arg(short, long = "prop", value_parser = parse_key_value)]
        properties: Vec<(String, Value)>,

        /// Flush right away instead of batching
        #[arg(long)]
        immediate: bool,
    },

    /// Read lines from stdin and send each as a record
    Pipe {
        /// auto, json or plain
        #[arg(long, default_value = "auto")]
        format: String,

        /// Level for lines that do not carry one
        #[arg(short, long, default_value = "info")]
        level: String,
    },
}

/// Parse `key=value`; the value is read as JSON when it parses, otherwise
/// kept as a string.
fn parse_key_value(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in `{}`", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn to_fields(pairs: Vec<(String, Value)>) -> Option<Fields> {
    (!pairs.is_empty()).then(|| pairs.into_iter().collect())
}

fn build_config(args: ConnectionArgs) -> Config {
    let mut config = Config::from_env();

    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }
    if let Some(project_id) = args.project_id {
        config.project_id = project_id;
    }
    if let Some(key) = args.project_key {
        config.project_key = Some(key);
    }
    if args.gzip {
        config.gzip = true;
    }
    if args.persist {
        config.persist_queue = true;
    }
    if let Some(path) = args.queue_file {
        config.queue_file_path = Some(path);
    }

    config
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let cli = Cli::parse();
    let config = build_config(cli.connection);

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(2);
    }

    info!(
        base_url = %config.base_url,
        project = %config.project_id,
        gzip = config.gzip,
        persist = config.persist_queue,
        "Starting logtap v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = Client::new(config).await?;

    let queued = match cli.command {
        Command::Log {
            level,
            message,
            fields,
        } => usize::from(client.log(Level::from(level.as_str()), &message, to_fields(fields))),
        Command::Track {
            name,
            properties,
            immediate,
        } => {
            let options = TrackOptions {
                immediate,
                ..Default::default()
            };
            usize::from(client.track_with(&name, to_fields(properties), options))
        }
        Command::Pipe { format, level } => pipe_stdin(&client, &format, &level).await?,
    };

    let outcome = client.close().await;
    info!(queued, sent = outcome.sent, remaining = outcome.remaining.total(), "Done");

    if outcome.failed || outcome.remaining.total() > 0 {
        warn!("Some records were not delivered");
        std::process::exit(1);
    }

    Ok(())
}

/// Forward stdin to the client line by line. Returns the number of records
/// queued.
async fn pipe_stdin(client: &Client, format: &str, level: &str) -> Result<usize> {
    let parser = parser_for(format, Level::from(level));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut queued = 0;

    while let Some(line) = lines.next_line().await.map_err(LogtapError::Io)? {
        if let Some(parsed) = parser.parse_line(&line) {
            if parsed.submit(client) {
                queued += 1;
            }
        }
    }

    Ok(queued)
}

/// Initialize structured logging
fn initialize_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
