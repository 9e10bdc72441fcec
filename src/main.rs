//! FlashMux - command-line client
//!
//! Sends commands to a Redis-compatible server through the multiplexer.
//! With a command on the command line it runs that command and exits;
//! otherwise it reads one command per line from stdin.

use anyhow::{bail, Context};
use flashmux::{
    Command, LoggingDecorator, MuxError, Multiplexer, MultiplexerConfig, RespValue,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Client configuration
struct Config {
    /// Host to connect to
    host: String,
    /// Port to connect to
    port: u16,
    /// Per-command timeout in milliseconds
    timeout_ms: u64,
    /// Database selected for every command
    db: u32,
    /// Name sent with CLIENT SETNAME
    client_name: Option<String>,
    /// Trace every byte on the wire
    trace_wire: bool,
    /// Print the status line after each command
    show_status: bool,
    /// Command to run; empty means read from stdin
    command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: flashmux::DEFAULT_HOST.to_string(),
            port: flashmux::DEFAULT_PORT,
            timeout_ms: 5000,
            db: 0,
            client_name: None,
            trace_wire: false,
            show_status: false,
            command: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> anyhow::Result<Self> {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value_of(&args, i, "--host")?.to_string();
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = value_of(&args, i, "--port")?
                        .parse()
                        .context("invalid port number")?;
                    i += 2;
                }
                "--timeout" | "-t" => {
                    config.timeout_ms = value_of(&args, i, "--timeout")?
                        .parse()
                        .context("invalid timeout")?;
                    i += 2;
                }
                "--db" | "-n" => {
                    config.db = value_of(&args, i, "--db")?
                        .parse()
                        .context("invalid database index")?;
                    i += 2;
                }
                "--name" => {
                    config.client_name = Some(value_of(&args, i, "--name")?.to_string());
                    i += 2;
                }
                "--trace" => {
                    config.trace_wire = true;
                    i += 1;
                }
                "--status" => {
                    config.show_status = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("FlashMux version {}", flashmux::VERSION);
                    std::process::exit(0);
                }
                arg if arg.starts_with("--") => {
                    print_help();
                    bail!("unknown argument: {}", arg);
                }
                _ => {
                    config.command = args[i..].to_vec();
                    break;
                }
            }
        }

        Ok(config)
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn multiplexer_config(&self) -> MultiplexerConfig {
        let timeout = Duration::from_millis(self.timeout_ms);
        let mut config = MultiplexerConfig::new()
            .with_endpoint(self.address())
            .with_sync_timeout(timeout)
            .with_async_timeout(timeout)
            .with_default_database(self.db);
        if let Some(name) = &self.client_name {
            config = config.with_client_name(name.clone());
        }
        config
    }
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> anyhow::Result<&'a str> {
    match args.get(i + 1) {
        Some(value) => Ok(value),
        None => bail!("{} requires a value", flag),
    }
}

fn print_help() {
    println!(
        r#"
FlashMux - Redis connection multiplexer client

USAGE:
    flashmux [OPTIONS] [COMMAND [ARG ...]]

OPTIONS:
    -h, --host <HOST>       Server host (default: 127.0.0.1)
    -p, --port <PORT>       Server port (default: 6379)
    -t, --timeout <MS>      Command timeout in milliseconds (default: 5000)
    -n, --db <INDEX>        Database index (default: 0)
        --name <NAME>       Client name sent on connect
        --trace             Log every byte read and written (RUST_LOG=trace)
        --status            Print multiplexer status after each command
    -v, --version           Print version information
        --help              Print this help message

EXAMPLES:
    flashmux PING                    # One command, then exit
    flashmux -p 6380 GET name        # Against another port
    flashmux                         # Read commands from stdin
"#
    );
}

/// Renders a reply the way redis-cli does.
fn format_reply(value: &RespValue, indent: usize) -> String {
    match value {
        RespValue::SimpleString(s) => s.clone(),
        RespValue::Error(e) => format!("(error) {}", e),
        RespValue::Integer(n) => format!("(integer) {}", n),
        RespValue::BulkString(b) => format!("\"{}\"", b.escape_ascii()),
        RespValue::Null => "(nil)".to_string(),
        RespValue::Array(items) if items.is_empty() => "(empty array)".to_string(),
        RespValue::Array(items) => {
            let width = items.len().to_string().len();
            items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    let pad = if i == 0 { String::new() } else { " ".repeat(indent) };
                    format!(
                        "{}{:>width$}) {}",
                        pad,
                        i + 1,
                        format_reply(item, indent + width + 2),
                        width = width
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

async fn run_command(mux: &Multiplexer, words: Vec<String>, show_status: bool) {
    let Some(command) = Command::from_words(words) else {
        return;
    };
    match mux.execute(command).await {
        Ok(reply) => println!("{}", format_reply(&reply, 0)),
        Err(MuxError::Server(message)) => println!("(error) {}", message),
        Err(e) => println!("(failure) {}", e),
    }
    if show_status {
        println!("{}", mux.status());
    }
}

async fn interactive(mux: Arc<Multiplexer>, show_status: bool) -> anyhow::Result<()> {
    // Pushes from SUBSCRIBE arrive out of band.
    let mut pushes = mux.pushes();
    tokio::spawn(async move {
        while let Ok(push) = pushes.recv().await {
            println!("{}", format_reply(&push.value, 0));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let words: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if words.is_empty() {
            continue;
        }
        if words[0].eq_ignore_ascii_case("quit") || words[0].eq_ignore_ascii_case("exit") {
            break;
        }
        run_command(&mux, words, show_status).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args()?;

    // Set up logging; RUST_LOG overrides the default level
    let default_level = if config.trace_wire { "trace" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let mut builder = Multiplexer::builder(config.multiplexer_config());
    if config.trace_wire {
        builder = builder.with_decorator(Arc::new(LoggingDecorator));
    }
    let mux = Arc::new(
        builder
            .connect()
            .await
            .with_context(|| format!("could not connect to {}", config.address()))?,
    );
    info!(endpoint = %config.address(), "Connected");

    let work = async {
        if config.command.is_empty() {
            interactive(Arc::clone(&mux), config.show_status).await
        } else {
            run_command(&mux, config.command.clone(), config.show_status).await;
            Ok(())
        }
    };

    let result = tokio::select! {
        result = work => result,
        _ = signal::ctrl_c() => {
            warn!("Interrupted");
            Ok(())
        }
    };

    mux.dispose();
    result
}
