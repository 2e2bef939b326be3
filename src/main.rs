//! `chainsub` - stream a contract event from any EVM-compatible node.
//!
//! # Usage
//!
//! ```bash
//! RPC_URL=wss://eth.example.org \
//! CONTRACT_ADDRESS=0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48 \
//! ABI_PATH=usdc.json EVENT_NAME=Transfer \
//! chainsub listen --from-block 19000000 --output json --cursor-file usdc.cursor
//! ```
//!
//! Records go to stdout, logs to stderr.

use std::{fs, path::Path, path::PathBuf, time::Duration};

use alloy::{primitives::Address, transports::http::reqwest::Url};
use anyhow::{Context, Result};
use chainsub::{
    BlockPointer, Cursor, OutputFormat, WriterSink,
    config::{ListenerConfig, Tuning, parse_address, parse_rpc_url},
    log_poller::{
        DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK, DEFAULT_MAX_BLOCK_RANGE,
        DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_SAFETY_MARGIN,
    },
    robust_provider::DEFAULT_MAX_RETRIES,
};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "chainsub")]
#[command(about = "Subscribe to smart contract events on any EVM-compatible chain")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log format on stderr: text or json.
    #[arg(long, global = true, env = "CHAINSUB_LOG_FORMAT", default_value = "text", value_parser = ["text", "json"])]
    log_format: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream decoded occurrences of one event emitted by one contract.
    Listen(ListenArgs),
}

#[derive(Args, Debug)]
struct ListenArgs {
    /// Node JSON-RPC endpoint (http, https, ws or wss).
    #[arg(long, env = "RPC_URL", value_parser = parse_rpc_url)]
    rpc: Url,

    /// Contract whose events are followed.
    #[arg(long, env = "CONTRACT_ADDRESS", value_parser = parse_address)]
    contract: Address,

    /// ABI JSON file, a bare item array or a compiler artifact.
    #[arg(long, env = "ABI_PATH")]
    abi: PathBuf,

    /// Event name, or its full signature to pick one overload.
    #[arg(long, env = "EVENT_NAME")]
    event: String,

    /// First block to deliver: "latest" or a block number.
    #[arg(long, env = "FROM_BLOCK", default_value = "latest")]
    from_block: BlockPointer,

    /// Record format on stdout: text (alias stdout) or json.
    #[arg(long, env = "OUTPUT", default_value = "text")]
    output: OutputFormat,

    /// Fallback endpoints tried in order when the primary fails.
    #[arg(long = "fallback-rpc", env = "CHAINSUB_FALLBACK_RPC_URLS", value_delimiter = ',', value_parser = parse_rpc_url)]
    fallback_rpc: Vec<Url>,

    /// Largest block span per log query.
    #[arg(long, env = "CHAINSUB_MAX_BLOCK_RANGE", default_value_t = DEFAULT_MAX_BLOCK_RANGE)]
    max_block_range: u64,

    /// Blocks below the head left to the catch-up phase.
    #[arg(long, env = "CHAINSUB_SAFETY_MARGIN", default_value_t = DEFAULT_SAFETY_MARGIN)]
    safety_margin: u64,

    /// Head polling interval in milliseconds, when the node cannot push logs.
    #[arg(long, env = "CHAINSUB_POLL_INTERVAL_MS", default_value_t = 2_000)]
    poll_interval_ms: u64,

    /// Timeout for a single RPC attempt in seconds.
    #[arg(long, env = "CHAINSUB_CALL_TIMEOUT_SECS", default_value_t = 30)]
    call_timeout_secs: u64,

    /// Retries per RPC call for transient failures.
    #[arg(long, env = "CHAINSUB_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: usize,

    /// Consecutive reconnects without progress before giving up.
    #[arg(long, env = "CHAINSUB_MAX_RECONNECT_ATTEMPTS", default_value_t = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    max_reconnect_attempts: usize,

    /// Queued events at which log queries pause.
    #[arg(long, env = "CHAINSUB_HIGH_WATERMARK", default_value_t = DEFAULT_HIGH_WATERMARK)]
    high_watermark: usize,

    /// Queued events at which paused queries resume.
    #[arg(long, env = "CHAINSUB_LOW_WATERMARK", default_value_t = DEFAULT_LOW_WATERMARK)]
    low_watermark: usize,

    /// Poll for new blocks even if the node supports subscriptions.
    #[arg(long, env = "CHAINSUB_POLLING")]
    polling: bool,

    /// Resume from this cursor file if present and write the final cursor to it on exit.
    #[arg(long, env = "CHAINSUB_CURSOR_FILE")]
    cursor_file: Option<PathBuf>,
}

impl ListenArgs {
    fn into_config(self) -> (ListenerConfig, Option<PathBuf>) {
        let config = ListenerConfig {
            rpc_url: self.rpc,
            fallback_rpc_urls: self.fallback_rpc,
            contract: self.contract,
            abi_path: self.abi,
            event: self.event,
            from_block: self.from_block,
            output: self.output,
            tuning: Tuning {
                max_block_range: self.max_block_range,
                safety_margin: self.safety_margin,
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                call_timeout: Duration::from_secs(self.call_timeout_secs),
                max_retries: self.max_retries,
                max_reconnect_attempts: self.max_reconnect_attempts,
                high_watermark: self.high_watermark,
                low_watermark: self.low_watermark,
                force_polling: self.polling,
            },
        };
        (config, self.cursor_file)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format == "json");

    match cli.command {
        Command::Listen(args) => listen(args).await,
    }
}

async fn listen(args: ListenArgs) -> Result<()> {
    let (config, cursor_file) = args.into_config();
    config.validate()?;
    let output = config.output;

    let resume = match &cursor_file {
        Some(path) => load_cursor(path)?,
        None => None,
    };
    if let Some(cursor) = &resume {
        info!(cursor = %cursor, "Resuming from cursor file, --from-block is ignored");
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    let listener =
        config.into_listener(cancel).await.context("failed to start listener")?.resume_from(resume);
    let written = listener.subscribe_cursor();

    let mut sink = WriterSink::stdout(output);
    let result = listener.run(&mut sink).await;

    let latest = *written.borrow();
    if let (Some(path), Some(cursor)) = (&cursor_file, latest) {
        save_cursor(path, &cursor)?;
        info!(path = %path.display(), cursor = %cursor, "Saved cursor");
    }

    result.context("listener failed")?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM. Queued events are still written before exit.
async fn cancel_on_shutdown(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown requested, draining queued events");
    token.cancel();
}

fn load_cursor(path: &Path) -> Result<Option<Cursor>> {
    if !path.exists() {
        return Ok(None);
    }
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read cursor file {}", path.display()))?;
    let cursor = serde_json::from_str(&json)
        .with_context(|| format!("invalid cursor file {}", path.display()))?;
    Ok(Some(cursor))
}

/// Written to a sibling file first, then renamed over `path`.
fn save_cursor(path: &Path, cursor: &Cursor) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(cursor)?)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
