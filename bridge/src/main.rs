//! `revocation-bridge` command line.
//!
//! Connects to Consul, keeps the revocation rule index in sync and answers
//! verification queries read from stdin, or performs one-off rule writes.

use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use serde_json::{json, Value};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use bridge::{BridgeConfig, ConsulKv, KvStore, RevocationEngine, RuleStore};
use rule_engine::{ClaimSet, Rule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    None,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Parser)]
#[command(name = "revocation-bridge")]
#[command(about = "Token revocation rules backed by a Consul KV tree", long_about = None)]
#[command(version)]
struct Cli {
    /// Consul agent URL (overrides REVOCATION_CONSUL_URL)
    #[arg(long, global = true)]
    consul_url: Option<String>,

    /// KV prefix holding the rule tree (overrides REVOCATION_KEY_PREFIX)
    #[arg(long, global = true)]
    key_prefix: Option<String>,

    /// Claim naming the token principal (overrides REVOCATION_IDENTITY_CLAIM)
    #[arg(long, global = true)]
    identity_claim: Option<String>,

    #[arg(long, value_enum, env = "REVOCATION_LOG_LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync rules and print a verdict for each JSON claim set read from stdin
    Verify,
    /// Write a rule, e.g. `add u/alice/1 '{"rt":"r1","iat":{"lt":100}}'`
    Add {
        /// Rule path: g/<id> or u/<principal>/<id>
        key: String,
        /// Rule expression as JSON
        value: String,
    },
    /// Delete a rule
    Remove {
        key: String,
    },
    /// Print all rules as JSON
    Rules,
}

fn init_logging(log_level: LogLevel) {
    let level = match log_level {
        LogLevel::None => return,
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env = env_logger::Env::default().filter_or("RUST_LOG", level);
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_target(matches!(log_level, LogLevel::Debug | LogLevel::Trace))
        .target(env_logger::Target::Stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<BridgeConfig, String> {
    let mut config = BridgeConfig::from_env().map_err(|e| e.to_string())?;
    if let Some(url) = &cli.consul_url {
        config.consul_url = url.clone();
    }
    if let Some(prefix) = &cli.key_prefix {
        config.key_prefix = prefix.clone();
    }
    if let Some(claim) = &cli.identity_claim {
        config.identity_claim = claim.clone();
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn build_store(config: &BridgeConfig) -> Result<Arc<RuleStore>, String> {
    let kv = ConsulKv::new(&config.consul_url, config.consul_token.clone()).map_err(|e| e.to_string())?;
    let kv: Arc<dyn KvStore> = Arc::new(kv);
    Ok(Arc::new(RuleStore::new(
        kv,
        config.key_prefix.clone(),
        config.sync.clone(),
    )))
}

async fn run(cli: Cli) -> Result<(), String> {
    let config = load_config(&cli)?;
    let store = build_store(&config)?;

    match cli.command {
        Commands::Verify => verify(store, &config).await,
        Commands::Add { key, value } => {
            let value: Value =
                serde_json::from_str(&value).map_err(|e| format!("Invalid rule JSON: {}", e))?;
            store.add(&key, &value).await.map_err(|e| e.to_string())?;
            Ok(())
        }
        Commands::Remove { key } => store.remove(&key).await.map_err(|e| e.to_string()),
        Commands::Rules => {
            let index = store.fetch_index().await.map_err(|e| e.to_string())?;
            let rules = index.rules();
            let rules: Vec<&Rule> = rules.iter().map(|rule| rule.as_ref()).collect();
            let listing = json!({
                "rules": rules,
                "diagnostics": index.diagnostics(),
            });
            let text = serde_json::to_string_pretty(&listing).map_err(|e| e.to_string())?;
            println!("{}", text);
            Ok(())
        }
    }
}

async fn verify(store: Arc<RuleStore>, config: &BridgeConfig) -> Result<(), String> {
    store.start_sync().await.map_err(|e| e.to_string())?;
    let engine = RevocationEngine::with_identity_claim(Arc::clone(&store), config.identity_claim.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut outcome = Ok(());

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                outcome = Err(format!("Failed to read stdin: {}", e));
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let code = match serde_json::from_str::<Value>(&line)
            .ok()
            .and_then(ClaimSet::from_value)
        {
            Some(claims) => engine.evaluate(&claims).reason_code(),
            None => "invalid",
        };

        if let Err(e) = write_verdict(&mut stdout, code).await {
            outcome = Err(format!("Failed to write verdict: {}", e));
            break;
        }
    }

    let stats = engine.stats();
    info!(
        "Evaluated {} claim sets ({} blacklisted)",
        stats.evaluations, stats.blacklisted
    );
    store.stop_sync().await;
    outcome
}

/// Writes one reason code per line and flushes so callers see it immediately.
async fn write_verdict<W: AsyncWrite + Unpin>(out: &mut W, code: &str) -> std::io::Result<()> {
    out.write_all(code.as_bytes()).await?;
    out.write_all(b"\n").await?;
    out.flush().await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
