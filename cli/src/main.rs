//! chainsink CLI: inspect and bootstrap the serializer database.
//!
//! Usage:
//! ```bash
//! chainsink status    --url postgresql://hive@localhost/haf_block_log
//! chainsink bootstrap --url postgresql://hive@localhost/haf_block_log --schema db/schema.sql
//! chainsink indexes   --url postgresql://hive@localhost/haf_block_log --restore
//! chainsink info
//! ```

use std::env;
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainsink_serializer::loader::load_initial_db_data;
use chainsink_serializer::schema;
use chainsink_serializer::SerializerConfig;
use chainsink_storage::PostgresStore;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("chainsink {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "status" => run(&args[2..], cmd_status),
        "bootstrap" => run(&args[2..], cmd_bootstrap),
        "indexes" => run(&args[2..], cmd_indexes),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("chainsink {}", env!("CARGO_PKG_VERSION"));
    println!("Concurrent Hive block serializer for PostgreSQL\n");
    println!("USAGE:");
    println!("    chainsink <COMMAND> [OPTIONS]\n");
    println!("COMMANDS:");
    println!("    info       Show serializer defaults");
    println!("    status     Show persisted head block, operation id and cache sizes");
    println!("    bootstrap  Run a schema script and register operation types");
    println!("    indexes    Drop or restore indexes, constraints and foreign keys");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("OPTIONS:");
    println!("    --url <URL>       PostgreSQL connection string (or DATABASE_URL)");
    println!("    --schema <PATH>   Schema script for bootstrap, one statement per line");
    println!("    --restore         Restore indexes (indexes command)");
    println!("    --drop            Save and drop indexes (indexes command)");
    println!("    --json            Emit JSON structured logs");
}

fn cmd_info() {
    let defaults = SerializerConfig::default();
    println!("ChainSink v{}", env!("CARGO_PKG_VERSION"));
    println!("  Live sync: commit every {} block(s)", defaults.live_blocks_per_commit);
    println!("  Reindex: commit every {} blocks", defaults.reindex_blocks_per_commit);
    println!(
        "  Index switch threshold: {} blocks behind head",
        defaults.index_threshold
    );
    println!("  Statistics: every {} blocks", defaults.statistics_interval);
    println!("  Tables: {}", schema::SWITCHED_TABLES.join(", "));
    println!("  Storage backends: memory, PostgreSQL (feature: postgres)");
}

// ─── Options ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Options {
    url: Option<String>,
    schema: Option<PathBuf>,
    restore: Option<bool>,
    json: bool,
}

impl Options {
    fn parse(args: &[String]) -> Result<Self> {
        let mut options = Self::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--url" => options.url = Some(iter.next().context("--url needs a value")?.clone()),
                "--schema" => {
                    options.schema = Some(iter.next().context("--schema needs a value")?.into())
                }
                "--restore" => options.restore = Some(true),
                "--drop" => options.restore = Some(false),
                "--json" => options.json = true,
                other => bail!("unknown option: {other}"),
            }
        }
        Ok(options)
    }

    fn store(&self) -> Result<PostgresStore> {
        let url = match &self.url {
            Some(url) => url.clone(),
            None => env::var("DATABASE_URL").context("pass --url or set DATABASE_URL")?,
        };
        Ok(PostgresStore::new(&url)?)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

fn run<F, Fut>(args: &[String], command: F) -> Result<()>
where
    F: FnOnce(Options) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let options = Options::parse(args)?;
    init_tracing(options.json);
    let runtime = tokio::runtime::Runtime::new().context("failed to start the tokio runtime")?;
    runtime.block_on(command(options))
}

// ─── Commands ────────────────────────────────────────────────────────────────

async fn cmd_status(options: Options) -> Result<()> {
    let store = options.store()?;
    let data = load_initial_db_data(&store).await?;
    println!("Persisted head block: {}", data.psql_block_number);
    println!("Next operation id:    {}", data.max_operation_id + 1);
    println!("Known accounts:       {}", data.accounts.len());
    println!("Known permlinks:      {}", data.permlinks.len());
    Ok(())
}

async fn cmd_bootstrap(options: Options) -> Result<()> {
    let store = options.store()?;
    let outcome = schema::bootstrap(&store, options.schema.as_deref()).await?;
    println!(
        "Schema statements executed: {}, failed: {}",
        outcome.executed, outcome.failed
    );
    println!("Operation types registered");
    Ok(())
}

async fn cmd_indexes(options: Options) -> Result<()> {
    let Some(create) = options.restore else {
        bail!("indexes needs --restore or --drop");
    };
    let store = options.store()?;
    schema::switch_db_items(&store, create).await?;
    println!(
        "Indexes, constraints and foreign keys {}",
        if create { "restored" } else { "saved and dropped" }
    );
    Ok(())
}
