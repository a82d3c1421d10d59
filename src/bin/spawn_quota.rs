use spawn_quota::config::{QuotaConfig, StoreConfig};
use spawn_quota::key::{ActorId, CellKey};
use spawn_quota::store::{CounterKey, CounterStore, CounterTable};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .map_err(|e| format!("runtime: {e}"))?;
    match args[1].as_str() {
        "stats" => runtime.block_on(cmd_stats(&args[2..])),
        "count" => runtime.block_on(cmd_count(&args[2..])),
        "set" => runtime.block_on(cmd_set(&args[2..])),
        "reset" => runtime.block_on(cmd_reset(&args[2..])),
        other => {
            print_usage();
            Err(format!("unknown command: {other}"))
        }
    }
}

async fn cmd_stats(args: &[String]) -> Result<(), String> {
    let store = open_store(args)?;
    for (label, table) in [("cells", CounterTable::Cells), ("actors", CounterTable::Actors)] {
        let rows = store.row_count(table).await;
        let units = store.sum_counts(table).await;
        println!("{label}\t{rows}\t{units}");
    }
    finish(store).await
}

async fn cmd_count(args: &[String]) -> Result<(), String> {
    let key = parse_key(args)?;
    let store = open_store(args)?;
    let exists = store.exists(key.clone()).await;
    let count = store.get(key.clone()).await;
    println!("{key}\t{count}\t{}", if exists { "stored" } else { "absent" });
    finish(store).await
}

async fn cmd_set(args: &[String]) -> Result<(), String> {
    let key = parse_key(args)?;
    let count = args
        .get(2)
        .ok_or("missing count")?
        .parse::<i32>()
        .map_err(|e| format!("invalid count: {e}"))?;
    if count < 0 {
        return Err("count must not be negative".into());
    }
    let store = open_store(args)?;
    if !store.set(key.clone(), count).await {
        return Err(format!("failed to set {key}"));
    }
    println!("ok\t{key}\t{count}");
    finish(store).await
}

async fn cmd_reset(args: &[String]) -> Result<(), String> {
    let key = parse_key(args)?;
    let store = open_store(args)?;
    if !store.delete(key.clone()).await {
        return Err(format!("failed to reset {key}"));
    }
    println!("ok\t{key}");
    finish(store).await
}

async fn finish(store: CounterStore) -> Result<(), String> {
    store.close().await;
    if store.failures() > 0 {
        return Err(format!("{} store operations failed", store.failures()));
    }
    Ok(())
}

/// `cell <world:x,z>` or `actor <uuid>`.
fn parse_key(args: &[String]) -> Result<CounterKey, String> {
    let kind = args.first().ok_or("missing key kind (cell|actor)")?;
    let raw = args.get(1).ok_or("missing key")?;
    match kind.as_str() {
        "cell" => raw
            .parse::<CellKey>()
            .map(CounterKey::from)
            .map_err(|e| e.to_string()),
        "actor" => raw
            .parse::<ActorId>()
            .map(CounterKey::from)
            .map_err(|e| e.to_string()),
        other => Err(format!("unknown key kind: {other}")),
    }
}

fn open_store(args: &[String]) -> Result<CounterStore, String> {
    let config = store_config(args)?;
    if !config.is_in_memory() && !config.path.exists() {
        return Err(format!("no store at {}", config.path.display()));
    }
    CounterStore::open(&config).map_err(|e| format!("open store [{}]: {e}", e.code_str()))
}

fn store_config(args: &[String]) -> Result<StoreConfig, String> {
    if let Some(db) = parse_flag_value(args, "--db") {
        return Ok(StoreConfig {
            path: PathBuf::from(db),
            ..StoreConfig::default()
        });
    }
    if let Some(path) = parse_flag_value(args, "--config") {
        let config = QuotaConfig::load(Path::new(&path)).map_err(|e| format!("config: {e}"))?;
        return Ok(config.store);
    }
    Err("--db or --config is required".into())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  spawn_quota stats (--db <file> | --config <quota.toml>)");
    eprintln!("  spawn_quota count (cell <world:x,z> | actor <uuid>) (--db <file> | --config <quota.toml>)");
    eprintln!("  spawn_quota set (cell <world:x,z> | actor <uuid>) <count> (--db <file> | --config <quota.toml>)");
    eprintln!("  spawn_quota reset (cell <world:x,z> | actor <uuid>) (--db <file> | --config <quota.toml>)");
}
