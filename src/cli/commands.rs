//! CLI command definitions for blockq.
//!
//! Every command reads `BLOCKQ_*` environment variables first and lets
//! command-line flags override them. `--memory` swaps Redis for an
//! in-process store, which is handy to watch the queue protocol without a
//! server. The store lives only as long as the command, so `produce` and
//! `consume` refuse it: use `run --memory` to exercise both sides.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::{CacheLookup, JsonRecordSource, RecordCache};
use crate::config::{ConfigError, QueueConfig};
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::queue::{
    list, Connections, ConsumeReport, Consumer, ConsumerConfig, ProduceReport, Producer,
    RunReport, Runner, StopHandle, StopSignal, Topology,
};
use crate::store::{
    Item, ListStore, MemoryServer, MemoryStore, PollTimeout, RecordStore, RedisStore, ValueStore,
};

/// Default list used by `list-demo`.
const DEFAULT_LIST_KEY: &str = "tasks";

/// Default key used by `kv`.
const DEFAULT_KV_KEY: &str = "message";

/// Blocking work queue over a Redis list.
#[derive(Parser)]
#[command(name = "blockq")]
#[command(about = "Blocking work queue over a Redis list")]
#[command(version)]
#[command(
    long_about = "blockq pushes items to a Redis list at a fixed cadence and drains it with a blocking pop, backing off after empty polls.\n\nExample usage:\n  blockq run --topology shared --poll-timeout-ms 700\n  blockq run --topology dual --memory"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL; overrides BLOCKQ_REDIS_URL.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Use an in-process store instead of Redis.
    #[arg(long, global = true)]
    pub memory: bool,

    /// Print Prometheus metrics when the command finishes.
    #[arg(long, global = true)]
    pub metrics: bool,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a producer and a consumer against the same queue.
    Run(RunArgs),

    /// Push labeled items to a queue, one per interval.
    Produce(ProduceArgs),

    /// Drain a queue until the miss budget runs out.
    Consume(ConsumeArgs),

    /// Seed a list, then pop its oldest and newest items.
    #[command(name = "list-demo")]
    ListDemo(ListDemoArgs),

    /// Set a value and read it back.
    Kv(KvArgs),

    /// Look up records through the cache, loading misses from a JSON file.
    Cache(CacheArgs),
}

/// Queue settings shared by `run`, `produce` and `consume`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct QueueArgs {
    /// Queue (list) name.
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Number of items to produce.
    #[arg(short = 'n', long)]
    pub count: Option<u64>,

    /// Milliseconds between two pushes.
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Blocking pop timeout in milliseconds; 0 waits forever.
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Milliseconds to wait after a miss.
    #[arg(long)]
    pub backoff_ms: Option<u64>,

    /// Consecutive misses tolerated before the consumer stops.
    #[arg(long)]
    pub max_miss: Option<u32>,

    /// Whether producer and consumer share one connection.
    #[arg(short, long, value_enum)]
    pub topology: Option<Topology>,

    /// Reject shared poll timeouts that reach the producer interval.
    #[arg(long)]
    pub strict: bool,
}

impl QueueArgs {
    fn apply(&self, mut config: QueueConfig) -> QueueConfig {
        if let Some(queue) = &self.queue {
            config.queue_name = queue.clone();
        }
        if let Some(count) = self.count {
            config.count = count;
        }
        if let Some(ms) = self.interval_ms {
            config.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.poll_timeout_ms {
            config.poll_timeout = Some(PollTimeout::from_millis(ms));
        }
        if let Some(ms) = self.backoff_ms {
            config.backoff_delay = Duration::from_millis(ms);
        }
        if let Some(max_miss) = self.max_miss {
            config.max_miss = max_miss;
        }
        if let Some(topology) = self.topology {
            config.topology = topology;
        }
        if self.strict {
            config.strict_topology = true;
        }
        config
    }
}

/// Arguments for `blockq run`.
#[derive(clap::Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Output a JSON summary instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `blockq produce`.
#[derive(clap::Args, Debug)]
pub struct ProduceArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Text placed before the counter in each label.
    #[arg(long, default_value = "Item")]
    pub prefix: String,

    /// Output a JSON summary instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `blockq consume`.
#[derive(clap::Args, Debug)]
pub struct ConsumeArgs {
    #[command(flatten)]
    pub queue: QueueArgs,

    /// Stop after handling this many items.
    #[arg(long)]
    pub max_items: Option<u64>,

    /// Output a JSON summary instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `blockq list-demo`.
#[derive(clap::Args, Debug)]
pub struct ListDemoArgs {
    /// List to seed; its previous content is deleted.
    #[arg(short, long, default_value = DEFAULT_LIST_KEY)]
    pub key: String,

    /// Number of tasks to push.
    #[arg(short = 'n', long, default_value = "10")]
    pub count: u64,
}

/// Arguments for `blockq kv`.
#[derive(clap::Args, Debug)]
pub struct KvArgs {
    /// Key to set.
    #[arg(short, long, default_value = DEFAULT_KV_KEY)]
    pub key: String,

    /// Value to store.
    #[arg(default_value = "hello redis from blockq")]
    pub value: String,
}

/// Arguments for `blockq cache`.
#[derive(clap::Args, Debug)]
pub struct CacheArgs {
    /// JSON array of records, each with a numeric `id`.
    #[arg(short, long)]
    pub source: PathBuf,

    /// Record ids to look up, in order. Repeat an id to see a cache hit.
    #[arg(required = true)]
    pub ids: Vec<u64>,

    /// Seconds a cached record lives; non-positive values use 60.
    #[arg(long, default_value = "60", allow_negative_numbers = true)]
    pub ttl_secs: i64,

    /// Delete cached copies of the ids before looking them up.
    #[arg(long)]
    pub fresh: bool,
}

/// Options that apply to every command.
#[derive(Debug, Clone)]
struct GlobalOptions {
    redis_url: Option<String>,
    memory: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the blockq CLI. A store transport
/// failure is returned as an error, so the process exits non-zero.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if cli.metrics {
        init_metrics().context("Failed to initialize metrics")?;
    }

    let global = GlobalOptions {
        redis_url: cli.redis_url,
        memory: cli.memory,
    };

    match cli.command {
        Commands::Run(args) => run_queue_command(args, &global).await?,
        Commands::Produce(args) => run_produce_command(args, &global).await?,
        Commands::Consume(args) => run_consume_command(args, &global).await?,
        Commands::ListDemo(args) => run_list_demo_command(args, &global).await?,
        Commands::Kv(args) => run_kv_command(args, &global).await?,
        Commands::Cache(args) => run_cache_command(args, &global).await?,
    }

    if cli.metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Environment configuration with CLI overrides applied.
fn read_config(global: &GlobalOptions, args: &QueueArgs) -> anyhow::Result<QueueConfig> {
    let mut config = QueueConfig::read_env().context("Invalid BLOCKQ_* environment")?;
    if let Some(url) = &global.redis_url {
        config.redis_url = url.clone();
    }
    Ok(args.apply(config))
}

/// Like [`read_config`], then validated for a producer/consumer pair.
fn load_config(global: &GlobalOptions, args: &QueueArgs) -> anyhow::Result<QueueConfig> {
    let config = read_config(global, args)?;
    config.validate()?;
    Ok(config)
}

/// Fails for commands whose items would vanish with an in-process store.
fn reject_memory_store(global: &GlobalOptions, command: &str) -> anyhow::Result<()> {
    if global.memory {
        anyhow::bail!(
            "`{}` cannot use --memory: the in-process store is dropped when the command exits. \
             Use `blockq run --memory` to produce and consume in one process",
            command
        );
    }
    Ok(())
}

fn redis_url(global: &GlobalOptions) -> anyhow::Result<String> {
    match &global.redis_url {
        Some(url) => Ok(url.clone()),
        None => Ok(QueueConfig::read_env()?.redis_url),
    }
}

async fn connect_redis(redis_url: &str) -> anyhow::Result<RedisStore> {
    RedisStore::connect(redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", redis_url))
}

/// Raises the returned signal on Ctrl+C.
fn install_stop_handler() -> StopSignal {
    let handle = StopHandle::new();
    let signal = handle.signal();

    tokio::spawn(async move {
        while let Ok(()) = tokio::signal::ctrl_c().await {
            if handle.is_stopped() {
                warn!("Received second Ctrl+C, exiting");
                std::process::exit(130);
            }
            info!("Received Ctrl+C, stopping");
            handle.stop();
        }
    });

    signal
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ============================================================================
// Queue commands
// ============================================================================

#[derive(Debug, Serialize)]
struct ProduceSummary {
    queue: String,
    pushed: u64,
    stopped_early: bool,
}

impl From<&ProduceReport> for ProduceSummary {
    fn from(report: &ProduceReport) -> Self {
        Self {
            queue: report.queue.clone(),
            pushed: report.pushed,
            stopped_early: report.stopped_early,
        }
    }
}

#[derive(Debug, Serialize)]
struct ConsumeSummary {
    queue: String,
    outcome: String,
    items: u64,
    misses: u64,
    polls: u64,
}

impl From<&ConsumeReport> for ConsumeSummary {
    fn from(report: &ConsumeReport) -> Self {
        Self {
            queue: report.queue.clone(),
            outcome: report.outcome.to_string(),
            items: report.items,
            misses: report.misses,
            polls: report.polls,
        }
    }
}

#[derive(Debug, Serialize)]
struct RunSummary {
    topology: String,
    poll_timeout: String,
    complete: bool,
    producer: ProduceSummary,
    consumer: ConsumeSummary,
}

impl From<&RunReport> for RunSummary {
    fn from(report: &RunReport) -> Self {
        Self {
            topology: report.topology.to_string(),
            poll_timeout: report.poll_timeout.to_string(),
            complete: report.is_complete(),
            producer: ProduceSummary::from(&report.produced),
            consumer: ConsumeSummary::from(&report.consumed),
        }
    }
}

async fn run_queue_command(args: RunArgs, global: &GlobalOptions) -> anyhow::Result<()> {
    let config = load_config(global, &args.queue)?;
    let runner = Runner::new(config.clone()).with_stop_signal(install_stop_handler());

    let report = if global.memory {
        let server = MemoryServer::new();
        runner
            .run(Connections::open_memory(&server, config.topology))
            .await?
    } else {
        let connections = Connections::open_redis(&config.redis_url, config.topology)
            .await
            .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
        runner.run(connections).await?
    };

    let summary = RunSummary::from(&report);
    if args.json {
        return print_json(&summary);
    }

    println!(
        "{} topology, poll timeout {}: produced {}, consumed {} ({} misses, {})",
        summary.topology,
        summary.poll_timeout,
        summary.producer.pushed,
        summary.consumer.items,
        summary.consumer.misses,
        summary.consumer.outcome
    );
    if !summary.complete {
        warn!(
            produced = summary.producer.pushed,
            consumed = summary.consumer.items,
            "Not every produced item was consumed"
        );
    }
    Ok(())
}

async fn produce_on<S>(store: S, config: &QueueConfig, prefix: &str) -> anyhow::Result<ProduceReport>
where
    S: ListStore + Clone,
{
    let producer_config = config.producer_config().with_label_prefix(prefix);
    let report = Producer::new(store.clone(), config.queue_name.clone(), producer_config)
        .with_stop_signal(install_stop_handler())
        .run()
        .await?;

    let depth = store.len(&config.queue_name).await?;
    MetricsCollector::new().update_queue_depth(&config.queue_name, depth);
    info!(queue = %config.queue_name, depth, "Queue depth after producing");

    Ok(report)
}

async fn run_produce_command(args: ProduceArgs, global: &GlobalOptions) -> anyhow::Result<()> {
    reject_memory_store(global, "produce")?;
    let config = load_config(global, &args.queue)?;

    let store = connect_redis(&config.redis_url).await?;
    let report = produce_on(store, &config, &args.prefix).await?;

    let summary = ProduceSummary::from(&report);
    if args.json {
        return print_json(&summary);
    }
    println!("Pushed {} items to '{}'", summary.pushed, summary.queue);
    Ok(())
}

/// Consumer settings for a standalone consumer.
///
/// A standalone consumer owns its connection, so the topology policy does not
/// apply and an indefinite wait is allowed. Without a configured timeout it
/// uses the consumer default rather than waiting forever.
fn standalone_consumer_config(
    config: &QueueConfig,
    max_items: Option<u64>,
) -> Result<ConsumerConfig, ConfigError> {
    if config.queue_name.is_empty() {
        return Err(ConfigError::ValidationFailed(
            "queue_name cannot be empty".to_string(),
        ));
    }

    let poll_timeout = config
        .poll_timeout
        .unwrap_or(ConsumerConfig::default().poll_timeout);
    let consumer_config = config.consumer_config(poll_timeout);
    let consumer_config = match max_items {
        Some(max) => consumer_config.with_max_items(max),
        None => consumer_config,
    };

    consumer_config.validate()?;
    Ok(consumer_config)
}

async fn consume_on<S: ListStore>(
    store: S,
    config: &QueueConfig,
    consumer_config: ConsumerConfig,
) -> anyhow::Result<ConsumeReport> {
    let report = Consumer::new(store, config.queue_name.clone(), consumer_config)
        .with_stop_signal(install_stop_handler())
        .run()
        .await?;
    Ok(report)
}

async fn run_consume_command(args: ConsumeArgs, global: &GlobalOptions) -> anyhow::Result<()> {
    reject_memory_store(global, "consume")?;
    let config = read_config(global, &args.queue)?;
    let consumer_config = standalone_consumer_config(&config, args.max_items)?;

    let store = connect_redis(&config.redis_url).await?;
    let report = consume_on(store, &config, consumer_config).await?;

    let summary = ConsumeSummary::from(&report);
    if args.json {
        return print_json(&summary);
    }
    println!(
        "Consumed {} items from '{}' in {} polls ({} misses, {})",
        summary.items, summary.queue, summary.polls, summary.misses, summary.outcome
    );
    Ok(())
}

// ============================================================================
// Store helpers
// ============================================================================

async fn list_demo_on<S: ListStore>(store: S, args: &ListDemoArgs) -> anyhow::Result<()> {
    list::seed(&store, &args.key, args.count).await?;
    let ends = list::take_oldest_and_newest(&store, &args.key).await?;

    let show = |item: Option<Item>| item.map_or_else(|| "-".to_string(), Item::into_inner);
    println!("oldest '{}' newest '{}'", show(ends.oldest), show(ends.newest));

    let remaining = store.len(&args.key).await?;
    MetricsCollector::new().update_queue_depth(&args.key, remaining);
    Ok(())
}

async fn run_list_demo_command(args: ListDemoArgs, global: &GlobalOptions) -> anyhow::Result<()> {
    if global.memory {
        list_demo_on(MemoryStore::new(), &args).await
    } else {
        list_demo_on(connect_redis(&redis_url(global)?).await?, &args).await
    }
}

async fn kv_on<S: ValueStore>(store: S, args: &KvArgs) -> anyhow::Result<()> {
    store.set(&args.key, &args.value).await?;
    let value = store.get(&args.key).await?;
    println!("{} = {}", args.key, value.as_deref().unwrap_or("(nil)"));
    Ok(())
}

async fn run_kv_command(args: KvArgs, global: &GlobalOptions) -> anyhow::Result<()> {
    if global.memory {
        kv_on(MemoryStore::new(), &args).await
    } else {
        kv_on(connect_redis(&redis_url(global)?).await?, &args).await
    }
}

async fn cache_on<S>(store: S, args: &CacheArgs) -> anyhow::Result<()>
where
    S: RecordStore + ListStore,
{
    let source = JsonRecordSource::load(&args.source)
        .await
        .with_context(|| format!("Failed to load records from {}", args.source.display()))?;
    let cache = RecordCache::new(store, source).with_ttl_secs(args.ttl_secs);

    if args.fresh {
        for id in &args.ids {
            cache.store().delete_key(&cache.key(*id)).await?;
        }
    }

    for id in &args.ids {
        match cache.get(*id).await? {
            Some(CacheLookup { record, origin }) => {
                println!("{} ({}): {}", cache.key(*id), origin, serde_json::to_string(&record)?);
            }
            None => println!("{}: not found", cache.key(*id)),
        }
    }
    Ok(())
}

async fn run_cache_command(args: CacheArgs, global: &GlobalOptions) -> anyhow::Result<()> {
    if global.memory {
        cache_on(MemoryStore::new(), &args).await
    } else {
        cache_on(connect_redis(&redis_url(global)?).await?, &args).await
    }
}
