use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use regex::Regex;
use tokio::sync::broadcast;

use ktail::client::KafkaClient;
use ktail::codec::Encoding;
use ktail::consume::{ConsumerConfig, start_consume};
use ktail::group::{GroupConfig, ResetTarget, inspect_groups};
use ktail::sink::PrintSink;

#[derive(Parser)]
#[command(name = "ktail", version, about = "Kafka offset-range consumer and consumer-group inspector")]
struct Cli {
    /// Kafka brokers, comma separated host:port list
    #[arg(
        short,
        long,
        global = true,
        env = "KTAIL_BROKERS",
        default_value = "localhost:9092"
    )]
    brokers: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume messages by partition and offset range
    Consume(ConsumeArgs),
    /// List consumer groups, their offsets and lag, or reset a group's offset
    Group(GroupArgs),
}

#[derive(Args)]
struct ConsumeArgs {
    #[arg(short, long, env = "KTAIL_TOPIC")]
    topic: String,

    /// Consumer group for marking offsets; offsets are committed only when set
    #[arg(short, long)]
    group: Option<String>,

    /// What to read, by partition and offset range (e.g. "0=4:,2=1:10,6")
    #[arg(short, long, default_value = "newest")]
    offsets: String,

    /// Stop a partition after this long without a message (e.g. "30s")
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    #[arg(long, value_enum, default_value_t = Encoding::String)]
    key_encoding: Encoding,

    #[arg(long, value_enum, default_value_t = Encoding::String)]
    value_encoding: Encoding,

    /// Only print records whose value matches this regex
    #[arg(long)]
    grep: Option<String>,

    /// Stop after printing this many records
    #[arg(short = 'n', long)]
    max: Option<u64>,
}

#[derive(Args)]
struct GroupArgs {
    /// Inspect only this group; all groups are discovered when unset
    #[arg(short, long)]
    group: Option<String>,

    /// Inspect only this topic
    #[arg(short, long)]
    topic: Option<String>,

    /// Filter discovered groups by regex
    #[arg(long)]
    filter_groups: Option<String>,

    /// Filter topics by regex
    #[arg(long)]
    filter_topics: Option<String>,

    /// Comma separated partitions to limit to, or "all"
    #[arg(long, default_value = "all")]
    partitions: String,

    /// Target offset to reset the group to (newest, oldest or a specific offset)
    #[arg(long)]
    reset: Option<String>,

    /// Fetch committed offsets and lag (disable for a fast name-only listing)
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fetch_offsets: bool,

    /// Include partitions without a committed offset
    #[arg(long)]
    all_offsets: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Consume(args) => run_consume(&cli.brokers, args).await,
        Command::Group(args) => run_group(&cli.brokers, args).await,
    }
}

async fn run_consume(brokers: &str, args: ConsumeArgs) -> Result<()> {
    let client = KafkaClient::new(
        brokers,
        args.group.as_deref(),
        &format!("ktail-consume-{}", std::process::id()),
    )?;

    let grep = args
        .grep
        .map(|g| Regex::new(&g))
        .transpose()
        .context("invalid grep regex")?;
    let sink = PrintSink::new(args.key_encoding, args.value_encoding, grep, args.max);

    let (quit, _) = broadcast::channel(1);
    let interrupt = quit.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = interrupt.send(());
        }
    });

    let config = ConsumerConfig {
        topic: args.topic,
        group: args.group,
        offsets: args.offsets,
        timeout: args.timeout,
    };
    let summary = start_consume(Arc::new(client), config, Box::new(sink), quit).await?;
    info!(
        "consumed {} records across {} partitions ({} errors)",
        summary.delivered,
        summary.outcomes.len(),
        summary.errors
    );
    Ok(())
}

async fn run_group(brokers: &str, args: GroupArgs) -> Result<()> {
    let client = KafkaClient::new(
        brokers,
        args.group.as_deref(),
        &format!("ktail-group-{}", std::process::id()),
    )?;

    let config = GroupConfig {
        group: args.group,
        topic: args.topic,
        filter_groups: compile_filter(args.filter_groups, "groups")?,
        filter_topics: compile_filter(args.filter_topics, "topics")?,
        partitions: parse_partition_list(&args.partitions)?,
        reset: args.reset.map(|s| s.parse::<ResetTarget>()).transpose()?,
        fetch_offsets: args.fetch_offsets,
        all_offsets: args.all_offsets,
    };

    let infos = inspect_groups(Arc::new(client), config).await?;
    for group_info in infos {
        println!("{}", serde_json::to_string(&group_info)?);
    }
    Ok(())
}

fn compile_filter(pattern: Option<String>, what: &str) -> Result<Option<Regex>> {
    pattern
        .map(|p| Regex::new(&p))
        .transpose()
        .with_context(|| format!("{what} filter regex invalid"))
}

fn parse_partition_list(s: &str) -> Result<Vec<i32>> {
    if s.is_empty() || s == "all" {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|p| {
            p.trim()
                .parse::<i32>()
                .with_context(|| format!("invalid partition id {p:?}"))
        })
        .collect()
}
