//! Workload driver for the S+tree balancing engine.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use stree::{BalanceStatsSnapshot, Item, ItemKind, Key, STree, StreeError, TreeSummary};
use tracing_subscriber::{fmt, EnvFilter};

#[path = "stree/config.rs"]
mod config;

#[derive(Parser, Debug)]
#[command(
    name = "stree",
    version,
    about = "Drive workloads against an in-memory S+tree",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "STREE_CONFIG",
        value_name = "FILE",
        help = "TOML file with a [tree] table of tree options"
    )]
    config: Option<PathBuf>,

    #[command(flatten)]
    layout: LayoutArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for the final report"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
pub struct LayoutArgs {
    #[arg(long, global = true, help = "Override block size (bytes)")]
    pub block_size: Option<usize>,

    #[arg(long, global = true, help = "Override block header size (bytes)")]
    pub block_head_size: Option<usize>,

    #[arg(long, global = true, help = "Cap the number of allocated blocks")]
    pub max_blocks: Option<u64>,

    #[arg(long, global = true, help = "Never split items across nodes")]
    pub no_flow: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert one item per object.
    Fill(FillCmd),
    /// Random mix of inserts, deletes, pastes and cuts.
    Churn(ChurnCmd),
    /// Print the effective tree options as TOML.
    ShowConfig,
}

#[derive(Args, Debug)]
struct FillCmd {
    #[arg(long, default_value_t = 10_000, help = "Number of items to insert")]
    count: u32,

    #[arg(long, value_enum, default_value_t = KindArg::Stat)]
    kind: KindArg,

    #[arg(long, default_value_t = 16, help = "Item body length (bytes)")]
    body: usize,

    #[arg(long, value_enum, default_value_t = Order::Sequential)]
    order: Order,

    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,

    #[arg(long, help = "Check every tree invariant after each operation")]
    verify_each: bool,
}

#[derive(Args, Debug)]
struct ChurnCmd {
    #[arg(long, default_value_t = 50_000, help = "Operations per thread")]
    ops: u64,

    #[arg(long, default_value_t = 4_096, help = "Size of the object id space")]
    objects: u32,

    #[arg(long, default_value_t = 512, help = "Largest body of a new item (bytes)")]
    max_body: usize,

    #[arg(long, default_value_t = 1, help = "Worker threads sharing the tree")]
    threads: usize,

    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Stat,
    Direct,
    Directory,
    Indirect,
}

impl From<KindArg> for ItemKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Stat => ItemKind::StatData,
            KindArg::Direct => ItemKind::Direct,
            KindArg::Directory => ItemKind::Directory,
            KindArg::Indirect => ItemKind::Indirect,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Order {
    Sequential,
    Reverse,
    Random,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Default, Serialize)]
struct Rejections {
    exists: u64,
    not_found: u64,
    invalid: u64,
    no_space: u64,
}

impl Rejections {
    fn note(&mut self, result: stree::Result<stree::BalanceOutcome>) -> stree::Result<()> {
        match result {
            Ok(_) => {}
            Err(StreeError::ItemExists) => self.exists += 1,
            Err(StreeError::NotFound) => self.not_found += 1,
            Err(StreeError::Invalid(_)) => self.invalid += 1,
            Err(StreeError::NoDiskSpace) => self.no_space += 1,
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn absorb(&mut self, other: Rejections) {
        self.exists += other.exists;
        self.not_found += other.not_found;
        self.invalid += other.invalid;
        self.no_space += other.no_space;
    }
}

#[derive(Debug, Serialize)]
struct Report {
    command: &'static str,
    operations: u64,
    elapsed_ms: u128,
    generation: u64,
    lock_contended: u64,
    allocated_blocks: u64,
    rejected: Rejections,
    tree: TreeSummary,
    stats: BalanceStatsSnapshot,
}

fn main() {
    install_tracing_subscriber();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let options = config::load_options(cli.config.as_deref(), &cli.layout)?;
    match cli.command {
        Command::ShowConfig => {
            print!("{}", config::render(&options)?);
            Ok(())
        }
        Command::Fill(cmd) => {
            let tree = STree::new(options)?;
            let report = fill(&tree, &cmd)?;
            emit(cli.format, &report)
        }
        Command::Churn(cmd) => {
            let tree = Arc::new(STree::new(options)?);
            let report = churn(&tree, &cmd)?;
            emit(cli.format, &report)
        }
    }
}

fn fill(tree: &STree, cmd: &FillCmd) -> Result<Report, Box<dyn Error>> {
    let kind = ItemKind::from(cmd.kind);
    let body = match kind.unit_len() {
        Some(unit) => (cmd.body / unit).max(1) * unit,
        None => cmd.body,
    };
    let mut objects: Vec<u32> = (0..cmd.count).collect();
    match cmd.order {
        Order::Sequential => {}
        Order::Reverse => objects.reverse(),
        Order::Random => objects.shuffle(&mut ChaCha8Rng::seed_from_u64(cmd.seed)),
    }

    let started = Instant::now();
    let mut rejected = Rejections::default();
    for &object in &objects {
        let item = Item::new(Key::new(1, object, 0, kind), vec![object as u8; body]);
        rejected.note(tree.insert_item(item))?;
        if cmd.verify_each {
            tree.verify()?;
        }
    }
    report(tree, "fill", objects.len() as u64, started, rejected)
}

fn churn(tree: &Arc<STree>, cmd: &ChurnCmd) -> Result<Report, Box<dyn Error>> {
    let max_body = cmd.max_body.clamp(1, tree.options().max_item_len());
    let threads = cmd.threads.max(1);
    let started = Instant::now();
    let results: Vec<stree::Result<Rejections>> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|worker| {
                let tree = Arc::clone(tree);
                let seed = cmd.seed.wrapping_add(worker as u64);
                scope.spawn(move || churn_worker(&tree, seed, cmd.ops, cmd.objects, max_body))
            })
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap_or(Err(StreeError::Corruption("worker panicked"))))
            .collect()
    });
    let mut rejected = Rejections::default();
    for result in results {
        rejected.absorb(result?);
    }
    report(tree, "churn", cmd.ops * threads as u64, started, rejected)
}

fn churn_worker(
    tree: &STree,
    seed: u64,
    ops: u64,
    objects: u32,
    max_body: usize,
) -> stree::Result<Rejections> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut rejected = Rejections::default();
    for _ in 0..ops {
        let key = Key::new(1, rng.gen_range(0..objects.max(1)), 0, ItemKind::Direct);
        let result = match rng.gen_range(0..8) {
            0..=3 => {
                let len = rng.gen_range(1..=max_body);
                tree.insert_item(Item::new(key, vec![key.object_id as u8; len]))
            }
            4 | 5 => tree.delete_item(&key),
            6 => {
                let len = rng.gen_range(1..=32);
                tree.paste_into_item(&key, 0, &vec![0xAB; len])
            }
            _ => tree.cut_from_item(&key, 0, rng.gen_range(1..=32)),
        };
        rejected.note(result)?;
    }
    Ok(rejected)
}

fn report(
    tree: &STree,
    command: &'static str,
    operations: u64,
    started: Instant,
    rejected: Rejections,
) -> Result<Report, Box<dyn Error>> {
    let elapsed_ms = started.elapsed().as_millis();
    let summary = tree.verify()?;
    tree.stats().emit_tracing();
    let lock = tree.lock_snapshot();
    Ok(Report {
        command,
        operations,
        elapsed_ms,
        generation: lock.generation,
        lock_contended: lock.contended,
        allocated_blocks: tree.allocated_blocks(),
        rejected,
        tree: summary,
        stats: tree.stats().snapshot(),
    })
}

fn emit(format: OutputFormat, report: &Report) -> Result<(), Box<dyn Error>> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(report)?;
            println!("{json}");
        }
        OutputFormat::Text => print_report_text(report),
    }
    Ok(())
}

fn print_report_text(report: &Report) {
    println!(
        "{}: {} ops in {} ms (generation={} contended={})",
        report.command,
        report.operations,
        report.elapsed_ms,
        report.generation,
        report.lock_contended
    );
    println!(
        "Tree: height={} nodes={} leaves={} items={} used_bytes={} allocated_blocks={}",
        report.tree.height,
        report.tree.nodes,
        report.tree.leaves,
        report.tree.items,
        report.tree.used_bytes,
        report.allocated_blocks
    );
    let stats = &report.stats;
    println!(
        "Balance: in_place={} leaf_splits={} internal_splits={} leaf_merges={} internal_merges={}",
        stats.in_place_edits,
        stats.leaf_splits,
        stats.internal_splits,
        stats.leaf_merges,
        stats.internal_merges
    );
    println!(
        "Shifts: left={} right={} flow={} root_grows={} root_collapses={} restarts={}",
        stats.left_shifts,
        stats.right_shifts,
        stats.flow_shifts,
        stats.root_grows,
        stats.root_collapses,
        stats.restarts
    );
    println!(
        "Rejected: exists={} not_found={} invalid={} no_space={}",
        report.rejected.exists,
        report.rejected.not_found,
        report.rejected.invalid,
        report.rejected.no_space
    );
}
