#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use essay_bench::config::{load_dotenv, DataLayout, ModelRoster, Settings};
use essay_bench::gateway::TracingUsageSink;
use essay_bench::ledger::PairSchema;
use essay_bench::pipeline::{pair_stats, render_reports, Benchmark};
use essay_bench::report::MarkdownReportSink;
use essay_bench::repair::{DEFAULT_MAX_ROUNDS, DEFAULT_THROTTLE};
use essay_bench::supplier::EssayPromptGenerator;

#[derive(Parser)]
#[command(name = "essay-bench", version, about = "Essay-writing benchmark across model sizes")]
struct Cli {
    /// Root directory for prompts, responses, evaluations and figures
    #[arg(long, global = true, env = "ESSAY_BENCH_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full benchmark: collect, score, repair, compare, report
    Run {
        /// Ignore a complete cached table; rows already on disk are kept
        #[arg(long)]
        force: bool,
    },
    /// Collect one model's responses
    Collect {
        #[arg(long)]
        model: String,
        /// Ignore a complete cached table; rows already on disk are kept
        #[arg(long)]
        force: bool,
    },
    /// Score one model's responses with the judge
    Score {
        #[arg(long)]
        model: String,
        /// Ignore a complete cached table; rows already on disk are kept
        #[arg(long)]
        force: bool,
    },
    /// Re-generate and re-score rows without a valid score
    Repair {
        #[arg(long)]
        model: String,
        #[arg(long, default_value_t = DEFAULT_MAX_ROUNDS)]
        max_rounds: u32,
        /// Pause between rounds, in seconds
        #[arg(long, default_value_t = DEFAULT_THROTTLE.as_secs())]
        throttle_secs: u64,
    },
    /// Pairwise comparison of two models
    Compare {
        #[arg(long)]
        a: String,
        #[arg(long)]
        b: String,
        /// Ignore a complete cached table; rows already on disk are kept
        #[arg(long)]
        force: bool,
    },
    /// Print win/loss statistics for a compared pair
    Stats {
        #[arg(long)]
        a: String,
        #[arg(long)]
        b: String,
    },
    /// Render distribution and summary charts for every pair
    Report,
    /// Generate essay prompts with the judge model
    GeneratePrompts {
        #[arg(long, default_value_t = 200)]
        count: usize,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve a pair against the roster so labels use canonical casing.
fn pair(roster: &ModelRoster, a: &str, b: &str) -> Result<PairSchema, Box<dyn std::error::Error>> {
    let a = roster.get(a)?.label;
    let b = roster.get(b)?.label;
    if a == b {
        return Err("--a and --b must name different models".into());
    }
    Ok(PairSchema::new(a, b))
}

#[tokio::main]
async fn main() -> ExitCode {
    load_dotenv();
    init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = cli.data_dir;
    let settings = || Settings::from_env(&data_dir);
    let usage = Arc::new(TracingUsageSink);

    match cli.command {
        Commands::Run { force } => {
            let summary = Benchmark::from_settings(&settings()?, usage)?.run(force).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Collect { model, force } => {
            let bench = Benchmark::from_settings(&settings()?, usage)?;
            let prompts = bench.load_prompts()?;
            let rows = bench.collect(&model, &prompts, force).await?;
            let answered = rows.iter().filter(|r| r.response.is_some()).count();
            println!("{model}: {answered}/{} prompts answered", prompts.len());
        }
        Commands::Score { model, force } => {
            let bench = Benchmark::from_settings(&settings()?, usage)?;
            let scored = bench.score(&model, force).await?;
            println!(
                "{model}: {}/{} valid scores ({:?})",
                scored.valid_count(),
                scored.rows.len(),
                scored.outcome
            );
        }
        Commands::Repair {
            model,
            max_rounds,
            throttle_secs,
        } => {
            let bench = Benchmark::from_settings(&settings()?, usage)?
                .with_repair(max_rounds, Duration::from_secs(throttle_secs));
            let prompts = bench.load_prompts()?;
            let report = bench.repair(&model, &prompts).await?;
            println!(
                "{model}: {} rounds, {} repaired, {} of {} still invalid",
                report.rounds, report.repaired, report.remaining_invalid, report.total
            );
        }
        Commands::Compare { a, b, force } => {
            let settings = settings()?;
            let pair = pair(&settings.roster, &a, &b)?;
            let bench = Benchmark::from_settings(&settings, usage)?;
            let compared = bench.compare(&pair, force).await?;
            println!(
                "{} vs {}: {}/{} valid comparisons ({:?})",
                pair.a,
                pair.b,
                compared.valid_count(),
                compared.rows.len(),
                compared.outcome
            );
        }
        // Stats and reports only read ledgers, so they need no API keys.
        Commands::Stats { a, b } => {
            let pair = pair(&ModelRoster::default(), &a, &b)?;
            let stats = pair_stats(&DataLayout::new(&data_dir), &pair)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Report => {
            let layout = DataLayout::new(&data_dir);
            let pairs = PairSchema::all_pairs(&ModelRoster::default().labels());
            let sink = MarkdownReportSink::new(layout.figures_dir());
            let stats = render_reports(&layout, &pairs, &sink)?;
            println!(
                "rendered {} pair reports to {}",
                stats.len(),
                layout.figures_dir().display()
            );
        }
        Commands::GeneratePrompts { count } => {
            let settings = settings()?;
            let gateway = Arc::new(settings.judge_gateway(usage)?);
            let generator = EssayPromptGenerator::new(
                gateway,
                settings.roster.judge.clone(),
                settings.layout.generated_prompts_path(),
            );
            let prompts = generator.generate(count).await?;
            println!(
                "generated {} prompts into {}",
                prompts.len(),
                generator.output_path().display()
            );
        }
    }
    Ok(())
}
