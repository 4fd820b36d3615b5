use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use occurrence_rarity::app::{App, LogProgress, ProgressSink, RunSummary, gbif_client, run_cells};
use occurrence_rarity::config::{ConfigLoader, Overrides, ResolvedConfig};
use occurrence_rarity::domain::{ExhaustedPolicy, YearRange};
use occurrence_rarity::error::RarityError;
use occurrence_rarity::gbif::GbifApi;
use occurrence_rarity::output::{JsonOutput, OutputMode, TextOutput};
use occurrence_rarity::reference::ReferenceMap;

#[derive(Parser)]
#[command(name = "rarity")]
#[command(
    about = "Species rarity tables from GBIF occurrence archives and rate-limited GBIF queries"
)]
#[command(version, author)]
struct Cli {
    /// JSON config file (defaults to ./rarity.json when present)
    #[arg(long, global = true)]
    config: Option<Utf8PathBuf>,

    /// Print the run summary as JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Count reference species per geohash cell from an occurrence archive")]
    Cells(CellsArgs),
    #[command(about = "Rank reference species by GBIF occurrence count")]
    Freq(FreqArgs),
    #[command(about = "Rank species within each region by GBIF facet counts")]
    Regions(RegionsArgs),
    #[command(about = "Match a taxonomy checklist against GBIF to build the reference mapping")]
    Seed(SeedArgs),
}

#[derive(Args)]
struct CellsArgs {
    /// Zipped occurrence download (Darwin Core archive)
    archive: Option<Utf8PathBuf>,

    #[arg(long, default_value = "species_seed.csv")]
    reference: Utf8PathBuf,

    #[arg(long, short, default_value = "bird_cell_counts.csv")]
    output: Utf8PathBuf,

    /// Geohash length, 1..=12
    #[arg(long)]
    precision: Option<usize>,

    /// Regex selecting archive entries (default: names ending in occurrence.txt)
    #[arg(long)]
    entry_pattern: Option<String>,

    #[arg(long)]
    delimiter: Option<char>,
}

#[derive(Args, Clone)]
struct RemoteArgs {
    #[arg(long)]
    qps: Option<u32>,

    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    max_attempts: Option<u32>,

    /// Per-call timeout in seconds
    #[arg(long)]
    call_timeout: Option<u64>,

    /// Abort outstanding calls after this many seconds
    #[arg(long)]
    run_timeout: Option<u64>,

    /// Year window, e.g. 2019,2024
    #[arg(long)]
    years: Option<YearRange>,

    #[arg(long)]
    on_exhausted: Option<ExhaustedPolicy>,
}

#[derive(Args)]
struct FreqArgs {
    #[arg(long, default_value = "species_seed.csv")]
    reference: Utf8PathBuf,

    #[arg(long, short, default_value = "species_freq_seed.csv")]
    output: Utf8PathBuf,

    #[command(flatten)]
    remote: RemoteArgs,
}

#[derive(Args)]
struct RegionsArgs {
    #[arg(long, default_value = "species_seed.csv")]
    reference: Utf8PathBuf,

    #[arg(long, short, default_value = "bounty_state.csv")]
    output: Utf8PathBuf,

    /// Region to query; repeat for several (default: US, Canada and Mexico states)
    #[arg(long = "region")]
    regions: Vec<String>,

    /// License filter; repeat for several
    #[arg(long = "license")]
    licenses: Vec<String>,

    #[command(flatten)]
    remote: RemoteArgs,
}

#[derive(Args)]
struct SeedArgs {
    /// Taxonomy checklist CSV
    checklist: Option<Utf8PathBuf>,

    #[arg(long, short, default_value = "species_seed.csv")]
    output: Utf8PathBuf,

    /// Checklist category to keep
    #[arg(long)]
    category: Option<String>,

    #[command(flatten)]
    remote: RemoteArgs,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<RarityError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &RarityError) -> u8 {
    match error {
        RarityError::MissingInput(_) | RarityError::InputNotFound(_) => 2,
        RarityError::ConfigRead(_)
        | RarityError::ConfigParse(_)
        | RarityError::InvalidConfig(_) => 2,
        RarityError::RemoteCallExhausted { .. }
        | RarityError::HttpClient(_)
        | RarityError::Cancelled => 3,
        RarityError::ArchiveCorrupt { .. }
        | RarityError::EntryNotFound { .. }
        | RarityError::MissingColumn { .. }
        | RarityError::ReferenceRead { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Text
    };
    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Text => &LogProgress,
    };

    let Some(command) = cli.command else {
        return Err(RarityError::MissingInput(
            "a command is required (try `rarity --help`)".to_string(),
        )
        .into());
    };

    let summary = match command {
        Commands::Cells(args) => {
            let archive = args
                .archive
                .ok_or_else(|| RarityError::MissingInput("archive path".to_string()))?;
            let overrides = Overrides {
                precision: args.precision,
                entry_pattern: args.entry_pattern,
                delimiter: args.delimiter,
                ..Overrides::default()
            };
            let config = resolve(cli.config.as_ref(), overrides)?;
            run_cells(&config, &archive, &args.reference, &args.output, sink)?
        }
        Commands::Freq(args) => {
            let config = resolve(cli.config.as_ref(), remote_overrides(&args.remote))?;
            let reference = ReferenceMap::load(&args.reference)?;
            remote_app(config)?
                .species_frequency(&reference, &args.output, sink)?
        }
        Commands::Regions(args) => {
            let mut overrides = remote_overrides(&args.remote);
            overrides.regions = (!args.regions.is_empty()).then_some(args.regions);
            overrides.licenses = (!args.licenses.is_empty()).then_some(args.licenses);
            let config = resolve(cli.config.as_ref(), overrides)?;
            let reference = ReferenceMap::load(&args.reference)?;
            remote_app(config)?
                .regional_frequency(&reference, &args.output, sink)?
        }
        Commands::Seed(args) => {
            let checklist = args
                .checklist
                .ok_or_else(|| RarityError::MissingInput("checklist path".to_string()))?;
            let mut overrides = remote_overrides(&args.remote);
            overrides.category = args.category;
            let config = resolve(cli.config.as_ref(), overrides)?;
            remote_app(config)?
                .seed_reference(&checklist, &args.output, sink)?
        }
    };

    print_summary(&summary, output_mode)
}

fn resolve(path: Option<&Utf8PathBuf>, overrides: Overrides) -> miette::Result<ResolvedConfig> {
    Ok(ConfigLoader::resolve(path.map(|p| p.as_path()), overrides)?)
}

fn remote_overrides(args: &RemoteArgs) -> Overrides {
    Overrides {
        qps: args.qps,
        concurrency: args.concurrency,
        max_attempts: args.max_attempts,
        call_timeout_secs: args.call_timeout,
        run_timeout_secs: args.run_timeout,
        years: args.years,
        exhausted_policy: args.on_exhausted,
        ..Overrides::default()
    }
}

fn remote_app(
    config: ResolvedConfig,
) -> miette::Result<App<occurrence_rarity::gbif::GbifConnector, GbifApi>> {
    let client = gbif_client(&config)?;
    let api = GbifApi::new(config.base_url.clone(), config.filters.clone());
    Ok(App::new(config, client, api))
}

fn print_summary(summary: &RunSummary, output_mode: OutputMode) -> miette::Result<()> {
    match output_mode {
        OutputMode::Json => JsonOutput::print_summary(summary).into_diagnostic(),
        OutputMode::Text => TextOutput::print_summary(summary).into_diagnostic(),
    }
}
