use std::process::ExitCode;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use ctat_data_manager::app::{App, GenomeLibRequest, ProgressSink, RunResult};
use ctat_data_manager::bundle::{CentrifugeRequest, LncrnaRequest};
use ctat_data_manager::command::SystemRunner;
use ctat_data_manager::config::ConfigLoader;
use ctat_data_manager::destination::FsDiskSpace;
use ctat_data_manager::error::CtatError;
use ctat_data_manager::fetch::HttpFetcher;
use ctat_data_manager::output::{JsonOutput, LogSink};

#[derive(Parser)]
#[command(name = "ctat-dm")]
#[command(about = "Download, build and register CTAT reference libraries for Galaxy")]
#[command(version, author)]
struct Cli {
    /// Settings file, defaults to ./ctat-dm.json or the user config dir.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print the data table record to stdout as well.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download, extract and build a CTAT genome resource library")]
    GenomeLib(GenomeLibArgs),
    #[command(about = "Download and register a centrifuge index")]
    Centrifuge(CentrifugeArgs),
    #[command(about = "Download and register the CTAT lncRNA annotations")]
    Lncrna(LncrnaArgs),
}

#[derive(Args)]
struct GenomeLibArgs {
    #[arg(long)]
    download_url: Option<String>,
    #[arg(long)]
    download_location: Option<Utf8PathBuf>,
    #[arg(long)]
    source_location: Option<Utf8PathBuf>,
    #[arg(long)]
    build_location: Option<Utf8PathBuf>,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    gmap_build: bool,
    #[arg(long)]
    force_gmap_build: bool,
    #[arg(long)]
    mutation_url: Option<String>,
    #[arg(long)]
    new_mutation_download: bool,
    #[arg(long)]
    new_mutation_integration: bool,
    #[arg(long)]
    cosmic_location: Option<Utf8PathBuf>,
    #[arg(long)]
    cravat_tissues: Option<Utf8PathBuf>,
    #[arg(long)]
    new_archive_download: bool,
    #[arg(long)]
    keep_archive: bool,
    #[arg(long)]
    new_library_build: bool,
    /// Galaxy output file receiving the data table record.
    #[arg(long)]
    output: Utf8PathBuf,
}

#[derive(Args)]
struct CentrifugeArgs {
    #[arg(long)]
    download_url: Option<String>,
    #[arg(long)]
    destination: Utf8PathBuf,
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    force_download: bool,
    #[arg(long)]
    no_download: bool,
    #[arg(long)]
    output: Utf8PathBuf,
}

#[derive(Args)]
struct LncrnaArgs {
    #[arg(long)]
    download_url: Option<String>,
    #[arg(long)]
    destination: Utf8PathBuf,
    #[arg(long)]
    force_download: bool,
    #[arg(long)]
    no_download: bool,
    #[arg(long)]
    output: Utf8PathBuf,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(ctat) = report.downcast_ref::<CtatError>() {
            return ExitCode::from(map_exit_code(ctat));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &CtatError) -> u8 {
    match error {
        CtatError::Config(_)
        | CtatError::ConfigRead(_)
        | CtatError::ConfigParse(_)
        | CtatError::Lookup(_)
        | CtatError::NotADirectory(_) => 2,
        CtatError::Http(_)
        | CtatError::HttpStatus { .. }
        | CtatError::ExternalCommand { .. }
        | CtatError::MissingTool(_) => 3,
        CtatError::Integrity(_) => 4,
        CtatError::InsufficientSpace { .. } | CtatError::NotWritable { .. } => 5,
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
    let settings = ConfigLoader::resolve(cli.config.as_deref())?;
    let fetcher = HttpFetcher::new(&settings)?;
    let app = App::new(settings, fetcher, SystemRunner, FsDiskSpace);
    let sink: &dyn ProgressSink = if cli.json { &JsonOutput } else { &LogSink };

    let (result, output) = match cli.command {
        Commands::GenomeLib(args) => {
            let output = args.output.clone();
            (app.genome_lib(&genome_lib_request(args), sink)?, output)
        }
        Commands::Centrifuge(args) => {
            let request = CentrifugeRequest {
                download_url: args.download_url,
                destination: args.destination,
                display_name: args.display_name,
                force_download: args.force_download,
                no_download: args.no_download,
            };
            (app.centrifuge(&request, sink)?, args.output)
        }
        Commands::Lncrna(args) => {
            let request = LncrnaRequest {
                download_url: args.download_url,
                destination: args.destination,
                force_download: args.force_download,
                no_download: args.no_download,
            };
            (app.lncrna(&request, sink)?, args.output)
        }
    };

    finish(&result, &output, cli.json)
}

fn genome_lib_request(args: GenomeLibArgs) -> GenomeLibRequest {
    GenomeLibRequest {
        download_url: args.download_url,
        download_location: args.download_location,
        source_location: args.source_location,
        build_location: args.build_location,
        display_name: args.display_name,
        gmap_build: args.gmap_build,
        force_gmap_build: args.force_gmap_build,
        mutation_url: args.mutation_url,
        new_mutation_download: args.new_mutation_download,
        new_mutation_integration: args.new_mutation_integration,
        cosmic_location: args.cosmic_location,
        cravat_tissues: args.cravat_tissues,
        new_archive_download: args.new_archive_download,
        keep_archive: args.keep_archive,
        new_library_build: args.new_library_build,
    }
}

fn finish(result: &RunResult, output: &Utf8Path, json: bool) -> miette::Result<()> {
    result.record.write_to(output)?;
    for stage in &result.stages {
        tracing::info!(stage = %stage.stage, target = %stage.target, action = ?stage.action, "stage");
    }
    if json {
        JsonOutput::print_record(&result.record).into_diagnostic()?;
    }
    Ok(())
}
