mod adjudicator;
mod aggregator;
mod bridge;
mod cli;
mod db;
mod error;
mod fmt;
mod importer;
mod invocation;
mod labels;
mod mapper;
mod models;
mod numeric;
mod overrides;
mod package;
mod pipeline;
mod ranker;
mod remote;
mod report;
mod settings;
mod storage;
mod workbook;
mod writer;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, OverridesCommands};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let settings = cli::settings_for(cli.data_dir.as_deref());

    let result = match cli.command {
        Commands::Init => cli::init::run(settings),
        Commands::Process {
            source,
            template,
            output,
            bucket,
            table,
        } => cli::process::run(settings, source, template, output, bucket, table),
        Commands::InferMapping {
            csv,
            template,
            dataset,
            only_unmapped,
        } => cli::discover::run(settings, csv, template, dataset, only_unmapped),
        Commands::Invoke { payload } => cli::invoke::run(settings, &payload),
        Commands::Overrides { command } => match command {
            OverridesCommands::List { dataset } => cli::overrides::list(&settings, dataset),
            OverridesCommands::Set {
                source,
                target,
                dataset,
            } => cli::overrides::set(&settings, &source, &target, dataset),
        },
        Commands::Serve => cli::serve::run(settings),
        Commands::Status => cli::status::run(&settings),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
