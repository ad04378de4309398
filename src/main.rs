//! keiba-dataset CLI
//!
//! Imports race results and builds leakage-free feature tables from them.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keiba_dataset::cli::{self, BuildArgs, Cli, Commands};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keiba_dataset=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Import { inputs } => cli::run_import(inputs, cli.db),
        Commands::ImportPeds { inputs } => cli::run_import_peds(inputs, cli.db),
        Commands::Build {
            output,
            begin,
            end,
            target,
            windows,
            depth,
            drop_nan,
            parallel,
            include_jumps,
            place,
            race_type,
            distance,
            split,
            encoders,
        } => cli::run_build(
            BuildArgs {
                output,
                begin,
                end,
                target,
                windows,
                depth,
                drop_nan,
                parallel,
                include_jumps,
                place,
                race_type,
                distance,
                split,
                encoders,
            },
            cli.db,
        ),
        Commands::Card {
            input,
            encoders,
            model,
            output,
            format,
        } => cli::run_card(input, encoders, model, output, format, cli.db),
    }
}
