//! CLI commands for keiba-dataset.
//!
//! `import` loads results into the store, `import-peds` loads pedigrees,
//! `build` writes the training feature table, `card` builds (and optionally
//! scores) features for a race card.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::dataset::{split_by_date, BuildReport, Dataset, DatasetAssembler, Target};
use crate::features::encoder::Encoders;
use crate::features::window::Window;
use crate::model::{score, OnnxPredictor};
use crate::storage::{pedigrees_from_csv, records_from_csv, RaceRepository, ResultFilter};
use crate::types::parse_date;

#[derive(Parser)]
#[command(name = "keiba-dataset")]
#[command(version, about = "Leakage-free feature tables for horse racing prediction", long_about = None)]
pub struct Cli {
    /// SQLite database path override
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load results CSV files into the database
    Import {
        /// Results CSV files (one row per runner)
        #[arg(value_name = "FILE", required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Load pedigree CSV files (horse_id, father, mother, ...) into the database
    ImportPeds {
        #[arg(value_name = "FILE", required = true)]
        inputs: Vec<PathBuf>,
    },

    /// Build the training feature table from stored results
    Build {
        /// Output file (.parquet or .csv)
        #[arg(short, long, default_value = "data/features/train.parquet")]
        output: PathBuf,

        /// First race date (YYYY-MM-DD)
        #[arg(long)]
        begin: Option<String>,

        /// Last race date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Label: binary, multiclass or regression
        #[arg(short, long)]
        target: Option<String>,

        /// Horse lookback windows, e.g. 5,9,all
        #[arg(short, long, value_delimiter = ',')]
        windows: Option<Vec<String>>,

        /// Number of "last race" positional blocks
        #[arg(long)]
        depth: Option<usize>,

        /// Drop rows with any missing feature
        #[arg(long)]
        drop_nan: bool,

        /// Process race dates in parallel
        #[arg(long)]
        parallel: bool,

        /// Keep jump races
        #[arg(long)]
        include_jumps: bool,

        /// Racecourse id filter
        #[arg(long)]
        place: Option<u8>,

        /// Race type filter (芝, ダート)
        #[arg(long)]
        race_type: Option<String>,

        /// Distance filter in meters
        #[arg(long)]
        distance: Option<u32>,

        /// Also write a chronological train/test split with this test share
        #[arg(long)]
        split: Option<f64>,

        /// Where to save the fitted encoders
        #[arg(long)]
        encoders: Option<PathBuf>,
    },

    /// Build features for a race card and optionally score them
    Card {
        /// Race card CSV (one row per runner, no results)
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Encoders saved by `build`
        #[arg(long)]
        encoders: Option<PathBuf>,

        /// ONNX model path override
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Write the card features to this file (.parquet or .csv)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

fn open_repository(config: &AppConfig, db: Option<PathBuf>) -> anyhow::Result<RaceRepository> {
    let path = db.unwrap_or_else(|| PathBuf::from(&config.database.path));
    eprintln!("Database: {}", path.display());
    RaceRepository::new(&path).with_context(|| format!("Failed to open {}", path.display()))
}

/// Load results CSV files into the database.
pub fn run_import(inputs: Vec<PathBuf>, db: Option<PathBuf>) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let mut repo = open_repository(&config, db)?;

    let mut total = 0;
    for input in &inputs {
        let records = records_from_csv(input)
            .with_context(|| format!("Failed to read {}", input.display()))?;
        let written = repo.insert_records(&records)?;
        eprintln!("{}: {} entries", input.display(), written);
        total += written;
    }

    eprintln!(
        "Imported {} entries ({} races stored, last date {})",
        total,
        repo.get_race_count()?,
        repo.get_last_race_date()?
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    Ok(())
}

/// Load pedigree CSV files into the database.
pub fn run_import_peds(inputs: Vec<PathBuf>, db: Option<PathBuf>) -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    let mut repo = open_repository(&config, db)?;

    for input in &inputs {
        let pedigrees = pedigrees_from_csv(input)
            .with_context(|| format!("Failed to read {}", input.display()))?;
        let written = repo.insert_pedigrees(&pedigrees)?;
        eprintln!("{}: {} pedigrees", input.display(), written);
    }

    eprintln!("{} pedigrees stored", repo.get_pedigree_count()?);
    Ok(())
}

/// Options of the `build` command.
pub struct BuildArgs {
    pub output: PathBuf,
    pub begin: Option<String>,
    pub end: Option<String>,
    pub target: Option<String>,
    pub windows: Option<Vec<String>>,
    pub depth: Option<usize>,
    pub drop_nan: bool,
    pub parallel: bool,
    pub include_jumps: bool,
    pub place: Option<u8>,
    pub race_type: Option<String>,
    pub distance: Option<u32>,
    pub split: Option<f64>,
    pub encoders: Option<PathBuf>,
}

/// Build the training feature table.
pub fn run_build(args: BuildArgs, db: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = AppConfig::load()?;

    // Override with CLI args
    if let Some(target) = &args.target {
        config.dataset.target = target.parse::<Target>()?;
    }
    if let Some(windows) = &args.windows {
        config.features.horse_windows = windows
            .iter()
            .map(|w| w.parse::<Window>())
            .collect::<Result<Vec<_>, _>>()?;
    }
    if let Some(depth) = args.depth {
        config.features.positional_depth = depth;
    }
    config.dataset.drop_nan |= args.drop_nan;
    config.features.parallel |= args.parallel;
    if args.include_jumps {
        config.dataset.flat_only = false;
    }
    if let Some(path) = &args.encoders {
        config.model.encoders_path = path.to_string_lossy().to_string();
    }

    let filter = ResultFilter {
        begin: args.begin.as_deref().map(parse_date).transpose()?,
        end: args.end.as_deref().map(parse_date).transpose()?,
        flat_only: config.dataset.flat_only,
        place_id: args.place,
        race_type: args.race_type.clone(),
        distance: args.distance,
    };

    let repo = open_repository(&config, db)?;
    eprintln!(
        "Building {} dataset (windows: {})",
        config.dataset.target,
        config
            .features
            .horse_windows
            .iter()
            .map(|w| w.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );
    let set = DatasetAssembler::new(&repo, &config).build_training(&filter)?;

    write_dataset(&set.dataset, &args.output)?;
    set.encoders.save(&config.model.encoders_path)?;
    eprintln!("Encoders saved to {}", config.model.encoders_path);

    if let Some(test_size) = args.split {
        let (train, test) = split_by_date(&set.dataset, test_size)?;
        write_dataset(&train, &with_suffix(&args.output, "train"))?;
        write_dataset(&test, &with_suffix(&args.output, "test"))?;
        eprintln!("Split: {} train rows, {} test rows", train.n_rows(), test.n_rows());
    }

    print_summary(&set.dataset, &set.report);
    Ok(())
}

/// Build features for a race card, scoring them when a model is configured.
pub fn run_card(
    input: PathBuf,
    encoders_path: Option<PathBuf>,
    model_path: Option<PathBuf>,
    output: Option<PathBuf>,
    format: String,
    db: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = AppConfig::load()?;
    if let Some(path) = encoders_path {
        config.model.encoders_path = path.to_string_lossy().to_string();
    }
    if let Some(path) = model_path {
        config.model.path = Some(path.to_string_lossy().to_string());
    }

    eprintln!("Loading encoders from: {}", config.model.encoders_path);
    let mut encoders = Encoders::load(&config.model.encoders_path)
        .context("Failed to load encoders (run `build` first)")?;

    let card = records_from_csv(&input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    eprintln!("Race card: {} runners", card.len());

    let repo = open_repository(&config, db)?;
    let (dataset, report) =
        DatasetAssembler::new(&repo, &config).build_race_card(card, &mut encoders)?;
    for skipped in &report.skipped_dates {
        eprintln!("Skipped {}: {}", skipped.date, skipped.reason);
    }

    if let Some(path) = &output {
        write_dataset(&dataset, path)?;
    }
    // New ids were appended; keep them for the next card
    encoders.save(&config.model.encoders_path)?;

    let scores = match &config.model.path {
        Some(path) => {
            eprintln!("Loading model from: {}", path);
            let model = OnnxPredictor::load(path, Some(encoders.columns.len()))?;
            Some(score(&model, &dataset)?)
        }
        None => None,
    };

    match format.as_str() {
        "json" => print_card_json(&dataset, scores.as_deref())?,
        "table" => print_card_table(&dataset, scores.as_deref()),
        _ => {
            eprintln!("Unknown format: {}. Using table.", format);
            print_card_table(&dataset, scores.as_deref());
        }
    }
    Ok(())
}

fn write_dataset(dataset: &Dataset, path: &Path) -> anyhow::Result<()> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => dataset.write_csv(path)?,
        _ => dataset.write_parquet(path)?,
    }
    let schema_path = path.with_extension("schema.json");
    std::fs::write(&schema_path, serde_json::to_string_pretty(&dataset.schema())?)?;
    eprintln!("Wrote {} rows to {}", dataset.n_rows(), path.display());
    Ok(())
}

/// "out/train.parquet" + "test" -> "out/train_test.parquet"
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("features");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}_{}.{}", stem, suffix, ext),
        None => format!("{}_{}", stem, suffix),
    };
    path.with_file_name(name)
}

fn print_summary(dataset: &Dataset, report: &BuildReport) {
    println!("=== Dataset ===");
    println!("  {:<18} {}", "rows", dataset.n_rows());
    println!("  {:<18} {}", "features", dataset.n_features());
    println!("  {:<18} {}", "race dates", report.dates_processed);
    println!("  {:<18} {}", "skipped dates", report.skipped_dates.len());
    println!("  {:<18} {}", "unlabeled rows", report.unlabeled_rows);
    println!("  {:<18} {}", "dropped (NaN)", report.nan_rows);
    println!("  {:<18} {}", "no pedigree", report.missing_pedigrees);
    if let Some(target) = dataset.target {
        println!("  {:<18} {}", "target", target);
        if target == Target::Binary && !dataset.y.is_empty() {
            // Label 0 is a place
            let placed = dataset.y.iter().filter(|&&y| y == 0.0).count();
            println!(
                "  {:<18} {:.1}%",
                "placed share",
                placed as f64 / dataset.y.len() as f64 * 100.0
            );
        }
    }
    for skipped in &report.skipped_dates {
        println!("  skipped {}: {}", skipped.date, skipped.reason);
    }
}

fn print_card_table(dataset: &Dataset, scores: Option<&[f64]>) {
    let mut current_race = "";
    for (i, key) in dataset.keys.iter().enumerate() {
        if key.race_id != current_race {
            current_race = &key.race_id;
            println!();
            println!("Race: {} ({})", key.race_id, key.race_date);
        }
        match scores {
            Some(scores) => println!("  {:>3} {:<12} {:.4}", key.horse_no, key.horse_id, scores[i]),
            None => println!("  {:>3} {:<12}", key.horse_no, key.horse_id),
        }
    }
    println!();
}

fn print_card_json(dataset: &Dataset, scores: Option<&[f64]>) -> anyhow::Result<()> {
    let rows: Vec<serde_json::Value> = dataset
        .keys
        .iter()
        .enumerate()
        .map(|(i, key)| {
            serde_json::json!({
                "race_id": key.race_id,
                "race_date": key.race_date.to_string(),
                "horse_id": key.horse_id,
                "horse_no": key.horse_no,
                "score": scores.map(|s| s[i]),
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}
