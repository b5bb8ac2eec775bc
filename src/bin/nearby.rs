//! nearby CLI - run similarity and clustering against a database
//!
//! Usage:
//!   nearby --db <file> --config <json> [--constraint <name>] similarity
//!          [--force] [--from <date>] [--to <date>]
//!   nearby --db <file> --config <json> [--constraint <name>] cluster
//!   nearby --db <file> --config <json> [--constraint <name>] all [--force]
//!
//! The configuration file holds either one constraint object or an array of
//! them, in which case `--constraint` picks one.

use clap::{Parser, Subcommand};
use log::error;
use nearby_activities::{
    config::{find_constraint, parse_date},
    NearbyConfig, NearbyEngine, NearbyStore, Result, StageOutcome,
};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "nearby")]
#[command(about = "Activity similarity and nearby groups", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database holding activities and positions
    #[arg(long, global = true, default_value = "nearby.db")]
    db: PathBuf,

    /// Constraint configuration (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Constraint to use when the configuration holds several
    #[arg(long, global = true)]
    constraint: Option<String>,

    /// Enable debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Score new activities against indexed ones
    Similarity {
        /// Recompute activities started in the given range
        #[arg(long)]
        force: bool,

        /// Start of the forced range (date or RFC 3339)
        #[arg(long)]
        from: Option<String>,

        /// End of the forced range, exclusive
        #[arg(long)]
        to: Option<String>,
    },

    /// Regroup activities from stored similarities
    Cluster,

    /// Both stages
    All {
        /// Recompute every activity
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| writeln!(buf, "[{:5}] {}", record.level(), record.args()))
        .init();

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref(), cli.constraint.as_deref())?;
    let db = cli.db.to_string_lossy();
    let store = NearbyStore::new(&db)?;

    match cli.command {
        Commands::Similarity { force, from, to } => {
            let mut engine = NearbyEngine::new(store, config)?
                .with_force_range(parse_date(from.as_deref())?, parse_date(to.as_deref())?);
            report("similarity", &engine.run_similarity(force)?);
        }
        Commands::Cluster => {
            let mut engine = NearbyEngine::new(store, config)?;
            report("clustering", &engine.run_clustering()?);
        }
        Commands::All { force } => {
            let mut engine = NearbyEngine::new(store, config)?;
            let outcome = engine.run(force)?;
            report("similarity", &outcome.similarity);
            report("clustering", &outcome.clustering);
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>, constraint: Option<&str>) -> Result<NearbyConfig> {
    let Some(path) = path else {
        return Ok(NearbyConfig::default());
    };
    match constraint {
        Some(name) => {
            let json = std::fs::read_to_string(path)?;
            let configs: Vec<NearbyConfig> = serde_json::from_str(&json)?;
            let config = find_constraint(configs, name)?;
            config.validate()?;
            Ok(config)
        }
        None => NearbyConfig::load(path),
    }
}

fn report(stage: &str, outcome: &StageOutcome) {
    match outcome {
        StageOutcome::Skipped => println!("{}: up to date", stage),
        StageOutcome::Scored {
            new_activities,
            edges,
        } => println!(
            "{}: {} new activities, {} edges",
            stage, new_activities, edges
        ),
        StageOutcome::Clustered { groups, epsilon } => {
            println!("{}: {} groups (d={:.4})", stage, groups, epsilon)
        }
    }
}
