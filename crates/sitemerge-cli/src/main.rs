use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use sitemerge_core::storage::database::migrations::get_applied_versions;
use sitemerge_core::storage::{SchemaGraph, open_database, open_existing};
use sitemerge_core::{
    AutoOnly, DedupeOptions, Decision, Driver, ExitCode, GroupReview, Reviewer, SiteMergeConfig, SiteMergeError,
};
use sitemerge_geo::{GeoError, RepairJob, RepairOptions};

// ─── CLI Definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "sitemerge",
    about = "Find and merge duplicate companies and facilities in a catalog database",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Catalog database. Overrides SITEMERGE_DATABASE and the config file.
    #[arg(long, global = true)]
    database: Option<String>,

    /// Config file (default: ~/.config/sitemerge/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the catalog schema.
    Init,

    /// Group duplicates, review them, and merge. Dry run unless --apply.
    Dedupe {
        #[arg(long)]
        apply: bool,
        /// Clustering radius in metres.
        #[arg(long)]
        max_distance: Option<f64>,
        #[arg(long)]
        limit_companies: Option<usize>,
        #[arg(long)]
        limit_facilities: Option<usize>,
        /// SQL predicate restricting the companies considered.
        #[arg(long)]
        company_where: Option<String>,
        /// SQL predicate restricting the facilities considered.
        #[arg(long)]
        facility_where: Option<String>,
        /// Also cluster facilities of the same company by distance alone.
        #[arg(long)]
        proximity: bool,
        /// Never prompt; merge only groups that differ by a naming variant.
        #[arg(long)]
        auto_only: bool,
    },

    /// Show the foreign keys that point at a table.
    References { table: String },

    /// Re-geocode facilities with missing or implausible coordinates.
    Geofix {
        #[arg(long)]
        dry_run: bool,
        /// Process every facility and write even unchanged results.
        #[arg(long)]
        overwrite: bool,
        /// Only facilities whose coordinates were not geocoded from their address.
        #[arg(long)]
        unflagged_only: bool,
        /// SQL predicate selecting the facilities to process.
        #[arg(long = "where")]
        filter: Option<String>,
        /// Only facilities with updated_at before this date (YYYY-MM-DD).
        #[arg(long)]
        not_updated_after: Option<NaiveDate>,
        #[arg(long, default_value = "500")]
        limit: usize,
        /// nominatim or google.
        #[arg(long)]
        backend: Option<String>,
        #[arg(long)]
        country_codes: Option<String>,
        #[arg(long)]
        log_csv: Option<PathBuf>,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Init => "init",
            Commands::Dedupe { .. } => "dedupe",
            Commands::References { .. } => "references",
            Commands::Geofix { .. } => "geofix",
        }
    }
}

// ─── Main ────────────────────────────────────────────────────────────────────

fn main() {
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => std::process::exit(code as i32),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(exit_code_for(&e) as i32);
        }
    }
}

/// Diagnostics go to stderr; stdout carries the audit log.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    let config = err.downcast_ref::<SiteMergeError>().is_some_and(SiteMergeError::is_config)
        || err.downcast_ref::<GeoError>().is_some_and(GeoError::is_config);
    if config {
        ExitCode::ConfigError
    } else {
        ExitCode::GeneralError
    }
}

fn load_config(cli: &Cli) -> Result<SiteMergeConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            let mut config = SiteMergeConfig::load_from(path)?;
            config.apply_env_overrides();
            config
        }
        None => {
            debug!(path = %SiteMergeConfig::config_path().display(), "loading config");
            SiteMergeConfig::load()?
        }
    };
    if let Some(db) = cli.database.as_deref() {
        config.set_database_path(db);
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    let db_path = config.require_database_path()?;
    info!(database = %db_path.display(), command = cli.command.name(), "starting");

    match cli.command {
        Commands::Init => {
            let pool = open_database(&db_path)?;
            let versions = get_applied_versions(&pool.get_connection())?;
            println!("catalog ready at {} (migrations {versions:?})", db_path.display());
            Ok(ExitCode::Success)
        }

        Commands::Dedupe {
            apply,
            max_distance,
            limit_companies,
            limit_facilities,
            company_where,
            facility_where,
            proximity,
            auto_only,
        } => {
            let mut options = DedupeOptions::from_config(&config);
            options.apply = apply;
            options.company_filter = company_where;
            options.facility_filter = facility_where;
            options.proximity_pass |= proximity;
            if let Some(d) = max_distance {
                options.max_distance_m = d;
            }
            if let Some(n) = limit_companies {
                options.limit_companies = n;
            }
            if let Some(n) = limit_facilities {
                options.limit_facilities = n;
            }

            let pool = open_existing(&db_path)?;
            let mut reviewer: Box<dyn Reviewer> = if auto_only {
                Box::new(AutoOnly)
            } else {
                Box::new(PromptReviewer::new(io::stdin().lock(), io::stderr()))
            };
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let summary = Driver::new(&pool, options, reviewer.as_mut(), &mut out).run()?;
            out.flush()?;
            Ok(summary.exit_code())
        }

        Commands::References { table } => {
            let pool = open_existing(&db_path)?;
            let conn = pool.get_connection();
            let graph = SchemaGraph::new(&conn, &config.database.schema);
            let refs = graph.references_to(&table)?;
            if refs.is_empty() {
                println!("no foreign keys reference {table}");
            }
            for r in &refs {
                println!("{r} -> {}", r.referenced_table);
                for partners in &r.unique_partners {
                    println!("  unique with: {}", partners.join(", "));
                }
            }
            Ok(ExitCode::Success)
        }

        Commands::Geofix {
            dry_run,
            overwrite,
            unflagged_only,
            filter,
            not_updated_after,
            limit,
            backend,
            country_codes,
            log_csv,
        } => {
            let mut geocode = config.geocode.clone();
            if let Some(b) = backend {
                geocode.backend = b;
            }
            if let Some(c) = country_codes {
                geocode.country_codes = c;
            }
            let geocoder = sitemerge_geo::geocoder::from_config(&geocode)?;
            let log_path = log_csv.unwrap_or_else(|| PathBuf::from(&geocode.log_csv));

            let options = RepairOptions {
                dry_run,
                overwrite,
                unflagged_only,
                filter,
                not_updated_after,
                limit,
                ..RepairOptions::from_config(&config)
            };
            let pool = open_existing(&db_path)?;
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
            let summary = runtime.block_on(RepairJob::new(&pool, geocoder.as_ref(), options).run_to_path(&log_path))?;

            print_geofix_summary(summary.processed, summary.selected, summary.updated, summary.skipped, &log_path);
            Ok(ExitCode::Success)
        }
    }
}

fn print_geofix_summary(processed: usize, selected: usize, updated: usize, skipped: usize, log: &Path) {
    if selected == 0 {
        println!("No facilities found matching the criteria.");
        return;
    }
    println!(
        "Done. Processed: {processed}/{selected}, Updated: {updated}, Skipped: {skipped}. Log: {}",
        log.display()
    );
}

// ─── Interactive review ──────────────────────────────────────────────────────

/// Shows each group's diff and asks y/n. End of input rejects.
struct PromptReviewer<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptReviewer<R, W> {
    fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Reviewer for PromptReviewer<R, W> {
    fn decide(&mut self, review: &GroupReview) -> Decision {
        if write!(self.output, "\n{}", review.render()).is_err() {
            return Decision::Reject;
        }
        loop {
            let shown = write!(self.output, "merge these records? [y/n] ").and_then(|_| self.output.flush());
            if shown.is_err() {
                return Decision::Reject;
            }

            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) | Err(_) => return Decision::Reject,
                Ok(_) => match line.trim().to_lowercase().as_str() {
                    "y" | "yes" => return Decision::Accept,
                    "n" | "no" => return Decision::Reject,
                    _ => continue,
                },
            }
        }
    }
}
