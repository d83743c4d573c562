use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod aggregate;
mod annotate;
mod config;
mod error;
mod extract;
mod loader;
mod pipeline;
mod record;
mod report;
mod views;

use crate::aggregate::Aggregator;
use crate::annotate::Annotator;
use crate::config::Settings;
use crate::pipeline::{CommandEngine, Pipeline, RunPlan};
use crate::record::Framework;
use crate::report::OutputFormat;
use crate::views::{RunFilter, SelectionMode, SortColumn, SortSpec, TableState, TableView};

/// Benchmark orchestration and dashboard-data pipeline for local LLM evaluations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output - show debug-level pipeline progress
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one benchmark run end-to-end and publish the dashboard data
    Run {
        /// Model identifier (may be a path, e.g. models/llama-3-8b-q4_0.gguf)
        #[arg(short, long)]
        model: String,

        /// Model size tag for display and ranking (e.g. "4.1G")
        #[arg(long)]
        model_size: Option<String>,

        /// Comma-separated list of tasks to evaluate
        #[arg(short, long)]
        tasks: String,

        /// Evaluation framework
        #[arg(short, long, value_enum, default_value = "lm-eval")]
        framework: Framework,

        /// Hardware profile tag recorded with the run
        #[arg(long, default_value = "unknown")]
        hardware: String,

        /// Runs directory (overrides the settings file)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Site directory the artifacts publish to (overrides settings)
        #[arg(long)]
        site_dir: Option<PathBuf>,

        /// Tracking-service project (overrides settings)
        #[arg(long)]
        tracking_project: Option<String>,

        /// Validate and print the plan without executing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Rebuild the index and metadata artifacts from the runs directory
    Aggregate {
        /// Runs directory (overrides the settings file)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Site directory the artifacts publish to (overrides settings)
        #[arg(long)]
        site_dir: Option<PathBuf>,

        /// Also export the index as CSV
        #[arg(long)]
        csv: bool,

        /// Print a corpus report after the pass
        #[arg(long, value_enum)]
        report: Option<OutputFormat>,
    },

    /// Render a dashboard projection of the corpus as JSON
    View {
        /// Runs directory (overrides the settings file)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        #[command(subcommand)]
        projection: Projection,
    },
}

#[derive(Subcommand, Debug)]
enum Projection {
    /// One page of the run table
    Table {
        /// 1-based page; out-of-range pages clamp
        #[arg(long, default_value_t = 1)]
        page: usize,

        /// Sort column; corpus order (newest first) when omitted
        #[arg(long, value_enum)]
        sort: Option<SortColumn>,

        /// Sort ascending instead of the default descending
        #[arg(long)]
        ascending: bool,

        /// Keep only models whose name contains this (case-insensitive)
        #[arg(long)]
        model_filter: Option<String>,

        /// Keep only runs that evaluated this task
        #[arg(long)]
        task: Option<String>,

        /// Keep only runs with this quantization label
        #[arg(long)]
        quantization: Option<String>,

        /// Inclusive lower accuracy bound
        #[arg(long)]
        min_accuracy: Option<f64>,

        /// Inclusive upper accuracy bound
        #[arg(long)]
        max_accuracy: Option<f64>,
    },

    /// Comparison matrix over the selected models
    Compare {
        /// Comma-separated model names to compare
        #[arg(long)]
        models: String,

        /// Include every run of each model, not just the latest
        #[arg(long)]
        all_runs: bool,

        /// Sort column
        #[arg(long, value_enum, default_value = "accuracy")]
        sort: SortColumn,

        /// Sort ascending instead of the default descending
        #[arg(long)]
        ascending: bool,
    },

    /// Accuracy trend and per-model mean series for the charts
    Charts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            model,
            model_size,
            tasks,
            framework,
            hardware,
            output_dir,
            site_dir,
            tracking_project,
            dry_run,
        } => {
            if let Some(output_dir) = output_dir {
                settings.runs_dir = output_dir;
            }
            if let Some(site_dir) = site_dir {
                settings.site_dir = site_dir;
            }
            if let Some(tracking_project) = tracking_project {
                settings.tracking_project = tracking_project;
            }

            let plan = RunPlan {
                model,
                model_size,
                tasks: parse_list(&tasks),
                framework,
                hardware_profile: hardware,
            };

            let engine = Box::new(CommandEngine::new(settings.engine_command.clone()));
            let annotator = Annotator::from_settings(&settings);
            let mut pipeline = Pipeline::new(&settings, engine, annotator);

            let outcome = pipeline.run(&plan, dry_run).await?;
            if dry_run {
                println!("Dry run OK: {} ({} tasks)", plan.model, plan.tasks.len());
            } else {
                println!(
                    "Run {} published ({} runs in corpus)",
                    outcome.run_id, outcome.corpus_size
                );
            }
        }

        Command::Aggregate {
            output_dir,
            site_dir,
            csv,
            report,
        } => {
            if let Some(output_dir) = output_dir {
                settings.runs_dir = output_dir;
            }
            if let Some(site_dir) = site_dir {
                settings.site_dir = site_dir;
            }

            let aggregator = Aggregator::new(settings.runs_dir, settings.site_dir);
            let outcome = aggregator.run_pass()?;

            if csv {
                let path = aggregator.export_csv(&outcome.index)?;
                println!("CSV exported to: {}", path.display());
            }
            match report {
                Some(format) => report::print_report(&outcome.index, &outcome.metadata, format),
                None => println!(
                    "Aggregated {} runs ({} skipped)",
                    outcome.index.runs.len(),
                    outcome.skipped.len()
                ),
            }
        }

        Command::View {
            output_dir,
            projection,
        } => {
            if let Some(output_dir) = output_dir {
                settings.runs_dir = output_dir;
            }
            let aggregator = Aggregator::new(settings.runs_dir, settings.site_dir);
            print_projection(&aggregator, projection)?;
        }
    }

    Ok(())
}

/// Render the requested projection to stdout as JSON.
fn print_projection(aggregator: &Aggregator, projection: Projection) -> anyhow::Result<()> {
    let records = aggregator.load_records()?;

    let rendered = match projection {
        Projection::Table {
            page,
            sort,
            ascending,
            model_filter,
            task,
            quantization,
            min_accuracy,
            max_accuracy,
        } => {
            let state = TableState {
                page,
                sort: sort.map(|column| sort_spec(column, ascending)),
                filter: RunFilter {
                    model_contains: model_filter,
                    task,
                    min_accuracy,
                    max_accuracy,
                    quantization,
                },
            };
            let table = TableView::from_records(&records).page(&state);
            serde_json::to_string_pretty(&table)?
        }

        Projection::Compare {
            models,
            all_runs,
            sort,
            ascending,
        } => {
            let selected = parse_list(&models);
            let mode = if all_runs {
                SelectionMode::AllRuns
            } else {
                SelectionMode::LatestOnly
            };
            let rows = views::comparison_rows(&records, &selected, mode, sort_spec(sort, ascending));
            serde_json::to_string_pretty(&rows)?
        }

        Projection::Charts => {
            let entries: Vec<_> = records.iter().map(record::RunIndexEntry::from_record).collect();
            let document = serde_json::json!({
                "trend": views::trend_series(&entries),
                "models": views::model_bars(&entries),
            });
            serde_json::to_string_pretty(&document)?
        }
    };

    println!("{rendered}");
    Ok(())
}

fn sort_spec(column: SortColumn, ascending: bool) -> SortSpec {
    let mut spec = SortSpec::new(column);
    if ascending {
        // One extra click flips the first-click descending default
        spec = spec.click(column);
    }
    spec
}

/// Split a comma-separated list, dropping empty items and whitespace.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
