use crate::extract::{quantization_label, short_name, size_display, size_gb};
use crate::record::{RunIndex, RunIndexEntry, RunRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Fixed page size of the dashboard table.
pub const PAGE_SIZE: usize = 10;

/// Number of runs in the trend chart.
const TREND_WINDOW: usize = 20;

/// Columns the table and comparison views sort by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SortColumn {
    Accuracy,
    Quantization,
    Size,
    Model,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// A column/direction pair with click-toggle semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub column: SortColumn,
    pub direction: SortDirection,
}

impl SortSpec {
    /// The sort a first click on a column produces.
    pub fn new(column: SortColumn) -> Self {
        Self {
            column,
            direction: SortDirection::Descending,
        }
    }

    /// Apply one header click: the same column flips direction, a new
    /// column resets to descending.
    pub fn click(self, column: SortColumn) -> Self {
        if self.column == column {
            let direction = match self.direction {
                SortDirection::Descending => SortDirection::Ascending,
                SortDirection::Ascending => SortDirection::Descending,
            };
            Self { column, direction }
        } else {
            Self::new(column)
        }
    }
}

/// Filter criteria over table rows; all conditions must hold.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Case-insensitive substring of the model name
    pub model_contains: Option<String>,
    /// Task that must be present in the run's task list
    pub task: Option<String>,
    /// Inclusive accuracy bounds
    pub min_accuracy: Option<f64>,
    pub max_accuracy: Option<f64>,
    /// Quantization label, matched case-insensitively
    pub quantization: Option<String>,
}

impl RunFilter {
    fn matches(&self, row: &TableRow) -> bool {
        if let Some(needle) = &self.model_contains {
            if !row
                .entry
                .model
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(task) = &self.task {
            if !row.entry.tasks.iter().any(|t| t == task) {
                return false;
            }
        }
        if let Some(min) = self.min_accuracy {
            if row.entry.average_accuracy < min {
                return false;
            }
        }
        if let Some(max) = self.max_accuracy {
            if row.entry.average_accuracy > max {
                return false;
            }
        }
        if let Some(quantization) = &self.quantization {
            if !row.quantization.eq_ignore_ascii_case(quantization) {
                return false;
            }
        }
        true
    }
}

/// Explicit table state, owned by the caller and passed into each
/// projection call; the view layer keeps no ambient globals.
#[derive(Debug, Clone, Default)]
pub struct TableState {
    /// 1-based requested page; out-of-range values clamp
    pub page: usize,
    /// None keeps the corpus order (timestamp desc, run_id desc)
    pub sort: Option<SortSpec>,
    pub filter: RunFilter,
}

/// One table row: the index entry plus the derived fields sorting needs.
#[derive(Debug, Clone, Serialize)]
pub struct TableRow {
    #[serde(flatten)]
    pub entry: RunIndexEntry,
    pub quantization: String,
    pub size_gb: f64,
}

/// One rendered page of the table.
#[derive(Debug, Clone, Serialize)]
pub struct TablePage {
    pub rows: Vec<TableRow>,
    /// The clamped page actually rendered
    pub page: usize,
    pub total_pages: usize,
    pub total_rows: usize,
}

/// Pure projection layer over the aggregated corpus.
///
/// Rows are derived once from the in-memory set; every sort/filter/page
/// call re-derives its output from them without touching storage, and
/// nothing here mutates the underlying records.
pub struct TableView {
    rows: Vec<TableRow>,
}

impl TableView {
    /// Build rows from full records (size comes from model metadata).
    pub fn from_records(records: &[RunRecord]) -> Self {
        let rows = records
            .iter()
            .map(|record| TableRow {
                entry: RunIndexEntry::from_record(record),
                quantization: quantization_label(&record.model.name),
                size_gb: size_gb(record.model.size.as_deref()),
            })
            .collect();
        Self { rows }
    }

    /// Build rows from the index artifact alone (lazy-load path); size
    /// ranks as 0 until the full records are fetched.
    pub fn from_index(index: &RunIndex) -> Self {
        let rows = index
            .runs
            .iter()
            .map(|entry| TableRow {
                entry: entry.clone(),
                quantization: quantization_label(&entry.model),
                size_gb: 0.0,
            })
            .collect();
        Self { rows }
    }

    /// Render one page under the given state: filter, sort, clamp, slice.
    pub fn page(&self, state: &TableState) -> TablePage {
        let mut rows: Vec<TableRow> = self
            .rows
            .iter()
            .filter(|row| state.filter.matches(row))
            .cloned()
            .collect();

        if let Some(sort) = state.sort {
            sort_rows(&mut rows, sort);
        }

        let total_rows = rows.len();
        let total_pages = total_rows.div_ceil(PAGE_SIZE).max(1);
        let page = state.page.clamp(1, total_pages);

        let start = (page - 1) * PAGE_SIZE;
        let rows = rows.into_iter().skip(start).take(PAGE_SIZE).collect();

        TablePage {
            rows,
            page,
            total_pages,
            total_rows,
        }
    }
}

/// Sort rows by the spec's column/direction with a stable tie-break on
/// model name ascending.
fn sort_rows(rows: &mut [TableRow], sort: SortSpec) {
    rows.sort_by(|a, b| {
        let ordering = match sort.column {
            SortColumn::Accuracy => compare_f64(a.entry.average_accuracy, b.entry.average_accuracy),
            SortColumn::Quantization => a.quantization.cmp(&b.quantization),
            SortColumn::Size => compare_f64(a.size_gb, b.size_gb),
            SortColumn::Model => a.entry.model.cmp(&b.entry.model),
            SortColumn::Timestamp => a.entry.timestamp.cmp(&b.entry.timestamp),
        };
        let ordering = match sort.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        ordering.then_with(|| a.entry.model.cmp(&b.entry.model))
    });
}

fn compare_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Which runs of each selected model the comparison includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// Only the most recent run per model
    LatestOnly,
    /// Every run of the model
    AllRuns,
}

/// One comparison-matrix row.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonRow {
    pub model: String,
    pub short_name: String,
    pub quantization: String,
    /// Numeric size for ranking; 0.0 when unknown
    pub size_gb: f64,
    /// Display size; "Unknown" when the metadata has none
    pub size: String,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub average_accuracy: f64,
    /// Per-task accuracies for the matrix cells; None renders a placeholder
    pub task_accuracies: BTreeMap<String, Option<f64>>,
}

/// Build the comparison matrix for the selected models.
///
/// `LatestOnly` keeps the run with the greatest timestamp per model
/// (run_id breaks ties); rows sort by the given spec with a stable
/// tie-break on model name ascending.
pub fn comparison_rows(
    records: &[RunRecord],
    selected_models: &[String],
    mode: SelectionMode,
    sort: SortSpec,
) -> Vec<ComparisonRow> {
    let mut rows: Vec<ComparisonRow> = Vec::new();

    for model in selected_models {
        let mut runs: Vec<&RunRecord> = records
            .iter()
            .filter(|r| &r.model.name == model)
            .collect();
        if runs.is_empty() {
            continue;
        }
        runs.sort_by(|a, b| a.corpus_order(b));

        let chosen: Vec<&RunRecord> = match mode {
            SelectionMode::LatestOnly => vec![runs[0]],
            SelectionMode::AllRuns => runs,
        };
        rows.extend(chosen.into_iter().map(comparison_row));
    }

    sort_comparison(&mut rows, sort);
    rows
}

fn comparison_row(record: &RunRecord) -> ComparisonRow {
    let task_accuracies = record
        .tasks
        .iter()
        .map(|task| {
            let accuracy = record.results.get(task).and_then(|m| m.accuracy);
            (task.clone(), accuracy)
        })
        .collect();

    ComparisonRow {
        model: record.model.name.clone(),
        short_name: short_name(&record.model.name).to_string(),
        quantization: quantization_label(&record.model.name),
        size_gb: size_gb(record.model.size.as_deref()),
        size: size_display(record.model.size.as_deref()),
        run_id: record.run_id.clone(),
        timestamp: record.timestamp,
        average_accuracy: record.average_accuracy,
        task_accuracies,
    }
}

fn sort_comparison(rows: &mut [ComparisonRow], sort: SortSpec) {
    rows.sort_by(|a, b| {
        let ordering = match sort.column {
            SortColumn::Accuracy => compare_f64(a.average_accuracy, b.average_accuracy),
            SortColumn::Quantization => a.quantization.cmp(&b.quantization),
            SortColumn::Size => compare_f64(a.size_gb, b.size_gb),
            SortColumn::Model => a.model.cmp(&b.model),
            SortColumn::Timestamp => a.timestamp.cmp(&b.timestamp),
        };
        let ordering = match sort.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        ordering.then_with(|| a.model.cmp(&b.model))
    });
}

/// One point of the accuracy trend chart.
#[derive(Debug, Clone, Serialize)]
pub struct TrendPoint {
    pub timestamp: DateTime<Utc>,
    /// Average accuracy scaled to percent
    pub accuracy_pct: f64,
}

/// The last 20 runs by timestamp, oldest first, as (timestamp, accuracy%).
pub fn trend_series(entries: &[RunIndexEntry]) -> Vec<TrendPoint> {
    let mut sorted: Vec<&RunIndexEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });

    let skip = sorted.len().saturating_sub(TREND_WINDOW);
    sorted
        .into_iter()
        .skip(skip)
        .map(|entry| TrendPoint {
            timestamp: entry.timestamp,
            accuracy_pct: entry.average_accuracy * 100.0,
        })
        .collect()
}

/// One bar of the per-model mean-accuracy chart.
#[derive(Debug, Clone, Serialize)]
pub struct ModelBar {
    pub short_name: String,
    pub mean_accuracy: f64,
    pub runs: usize,
}

/// Mean accuracy per model, grouped by short model name and sorted by
/// name so the series is deterministic.
pub fn model_bars(entries: &[RunIndexEntry]) -> Vec<ModelBar> {
    let mut grouped: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for entry in entries {
        grouped
            .entry(short_name(&entry.model).to_string())
            .or_default()
            .push(entry.average_accuracy);
    }

    grouped
        .into_iter()
        .map(|(short_name, accuracies)| ModelBar {
            mean_accuracy: accuracies.iter().sum::<f64>() / accuracies.len() as f64,
            runs: accuracies.len(),
            short_name,
        })
        .collect()
}
