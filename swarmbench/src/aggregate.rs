// Offline merge of every node's iteration files into comparison tables.
//
// Aggregation never touches its inputs and is deterministic: files are read in
// sorted order and groups are emitted in key order, so running it twice over
// the same directory produces byte-identical outputs.

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{Path, PathBuf},
};
use crate::{
    record::{IterationResult, SizeCategory},
    stats,
    store::{self, StoreError},
    table::{self, fmt_opt, Table, TableError},
};

pub const COMBINED_FILE_NAME: &str = "combined_results.csv";
pub const NODE_COMPARISON_FILE_NAME: &str = "node_performance_comparison.csv";
pub const CATEGORY_SUMMARY_FILE_NAME: &str = "size_category_summary.csv";
pub const COMBINED_RATIO_FILE_NAME: &str = "combined_data_analysis.csv";

pub const OUTPUT_FILE_NAMES: [&str; 4] = [
    COMBINED_FILE_NAME,
    NODE_COMPARISON_FILE_NAME,
    CATEGORY_SUMMARY_FILE_NAME,
    COMBINED_RATIO_FILE_NAME,
];

#[derive(thiserror::Error, Debug)]
pub enum AggregateError {

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no iteration result files in {0}")]
    NoInput(PathBuf),

    #[error("failed to write output: {0}")]
    Store(#[from] StoreError),

    #[error("failed to encode output: {0}")]
    Encode(#[from] TableError),

}

pub type Result<T> = std::result::Result<T, AggregateError>;

// Mean, sample standard deviation and range of one metric within a group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricStats {
    pub mean: f64,
    pub std_dev: Option<f64>,
    pub min: f64,
    pub max: f64,
}

impl MetricStats {

    fn of(values: &[f64]) -> Option<Self> {
        Some(Self {
            mean: stats::mean(values)?,
            std_dev: stats::sample_std_dev(values),
            min: stats::min(values)?,
            max: stats::max(values)?,
        })
    }

    fn full_fields(&self) -> [String; 4] {
        [self.mean.to_string(), fmt_opt(self.std_dev), self.min.to_string(), self.max.to_string()]
    }

    fn short_fields(&self) -> [String; 2] {
        [self.mean.to_string(), fmt_opt(self.std_dev)]
    }

}

// The three metrics every grouping reports on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupStats {
    pub transfer_time: MetricStats,
    pub throughput: MetricStats,
    pub transfer_ratio: MetricStats,
}

impl GroupStats {
    fn of(rows: &[&IterationResult]) -> Option<Self> {
        let times: Vec<f64> = rows.iter().map(|r| r.transfer_time).collect();
        let throughputs: Vec<f64> = rows.iter().map(|r| r.throughput).collect();
        let ratios: Vec<f64> = rows.iter().map(|r| r.transfer_ratio).collect();
        Some(Self {
            transfer_time: MetricStats::of(&times)?,
            throughput: MetricStats::of(&throughputs)?,
            transfer_ratio: MetricStats::of(&ratios)?,
        })
    }
}

const METRIC_NAMES: [&str; 3] = ["Transfer Time", "Throughput", "Transfer Ratio"];

#[derive(Debug, Clone, PartialEq)]
pub struct NodeCategoryRow {
    pub node_id: String,
    pub size_category: SizeCategory,
    pub iterations: usize,
    pub stats: GroupStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryRow {
    pub size_category: SizeCategory,
    pub iterations: usize,
    pub stats: GroupStats,
}

// Swarm-wide ratio from every vantage point combined.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedRatioRow {

    pub size_category: SizeCategory,

    // File size of the first row in the group.
    pub file_size: u64,

    // Sum of every node's estimated total.
    pub total_data_transferred: u64,

    // Mean of the per-node estimates.
    pub mean_transfer_ratio: f64,

    // total_data_transferred / (file_size * fanout), None when the divisor is zero.
    pub combined_ratio: Option<f64>,

}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReport {
    pub combined: Vec<IterationResult>,
    pub per_node: Vec<NodeCategoryRow>,
    pub per_category: Vec<CategoryRow>,
    pub combined_ratio: Vec<CombinedRatioRow>,
}

impl AggregateReport {

    pub fn node_table(&self) -> Table {
        let mut header = vec!["Leecher ID".to_string(), "Size Category".into(), "Iterations".into()];
        for name in METRIC_NAMES {
            for stat in ["Mean", "Std", "Min", "Max"] {
                header.push(format!("{} {}", name, stat));
            }
        }

        let mut table = Table::new(header);
        for row in &self.per_node {
            let mut fields = vec![row.node_id.clone(), row.size_category.to_string(), row.iterations.to_string()];
            for metric in [&row.stats.transfer_time, &row.stats.throughput, &row.stats.transfer_ratio] {
                fields.extend(metric.full_fields());
            }
            table.push(fields);
        }
        table
    }

    pub fn category_table(&self) -> Table {
        let mut header = vec!["Size Category".to_string(), "Iterations".into()];
        for name in METRIC_NAMES {
            header.push(format!("{} Mean", name));
            header.push(format!("{} Std", name));
        }

        let mut table = Table::new(header);
        for row in &self.per_category {
            let mut fields = vec![row.size_category.to_string(), row.iterations.to_string()];
            for metric in [&row.stats.transfer_time, &row.stats.throughput, &row.stats.transfer_ratio] {
                fields.extend(metric.short_fields());
            }
            table.push(fields);
        }
        table
    }

    pub fn combined_ratio_table(&self) -> Table {
        let mut table = Table::new([
            "Size Category",
            "File Size",
            "Total Data Transferred",
            "Transfer Ratio",
            "Combined Transfer Ratio",
        ]);
        for row in &self.combined_ratio {
            table.push(vec![
                row.size_category.to_string(),
                row.file_size.to_string(),
                row.total_data_transferred.to_string(),
                row.mean_transfer_ratio.to_string(),
                fmt_opt(row.combined_ratio),
            ]);
        }
        table
    }

    // Encoded contents of every output file, keyed by file name.
    pub fn encode(&self) -> std::result::Result<Vec<(&'static str, Vec<u8>)>, TableError> {
        Ok(vec![
            (COMBINED_FILE_NAME, table::to_csv(&self.combined)?),
            (NODE_COMPARISON_FILE_NAME, self.node_table().to_csv()?),
            (CATEGORY_SUMMARY_FILE_NAME, self.category_table().to_csv()?),
            (COMBINED_RATIO_FILE_NAME, self.combined_ratio_table().to_csv()?),
        ])
    }

}

#[derive(Debug, Clone, Copy)]
pub struct AggregationPipeline {
    peer_fanout: u32,
}

impl AggregationPipeline {

    pub fn new(peer_fanout: u32) -> Self {
        Self { peer_fanout }
    }

    // Loads, aggregates and writes every output table into `output_dir`.
    #[tracing::instrument(skip(self), fields(input = %input_dir.display()))]
    pub fn run(&self, input_dir: &Path, output_dir: &Path) -> Result<AggregateReport> {
        let rows = self.load(input_dir)?;
        tracing::info!("aggregating {} iteration results", rows.len());
        let report = self.aggregate(rows);
        for path in self.write(&report, output_dir)? {
            tracing::info!("wrote {}", path.display());
        }
        Ok(report)
    }

    // Reads every `<category>_<node>_results.csv` in `dir`, in file name order.
    // Unreadable files are skipped with a warning.
    pub fn load(&self, dir: &Path) -> Result<Vec<IterationResult>> {
        let io_err = |source| AggregateError::Io { path: dir.to_path_buf(), source };
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(io_err)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .and_then(store::parse_iteration_file_name)
                    .is_some()
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(AggregateError::NoInput(dir.to_path_buf()));
        }

        let mut rows = Vec::new();
        for path in files {
            match read_results(&path) {
                Ok(mut results) => {
                    tracing::debug!("read {} rows from {}", results.len(), path.display());
                    rows.append(&mut results);
                },
                Err(e) => tracing::warn!("skipping {}: {}", path.display(), e),
            }
        }
        Ok(rows)
    }

    pub fn aggregate(&self, rows: Vec<IterationResult>) -> AggregateReport {

        let mut by_node: BTreeMap<(String, SizeCategory), Vec<&IterationResult>> = BTreeMap::new();
        let mut by_category: BTreeMap<SizeCategory, Vec<&IterationResult>> = BTreeMap::new();
        for row in &rows {
            by_node.entry((row.node_id.clone(), row.size_category)).or_default().push(row);
            by_category.entry(row.size_category).or_default().push(row);
        }

        let per_node = by_node
            .into_iter()
            .filter_map(|((node_id, size_category), group)| {
                Some(NodeCategoryRow {
                    node_id,
                    size_category,
                    iterations: group.len(),
                    stats: GroupStats::of(&group)?,
                })
            })
            .collect();

        let per_category = by_category
            .iter()
            .filter_map(|(size_category, group)| {
                Some(CategoryRow {
                    size_category: *size_category,
                    iterations: group.len(),
                    stats: GroupStats::of(group)?,
                })
            })
            .collect();

        let combined_ratio = by_category
            .iter()
            .filter_map(|(size_category, group)| self.combined_ratio(*size_category, group))
            .collect();

        AggregateReport {
            per_node,
            per_category,
            combined_ratio,
            combined: rows,
        }
    }

    fn combined_ratio(&self, size_category: SizeCategory, group: &[&IterationResult]) -> Option<CombinedRatioRow> {
        let file_size = group.first()?.file_size;
        // Totals come from files on disk, saturate instead of overflowing.
        let total_data_transferred = group
            .iter()
            .fold(0u64, |sum, r| sum.saturating_add(r.total_data_transferred));
        let ratios: Vec<f64> = group.iter().map(|r| r.transfer_ratio).collect();
        let divisor = file_size as f64 * self.peer_fanout as f64;
        let combined_ratio = (divisor > 0.0).then(|| total_data_transferred as f64 / divisor);

        Some(CombinedRatioRow {
            size_category,
            file_size,
            total_data_transferred,
            mean_transfer_ratio: stats::mean(&ratios)?,
            combined_ratio,
        })
    }

    pub fn write(&self, report: &AggregateReport, output_dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(output_dir).map_err(|source| AggregateError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let mut written = Vec::new();
        for (name, data) in report.encode()? {
            let path = output_dir.join(name);
            store::write_file(&path, &data)?;
            written.push(path);
        }
        Ok(written)
    }

}

fn read_results(path: &Path) -> std::result::Result<Vec<IterationResult>, TableError> {
    table::from_csv(&fs::read(path)?)
}
