use std::{fmt, str::FromStr};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{de, ser, Deserialize, Serialize};
use crate::{stats, table::Record};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

// Result files are grouped by the size of the transferred file.
// Upper bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeCategory {
    // Up to 10 KiB.
    Small,
    // Up to 100 KiB.
    Medium,
    // Up to 1 MiB.
    Large,
    VeryLarge,
}

impl SizeCategory {

    pub fn of(file_size: u64) -> Self {
        if file_size <= 10 * KIB {
            SizeCategory::Small
        } else if file_size <= 100 * KIB {
            SizeCategory::Medium
        } else if file_size <= MIB {
            SizeCategory::Large
        } else {
            SizeCategory::VeryLarge
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SizeCategory::Small => "10kB",
            SizeCategory::Medium => "100kB",
            SizeCategory::Large => "1MB",
            SizeCategory::VeryLarge => "10MB",
        }
    }

}

impl fmt::Display for SizeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SizeCategory {
    type Err = String;

    // Also accepts the "<label> file" form used by older summary files.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_end_matches(" file") {
            "10kB" => Ok(SizeCategory::Small),
            "100kB" => Ok(SizeCategory::Medium),
            "1MB" => Ok(SizeCategory::Large),
            "10MB" => Ok(SizeCategory::VeryLarge),
            other => Err(format!("unknown size category: {}", other)),
        }
    }
}

pub fn now_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

impl Serialize for SizeCategory {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SizeCategory {
    fn deserialize<D: de::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// Summary rows label the category as "<label> file".
fn category_file_serialize<S: ser::Serializer>(category: &SizeCategory, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{} file", category))
}

// RFC 3339 in UTC with microseconds.
mod timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{de, ser, Deserialize};

    pub fn serialize<S: ser::Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: de::Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(s.trim())
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(de::Error::custom)
    }
}

// One completed iteration on one node.
#[derive(Debug, Clone, PartialEq, serde_derive::Serialize, serde_derive::Deserialize)]
pub struct IterationResult {

    #[serde(rename = "Leecher ID")]
    pub node_id: String,

    // Seconds.
    #[serde(rename = "Transfer Time")]
    pub transfer_time: f64,

    // Kilobits per second.
    #[serde(rename = "Throughput")]
    pub throughput: f64,

    #[serde(rename = "File Size")]
    pub file_size: u64,

    #[serde(rename = "Size Category")]
    pub size_category: SizeCategory,

    // 1-based, never reused within a run.
    #[serde(rename = "Iteration")]
    pub iteration: u32,

    // Estimated, see `metrics`.
    #[serde(rename = "Total Data Transferred")]
    pub total_data_transferred: u64,

    // Estimated, see `metrics`.
    #[serde(rename = "Transfer Ratio")]
    pub transfer_ratio: f64,

    #[serde(rename = "Timestamp", with = "timestamp")]
    pub timestamp: DateTime<Utc>,

}

impl Record for IterationResult {
    const HEADER: &'static [&'static str] = &[
        "Leecher ID",
        "Transfer Time",
        "Throughput",
        "File Size",
        "Size Category",
        "Iteration",
        "Total Data Transferred",
        "Transfer Ratio",
        "Timestamp",
    ];
}

// Aggregate of one run on one node.
#[derive(Debug, Clone, PartialEq, serde_derive::Serialize, serde_derive::Deserialize)]
pub struct RunSummary {

    #[serde(rename = "Leecher ID")]
    pub node_id: String,

    #[serde(rename = "File Size")]
    pub file_size: u64,

    #[serde(rename = "Size Category", serialize_with = "category_file_serialize")]
    pub size_category: SizeCategory,

    #[serde(rename = "Avg Transfer Time")]
    pub avg_transfer_time: f64,

    #[serde(rename = "Std Dev Transfer Time")]
    pub std_dev_transfer_time: f64,

    #[serde(rename = "Avg Throughput")]
    pub avg_throughput: f64,

    #[serde(rename = "Std Dev Throughput")]
    pub std_dev_throughput: f64,

    #[serde(rename = "Avg Transfer Ratio")]
    pub avg_transfer_ratio: f64,

    #[serde(rename = "Std Dev Transfer Ratio")]
    pub std_dev_transfer_ratio: f64,

    #[serde(rename = "Timestamp", with = "timestamp")]
    pub timestamp: DateTime<Utc>,

}

impl RunSummary {

    // Population statistics over the recorded iterations, None when there are none.
    pub fn from_results(results: &[IterationResult]) -> Option<Self> {
        let first = results.first()?;
        let times: Vec<f64> = results.iter().map(|r| r.transfer_time).collect();
        let throughputs: Vec<f64> = results.iter().map(|r| r.throughput).collect();
        let ratios: Vec<f64> = results.iter().map(|r| r.transfer_ratio).collect();

        Some(Self {
            node_id: first.node_id.clone(),
            file_size: first.file_size,
            size_category: first.size_category,
            avg_transfer_time: stats::mean(&times)?,
            std_dev_transfer_time: stats::population_std_dev(&times)?,
            avg_throughput: stats::mean(&throughputs)?,
            std_dev_throughput: stats::population_std_dev(&throughputs)?,
            avg_transfer_ratio: stats::mean(&ratios)?,
            std_dev_transfer_ratio: stats::population_std_dev(&ratios)?,
            timestamp: now_timestamp(),
        })
    }

}

impl Record for RunSummary {
    const HEADER: &'static [&'static str] = &[
        "Leecher ID",
        "File Size",
        "Size Category",
        "Avg Transfer Time",
        "Std Dev Transfer Time",
        "Avg Throughput",
        "Std Dev Throughput",
        "Avg Transfer Ratio",
        "Std Dev Transfer Ratio",
        "Timestamp",
    ];
}
