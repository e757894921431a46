// Per-iteration metrics.
//
// The swarm-wide figures are extrapolated from a single node's counters under
// a fixed swarm shape: one source and `peer_fanout` receivers that all upload
// as much as the observing node did. They are estimates, not measurements.

use std::time::Duration;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MetricsError {

    #[error("division by zero: {0} is zero")]
    DivideByZero(&'static str),

}

pub type Result<T> = std::result::Result<T, MetricsError>;

#[derive(Debug, Clone, Copy)]
pub struct MetricsInput {

    // Bytes in the transferred file.
    pub file_size: u64,

    pub transfer_time: Duration,

    // Bytes this node uploaded during the iteration.
    pub uploaded: u64,

}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metrics {

    // Seconds.
    pub transfer_time: f64,

    // Kilobits per second, scaled by the fanout.
    pub throughput: f64,

    // Estimated bytes moved across the whole swarm.
    pub estimated_total: u64,

    // Estimated total over file_size * fanout.
    pub transfer_ratio: f64,

}

#[derive(Debug, Clone, Copy)]
pub struct MetricsEstimator {
    peer_fanout: u32,
}

impl MetricsEstimator {

    pub fn new(peer_fanout: u32) -> Self {
        Self { peer_fanout }
    }

    pub fn estimate(&self, input: MetricsInput) -> Result<Metrics> {
        if input.file_size == 0 {
            return Err(MetricsError::DivideByZero("file size"));
        }
        if input.transfer_time.is_zero() {
            return Err(MetricsError::DivideByZero("transfer time"));
        }
        if self.peer_fanout == 0 {
            return Err(MetricsError::DivideByZero("peer fanout"));
        }

        let fanout = self.peer_fanout as u64;
        let transfer_time = input.transfer_time.as_secs_f64();
        let throughput = (input.file_size as f64 * 8.0 * fanout as f64) / (transfer_time * 1000.0);

        // Byte counts saturate at u64::MAX.
        let source_upload = fanout.saturating_mul(input.file_size);
        let receiver_download = fanout.saturating_mul(input.file_size);
        let receiver_upload = fanout.saturating_mul(input.uploaded);
        let estimated_total = source_upload
            .saturating_add(receiver_download)
            .saturating_add(receiver_upload);
        let transfer_ratio = estimated_total as f64 / (input.file_size as f64 * fanout as f64);

        Ok(Metrics {
            transfer_time,
            throughput,
            estimated_total,
            transfer_ratio,
        })
    }

}
