use std::{collections::HashSet, net::IpAddr};
use tokio::time::Instant;
use crate::{detector::Phase, event::TransferEvent, stats::Counter};

// Everything the run loop knows about the iteration in flight.
// Created when the session is, dropped with it.
#[derive(Debug)]
pub struct IterationState {

    pub start: Instant,

    download: Counter,

    upload: Counter,

    // Highest completion fraction seen so far.
    progress: f64,

    // Peers are counted per address, reconnects don't count.
    peers: HashSet<IpAddr>,

    // Set once the first downloaded byte is seen, never cleared.
    transfer_started: bool,

    pub(crate) phase: Phase,

}

impl IterationState {

    pub fn new(start: Instant) -> Self {
        Self {
            start,
            download: Counter::default(),
            upload: Counter::default(),
            progress: 0.0,
            peers: HashSet::new(),
            transfer_started: false,
            phase: Phase::Running,
        }
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn transfer_started(&self) -> bool {
        self.transfer_started
    }

    // Last absolute totals reported by the engine.
    pub fn downloaded(&self) -> u64 {
        self.download.last()
    }

    pub fn uploaded(&self) -> u64 {
        self.upload.last()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    // Smoothed peak rates, bytes per tick.
    pub fn peak_download_rate(&self) -> u64 {
        self.download.peak()
    }

    pub fn peak_upload_rate(&self) -> u64 {
        self.upload.peak()
    }

}

// Byte deltas since the previous observation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Deltas {
    pub download: u64,
    pub upload: u64,
}

#[derive(Debug)]
pub struct EventMonitor {
    state: IterationState,
}

impl EventMonitor {

    pub fn new(start: Instant) -> Self {
        Self { state: IterationState::new(start) }
    }

    pub fn state(&self) -> &IterationState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut IterationState {
        &mut self.state
    }

    pub fn observe(&mut self, event: TransferEvent) {
        match event {

            TransferEvent::PeerConnected { address } => {
                if self.state.peers.insert(address.ip()) {
                    tracing::info!("new peer connected from {} ({} total)", address.ip(), self.state.peers.len());
                }
            },

            TransferEvent::PieceCompleted { index } => {
                tracing::debug!("piece {} completed, available for sharing", index);
            },

            TransferEvent::TrackerAnnounce { message } => {
                tracing::info!("tracker announce: {}", message);
            },

            TransferEvent::TrackerReply { message } => {
                tracing::info!("tracker reply: {}", message);
            },

            TransferEvent::ProgressChanged { fraction } => {
                // Duplicates and stale values are expected, only increases count.
                if fraction > self.state.progress {
                    self.state.progress = fraction;
                    tracing::info!("progress update: {:.2}%", fraction * 100.0);
                }
            },
        }
    }

    // Feeds the engine's absolute byte totals.
    pub fn observe_counters(&mut self, downloaded: u64, uploaded: u64) -> Deltas {
        let deltas = Deltas {
            download: self.state.download.observe(downloaded),
            upload: self.state.upload.observe(uploaded),
        };

        if deltas.download > 0 {
            if !self.state.transfer_started {
                self.state.transfer_started = true;
                tracing::info!("data transfer started");
            }
            tracing::debug!("downloading at {:.1} kB/s", deltas.download as f64 / 1024.0);
        }
        if deltas.upload > 0 {
            tracing::debug!("uploading at {:.1} kB/s", deltas.upload as f64 / 1024.0);
        }

        self.state.download.reset();
        self.state.upload.reset();
        deltas
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn monitor() -> EventMonitor {
        EventMonitor::new(Instant::now())
    }

    #[test]
    fn test_peers_deduplicated_by_ip() {
        let mut monitor = monitor();
        let a: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        let a_other_port: SocketAddr = "10.0.0.2:51413".parse().unwrap();
        let b: SocketAddr = "10.0.0.3:6881".parse().unwrap();

        monitor.observe(TransferEvent::PeerConnected { address: a });
        monitor.observe(TransferEvent::PeerConnected { address: a_other_port });
        monitor.observe(TransferEvent::PeerConnected { address: a });
        assert_eq!(monitor.state().peer_count(), 1);

        monitor.observe(TransferEvent::PeerConnected { address: b });
        assert_eq!(monitor.state().peer_count(), 2);
    }

    #[test]
    fn test_progress_non_decreasing() {
        let mut monitor = monitor();
        let fractions = [0.1, 0.3, 0.3, 0.2, 0.0, 0.5, 0.45, 0.5, 1.0, 0.9];
        let mut last = 0.0;
        for fraction in fractions {
            monitor.observe(TransferEvent::ProgressChanged { fraction });
            assert!(monitor.state().progress() >= last);
            last = monitor.state().progress();
        }
        assert_eq!(monitor.state().progress(), 1.0);
    }

    #[test]
    fn test_progress_ignores_nan() {
        let mut monitor = monitor();
        monitor.observe(TransferEvent::ProgressChanged { fraction: 0.4 });
        monitor.observe(TransferEvent::ProgressChanged { fraction: f64::NAN });
        assert_eq!(monitor.state().progress(), 0.4);
    }

    #[test]
    fn test_deltas_never_negative() {
        let mut monitor = monitor();
        assert_eq!(monitor.observe_counters(4096, 1024), Deltas { download: 4096, upload: 1024 });
        assert_eq!(monitor.observe_counters(8192, 1024), Deltas { download: 4096, upload: 0 });
        // Counter reset on the engine side.
        assert_eq!(monitor.observe_counters(0, 0), Deltas { download: 0, upload: 0 });
        assert_eq!(monitor.observe_counters(100, 50), Deltas { download: 100, upload: 50 });
        assert_eq!(monitor.state().downloaded(), 100);
        assert_eq!(monitor.state().uploaded(), 50);
    }

    #[test]
    fn test_transfer_started_is_sticky() {
        let mut monitor = monitor();
        monitor.observe_counters(0, 0);
        assert!(!monitor.state().transfer_started());
        monitor.observe_counters(1, 0);
        assert!(monitor.state().transfer_started());
        monitor.observe_counters(0, 0);
        assert!(monitor.state().transfer_started());
    }
}
