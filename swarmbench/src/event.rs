use std::{fmt, net::SocketAddr};

// Progress notifications produced by a transfer session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {

    // A connection with a remote peer was established.
    PeerConnected { address: SocketAddr },

    // A piece is complete and available for sharing.
    PieceCompleted { index: usize },

    // An announce / discovery request was sent.
    TrackerAnnounce { message: String },

    // The discovery service answered.
    TrackerReply { message: String },

    // Completion fraction in [0, 1].
    ProgressChanged { fraction: f64 },

}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferEvent::PeerConnected { address } => write!(f, "peer connected: {}", address),
            TransferEvent::PieceCompleted { index } => write!(f, "piece {} completed", index),
            TransferEvent::TrackerAnnounce { message } => write!(f, "tracker announce: {}", message),
            TransferEvent::TrackerReply { message } => write!(f, "tracker reply: {}", message),
            TransferEvent::ProgressChanged { fraction } => write!(f, "progress: {:.2}%", fraction * 100.0),
        }
    }
}
