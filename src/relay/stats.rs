//! Per-run counters returned by the relay stage

use serde::Serialize;

/// What happened to one inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Transformed and handed to the broker
    Relayed,
    /// Not for this stage (topic mismatch or skipped retained message)
    Skipped,
    /// Transform rejected the payload
    DecodeFailed,
    /// Publish failed; the message is gone
    Dropped,
}

/// Counters for one `RelayStage::run`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub received: u64,
    pub published: u64,
    pub skipped: u64,
    pub decode_failures: u64,
    pub publish_failures: u64,
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub sessions_established: u64,
    /// Established sessions that were lost
    pub reconnects: u64,
}

impl RelayStats {
    pub fn record(&mut self, outcome: MessageOutcome) {
        self.received += 1;
        match outcome {
            MessageOutcome::Relayed => self.published += 1,
            MessageOutcome::Skipped => self.skipped += 1,
            MessageOutcome::DecodeFailed => self.decode_failures += 1,
            MessageOutcome::Dropped => self.publish_failures += 1,
        }
    }

    /// Every received message is accounted for exactly once
    pub fn is_balanced(&self) -> bool {
        self.received
            == self.published + self.skipped + self.decode_failures + self.publish_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcomes() {
        let mut stats = RelayStats::default();
        stats.record(MessageOutcome::Relayed);
        stats.record(MessageOutcome::Relayed);
        stats.record(MessageOutcome::Skipped);
        stats.record(MessageOutcome::DecodeFailed);
        stats.record(MessageOutcome::Dropped);

        assert_eq!(stats.received, 5);
        assert_eq!(stats.published, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.publish_failures, 1);
        assert!(stats.is_balanced());
    }

    #[test]
    fn test_stats_serialize() {
        let json = serde_json::to_value(RelayStats::default()).unwrap();
        assert_eq!(json["received"], 0);
        assert_eq!(json["reconnects"], 0);
    }
}
