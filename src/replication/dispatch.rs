//! Dispatch stage
//!
//! One task per observer: compute removals, drain pending updates into a
//! single message, encode it and hand the bytes to the observer's sink.
//! Sinks never block. A full queue drops the message and schedules a resync;
//! a closed one marks the observer for pruning at the start of the next tick.

use hashbrown::HashMap;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::net::codec::WireCodec;
use crate::net::sink::SinkError;
use crate::replication::viewer::ViewerState;
use crate::replication::ObserverId;

/// Counts produced by one dispatch pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub messages_sent: usize,
    pub bytes_sent: usize,
    /// Messages lost to a full or closed sink, or a codec failure
    pub messages_dropped: usize,
    /// Empty messages not sent because heartbeats are off
    pub messages_skipped: usize,
    /// Messages discarded because the observer has no sink
    pub no_sink: usize,
    pub disconnected: usize,
    pub removals: usize,
    pub full_snapshots: usize,
    pub deltas: usize,
    /// Full-resync messages of any cause
    pub resyncs: usize,
    /// Resyncs caused by the pending-update cap
    pub overflow_resyncs: usize,
}

impl DispatchStats {
    fn merge(self, other: Self) -> Self {
        Self {
            messages_sent: self.messages_sent + other.messages_sent,
            bytes_sent: self.bytes_sent + other.bytes_sent,
            messages_dropped: self.messages_dropped + other.messages_dropped,
            messages_skipped: self.messages_skipped + other.messages_skipped,
            no_sink: self.no_sink + other.no_sink,
            disconnected: self.disconnected + other.disconnected,
            removals: self.removals + other.removals,
            full_snapshots: self.full_snapshots + other.full_snapshots,
            deltas: self.deltas + other.deltas,
            resyncs: self.resyncs + other.resyncs,
            overflow_resyncs: self.overflow_resyncs + other.overflow_resyncs,
        }
    }
}

/// Run the dispatch stage for every observer. Must be called inside the
/// engine's worker pool after update queuing has finished.
pub fn dispatch_all(
    observers: &mut HashMap<ObserverId, ViewerState>,
    tick: u64,
    codec: &dyn WireCodec,
    heartbeat: bool,
) -> DispatchStats {
    observers
        .par_values_mut()
        .map(|viewer| dispatch_observer(viewer, tick, codec, heartbeat))
        .reduce(DispatchStats::default, DispatchStats::merge)
}

/// Build, encode and send one observer's message for `tick`
pub fn dispatch_observer(
    viewer: &mut ViewerState,
    tick: u64,
    codec: &dyn WireCodec,
    heartbeat: bool,
) -> DispatchStats {
    let overflowed = viewer.is_overflowed();
    let message = viewer.drain_and_dispatch(tick);
    let mut stats = DispatchStats {
        removals: message.removals.len(),
        full_snapshots: message.full_snapshot_count(),
        deltas: message.delta_count(),
        resyncs: usize::from(message.full_resync),
        overflow_resyncs: usize::from(overflowed),
        ..Default::default()
    };
    if overflowed {
        debug!("Pending cap hit for {}, sending full resync", viewer.id());
    }

    if message.is_empty() && !heartbeat {
        stats.messages_skipped = 1;
        return stats;
    }

    if viewer.sink().is_none() {
        stats.no_sink = 1;
        return stats;
    }

    let bytes = match codec.encode_message(&message) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Failed to encode tick {} for {}: {}", tick, viewer.id(), e);
            viewer.note_message_lost();
            stats.messages_dropped = 1;
            return stats;
        }
    };
    let len = bytes.len();

    let Some(result) = viewer.sink().map(|sink| sink.send(bytes)) else {
        stats.no_sink = 1;
        return stats;
    };

    match result {
        Ok(()) => {
            stats.messages_sent = 1;
            stats.bytes_sent = len;
        }
        Err(SinkError::Full) => {
            debug!("Outbound queue full for {}, resync scheduled", viewer.id());
            viewer.note_message_lost();
            stats.messages_dropped = 1;
        }
        Err(SinkError::Disconnected) => {
            debug!("Sink closed for {}, pruning next tick", viewer.id());
            viewer.mark_disconnected();
            stats.messages_dropped = 1;
            stats.disconnected = 1;
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::{BincodeCodec, CodecError, EntityUpdate};
    use crate::net::sink::ChannelSink;
    use crate::replication::component::{ComponentKind, UpdateRecord};
    use crate::world::EntityId;

    fn viewer_with_sink(capacity: usize) -> (ViewerState, crossbeam_channel::Receiver<Vec<u8>>) {
        let (sink, rx) = if capacity == 0 {
            ChannelSink::unbounded()
        } else {
            ChannelSink::bounded(capacity)
        };
        let mut viewer = ViewerState::new(ObserverId::new(), EntityId(0), 10.0, 64, Some(Box::new(sink)));
        // Consume the first-tick rebuild so later resync requests are observable
        viewer.take_force_new();
        (viewer, rx)
    }

    fn full(byte: u8) -> UpdateRecord {
        UpdateRecord::FullSnapshot { kind: ComponentKind(0), data: vec![byte] }
    }

    #[test]
    fn test_sends_encoded_message() {
        let (mut viewer, rx) = viewer_with_sink(0);
        viewer.record_visible(EntityId(1));
        viewer.queue_update(EntityId(1), full(9));

        let stats = dispatch_observer(&mut viewer, 3, &BincodeCodec::new(), false);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.full_snapshots, 1);

        let bytes = rx.try_recv().unwrap();
        assert_eq!(stats.bytes_sent, bytes.len());
        let message = BincodeCodec::new().decode_message(&bytes).unwrap();
        assert_eq!(message.tick, 3);
        assert_eq!(message.updates, vec![EntityUpdate { entity: EntityId(1), record: full(9) }]);
    }

    #[test]
    fn test_empty_message_skipped_without_heartbeat() {
        let (mut viewer, rx) = viewer_with_sink(0);

        let stats = dispatch_observer(&mut viewer, 1, &BincodeCodec::new(), false);
        assert_eq!(stats.messages_skipped, 1);
        assert!(rx.try_recv().is_err());

        let stats = dispatch_observer(&mut viewer, 2, &BincodeCodec::new(), true);
        assert_eq!(stats.messages_sent, 1, "Heartbeat sends the empty message");
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn test_full_sink_schedules_resync() {
        let (mut viewer, rx) = viewer_with_sink(1);
        let codec = BincodeCodec::new();

        viewer.record_visible(EntityId(1));
        viewer.queue_update(EntityId(1), full(1));
        assert_eq!(dispatch_observer(&mut viewer, 1, &codec, false).messages_sent, 1);

        viewer.begin_tick();
        viewer.record_visible(EntityId(1));
        viewer.queue_update(EntityId(1), full(2));
        let stats = dispatch_observer(&mut viewer, 2, &codec, false);
        assert_eq!(stats.messages_dropped, 1);
        assert!(viewer.sent_last_tick().is_empty(), "Lost message forgets what the client knows");
        assert!(viewer.take_force_new());

        rx.try_recv().unwrap();
        viewer.begin_tick();
        let stats = dispatch_observer(&mut viewer, 3, &codec, false);
        assert_eq!(stats.messages_sent, 1);
        let message = codec.decode_message(&rx.try_recv().unwrap()).unwrap();
        assert!(message.full_resync);
    }

    #[test]
    fn test_disconnected_sink_marks_prune() {
        let (mut viewer, rx) = viewer_with_sink(0);
        drop(rx);
        viewer.record_visible(EntityId(1));
        viewer.queue_update(EntityId(1), full(1));

        let stats = dispatch_observer(&mut viewer, 1, &BincodeCodec::new(), false);
        assert_eq!(stats.disconnected, 1);
        assert!(viewer.should_prune());
    }

    #[test]
    fn test_no_sink_discards() {
        let mut viewer = ViewerState::new(ObserverId::new(), EntityId(0), 10.0, 64, None);
        viewer.record_visible(EntityId(1));
        viewer.queue_update(EntityId(1), full(1));

        let stats = dispatch_observer(&mut viewer, 1, &BincodeCodec::new(), false);
        assert_eq!(stats.no_sink, 1);
        assert_eq!(viewer.pending_len(), 0);
        assert_eq!(viewer.sent_last_tick().len(), 1);
    }

    struct FailingCodec;

    impl WireCodec for FailingCodec {
        fn encode_update(&self, _update: &EntityUpdate, _out: &mut Vec<u8>) -> Result<(), CodecError> {
            Err(CodecError::Encode("refused".into()))
        }

        fn encode_removals(&self, _removals: &[EntityId], _out: &mut Vec<u8>) -> Result<(), CodecError> {
            Ok(())
        }
    }

    #[test]
    fn test_codec_failure_treated_as_lost() {
        let (mut viewer, rx) = viewer_with_sink(0);
        viewer.record_visible(EntityId(1));
        viewer.queue_update(EntityId(1), full(1));

        let stats = dispatch_observer(&mut viewer, 1, &FailingCodec, false);
        assert_eq!(stats.messages_dropped, 1);
        assert!(rx.try_recv().is_err());
        assert!(viewer.take_force_new());
    }

    #[test]
    fn test_dispatch_all_aggregates() {
        let mut observers = HashMap::new();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (mut viewer, rx) = viewer_with_sink(0);
            viewer.record_visible(EntityId(1));
            viewer.queue_update(EntityId(1), full(1));
            observers.insert(viewer.id(), viewer);
            receivers.push(rx);
        }

        let stats = dispatch_all(&mut observers, 1, &BincodeCodec::new(), false);
        assert_eq!(stats.messages_sent, 4);
        assert!(receivers.iter().all(|rx| rx.len() == 1));
    }
}
