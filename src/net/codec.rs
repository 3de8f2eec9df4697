//! Outgoing message layout and wire encoding
//!
//! The replication core builds one [`OutgoingMessage`] per observer per tick
//! and hands it to a [`WireCodec`]. The codec owns the byte layout; the core
//! only relies on "encode an update" and "encode a removal set".
//!
//! Default framing produced by [`WireCodec::encode_message`]:
//! `[u64 tick LE][u8 flags][removal block][u32 update count LE][update]*`

use serde::{Deserialize, Serialize};

use crate::replication::component::UpdateRecord;
use crate::world::EntityId;

/// Message flag: client must drop its replicated view before applying
pub const FLAG_FULL_RESYNC: u8 = 1 << 0;

/// Size of the fixed message header (tick + flags)
const HEADER_LEN: usize = 9;

/// One queued update addressed to an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub entity: EntityId,
    pub record: UpdateRecord,
}

/// Everything one observer receives for one tick
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub tick: u64,
    /// Client drops everything it knows before applying this message
    pub full_resync: bool,
    /// Entities that left the observer's view, sorted
    pub removals: Vec<EntityId>,
    /// Updates sorted by (entity, component kind)
    pub updates: Vec<EntityUpdate>,
}

impl OutgoingMessage {
    /// A resync notice with no content
    pub fn resync(tick: u64) -> Self {
        Self {
            tick,
            full_resync: true,
            removals: Vec::new(),
            updates: Vec::new(),
        }
    }

    /// Nothing to tell the client (heartbeat candidates)
    pub fn is_empty(&self) -> bool {
        !self.full_resync && self.removals.is_empty() && self.updates.is_empty()
    }

    pub fn full_snapshot_count(&self) -> usize {
        self.updates.iter().filter(|u| u.record.is_full_snapshot()).count()
    }

    pub fn delta_count(&self) -> usize {
        self.updates.len() - self.full_snapshot_count()
    }

    fn flags(&self) -> u8 {
        if self.full_resync {
            FLAG_FULL_RESYNC
        } else {
            0
        }
    }
}

/// Errors that can occur while encoding or decoding messages
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Message truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
}

/// Wire encoding consumed by the dispatch stage
pub trait WireCodec: Send + Sync {
    /// Append one entity update to `out`
    fn encode_update(&self, update: &EntityUpdate, out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Append a removal set to `out`
    fn encode_removals(&self, removals: &[EntityId], out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Encode a whole message with the default framing
    fn encode_message(&self, message: &OutgoingMessage) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(HEADER_LEN + 8 * message.removals.len() + 32 * message.updates.len());
        out.extend_from_slice(&message.tick.to_le_bytes());
        out.push(message.flags());
        self.encode_removals(&message.removals, &mut out)?;
        out.extend_from_slice(&update_count(message.updates.len())?.to_le_bytes());
        for update in &message.updates {
            self.encode_update(update, &mut out)?;
        }
        Ok(out)
    }
}

/// Update count as written in the `u32` count field
fn update_count(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::Encode(format!("{} updates do not fit the u32 count field", len)))
}

// ============================================================================
// Bincode Codec
// ============================================================================

/// Bincode implementation of [`WireCodec`]
/// Uses legacy config for fixed-size integers (stable layout for non-Rust clients)
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl BincodeCodec {
    pub fn new() -> Self {
        Self
    }

    /// Decode a message produced by [`WireCodec::encode_message`]
    pub fn decode_message(&self, data: &[u8]) -> Result<OutgoingMessage, CodecError> {
        if data.len() < HEADER_LEN {
            return Err(CodecError::Truncated { needed: HEADER_LEN, available: data.len() });
        }
        let mut tick_bytes = [0u8; 8];
        tick_bytes.copy_from_slice(&data[..8]);
        let tick = u64::from_le_bytes(tick_bytes);
        let flags = data[8];
        let mut offset = HEADER_LEN;

        let (removals, used): (Vec<EntityId>, usize) = decode_at(data, offset)?;
        offset += used;

        if data.len() < offset + 4 {
            return Err(CodecError::Truncated { needed: offset + 4, available: data.len() });
        }
        let mut count_bytes = [0u8; 4];
        count_bytes.copy_from_slice(&data[offset..offset + 4]);
        let count = u32::from_le_bytes(count_bytes) as usize;
        offset += 4;

        let mut updates = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let (update, used): (EntityUpdate, usize) = decode_at(data, offset)?;
            offset += used;
            updates.push(update);
        }

        Ok(OutgoingMessage {
            tick,
            full_resync: flags & FLAG_FULL_RESYNC != 0,
            removals,
            updates,
        })
    }
}

fn encode_into<T: Serialize>(value: &T, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::legacy())
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    out.extend_from_slice(&bytes);
    Ok(())
}

fn decode_at<T: for<'de> Deserialize<'de>>(data: &[u8], offset: usize) -> Result<(T, usize), CodecError> {
    bincode::serde::decode_from_slice(&data[offset..], bincode::config::legacy())
        .map_err(|e| CodecError::Decode(e.to_string()))
}

impl WireCodec for BincodeCodec {
    fn encode_update(&self, update: &EntityUpdate, out: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_into(update, out)
    }

    fn encode_removals(&self, removals: &[EntityId], out: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_into(&removals, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::component::ComponentKind;

    fn sample_message() -> OutgoingMessage {
        OutgoingMessage {
            tick: 42,
            full_resync: false,
            removals: vec![EntityId(3), EntityId(9)],
            updates: vec![
                EntityUpdate {
                    entity: EntityId(1),
                    record: UpdateRecord::FullSnapshot { kind: ComponentKind(0), data: vec![1, 2, 3] },
                },
                EntityUpdate {
                    entity: EntityId(2),
                    record: UpdateRecord::Delta { kind: ComponentKind(1), payload: vec![7] },
                },
            ],
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let codec = BincodeCodec::new();
        let message = sample_message();

        let bytes = codec.encode_message(&message).unwrap();
        let decoded = codec.decode_message(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_header_layout() {
        let codec = BincodeCodec::new();
        let bytes = codec.encode_message(&OutgoingMessage::resync(5)).unwrap();

        assert_eq!(&bytes[..8], &5u64.to_le_bytes());
        assert_eq!(bytes[8], FLAG_FULL_RESYNC);
        assert!(codec.decode_message(&bytes).unwrap().full_resync);
    }

    #[test]
    fn test_decode_truncated() {
        let codec = BincodeCodec::new();
        let bytes = codec.encode_message(&sample_message()).unwrap();

        assert!(matches!(codec.decode_message(&bytes[..4]), Err(CodecError::Truncated { .. })));
        assert!(codec.decode_message(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_message_counts() {
        let message = sample_message();
        assert_eq!(message.full_snapshot_count(), 1);
        assert_eq!(message.delta_count(), 1);
        assert!(!message.is_empty());
        assert!(OutgoingMessage::default().is_empty());
        assert!(!OutgoingMessage::resync(1).is_empty(), "A resync notice always carries meaning");
    }

    #[test]
    fn test_update_count_fits_u32() {
        assert_eq!(update_count(2).unwrap(), 2);
        assert_eq!(update_count(u32::MAX as usize).unwrap(), u32::MAX);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_update_count_overflow_is_encode_error() {
        let err = update_count(u32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, CodecError::Encode(_)), "Got {:?}", err);
    }
}
