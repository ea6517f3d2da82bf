//! Protocol messages
//!
//! One cycle of the agreement exchanges two broadcasts per participant: a
//! `z` value in round 1 and an `x` value in round 2. Every message carries
//! the cycle envelope (initiator id, rekey counter, and the membership the
//! initiator declared), so a participant can join a cycle it has never heard
//! of from any one of its messages.

use core::fmt;

use serde::{Deserialize, Serialize};
use session_key::ParticipantId;

/// Cycle envelope, present on every protocol message.
///
/// The envelope is authoritative: a message carrying a counter newer than
/// anything held locally opens a fresh cycle record from the envelope alone,
/// whether it is a `z` or an `x` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiator {
    /// Id of the participant that initiated the cycle
    pub id: ParticipantId,
    /// Rekey counter the initiator chose for the cycle
    pub counter: u64,
    /// Membership the initiator declared for the cycle, sorted ascending;
    /// positions in this sequence index the per-member value arrays
    pub members: Vec<ParticipantId>,
}

/// Z or X value carried by one protocol message.
///
/// Values are opaque byte sequences produced and consumed by the
/// key-agreement primitives; the engine stores and forwards them without
/// interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Payload {
    /// Round-1 public value
    Z(#[serde(with = "hex::serde")] Vec<u8>),
    /// Round-2 public value
    X(#[serde(with = "hex::serde")] Vec<u8>),
}

impl Payload {
    /// Which of the two per-cycle value arrays this payload belongs to.
    pub fn kind(&self) -> ValueKind {
        match self {
            Payload::Z(_) => ValueKind::Z,
            Payload::X(_) => ValueKind::X,
        }
    }

    /// Raw value bytes.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::Z(bytes) | Payload::X(bytes) => bytes,
        }
    }
}

/// Discriminator of the two broadcast rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Z,
    X,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Z => f.write_str("z"),
            ValueKind::X => f.write_str("x"),
        }
    }
}

/// One broadcast of the agreement protocol.
///
/// The sender id is not part of the message; the transport supplies it
/// alongside on delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleMessage {
    pub initiator: Initiator,
    #[serde(flatten)]
    pub payload: Payload,
}

/// Outbound transport hook.
///
/// The engine hands every outbound message to the sink as it produces it;
/// wire framing and fan-out to the other participants are the transport's
/// concern. Delivery ordering is not assumed anywhere.
pub trait MessageSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn broadcast(&mut self, message: CycleMessage) -> Result<(), Self::Error>;
}
