//! Group key agreement for dynamic peer-to-peer sessions, based on the
//! Burmester-Desmedt cyclic protocol.
//!
//! Every participant of a session runs one [`CycleEngine`]. The engines
//! exchange two broadcast rounds per rekey "cycle" (a `z` value, then an
//! `x` value per member) and converge on the same symmetric [`SessionKey`]
//! without a trusted party. Cycles are started by the elected initiator (the
//! participant with the smallest id in the local roster, no negotiation) and
//! are expected to follow every membership change.
//!
//! The engine is transport-agnostic and tolerates protocol messages in any
//! order: a message for a cycle it has never heard of opens that cycle from
//! the message envelope, an `x` arriving before the kickoff is stored until
//! the missing `z` values catch up, and a roster change re-checks every
//! in-flight cycle that may have been blocked on it.
//!
//! A normal usage flow:
//!
//! 1. build an engine with [`CycleEngine::builder`], injecting the
//!    key-agreement primitives (a [`KeyAgreement`] implementation such as
//!    [`EcKeyAgreement`]), the outbound [`MessageSink`], and optionally a
//!    step-change observer;
//! 2. call [`CycleEngine::set_my_id`] once, then feed roster changes through
//!    [`CycleEngine::add_member`] / [`CycleEngine::delete_member`] as the
//!    membership service reports them;
//! 3. the elected initiator calls [`CycleEngine::start`] to begin a cycle;
//! 4. hand every inbound protocol message to
//!    [`CycleEngine::handle_message`]; the engine broadcasts its own
//!    messages through the sink as cycles advance;
//! 5. once the step reaches [`Step::Ready`], read the agreed key from
//!    [`CycleEngine::key`]; after the next rekey the superseded key stays
//!    reachable through [`CycleEngine::previous_key`].
//!
//! The protocol authenticates nobody and assumes nothing about delivery
//! ordering; authentication, framing, and delivery are the transport's
//! concern.

pub mod crypto;
pub mod cycle;
pub mod message;

pub use crypto::{AgreementError, EcKeyAgreement, KeyAgreement};
pub use cycle::{Bug, CycleEngine, CycleEngineBuilder, CycleError, ProtocolViolation, Step};
pub use message::{CycleMessage, Initiator, MessageSink, Payload, ValueKind};
pub use session_key::{InvalidKey, KeyRing, KeyTag, ParticipantId, SessionKey};
