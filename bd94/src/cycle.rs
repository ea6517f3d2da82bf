//! The cycle engine
//!
//! One [`CycleEngine`] per participant. The engine ingests roster changes
//! and inbound protocol messages, broadcasts its own messages through the
//! injected sink, and rolls the session key forward when a cycle completes.
//! Each in-flight cycle is an independent record in a table keyed by
//! initiator id; records advance out of order and tolerate messages
//! arriving before the kickoff that declared them.

use std::collections::BTreeMap;
use std::fmt;

use session_key::{KeyRing, KeyTag, ParticipantId, SessionKey};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::crypto::KeyAgreement;
use crate::message::{CycleMessage, Initiator, MessageSink, Payload, ValueKind};

/// Coarse public phase of the whole engine, distinct from per-cycle
/// progress.
///
/// `Ready` persists until the next cycle begins; dropping back to
/// `WaitingZ` from `Ready` is the normal start of a rekey.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Initialized,
    WaitingZ,
    WaitingX,
    Ready,
}

/// In-flight state of one `(initiator, counter)` cycle.
///
/// `members` is fixed at creation and sizes both value arrays; every slot
/// is written at most once while the record lives.
struct CycleRecord {
    counter: u64,
    members: Vec<ParticipantId>,
    /// This participant's private scalar for the cycle.
    r: Vec<u8>,
    z_values: Vec<Option<Vec<u8>>>,
    x_values: Vec<Option<Vec<u8>>>,
}

impl CycleRecord {
    fn new(counter: u64, members: Vec<ParticipantId>, r: Vec<u8>) -> Self {
        let n = members.len();
        Self {
            counter,
            members,
            r,
            z_values: vec![None; n],
            x_values: vec![None; n],
        }
    }

    fn position(&self, participant: ParticipantId) -> Option<usize> {
        self.members.iter().position(|&m| m == participant)
    }

    fn z_complete(&self) -> bool {
        self.z_values.iter().all(Option::is_some)
    }

    fn x_complete(&self) -> bool {
        self.x_values.iter().all(Option::is_some)
    }
}

// Structural snapshot for logs; slot contents and the private scalar stay
// out.
impl fmt::Debug for CycleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let filled = |values: &[Option<Vec<u8>>]| values.iter().flatten().count();
        f.debug_struct("CycleRecord")
            .field("counter", &self.counter)
            .field("members", &self.members)
            .field("z", &format_args!("{}/{}", filled(&self.z_values), self.z_values.len()))
            .field("x", &format_args!("{}/{}", filled(&self.x_values), self.x_values.len()))
            .finish()
    }
}

/// Builder of a [`CycleEngine`].
pub struct CycleEngineBuilder<C, S> {
    crypto: C,
    sink: S,
    step_listener: Option<Box<dyn FnMut(Step)>>,
}

impl<C, S> CycleEngineBuilder<C, S> {
    /// Registers the step-change observer.
    ///
    /// Invoked once per actual change of the engine's [`Step`], after the
    /// change took effect. Fire-and-forget: the engine never waits on it
    /// and never re-enters itself while dispatching.
    pub fn on_step_change(mut self, listener: impl FnMut(Step) + 'static) -> Self {
        self.step_listener = Some(Box::new(listener));
        self
    }

    pub fn build(self) -> CycleEngine<C, S> {
        CycleEngine {
            crypto: self.crypto,
            sink: self.sink,
            my_id: None,
            roster: Vec::new(),
            cycles: BTreeMap::new(),
            keys: KeyRing::new(),
            step: Step::Initialized,
            my_counter: 0,
            step_listener: self.step_listener,
        }
    }
}

/// Group key-agreement engine of one participant.
///
/// All operations are non-reentrant with respect to the same instance; the
/// surrounding runtime serializes calls. Key derivation is the sole
/// suspension point, so the async operations never interleave cycle-table
/// mutation with an await on the same record.
pub struct CycleEngine<C, S> {
    crypto: C,
    sink: S,
    my_id: Option<ParticipantId>,
    /// Locally-observed membership, sorted ascending, unique.
    roster: Vec<ParticipantId>,
    cycles: BTreeMap<ParticipantId, CycleRecord>,
    keys: KeyRing,
    step: Step,
    /// Rekey counter of cycles this participant initiates; monotone for the
    /// lifetime of the instance.
    my_counter: u64,
    step_listener: Option<Box<dyn FnMut(Step)>>,
}

impl<C, S> CycleEngine<C, S>
where
    C: KeyAgreement,
    S: MessageSink,
{
    pub fn builder(crypto: C, sink: S) -> CycleEngineBuilder<C, S> {
        CycleEngineBuilder {
            crypto,
            sink,
            step_listener: None,
        }
    }

    /// Records the local participant id and adds it to the roster.
    ///
    /// One-shot: calls after the first are ignored.
    pub fn set_my_id(&mut self, id: ParticipantId) {
        if self.my_id.is_some() {
            return;
        }
        self.my_id = Some(id);
        self.insert_roster(id);
        debug!(id, "local participant id set");
    }

    pub fn my_id(&self) -> Option<ParticipantId> {
        self.my_id
    }

    /// Locally-observed membership, sorted ascending.
    pub fn roster(&self) -> &[ParticipantId] {
        &self.roster
    }

    /// Whether this participant is the elected initiator: no negotiation,
    /// the smallest id present in the local roster initiates.
    pub fn is_initiator(&self) -> bool {
        match (self.my_id, self.roster.first()) {
            (Some(me), Some(&smallest)) => me <= smallest,
            _ => false,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Current session key, once a cycle has completed.
    pub fn key(&self) -> Option<&SessionKey> {
        self.keys.current()
    }

    /// Key superseded by the most recent rotation.
    pub fn previous_key(&self) -> Option<&SessionKey> {
        self.keys.previous()
    }

    /// Number of cycles currently in flight.
    pub fn cycles_in_flight(&self) -> usize {
        self.cycles.len()
    }

    #[cfg(test)]
    fn cycle_counter(&self, initiator: ParticipantId) -> Option<u64> {
        self.cycles.get(&initiator).map(|record| record.counter)
    }

    /// Adds a participant to the local roster and re-checks in-flight
    /// cycles.
    ///
    /// A cycle may have been blocked waiting for this member to appear
    /// locally; the re-check lets it advance without another message.
    pub async fn add_member(
        &mut self,
        id: ParticipantId,
    ) -> Result<(), CycleError<C::Error, S::Error>> {
        if self.insert_roster(id) {
            debug!(id, roster = ?self.roster, "member added");
        }
        self.recheck_cycles().await
    }

    /// Removes a participant from the local roster and re-checks in-flight
    /// cycles.
    pub async fn delete_member(
        &mut self,
        id: ParticipantId,
    ) -> Result<(), CycleError<C::Error, S::Error>> {
        if let Ok(at) = self.roster.binary_search(&id) {
            self.roster.remove(at);
            debug!(id, roster = ?self.roster, "member removed");
        }
        self.recheck_cycles().await
    }

    /// Starts a new cycle over the current roster.
    ///
    /// Only the elected initiator may call this, and only once at least one
    /// other participant is present.
    pub fn start(&mut self) -> Result<(), CycleError<C::Error, S::Error>> {
        let my_id = self.my_id.ok_or(CycleError::IdUnset)?;
        if !self.is_initiator() {
            return Err(CycleError::NotInitiator);
        }
        if self.roster.len() < 2 {
            return Err(CycleError::LoneParticipant);
        }

        self.my_counter += 1;
        let counter = self.my_counter;
        debug_assert!(
            self.cycles
                .get(&my_id)
                .map_or(true, |record| record.counter < counter),
            "rekey counter must advance past every cycle this participant initiated",
        );

        let members = self.roster.clone();
        debug_assert_eq!(members[0], my_id, "the initiator is the smallest id in the roster");

        let r = self.crypto.generate_ri().map_err(CycleError::Crypto)?;
        let z = self.crypto.compute_zi(&r).map_err(CycleError::Crypto)?;

        let mut record = CycleRecord::new(counter, members.clone(), r);
        record.z_values[0] = Some(z.clone());
        self.cycles.insert(my_id, record);
        info!(counter, n = members.len(), "initiating key-agreement cycle");

        self.broadcast(Initiator { id: my_id, counter, members }, Payload::Z(z))?;
        self.set_step(Step::WaitingZ);
        Ok(())
    }

    /// Ingests one inbound protocol message.
    ///
    /// `sender` is supplied by the transport alongside the message. Arrival
    /// order is unconstrained: a message whose envelope names a counter
    /// newer than anything held locally opens the cycle from the envelope
    /// before the payload is applied, `z` and `x` alike.
    pub async fn handle_message(
        &mut self,
        sender: ParticipantId,
        message: CycleMessage,
    ) -> Result<(), CycleError<C::Error, S::Error>> {
        let my_id = self.my_id.ok_or(CycleError::IdUnset)?;
        let CycleMessage { initiator, payload } = message;
        let Initiator { id, counter, members } = initiator;

        // A finished cycle leaves its tag on the installed key; stragglers
        // for it must not reopen a record.
        if self
            .keys
            .newest_counter(id)
            .map_or(false, |installed| counter <= installed)
        {
            trace!(initiator = id, counter, "message for a completed cycle; dropped");
            return Ok(());
        }

        let newer = self
            .cycles
            .get(&id)
            .map_or(true, |record| record.counter < counter);
        if newer {
            let Some(position) = members.iter().position(|&m| m == my_id) else {
                debug!(initiator = id, counter, "absent from the declared members; dropped");
                return Ok(());
            };
            self.open_cycle(id, counter, members, position)?;
        }

        let kind = payload.kind();
        {
            let Some(record) = self.cycles.get_mut(&id) else {
                trace!(initiator = id, counter, "no cycle record for payload; dropped");
                return Ok(());
            };
            let held = record.counter;
            let Some(slot) = record.position(sender) else {
                return Err(CycleError::Violation(ProtocolViolation::UnknownSender {
                    sender,
                    initiator: id,
                    counter: held,
                }));
            };
            let (values, bytes) = match payload {
                Payload::Z(bytes) => (&mut record.z_values, bytes),
                Payload::X(bytes) => (&mut record.x_values, bytes),
            };
            if values[slot].is_some() {
                return Err(CycleError::Violation(ProtocolViolation::SlotRefilled {
                    kind,
                    sender,
                    initiator: id,
                    counter: held,
                }));
            }
            values[slot] = Some(bytes);
            trace!(initiator = id, counter = held, sender, %kind, "stored value");
        }

        match kind {
            ValueKind::Z => {
                self.try_advance(my_id, id)?;
                self.try_complete(my_id, id).await
            }
            ValueKind::X => self.try_complete(my_id, id).await,
        }
    }

    fn insert_roster(&mut self, id: ParticipantId) -> bool {
        match self.roster.binary_search(&id) {
            Ok(_) => false,
            Err(at) => {
                self.roster.insert(at, id);
                true
            }
        }
    }

    // Opens a record for a cycle someone else initiated, seeded with this
    // participant's Z value. Replaces any older record for the same
    // initiator wholesale: a newer counter supersedes the cycle, not just
    // the envelope.
    fn open_cycle(
        &mut self,
        id: ParticipantId,
        counter: u64,
        members: Vec<ParticipantId>,
        position: usize,
    ) -> Result<(), CycleError<C::Error, S::Error>> {
        let r = self.crypto.generate_ri().map_err(CycleError::Crypto)?;
        let z = self.crypto.compute_zi(&r).map_err(CycleError::Crypto)?;

        let mut record = CycleRecord::new(counter, members.clone(), r);
        record.z_values[position] = Some(z.clone());

        let superseded = self.cycles.insert(id, record);
        debug!(
            initiator = id,
            counter,
            n = members.len(),
            superseded = superseded.map(|record| record.counter),
            "joined key-agreement cycle",
        );

        self.broadcast(Initiator { id, counter, members }, Payload::Z(z))?;
        self.set_step(Step::WaitingZ);
        Ok(())
    }

    // Z-ripeness: once the local roster covers the declared members and
    // every Z value is present, compute and broadcast this participant's X
    // value. Aborts silently when a precondition fails; the cycle is
    // retried on the next roster or message event.
    fn try_advance(
        &mut self,
        my_id: ParticipantId,
        id: ParticipantId,
    ) -> Result<(), CycleError<C::Error, S::Error>> {
        let Some(record) = self.cycles.get(&id) else {
            return Ok(());
        };
        if !self.roster_covers(&record.members) {
            debug!(initiator = id, snapshot = ?record, "z check: roster does not cover declared members");
            return Ok(());
        }
        if !record.z_complete() {
            trace!(initiator = id, snapshot = ?record, "z check: z values missing");
            return Ok(());
        }
        let i = record.position(my_id).ok_or(Bug::NotInOwnCycle)?;
        if record.x_values[i].is_some() {
            // Already advanced; a roster re-check can land here while the
            // engine-wide step lags this record.
            return Ok(());
        }

        let n = record.members.len();
        let counter = record.counter;
        let members = record.members.clone();
        let r = record.r.clone();
        let z_right = record.z_values[(i + 1) % n]
            .clone()
            .ok_or(Bug::IncompleteArray)?;
        let z_left = record.z_values[(n + i - 1) % n]
            .clone()
            .ok_or(Bug::IncompleteArray)?;

        let x = self
            .crypto
            .compute_xi(&r, &z_right, &z_left)
            .map_err(CycleError::Crypto)?;

        let record = self.cycles.get_mut(&id).ok_or(Bug::RecordVanished)?;
        record.x_values[i] = Some(x.clone());
        debug!(initiator = id, counter, "z values complete; broadcasting x value");

        self.broadcast(Initiator { id, counter, members }, Payload::X(x))?;
        self.set_step(Step::WaitingX);
        Ok(())
    }

    // X-ripeness: once every X value is present and the roster still covers
    // the declared members, derive the session key, install it, and delete
    // the record. Deletion happens only after the derivation resolved, so a
    // late X for this cycle never finds a half-derived record.
    async fn try_complete(
        &mut self,
        my_id: ParticipantId,
        id: ParticipantId,
    ) -> Result<(), CycleError<C::Error, S::Error>> {
        let Some(record) = self.cycles.get(&id) else {
            return Ok(());
        };
        if !self.roster_covers(&record.members) {
            debug!(initiator = id, snapshot = ?record, "x check: roster does not cover declared members");
            return Ok(());
        }
        if !record.x_complete() {
            trace!(initiator = id, snapshot = ?record, "x check: x values missing");
            return Ok(());
        }

        let i = record.position(my_id).ok_or(Bug::NotInOwnCycle)?;
        let n = record.members.len();
        let counter = record.counter;
        let r = record.r.clone();
        let z_left = record.z_values[(n + i - 1) % n]
            .clone()
            .ok_or(Bug::IncompleteArray)?;
        let x_array = record
            .x_values
            .iter()
            .map(|slot| slot.clone().ok_or(Bug::IncompleteArray))
            .collect::<Result<Vec<_>, _>>()?;

        let secret = self
            .crypto
            .compute_shared_secret(&r, &x_array[i], &z_left, &x_array)
            .map_err(CycleError::Crypto)?;
        let material = self
            .crypto
            .derive_key(&secret)
            .await
            .map_err(CycleError::Crypto)?;

        let tag = KeyTag { initiator: id, counter };
        self.keys.install(SessionKey::new(tag, material));
        self.cycles.remove(&id);
        info!(%tag, "session key installed");

        self.set_step(Step::Ready);
        Ok(())
    }

    // A roster change can unblock a stalled cycle; re-run the check the
    // current phase is waiting on against every record. Skipped while this
    // participant is the initiator.
    async fn recheck_cycles(&mut self) -> Result<(), CycleError<C::Error, S::Error>> {
        let Some(my_id) = self.my_id else {
            return Ok(());
        };
        if self.is_initiator() {
            return Ok(());
        }
        let step = self.step;
        if step != Step::WaitingZ && step != Step::WaitingX {
            return Ok(());
        }

        let ids: Vec<ParticipantId> = self.cycles.keys().copied().collect();
        for id in ids {
            match step {
                Step::WaitingZ => {
                    self.try_advance(my_id, id)?;
                    self.try_complete(my_id, id).await?;
                }
                Step::WaitingX => self.try_complete(my_id, id).await?,
                Step::Initialized | Step::Ready => {}
            }
        }
        Ok(())
    }

    // Declared members must all be present locally; a key derived past a
    // missing member would exclude a participant the initiator intended to
    // include.
    fn roster_covers(&self, members: &[ParticipantId]) -> bool {
        self.roster.len() >= members.len()
            && members.iter().all(|m| self.roster.binary_search(m).is_ok())
    }

    fn broadcast(
        &mut self,
        initiator: Initiator,
        payload: Payload,
    ) -> Result<(), CycleError<C::Error, S::Error>> {
        self.sink
            .broadcast(CycleMessage { initiator, payload })
            .map_err(CycleError::Send)
    }

    fn set_step(&mut self, step: Step) {
        if self.step == step {
            return;
        }
        debug!(from = ?self.step, to = ?step, "step change");
        self.step = step;
        if let Some(listener) = &mut self.step_listener {
            listener(step);
        }
    }
}

/// Error of an engine operation
#[derive(Debug, Error)]
pub enum CycleError<CErr, SErr> {
    /// A peer broke the protocol; the instance is not safe to continue
    #[error("protocol violated by a peer")]
    Violation(#[source] ProtocolViolation),
    /// The local participant id was never set
    #[error("local participant id is not set")]
    IdUnset,
    /// `start` was called on an instance that is not the elected initiator
    #[error("only the elected initiator may start a cycle")]
    NotInitiator,
    /// `start` was called with no other participant present
    #[error("cannot agree on a group key alone")]
    LoneParticipant,
    /// A key-agreement primitive failed; fatal to the in-flight cycle
    #[error("key-agreement primitive failed")]
    Crypto(#[source] CErr),
    /// Broadcasting an outbound message failed
    #[error("broadcasting outbound message failed")]
    Send(#[source] SErr),
    #[error("internal error")]
    InternalError(#[from] Bug),
}

/// Protocol fault attributable to a peer
///
/// Signals a buggy or malicious peer; the engine reports it instead of
/// guessing which of the conflicting values to keep.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("sender {sender} is not among the declared members of cycle ({initiator}, {counter})")]
    UnknownSender {
        sender: ParticipantId,
        initiator: ParticipantId,
        counter: u64,
    },
    #[error("{kind} slot of sender {sender} in cycle ({initiator}, {counter}) is already filled")]
    SlotRefilled {
        kind: ValueKind,
        sender: ParticipantId,
        initiator: ParticipantId,
        counter: u64,
    },
}

/// Unexpected error in operation not caused by other parties
#[derive(Debug, Error)]
pub enum Bug {
    #[error("local participant is missing from a cycle it joined")]
    NotInOwnCycle,
    #[error("a value slot is empty in an array that checked complete")]
    IncompleteArray,
    #[error("cycle record vanished while being advanced")]
    RecordVanished,
}
