//! Session keys
//!
//! Types for the symmetric keys a group key-agreement cycle produces: the
//! key material itself, the `(initiator, counter)` tag identifying the cycle
//! that derived it, and the current/previous rotation pair kept by a running
//! session.

use core::fmt;

use thiserror::Error;

/// Identifier of a participant within one peer-to-peer session.
///
/// Ids are opaque to the protocol except for their ordering: the smallest id
/// present in the local roster is the elected initiator.
pub type ParticipantId = u64;

/// Cycle that produced a session key.
///
/// A cycle is uniquely identified by the initiating participant and the
/// monotonically increasing rekey counter that participant chose for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyTag {
    /// Id of the participant that initiated the cycle
    pub initiator: ParticipantId,
    /// Rekey counter the initiator chose for the cycle
    pub counter: u64,
}

impl fmt::Display for KeyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.initiator, self.counter)
    }
}

/// Symmetric key shared by every participant that completed a cycle.
///
/// Obtained as the output of the key-agreement engine; every honest
/// participant finishing the same cycle holds a `SessionKey` with the same
/// tag and the same material.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    tag: KeyTag,
    material: Vec<u8>,
}

impl SessionKey {
    pub fn new(tag: KeyTag, material: Vec<u8>) -> Self {
        Self { tag, material }
    }

    /// Cycle this key was derived from.
    pub fn tag(&self) -> KeyTag {
        self.tag
    }

    /// Raw key material.
    ///
    /// Hand this to an AEAD or KDF; never log it.
    pub fn material(&self) -> &[u8] {
        &self.material
    }

    /// Validates the key
    ///
    /// Performs consistency checks against a session key, returns `Ok(())`
    /// if the key looks OK.
    pub fn validate(&self) -> Result<(), InvalidKey> {
        if self.material.is_empty() {
            return Err(ErrorReason::EmptyMaterial.into());
        }
        Ok(())
    }
}

// Key material stays out of logs and panic messages.
impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("tag", &self.tag)
            .field("material", &format!("<{} bytes>", self.material.len()))
            .finish()
    }
}

/// Current and previous session key of a running instance.
///
/// Installing a new key moves the current one into the previous slot, so
/// traffic protected under the superseded key stays readable across one
/// rekey.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    current: Option<SessionKey>,
    previous: Option<SessionKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rolls the ring forward: the current key (if any) becomes the previous
    /// key, the given key becomes current.
    pub fn install(&mut self, key: SessionKey) {
        self.previous = self.current.take();
        self.current = Some(key);
    }

    pub fn current(&self) -> Option<&SessionKey> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&SessionKey> {
        self.previous.as_ref()
    }

    /// Largest cycle counter among the held keys derived by `initiator`.
    ///
    /// `None` if no held key came from that initiator.
    pub fn newest_counter(&self, initiator: ParticipantId) -> Option<u64> {
        [self.current.as_ref(), self.previous.as_ref()]
            .into_iter()
            .flatten()
            .filter(|key| key.tag.initiator == initiator)
            .map(|key| key.tag.counter)
            .max()
    }

    /// Validates the ring
    ///
    /// Performs consistency checks against the held keys, returns `Ok(())`
    /// if the ring looks OK.
    pub fn validate(&self) -> Result<(), InvalidKey> {
        if let Some(current) = &self.current {
            current.validate()?;
        }
        if let Some(previous) = &self.previous {
            previous.validate()?;
        }
        if let (Some(current), Some(previous)) = (&self.current, &self.previous) {
            if current.tag.initiator == previous.tag.initiator
                && current.tag.counter <= previous.tag.counter
            {
                return Err(ErrorReason::CounterNotAdvanced.into());
            }
        }
        Ok(())
    }
}

/// Error indicating that a session key or key ring is not valid
#[derive(Debug, Error)]
#[error(transparent)]
pub struct InvalidKey(#[from] ErrorReason);

#[derive(Debug, Error)]
enum ErrorReason {
    #[error("key material is empty")]
    EmptyMaterial,
    #[error("current key does not supersede previous key from the same initiator: current.counter <= previous.counter")]
    CounterNotAdvanced,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(initiator: ParticipantId, counter: u64, material: &[u8]) -> SessionKey {
        SessionKey::new(KeyTag { initiator, counter }, material.to_vec())
    }

    #[test]
    fn install_rotates_current_into_previous() {
        let mut ring = KeyRing::new();
        assert!(ring.current().is_none());
        assert!(ring.previous().is_none());

        ring.install(key(1, 1, b"k1"));
        assert_eq!(ring.current().unwrap().tag().counter, 1);
        assert!(ring.previous().is_none());

        ring.install(key(1, 2, b"k2"));
        assert_eq!(ring.current().unwrap().material(), b"k2");
        assert_eq!(ring.previous().unwrap().material(), b"k1");
        ring.validate().unwrap();
    }

    #[test]
    fn newest_counter_is_per_initiator() {
        let mut ring = KeyRing::new();
        ring.install(key(1, 4, b"k1"));
        ring.install(key(2, 1, b"k2"));

        assert_eq!(ring.newest_counter(1), Some(4));
        assert_eq!(ring.newest_counter(2), Some(1));
        assert_eq!(ring.newest_counter(3), None);
        ring.validate().unwrap();
    }

    #[test]
    fn stale_rotation_fails_validation() {
        let mut ring = KeyRing::new();
        ring.install(key(1, 2, b"k1"));
        ring.install(key(1, 2, b"k2"));
        assert!(ring.validate().is_err());
    }

    #[test]
    fn empty_material_is_invalid() {
        assert!(key(1, 1, b"").validate().is_err());
        assert!(key(1, 1, b"k").validate().is_ok());
    }

    #[test]
    fn debug_redacts_material() {
        let rendered = format!("{:?}", key(7, 3, b"super secret"));
        assert!(!rendered.contains("super secret"));
        assert!(rendered.contains("12 bytes"));
    }
}
