//! Wipe-once container for a single secret value.
//!
//! The secret lives in a `secrecy::SecretVec`, so the bytes are zeroized
//! when the handle is wiped or dropped, whichever happens first. After
//! [`SecureHandle::wipe`] no method returns the bytes again. Only a salted
//! fingerprint is retained so the validator can recognise stray copies.

use crate::error::HandleError;
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(Uuid);

impl HandleId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0.simple())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Active,
    Wiped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeOutcome {
    Wiped,
    /// The handle was already wiped; wiping again is a no-op.
    AlreadyWiped,
}

/// Salted SHA-256 of the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Fingerprint {
    salt: [u8; 16],
    digest: [u8; 32],
}

impl Fingerprint {
    fn compute(salt: [u8; 16], value: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(value);
        Self {
            salt,
            digest: hasher.finalize().into(),
        }
    }

    /// Whether `candidate` is byte-for-byte the fingerprinted secret.
    pub fn matches(&self, candidate: &[u8]) -> bool {
        Fingerprint::compute(self.salt, candidate).digest == self.digest
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Fingerprint(..)")
    }
}

pub struct SecureHandle {
    id: HandleId,
    label: String,
    secret: Mutex<Option<SecretVec<u8>>>,
    fingerprint: Fingerprint,
}

impl SecureHandle {
    /// Take ownership of `bytes`. The vector is moved, never copied.
    pub fn new(label: impl Into<String>, bytes: Vec<u8>) -> Result<Self, HandleError> {
        if bytes.is_empty() {
            return Err(HandleError::Empty);
        }
        let fingerprint = Fingerprint::compute(rand::random(), &bytes);
        Ok(Self {
            id: HandleId::new(),
            label: label.into(),
            secret: Mutex::new(Some(SecretVec::new(bytes))),
            fingerprint,
        })
    }

    pub fn from_string(label: impl Into<String>, value: String) -> Result<Self, HandleError> {
        Self::new(label, value.into_bytes())
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> HandleState {
        if self.secret.lock().is_some() {
            HandleState::Active
        } else {
            HandleState::Wiped
        }
    }

    pub fn is_wiped(&self) -> bool {
        self.state() == HandleState::Wiped
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Scoped access to the secret bytes. The borrow cannot outlive `f`.
    pub fn with_secret<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, HandleError> {
        let guard = self.secret.lock();
        match guard.as_ref() {
            Some(secret) => Ok(f(secret.expose_secret())),
            None => Err(HandleError::Wiped(self.id.to_string())),
        }
    }

    /// Zeroize and release the secret. Idempotent.
    pub fn wipe(&self) -> WipeOutcome {
        let taken = self.secret.lock().take();
        match taken {
            Some(secret) => {
                drop(secret);
                tracing::debug!(handle = %self.id, label = %self.label, "secure handle wiped");
                WipeOutcome::Wiped
            }
            None => WipeOutcome::AlreadyWiped,
        }
    }
}

impl fmt::Debug for SecureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wipe_is_idempotent() {
        let handle = SecureHandle::from_string("token", "tok_abc123".to_string()).unwrap();
        assert_eq!(handle.state(), HandleState::Active);
        assert_eq!(handle.wipe(), WipeOutcome::Wiped);
        assert_eq!(handle.wipe(), WipeOutcome::AlreadyWiped);
        assert_eq!(handle.state(), HandleState::Wiped);
    }

    #[test]
    fn wiped_handle_exposes_nothing() {
        let handle = SecureHandle::from_string("token", "tok_abc123".to_string()).unwrap();
        let len = handle.with_secret(|bytes| bytes.len()).unwrap();
        assert_eq!(len, 10);

        handle.wipe();
        assert!(matches!(
            handle.with_secret(|bytes| bytes.to_vec()),
            Err(HandleError::Wiped(_))
        ));
    }

    #[test]
    fn debug_output_is_redacted() {
        let handle = SecureHandle::from_string("api-key", "sk-live-secret".to_string()).unwrap();
        let rendered = format!("{:?}", handle);
        assert!(!rendered.contains("sk-live-secret"));
        assert!(rendered.contains("api-key"));
    }

    #[test]
    fn fingerprint_survives_wipe() {
        let handle = SecureHandle::from_string("token", "tok_abc123".to_string()).unwrap();
        handle.wipe();
        assert!(handle.fingerprint().matches(b"tok_abc123"));
        assert!(!handle.fingerprint().matches(b"tok_abc124"));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert_eq!(
            SecureHandle::new("empty", Vec::new()).unwrap_err(),
            HandleError::Empty
        );
    }

    #[test]
    fn handles_get_distinct_ids() {
        let a = SecureHandle::from_string("a", "x".into()).unwrap();
        let b = SecureHandle::from_string("b", "x".into()).unwrap();
        assert_ne!(a.id(), b.id());
        // same value, different salt
        assert!(a.fingerprint() != b.fingerprint());
    }
}
