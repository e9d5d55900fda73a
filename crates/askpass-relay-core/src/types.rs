//! Core types for askpass-relay.
//!
//! This module contains the data structures shared by the helper and the
//! relay server: the per-invocation identity, the prompt kind hint and the
//! prompt handed to the application's credential callback.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Number of random bytes in an invocation id.
const ID_BYTES: usize = 16;

/// Opaque random identifier of one git invocation.
///
/// The id names the invocation's relay endpoint and doubles as the
/// connection credential: a helper must present it verbatim before the relay
/// server forwards its prompt.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvocationId(String);

impl InvocationId {
    /// Generate a fresh id from 128 random bits, hex encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        Self(hex)
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against a presented id without short-circuiting on the first
    /// differing byte.
    pub fn verify(&self, presented: &str) -> bool {
        let expected = self.0.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Only the first 8 characters are shown in debug output so ids don't end up
// in full in logs of panicking tests.
impl fmt::Debug for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.0.get(..8).unwrap_or(&self.0);
        write!(f, "InvocationId({}…)", short)
    }
}

/// Error returned when parsing an [`InvocationId`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid invocation id: expected {} lowercase hex characters", ID_BYTES * 2)]
pub struct ParseInvocationIdError;

impl FromStr for InvocationId {
    type Err = ParseInvocationIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == ID_BYTES * 2
            && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(ParseInvocationIdError)
        }
    }
}

/// Best-effort hint of what a prompt is asking for.
///
/// Derived from the prompt wording, which git and OpenSSH do not treat as a
/// stable interface. Consumers must not rely on it for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// Git HTTPS username.
    Username,
    /// Git HTTPS or ssh account password.
    Password,
    /// Passphrase unlocking an ssh private key.
    Passphrase,
    /// PIN of a FIDO2 security key.
    Pin,
    /// ssh asking to trust an unknown host key ("yes/no").
    HostKey,
    /// Anything else.
    #[default]
    Unknown,
}

impl PromptKind {
    /// Whether the answer is expected to be echoed when typed.
    ///
    /// Usernames and host key confirmations are not secret.
    pub fn is_visible(&self) -> bool {
        matches!(self, PromptKind::Username | PromptKind::HostKey)
    }
}

impl fmt::Display for PromptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptKind::Username => write!(f, "username"),
            PromptKind::Password => write!(f, "password"),
            PromptKind::Passphrase => write!(f, "passphrase"),
            PromptKind::Pin => write!(f, "pin"),
            PromptKind::HostKey => write!(f, "host_key"),
            PromptKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// One askpass round trip, as handed to the application's credential
/// callback.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    /// The invocation this prompt belongs to.
    pub invocation_id: InvocationId,
    /// The prompt text exactly as git/ssh passed it to the helper.
    pub prompt: String,
    /// Classification hint.
    pub kind: PromptKind,
    /// Pid of the process that exec'd the helper (git or ssh), if reported.
    pub caller_pid: Option<u32>,
}
