//! Protocol types for helper-relay communication.
//!
//! Each connection carries exactly one exchange:
//!
//! 1. The helper sends a single newline-terminated JSON [`Request`].
//! 2. The relay answers with `answer:<secret bytes>` or `deny` and closes
//!    the connection. The response is not newline-terminated; the helper
//!    reads until end of stream so secrets may contain any byte sequence
//!    valid in UTF-8, including newlines.
//!
//! The environment variables that carry endpoint and identity into the
//! spawned process tree are defined here as well, since both sides must
//! agree on them.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::prompt_kind::classify;
use crate::types::{InvocationId, PromptKind};

/// Environment variable holding the relay endpoint address (socket path or
/// pipe name).
pub const ENV_ENDPOINT: &str = "ASKPASS_RELAY_ENDPOINT";

/// Environment variable holding the invocation id.
pub const ENV_INVOCATION_ID: &str = "ASKPASS_RELAY_INVOCATION";

/// Environment variable holding the helper's wait budget in milliseconds.
pub const ENV_DEADLINE_MS: &str = "ASKPASS_RELAY_DEADLINE_MS";

/// Upper bound on the size of a request line.
///
/// Prompts are a single line of text; anything beyond this is treated as a
/// protocol violation.
pub const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// Upper bound on the size of a response.
pub const MAX_RESPONSE_BYTES: u64 = 64 * 1024;

const ANSWER_PREFIX: &[u8] = b"answer:";
const DENY: &[u8] = b"deny";

/// A prompt request from the helper to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// The invocation id inherited from the environment.
    pub invocation_id: String,

    /// The prompt text, verbatim.
    pub prompt: String,

    /// Best-effort classification of the prompt.
    #[serde(default)]
    pub kind: PromptKind,

    /// How long the helper is willing to wait, in milliseconds.
    #[serde(default)]
    pub deadline_millis: Option<u64>,

    /// Pid of the process that exec'd the helper.
    #[serde(default)]
    pub caller_pid: Option<u32>,
}

impl Request {
    /// Create a request for `prompt`, classifying it on the way.
    pub fn new(invocation_id: &InvocationId, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        let kind = classify(&prompt).kind;
        Self {
            invocation_id: invocation_id.as_str().to_string(),
            prompt,
            kind,
            deadline_millis: None,
            caller_pid: None,
        }
    }

    /// Parse a request from a JSON string.
    pub fn parse(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(ProtocolError::Serialization)
    }

    /// Serialize the request to a JSON string with newline.
    pub fn to_json_line(&self) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

/// The relay's answer to a [`Request`].
#[derive(Debug, Clone)]
pub enum Response {
    /// The credential to print on stdout.
    Answer(SecretString),
    /// Refusal: the helper exits non-zero with empty stdout.
    Deny,
}

impl Response {
    /// Create an answer response.
    pub fn answer(secret: SecretString) -> Self {
        Response::Answer(secret)
    }

    /// Whether this is a refusal.
    pub fn is_deny(&self) -> bool {
        matches!(self, Response::Deny)
    }

    /// Encode the response for the wire.
    ///
    /// The returned buffer is wiped when dropped.
    pub fn encode(&self) -> Zeroizing<Vec<u8>> {
        match self {
            Response::Answer(secret) => {
                let secret = secret.expose_secret().as_bytes();
                let mut buf = Vec::with_capacity(ANSWER_PREFIX.len() + secret.len());
                buf.extend_from_slice(ANSWER_PREFIX);
                buf.extend_from_slice(secret);
                Zeroizing::new(buf)
            }
            Response::Deny => Zeroizing::new(DENY.to_vec()),
        }
    }

    /// Decode a complete response as read from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes == DENY {
            return Ok(Response::Deny);
        }
        if bytes.is_empty() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let secret = bytes.strip_prefix(ANSWER_PREFIX).ok_or_else(|| {
            ProtocolError::InvalidMessage("response is neither an answer nor a denial".into())
        })?;
        let secret = std::str::from_utf8(secret)
            .map_err(|_| ProtocolError::InvalidMessage("answer is not valid UTF-8".into()))?;
        Ok(Response::Answer(SecretString::from(secret.to_string())))
    }
}

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize or parse a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to read/write to the endpoint.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Received a message that doesn't follow the protocol.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The presented invocation id does not belong to this relay.
    #[error("invocation id mismatch")]
    InvocationMismatch,

    /// Connection closed before a complete message arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// No response arrived within the helper's wait budget.
    #[error("timed out after {0} ms waiting for the relay")]
    Timeout(u64),

    /// A required environment variable is missing or unusable.
    #[error("environment variable {0} is not set or invalid")]
    MissingEnvironment(&'static str),
}
