//! Prompt kind detection from prompt text.
//!
//! Git and OpenSSH only hand the askpass helper a free-form prompt string.
//! This module guesses what is being asked for, and for whom, so the
//! application can render a sensible dialog. The wording is not a stable
//! interface upstream; the result is a hint and unrecognized prompts fall
//! back to [`PromptKind::Unknown`].
//!
//! # Supported Prompt Formats
//!
//! ## Git credentials
//! - `Username for 'https://github.com':`
//! - `Password for 'https://user@github.com':`
//!
//! ## OpenSSH
//! - `user@host's password:`
//! - `Enter passphrase for key '/home/user/.ssh/id_ed25519':`
//! - `Enter PIN for ED25519-SK key /home/user/.ssh/id_ed25519_sk:`
//! - `Are you sure you want to continue connecting (yes/no/[fingerprint])?`

use crate::types::PromptKind;

/// Result of prompt classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// The detected kind.
    pub kind: PromptKind,
    /// What the credential is for: a URL, `user@host`, key path or host.
    pub target: Option<String>,
    /// Confidence level of the detection.
    pub confidence: Confidence,
}

/// Confidence level of prompt classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// Prompt matched a known pattern and a target was extracted.
    High,
    /// Prompt matched a known pattern but no target was found.
    Medium,
    /// Nothing matched.
    Low,
}

/// Classify a prompt string.
///
/// # Examples
///
/// ```
/// use askpass_relay_core::prompt_kind::classify;
/// use askpass_relay_core::types::PromptKind;
///
/// let result = classify("Password for 'https://example.com':");
/// assert_eq!(result.kind, PromptKind::Password);
/// assert_eq!(result.target.as_deref(), Some("https://example.com"));
///
/// let result = classify("git@github.com's password:");
/// assert_eq!(result.kind, PromptKind::Password);
/// assert_eq!(result.target.as_deref(), Some("git@github.com"));
/// ```
pub fn classify(prompt: &str) -> Classification {
    // Most specific first: host key prompts can mention passwords in the
    // surrounding text, FIDO prompts mention keys.
    if let Some(result) = detect_host_key(prompt) {
        return result;
    }

    if let Some(result) = detect_security_key_pin(prompt) {
        return result;
    }

    if let Some(result) = detect_passphrase(prompt) {
        return result;
    }

    if let Some(result) = detect_git(prompt) {
        return result;
    }

    if let Some(result) = detect_ssh_password(prompt) {
        return result;
    }

    Classification {
        kind: PromptKind::Unknown,
        target: None,
        confidence: Confidence::Low,
    }
}

fn matched(kind: PromptKind, target: Option<String>) -> Classification {
    let confidence = if target.is_some() {
        Confidence::High
    } else {
        Confidence::Medium
    };
    Classification {
        kind,
        target,
        confidence,
    }
}

/// Detect ssh's unknown host key confirmation.
fn detect_host_key(prompt: &str) -> Option<Classification> {
    let lower = prompt.to_lowercase();
    if !(lower.contains("continue connecting") || lower.contains("(yes/no")) {
        return None;
    }

    // "The authenticity of host 'github.com (140.82.121.4)' can't be established."
    let host = extract_quoted(prompt).map(|quoted| {
        quoted
            .split_whitespace()
            .next()
            .unwrap_or(quoted)
            .to_string()
    });
    Some(matched(PromptKind::HostKey, host))
}

/// Detect FIDO2 security key PIN prompts.
fn detect_security_key_pin(prompt: &str) -> Option<Classification> {
    let lower = prompt.to_lowercase();
    let is_pin = lower.contains("enter pin") && (lower.contains("-sk") || lower.contains("key"));
    if !is_pin {
        return None;
    }

    let target = extract_sha256_fingerprint(prompt).or_else(|| extract_key_path(prompt));
    Some(matched(PromptKind::Pin, target))
}

/// Detect ssh private key passphrase prompts.
fn detect_passphrase(prompt: &str) -> Option<Classification> {
    if !prompt.to_lowercase().contains("passphrase") {
        return None;
    }

    let target = extract_quoted(prompt)
        .map(str::to_string)
        .or_else(|| extract_key_path(prompt));
    Some(matched(PromptKind::Passphrase, target))
}

/// Detect git's credential prompts.
///
/// Matches `Username for '<url>':` and `Password for '<url>':`.
fn detect_git(prompt: &str) -> Option<Classification> {
    let lower = prompt.trim_start().to_lowercase();
    let kind = if lower.starts_with("username for") {
        PromptKind::Username
    } else if lower.starts_with("password for") {
        PromptKind::Password
    } else {
        return None;
    };

    let target = extract_quoted(prompt)
        .filter(|q| q.contains("://"))
        .map(normalize_url);
    Some(matched(kind, target))
}

/// Detect ssh's keyboard-interactive/password prompt `user@host's password:`.
fn detect_ssh_password(prompt: &str) -> Option<Classification> {
    let trimmed = prompt.trim();
    let lower = trimmed.to_lowercase();
    if !lower.ends_with("password:") {
        return None;
    }

    let target = trimmed
        .find("'s password")
        .map(|end| &trimmed[..end])
        .and_then(|before| before.rsplit(char::is_whitespace).next())
        .filter(|account| !account.is_empty())
        .map(str::to_string);
    Some(matched(PromptKind::Password, target))
}

/// Extract the first single-quoted section.
fn extract_quoted(prompt: &str) -> Option<&str> {
    let start = prompt.find('\'')?;
    let rest = &prompt[start + 1..];
    let end = rest.find('\'')?;
    let quoted = &rest[..end];
    if quoted.is_empty() {
        None
    } else {
        Some(quoted)
    }
}

/// Extract a SHA256 key fingerprint like `SHA256:abc123...`.
fn extract_sha256_fingerprint(prompt: &str) -> Option<String> {
    let sha_prefix = "SHA256:";
    let start = prompt.find(sha_prefix)?;
    let after_prefix = &prompt[start + sha_prefix.len()..];

    let fingerprint: String = after_prefix
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '+' || *c == '/' || *c == '=')
        .collect();

    if fingerprint.len() >= 8 {
        Some(format!("SHA256:{}", fingerprint))
    } else {
        None
    }
}

/// Extract an ssh key path like `/home/user/.ssh/id_ed25519`.
fn extract_key_path(prompt: &str) -> Option<String> {
    for word in prompt.split_whitespace() {
        let word = word.trim_end_matches(':').trim_matches('\'');
        if (word.starts_with('/') || word.starts_with('~')) && word.contains(".ssh") {
            return Some(word.to_string());
        }
    }
    None
}

/// Drop trailing slashes and a `.git` suffix from a remote URL.
fn normalize_url(url: &str) -> String {
    let mut normalized = url.trim_end_matches('/').to_string();
    if normalized.ends_with(".git") {
        normalized.truncate(normalized.len() - 4);
    }
    normalized
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The classifier should never panic on arbitrary input.
        #[test]
        fn classify_never_panics(prompt in ".*") {
            let _ = classify(&prompt);
        }

        /// Classification is deterministic.
        #[test]
        fn classify_is_deterministic(prompt in ".*") {
            prop_assert_eq!(classify(&prompt), classify(&prompt));
        }

        /// Unknown prompts never carry a target.
        #[test]
        fn unknown_has_no_target(prompt in ".*") {
            let result = classify(&prompt);
            if result.kind == PromptKind::Unknown {
                prop_assert!(result.target.is_none());
                prop_assert_eq!(result.confidence, Confidence::Low);
            }
        }

        /// Any git URL in a password prompt comes back as the target.
        #[test]
        fn git_password_target_is_url(host in "[a-z]{1,12}\\.(com|org|net)") {
            let prompt = format!("Password for 'https://{}':", host);
            let result = classify(&prompt);
            prop_assert_eq!(result.kind, PromptKind::Password);
            prop_assert_eq!(result.target, Some(format!("https://{}", host)));
        }
    }
}
