//! Deterministic container naming.
//!
//! The container name is a pure function of the task id so that a restarted
//! process, or a second process on the same host, derives the same name and
//! finds the same container without any shared state.
//!
//! Name layout: `{prefix}-{hex}` where `hex` is the first
//! [`NAME_HASH_LEN`] lowercase hex characters of `SHA-256(task_id)`. The
//! prefix is validated by [`crate::config::types::TaskboxConfig::validate`]
//! (at most 40 chars from `[a-zA-Z0-9_.-]`), so names never exceed 57
//! characters, below Docker's 63-character hostname-safe limit.

use sha2::{Digest, Sha256};

/// Hex characters of the digest kept in the name (64 bits).
pub const NAME_HASH_LEN: usize = 16;

/// Derive the container name for a task.
pub fn container_name(prefix: &str, task_id: &str) -> String {
    let digest = Sha256::digest(task_id.as_bytes());
    let hex: String = digest
        .iter()
        .take(NAME_HASH_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{}-{}", prefix, hex)
}

/// Whether `name` follows the `{prefix}-{hex}` layout produced above.
pub fn is_managed_name(prefix: &str, name: &str) -> bool {
    let name = name.trim_start_matches('/');
    match name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
    {
        Some(hex) => {
            hex.len() == NAME_HASH_LEN
                && hex
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}
