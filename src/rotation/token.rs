//! Join token format
//!
//! `K10<32 chars>::server:<16 chars>`, lowercase alphanumerics only. Nodes
//! already in the field parse this shape, so it never changes.

use crate::error::{KeelError, Result};
use crate::secret::Secret;
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

/// Validation pattern for join tokens
pub const TOKEN_PATTERN: &str = r"^K10[a-z0-9]{32}::server:[a-z0-9]{16}$";

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(TOKEN_PATTERN))
        .as_ref()
        .map_err(|e| KeelError::Internal(format!("token pattern: {}", e)))
}

fn random_chars(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Generate a fresh join token
pub fn generate() -> Secret {
    Secret::new(format!("K10{}::server:{}", random_chars(32), random_chars(16)))
}

/// Check a token against the literal grammar
pub fn validate(token: &str) -> Result<()> {
    if pattern()?.is_match(token) {
        Ok(())
    } else {
        Err(KeelError::InvalidToken(format!(
            "expected K10<32>::server:<16>, got {} characters",
            token.len()
        )))
    }
}
