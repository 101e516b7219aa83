//! Confirmation tokens.
//!
//! A token is the only capability that moves a handoff to `completed`. The
//! plaintext leaves the core exactly once, at creation. Storage keeps only a
//! BLAKE3 digest and a consumption marker.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

/// Smallest accepted token size, in bytes (128 bits).
pub const MIN_TOKEN_BYTES: usize = 16;

/// A plaintext confirmation token.
///
/// `Debug` is redacted so the value never reaches logs by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfirmationToken(String);

impl ConfirmationToken {
    /// Generate a token from `bytes` bytes of OS randomness.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is below [`MIN_TOKEN_BYTES`] or the OS
    /// random source fails.
    pub fn generate(bytes: usize) -> Result<Self> {
        if bytes < MIN_TOKEN_BYTES {
            return Err(Error::internal(format!(
                "token size {bytes} is below the {MIN_TOKEN_BYTES}-byte minimum"
            )));
        }
        let mut buf = vec![0u8; bytes];
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| Error::internal(format!("OS random source failed: {e}")))?;
        Ok(Self(hex::encode(buf)))
    }

    /// Wrap a token received from a caller.
    #[must_use]
    pub fn from_plaintext(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plaintext, for delivery to the receiving party.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// BLAKE3 digest of the plaintext, hex encoded.
    #[must_use]
    pub fn digest(&self) -> String {
        blake3::hash(self.0.as_bytes()).to_hex().to_string()
    }
}

impl std::fmt::Debug for ConfirmationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConfirmationToken(<redacted>)")
    }
}

impl serde::Serialize for ConfirmationToken {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// The stored side of a token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenSeal {
    /// Hex BLAKE3 digest of the plaintext.
    pub digest: String,
    /// When the token was used; set at most once.
    pub consumed_at: Option<DateTime<Utc>>,
}

impl TokenSeal {
    /// Seal a freshly generated token.
    #[must_use]
    pub fn for_token(token: &ConfirmationToken) -> Self {
        Self {
            digest: token.digest(),
            consumed_at: None,
        }
    }

    /// Whether the token has already been used.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    /// Constant-time comparison of `token` against the stored digest.
    #[must_use]
    pub fn matches(&self, token: &ConfirmationToken) -> bool {
        let candidate = token.digest();
        bool::from(candidate.as_bytes().ct_eq(self.digest.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_has_requested_entropy() {
        let token = ConfirmationToken::generate(32).unwrap();
        assert_eq!(token.expose().len(), 64);
        assert!(token.expose().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_rejects_short_tokens() {
        assert!(ConfirmationToken::generate(8).is_err());
        assert!(ConfirmationToken::generate(MIN_TOKEN_BYTES).is_ok());
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = ConfirmationToken::generate(32).unwrap();
        let b = ConfirmationToken::generate(32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_is_redacted() {
        let token = ConfirmationToken::from_plaintext("super-secret");
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_seal_matches_only_its_token() {
        let token = ConfirmationToken::generate(32).unwrap();
        let seal = TokenSeal::for_token(&token);

        assert!(seal.matches(&token));
        assert!(!seal.matches(&ConfirmationToken::from_plaintext("guess")));
        assert!(!seal.is_consumed());
    }

    #[test]
    fn test_digest_is_not_plaintext() {
        let token = ConfirmationToken::from_plaintext("abc");
        assert_ne!(token.digest(), "abc");
        assert_eq!(token.digest().len(), 64);
    }
}
