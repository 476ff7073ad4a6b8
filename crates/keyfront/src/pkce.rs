//! PKCE (Proof Key for Code Exchange) helpers.
//!
//! Implements RFC 7636 verifier/challenge generation for the authorization
//! code flow. Verifiers are drawn from the RFC 3986 unreserved alphabet; the
//! challenge is the base64url-encoded SHA-256 digest of the verifier.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// RFC 3986 unreserved characters, the allowed verifier alphabet.
const UNRESERVED: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Verifier length used by [`PkceTriple::generate`]. Within the RFC 7636
/// 43-128 character limit.
pub const VERIFIER_LENGTH: usize = 96;

/// Generate a cryptographically secure code verifier of exactly `length`
/// characters.
///
/// Each random byte is mapped modulo the unreserved-character alphabet, so
/// the result is always URL-safe. Pure function of randomness; no error
/// conditions.
#[must_use]
pub fn generate_verifier(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length).map(|_| UNRESERVED[rng.gen::<u8>() as usize % UNRESERVED.len()] as char).collect()
}

/// Compute the S256 code challenge for a verifier.
///
/// Per RFC 7636 the challenge is `BASE64URL(SHA256(ASCII(code_verifier)))`
/// with padding stripped. Deterministic given the verifier.
#[must_use]
pub fn code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// A verifier/challenge pair for one authorization attempt.
///
/// The verifier is kept secret until token exchange; the challenge travels in
/// the authorization request. Safe to generate repeatedly and discard.
#[derive(Debug, Clone)]
pub struct PkceTriple {
    /// High-entropy random string, consumed exactly once at code exchange.
    pub verifier: String,
    /// SHA-256 digest of the verifier, base64url without padding.
    pub challenge: String,
    /// Challenge method; always `"S256"`.
    pub method: &'static str,
}

impl PkceTriple {
    /// Generate a fresh triple with a [`VERIFIER_LENGTH`]-character verifier.
    #[must_use]
    pub fn generate() -> Self {
        let verifier = generate_verifier(VERIFIER_LENGTH);
        let challenge = code_challenge(&verifier);
        Self { verifier, challenge, method: "S256" }
    }
}
