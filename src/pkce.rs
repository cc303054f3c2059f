use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Generates the CSRF-protection `state` parameter for an authorization
/// request.
///
/// 24 random bytes, base64url encoded (32 characters).
#[must_use]
pub fn generate_state() -> String {
    let random_bytes: [u8; 24] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Generates the `nonce` bound into the requested id token.
#[must_use]
pub fn generate_nonce() -> String {
    let random_bytes: [u8; 24] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Generates a random PKCE code verifier.
///
/// 48 random bytes encode to 64 URL-safe characters, inside the 43-128
/// range RFC 7636 requires.
#[must_use]
pub fn generate_code_verifier() -> String {
    let random_bytes: [u8; 48] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Computes the S256 code challenge for a verifier:
/// `BASE64URL(SHA256(verifier))`.
#[must_use]
pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}
