//! Random values for the authorization-code flow
//!
//! The `state` parameter and the PKCE code verifier are 32 random bytes from
//! the OS generator, encoded as URL-safe Base64 without padding.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;

/// Length of the random part in bytes
const RANDOM_BYTES: usize = 32;

/// Generate an opaque `state` value for an authorization redirect
pub fn generate_state() -> String {
    random_token()
}

/// Generate a PKCE code verifier
///
/// 32 bytes encode to 43 characters, the minimum RFC 7636 allows.
pub fn generate_code_verifier() -> String {
    random_token()
}

fn random_token() -> String {
    let mut bytes = [0u8; RANDOM_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
