use std::fmt;

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

/// Random bytes per token (160 bits).
pub const TOKEN_BYTES: usize = 20;

/// Rendered token width in hex characters.
pub const TOKEN_LEN: usize = TOKEN_BYTES * 2;

/// Ownership discriminator for one acquisition.
///
/// Every authority stores the token as the value of the locked key and only
/// extends or deletes the key when the presented token matches. Tokens are
/// fixed-width uppercase hex and are compared by equality only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(String);

impl FencingToken {
    /// Mint a fresh token from the operating system's CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FencingToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
