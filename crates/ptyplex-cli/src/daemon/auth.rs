//! Shared secret for the streaming transport.

use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use subtle::ConstantTimeEq;

/// Number of random bytes in a token (hex-encoded to twice as many chars).
const TOKEN_BYTES: usize = 32;

/// Random token generated once per daemon process. Every streaming
/// connection must present it before anything else is honoured.
#[derive(Clone)]
pub struct AuthToken(Arc<str>);

impl AuthToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes).into())
    }

    /// Constant-time comparison against a presented token.
    pub fn verify(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_token_is_hex() {
        let token = AuthToken::generate();
        assert_eq!(token.as_str().len(), TOKEN_BYTES * 2);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tokens_differ() {
        assert_ne!(AuthToken::generate().as_str(), AuthToken::generate().as_str());
    }

    #[test]
    fn test_verify() {
        let token = AuthToken::generate();
        assert!(token.verify(token.as_str()));
        assert!(!token.verify(""));
        assert!(!token.verify(&token.as_str()[1..]));
        assert!(!token.verify(&format!("{}0", token.as_str())));
    }

    #[test]
    fn test_debug_redacts() {
        let token = AuthToken::generate();
        let debug = format!("{:?}", token);
        assert!(!debug.contains(token.as_str()));
    }
}
