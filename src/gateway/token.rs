//! Session token issuance and verification.
//!
//! Tokens are HS256-signed JWTs handed out by `/api/login` and accepted
//! by `/api/yd/decryptl` as a `token` query parameter in place of a
//! username/password pair. The 8-character padded-username claim and
//! 48-hour lifetime mirror the upstream login service's own tokens.

use std::time::Duration;

use jwt_simple::prelude::*;
use serde::{Deserialize, Serialize};

const TOKEN_TTL: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Username padded/truncated to exactly 8 characters.
    sub: String,
}

pub struct TokenIssuer {
    key: HS256Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInvalid;

impl TokenIssuer {
    pub fn new(secret: &str) -> Self {
        Self {
            key: HS256Key::from_bytes(secret.as_bytes()),
        }
    }

    pub fn issue(&self, username: &str) -> anyhow::Result<String> {
        let custom = Claims {
            sub: pad_username(username),
        };
        let claims = jwt_simple::claims::Claims::with_custom_claims(
            custom,
            jwt_simple::prelude::Duration::from_secs(TOKEN_TTL.as_secs()),
        );
        self.key
            .authenticate(claims)
            .map_err(|e| anyhow::anyhow!("failed to sign token: {e}"))
    }

    /// Verifies a token and returns the username it was issued to
    /// (trimmed of the 8-character padding).
    pub fn verify(&self, token: &str) -> Result<String, TokenInvalid> {
        let claims = self
            .key
            .verify_token::<Claims>(token, None)
            .map_err(|_| TokenInvalid)?;
        Ok(claims.custom.sub.trim().to_string())
    }
}

fn pad_username(username: &str) -> String {
    let mut padded = username.to_string();
    padded.truncate(8);
    while padded.len() < 8 {
        padded.push(' ');
    }
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_username() {
        let issuer = TokenIssuer::new("test-secret");
        let token = issuer.issue("alice").unwrap();
        let username = issuer.verify(&token).unwrap();
        assert_eq!(username, "alice");
    }

    #[test]
    fn rejects_garbage_token() {
        let issuer = TokenIssuer::new("test-secret");
        assert_eq!(issuer.verify("not-a-token"), Err(TokenInvalid));
    }

    #[test]
    fn rejects_token_signed_with_different_secret() {
        let a = TokenIssuer::new("secret-a");
        let b = TokenIssuer::new("secret-b");
        let token = a.issue("alice").unwrap();
        assert_eq!(b.verify(&token), Err(TokenInvalid));
    }
}
