use anyhow::{anyhow, bail, Context};
use easel_common::types::Identity;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const CONNECTION_TOKEN_TTL_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConnectionClaims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    color: Option<String>,
    iat: i64,
    exp: i64,
}

/// Why a credential was refused. Terminal for that connection attempt.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum AuthRejection {
    #[error("credential has expired")]
    Expired,
    #[error("credential is malformed")]
    Malformed,
    #[error("credential signature is invalid")]
    SignatureInvalid,
}

impl AuthRejection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Malformed => "malformed",
            Self::SignatureInvalid => "signature_invalid",
        }
    }

    /// WebSocket close code sent when the handshake is rejected.
    pub const fn close_code(self) -> u16 {
        match self {
            Self::Expired => 4001,
            Self::Malformed => 4002,
            Self::SignatureInvalid => 4003,
        }
    }
}

/// Verifies HS256 connection credentials locally; never touches the network.
#[derive(Clone)]
pub struct JwtCredentialVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtCredentialVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        // Expiry is checked against the caller-supplied clock in `authenticate_at`.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Mint a credential for `identity`. The relay only needs this for local
    /// development and tests; production tokens come from the identity service.
    pub fn issue_token(&self, identity: &Identity, ttl_seconds: i64) -> anyhow::Result<String> {
        self.issue_token_at(identity, current_unix_timestamp()?, ttl_seconds)
    }

    pub fn issue_token_at(
        &self,
        identity: &Identity,
        issued_at: i64,
        ttl_seconds: i64,
    ) -> anyhow::Result<String> {
        let claims = ConnectionClaims {
            sub: identity.user_id.clone(),
            name: Some(identity.display_name.clone()),
            color: Some(identity.color.clone()),
            iat: issued_at,
            exp: issued_at + ttl_seconds,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode connection token")
    }

    pub fn authenticate(&self, token: &str) -> Result<Identity, AuthRejection> {
        let now = current_unix_timestamp().map_err(|_| AuthRejection::Expired)?;
        self.authenticate_at(token, now)
    }

    /// Pure verification: the outcome depends only on `token` and `now`.
    pub fn authenticate_at(&self, token: &str, now: i64) -> Result<Identity, AuthRejection> {
        let claims = decode::<ConnectionClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| match error.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    AuthRejection::SignatureInvalid
                }
                ErrorKind::ExpiredSignature => AuthRejection::Expired,
                _ => AuthRejection::Malformed,
            })?
            .claims;

        if claims.exp <= now {
            return Err(AuthRejection::Expired);
        }

        let user_id = claims.sub.trim();
        if user_id.is_empty() {
            return Err(AuthRejection::Malformed);
        }

        let display_name = claims
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| user_id.to_string());

        Ok(Identity::new(user_id, display_name, claims.color))
    }
}

pub(crate) fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{AuthRejection, JwtCredentialVerifier, CONNECTION_TOKEN_TTL_SECONDS};
    use easel_common::types::{Identity, PRESENCE_PALETTE};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde_json::json;

    const TEST_SECRET: &str = "easel_test_secret_that_is_definitely_long_enough";
    const NOW: i64 = 1_700_000_000;

    fn verifier() -> JwtCredentialVerifier {
        JwtCredentialVerifier::new(TEST_SECRET).expect("verifier should initialize")
    }

    fn sign(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("token should encode")
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(JwtCredentialVerifier::new("too-short").is_err());
    }

    #[test]
    fn issues_and_authenticates_tokens() {
        let verifier = verifier();
        let identity = Identity::new("user-a", "Alice", Some("#112233".into()));
        let token = verifier
            .issue_token_at(&identity, NOW, CONNECTION_TOKEN_TTL_SECONDS)
            .expect("token should be issued");

        let authenticated =
            verifier.authenticate_at(&token, NOW + 10).expect("token should authenticate");
        assert_eq!(authenticated, identity);
    }

    #[test]
    fn expired_tokens_are_rejected_as_expired() {
        let verifier = verifier();
        let identity = Identity::new("user-a", "Alice", None);
        let token = verifier.issue_token_at(&identity, NOW, 60).expect("token should be issued");

        assert_eq!(verifier.authenticate_at(&token, NOW + 61), Err(AuthRejection::Expired));
    }

    #[test]
    fn verification_is_a_function_of_the_supplied_clock() {
        let verifier = verifier();
        let identity = Identity::new("user-a", "Alice", None);
        let token = verifier.issue_token_at(&identity, NOW, 60).expect("token should be issued");

        assert!(verifier.authenticate_at(&token, NOW + 30).is_ok());
        assert_eq!(verifier.authenticate_at(&token, NOW + 3600), Err(AuthRejection::Expired));
    }

    #[test]
    fn foreign_signatures_are_rejected() {
        let token = sign(
            json!({"sub": "user-a", "iat": NOW, "exp": NOW + 60}),
            "another_secret_that_is_also_long_enough_for_hs256",
        );
        assert_eq!(verifier().authenticate_at(&token, NOW), Err(AuthRejection::SignatureInvalid));
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(verifier().authenticate_at("not-a-jwt", NOW), Err(AuthRejection::Malformed));
        assert_eq!(verifier().authenticate_at("", NOW), Err(AuthRejection::Malformed));
    }

    #[test]
    fn missing_or_blank_subject_is_malformed() {
        let missing = sign(json!({"iat": NOW, "exp": NOW + 60}), TEST_SECRET);
        assert_eq!(verifier().authenticate_at(&missing, NOW), Err(AuthRejection::Malformed));

        let blank = sign(json!({"sub": "  ", "iat": NOW, "exp": NOW + 60}), TEST_SECRET);
        assert_eq!(verifier().authenticate_at(&blank, NOW), Err(AuthRejection::Malformed));
    }

    #[test]
    fn missing_name_and_color_fall_back() {
        let token = sign(json!({"sub": "user-b", "iat": NOW, "exp": NOW + 60}), TEST_SECRET);
        let identity = verifier().authenticate_at(&token, NOW).expect("token should authenticate");

        assert_eq!(identity.display_name, "user-b");
        assert!(PRESENCE_PALETTE.contains(&identity.color.as_str()));
    }

    #[test]
    fn rejection_codes_are_stable() {
        assert_eq!(AuthRejection::Expired.as_str(), "expired");
        assert_eq!(AuthRejection::Malformed.close_code(), 4002);
        assert_eq!(AuthRejection::SignatureInvalid.as_str(), "signature_invalid");
        assert_eq!(AuthRejection::SignatureInvalid.close_code(), 4003);
    }
}
