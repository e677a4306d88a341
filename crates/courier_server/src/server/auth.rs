#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use courier_domain::{Identity, ParseIdError};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::config::SecretString;

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("missing credential")]
	Missing,

	#[error("invalid token format")]
	Format,

	#[error("invalid token encoding: {0}")]
	Encoding(#[from] base64::DecodeError),

	#[error("invalid token signature")]
	Signature,

	#[error("invalid token claims: {0}")]
	Claims(#[from] serde_json::Error),

	#[error("token expired")]
	Expired,

	#[error("invalid identity: {0}")]
	Identity(#[from] ParseIdError),
}

/// Resolves an opaque client credential to the identity it stands for.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
	async fn verify(&self, token: &str) -> Result<Identity, AuthError>;

	fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

/// Stateless `v1.<payload>.<signature>` tokens signed with HMAC-SHA256.
#[derive(Debug, Clone)]
pub struct HmacAuthenticator {
	secret: SecretString,
}

impl HmacAuthenticator {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}
}

#[async_trait::async_trait]
impl Authenticator for HmacAuthenticator {
	async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
		let claims = verify_hmac_token(token, self.secret.expose())?;
		Ok(Identity::new(claims.sub)?)
	}

	fn name(&self) -> &'static str {
		"hmac"
	}
}

/// Dev-only: the credential is the identity.
#[derive(Debug, Clone, Default)]
pub struct PlaintextAuthenticator;

#[async_trait::async_trait]
impl Authenticator for PlaintextAuthenticator {
	async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
		if token.trim().is_empty() {
			return Err(AuthError::Missing);
		}
		Ok(Identity::new(token)?)
	}

	fn name(&self) -> &'static str {
		"plaintext"
	}
}

pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let token = token.trim();
	if token.is_empty() {
		return Err(AuthError::Missing);
	}

	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::Format);
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64)?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64)?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::Signature);
	}

	let claims: AuthClaims = serde_json::from_slice(&payload)?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(AuthError::Expired);
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	// HMAC accepts keys of any length, so this constructor cannot fail.
	let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
		return Vec::new();
	};
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Mint a token the way the external issuer does. Tests only.
#[cfg(test)]
pub fn sign_hmac_token(sub: &str, exp: u64, secret: &str) -> String {
	let claims = AuthClaims {
		sub: sub.to_string(),
		exp,
	};
	let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).expect("encode claims"));
	let sig = URL_SAFE_NO_PAD.encode(sign(payload.as_bytes(), secret.as_bytes()));
	format!("v1.{payload}.{sig}")
}

#[cfg(test)]
pub fn far_future() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() + 3600
}

#[cfg(test)]
mod tests {
	use super::*;

	const SECRET: &str = "test-secret";

	#[tokio::test]
	async fn hmac_token_resolves_subject() {
		let auth = HmacAuthenticator::new(SecretString::new(SECRET));
		let token = sign_hmac_token("alice", far_future(), SECRET);
		assert_eq!(auth.verify(&token).await.expect("verify").as_str(), "alice");
	}

	#[tokio::test]
	async fn hmac_rejects_tampering_expiry_and_wrong_secret() {
		let auth = HmacAuthenticator::new(SecretString::new(SECRET));

		let token = sign_hmac_token("alice", far_future(), "other-secret");
		assert!(matches!(auth.verify(&token).await, Err(AuthError::Signature)));

		let expired = sign_hmac_token("alice", 1, SECRET);
		assert!(matches!(auth.verify(&expired).await, Err(AuthError::Expired)));

		assert!(matches!(auth.verify("alice").await, Err(AuthError::Format)));
		assert!(matches!(auth.verify("  ").await, Err(AuthError::Missing)));

		let forged = sign_hmac_token("mallory", far_future(), SECRET);
		let (head, _) = forged.rsplit_once('.').expect("three parts");
		let mixed = format!("{head}.{}", token.rsplit_once('.').expect("three parts").1);
		assert!(matches!(auth.verify(&mixed).await, Err(AuthError::Signature)));
	}

	#[tokio::test]
	async fn hmac_rejects_blank_subject() {
		let auth = HmacAuthenticator::new(SecretString::new(SECRET));
		let token = sign_hmac_token("   ", far_future(), SECRET);
		assert!(matches!(auth.verify(&token).await, Err(AuthError::Identity(_))));
	}

	#[tokio::test]
	async fn plaintext_uses_credential_as_identity() {
		let auth = PlaintextAuthenticator;
		assert_eq!(auth.verify(" bob ").await.expect("verify").as_str(), "bob");
		assert!(matches!(auth.verify("").await, Err(AuthError::Missing)));
	}
}
