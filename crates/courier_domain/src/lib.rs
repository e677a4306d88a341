#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Authenticated user name a session acts on behalf of.
///
/// Only ever produced from a verified credential; the relay never invents one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
	/// Maximum identity length in bytes.
	pub const MAX_LEN: usize = 255;

	/// Create a non-empty identity. Surrounding whitespace is trimmed.
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		let trimmed = name.trim();
		if trimmed.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if trimmed.len() > Self::MAX_LEN {
			return Err(ParseIdError::InvalidFormat(format!(
				"identity longer than {} bytes",
				Self::MAX_LEN
			)));
		}
		if trimmed.chars().any(char::is_control) {
			return Err(ParseIdError::InvalidFormat("identity contains control characters".into()));
		}

		if trimmed.len() == name.len() {
			Ok(Self(name))
		} else {
			Ok(Self(trimmed.to_string()))
		}
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Identity {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Identity::new(s.to_string())
	}
}

impl TryFrom<String> for Identity {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Identity::new(value)
	}
}

impl From<Identity> for String {
	fn from(value: Identity) -> Self {
		value.0
	}
}

/// Server-assigned message identifier, stable across queue and store hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// A chat message that could not be written straight to a live connection.
///
/// Travels over the queue bridge as JSON and is persisted by the offline store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
	pub id: MessageId,
	pub source: Identity,
	pub target: Identity,
	pub content: String,

	/// Relay instance that accepted the message from its sender.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub origin: Option<String>,

	pub created_at_unix_ms: i64,
}

impl PendingMessage {
	pub fn new(source: Identity, target: Identity, content: impl Into<String>, created_at_unix_ms: i64) -> Self {
		Self {
			id: MessageId::new_v4(),
			source,
			target,
			content: content.into(),
			origin: None,
			created_at_unix_ms,
		}
	}

	/// Tag the message with the instance that accepted it.
	pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
		self.origin = Some(origin.into());
		self
	}
}

/// A pending message as held by the offline store, with its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub message: PendingMessage,
	pub attempts: u32,
}

impl StoredMessage {
	pub fn new(message: PendingMessage) -> Self {
		Self { message, attempts: 0 }
	}

	/// Age of the record relative to `now_unix_ms` (zero if the clock went backwards).
	pub fn age_ms(&self, now_unix_ms: i64) -> u64 {
		now_unix_ms.saturating_sub(self.message.created_at_unix_ms).max(0) as u64
	}
}
