#![forbid(unsafe_code)]

//! Wire types exchanged over a relay connection.
//!
//! Clients send [`WireEnvelope`]s; the relay answers each one with a [`Reply`] on the
//! same connection and pushes [`Delivery`] frames to recipients. Both outbound kinds
//! share the connection, so clients decode them as a [`ServerFrame`].

use courier_domain::{Identity, ParseIdError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `msgType` discriminants.
pub mod msg_type {
	pub const CHAT: i64 = 1;
	pub const PRESENCE: i64 = 2;
}

/// Envelope exactly as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
	pub msg_type: i64,

	/// Sender credential, resolved to an identity by the auth collaborator.
	pub from: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub to: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub content: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
	#[error("unknown msgType {0}")]
	UnknownMsgType(i64),

	#[error("chat request without a target")]
	MissingTarget,

	#[error("invalid target: {0}")]
	InvalidTarget(#[from] ParseIdError),
}

/// Classified envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
	PresenceAnnounce {
		credential: String,
	},
	ChatRequest {
		credential: String,
		target: Identity,
		content: String,
	},
}

impl Envelope {
	pub fn credential(&self) -> &str {
		match self {
			Envelope::PresenceAnnounce { credential } | Envelope::ChatRequest { credential, .. } => credential,
		}
	}

	pub fn kind(&self) -> &'static str {
		match self {
			Envelope::PresenceAnnounce { .. } => "presence",
			Envelope::ChatRequest { .. } => "chat",
		}
	}
}

impl TryFrom<WireEnvelope> for Envelope {
	type Error = EnvelopeError;

	fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
		match wire.msg_type {
			msg_type::PRESENCE => Ok(Envelope::PresenceAnnounce { credential: wire.from }),
			msg_type::CHAT => {
				let to = wire.to.filter(|t| !t.trim().is_empty()).ok_or(EnvelopeError::MissingTarget)?;
				Ok(Envelope::ChatRequest {
					credential: wire.from,
					target: Identity::new(to)?,
					content: wire.content.unwrap_or_default(),
				})
			}
			other => Err(EnvelopeError::UnknownMsgType(other)),
		}
	}
}

impl From<Envelope> for WireEnvelope {
	fn from(env: Envelope) -> Self {
		match env {
			Envelope::PresenceAnnounce { credential } => WireEnvelope {
				msg_type: msg_type::PRESENCE,
				from: credential,
				to: None,
				content: None,
			},
			Envelope::ChatRequest {
				credential,
				target,
				content,
			} => WireEnvelope {
				msg_type: msg_type::CHAT,
				from: credential,
				to: Some(target.into_string()),
				content: Some(content),
			},
		}
	}
}

/// Reply result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ResultCode {
	Ok,
	BadRequest,
	Unauthorized,
	RateLimited,
	Internal,
}

impl ResultCode {
	pub const fn as_u16(self) -> u16 {
		match self {
			ResultCode::Ok => 200,
			ResultCode::BadRequest => 400,
			ResultCode::Unauthorized => 401,
			ResultCode::RateLimited => 429,
			ResultCode::Internal => 500,
		}
	}

	pub const fn is_success(self) -> bool {
		matches!(self, ResultCode::Ok)
	}
}

impl From<ResultCode> for u16 {
	fn from(code: ResultCode) -> Self {
		code.as_u16()
	}
}

impl TryFrom<u16> for ResultCode {
	type Error = String;

	fn try_from(value: u16) -> Result<Self, Self::Error> {
		match value {
			200 => Ok(ResultCode::Ok),
			400 => Ok(ResultCode::BadRequest),
			401 => Ok(ResultCode::Unauthorized),
			429 => Ok(ResultCode::RateLimited),
			500 => Ok(ResultCode::Internal),
			other => Err(format!("unknown resultCode {other}")),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
	pub result_code: ResultCode,
	pub content: String,
}

impl Reply {
	pub fn new(result_code: ResultCode, content: impl Into<String>) -> Self {
		Self {
			result_code,
			content: content.into(),
		}
	}

	pub fn ok(content: impl Into<String>) -> Self {
		Self::new(ResultCode::Ok, content)
	}

	pub fn bad_request(content: impl Into<String>) -> Self {
		Self::new(ResultCode::BadRequest, content)
	}

	pub fn unauthorized(content: impl Into<String>) -> Self {
		Self::new(ResultCode::Unauthorized, content)
	}

	pub fn rate_limited(content: impl Into<String>) -> Self {
		Self::new(ResultCode::RateLimited, content)
	}

	pub fn internal(content: impl Into<String>) -> Self {
		Self::new(ResultCode::Internal, content)
	}
}

/// A chat message pushed to its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
	pub from: Identity,
	pub content: String,
}

/// Anything the relay writes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
	Reply(Reply),
	Delivery(Delivery),
}

#[cfg(test)]
mod tests {
	use super::*;

	fn wire(json: &str) -> WireEnvelope {
		serde_json::from_str(json).expect("wire envelope")
	}

	#[test]
	fn classifies_presence_without_payload() {
		let env = Envelope::try_from(wire(r#"{"msgType":2,"from":"tok"}"#)).unwrap();
		assert_eq!(
			env,
			Envelope::PresenceAnnounce {
				credential: "tok".into()
			}
		);
	}

	#[test]
	fn classifies_chat_and_defaults_content() {
		let env = Envelope::try_from(wire(r#"{"msgType":1,"from":"tok","to":"bob"}"#)).unwrap();
		match env {
			Envelope::ChatRequest { target, content, .. } => {
				assert_eq!(target.as_str(), "bob");
				assert!(content.is_empty());
			}
			other => panic!("unexpected envelope: {other:?}"),
		}
	}

	#[test]
	fn rejects_unknown_type_and_missing_target() {
		assert_eq!(
			Envelope::try_from(wire(r#"{"msgType":7,"from":"tok"}"#)),
			Err(EnvelopeError::UnknownMsgType(7))
		);
		assert_eq!(
			Envelope::try_from(wire(r#"{"msgType":1,"from":"tok","to":"  "}"#)),
			Err(EnvelopeError::MissingTarget)
		);
	}

	#[test]
	fn reply_uses_numeric_result_code() {
		let json = serde_json::to_string(&Reply::rate_limited("slow down")).unwrap();
		assert_eq!(json, r#"{"resultCode":429,"content":"slow down"}"#);
		assert!(serde_json::from_str::<Reply>(r#"{"resultCode":418,"content":""}"#).is_err());
	}

	#[test]
	fn server_frame_distinguishes_reply_from_delivery() {
		let reply: ServerFrame = serde_json::from_str(r#"{"resultCode":200,"content":"ok"}"#).unwrap();
		assert!(matches!(reply, ServerFrame::Reply(r) if r.result_code.is_success()));

		let delivery: ServerFrame = serde_json::from_str(r#"{"from":"alice","content":"hi"}"#).unwrap();
		match delivery {
			ServerFrame::Delivery(d) => {
				assert_eq!(d.from.as_str(), "alice");
				assert_eq!(d.content, "hi");
			}
			other => panic!("unexpected frame: {other:?}"),
		}
	}
}
