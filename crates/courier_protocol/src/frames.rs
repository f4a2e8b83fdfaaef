#![forbid(unsafe_code)]

use courier_domain::{ClientId, MessageId, StoredMessage, Tag, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::{kind, status};

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("malformed json: {0}")]
	Json(#[from] serde_json::Error),

	#[error("frame is not a json object")]
	NotAnObject,

	#[error("invalid field `{field}`: expected {expected}")]
	InvalidField {
		field: &'static str,
		expected: &'static str,
	},
}

/// Inbound frame after the envelope (`t`, `i`) has been read but before the
/// type-specific fields are validated.
#[derive(Debug, Clone)]
pub struct RawFrame {
	/// Type discriminator (`t`); empty when missing or not a string.
	pub kind: String,
	/// Client correlation id (`i`), stringified.
	pub id: String,
	body: Map<String, Value>,
}

/// Parse one inbound text frame. Newlines are folded into spaces first.
pub fn parse_frame(text: &str) -> Result<RawFrame, FrameError> {
	let folded = text.replace('\n', " ");
	let value: Value = serde_json::from_str(folded.trim())?;
	let Value::Object(body) = value else {
		return Err(FrameError::NotAnObject);
	};

	let kind = match body.get("t") {
		Some(Value::String(s)) => s.clone(),
		_ => String::new(),
	};
	let id = body.get("i").map(stringify).unwrap_or_default();

	Ok(RawFrame { kind, id, body })
}

/// Validated client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
	Login(LoginFrame),
	Tag(TagChanges),
	Ack(Vec<MessageId>),
	Unknown(String),
}

/// Fields of an `l` frame. `user`/`client_id` are raw (trimmed) so blank
/// values can be reported as a failure instead of a decode error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFrame {
	pub user: String,
	pub client_id: String,
	pub token: String,
	pub timestamp: i64,
}

impl LoginFrame {
	/// Typed identity, or `None` when either part is blank.
	pub fn identity(&self) -> Option<(UserId, ClientId)> {
		let user = UserId::new(self.user.clone()).ok()?;
		let client = ClientId::new(self.client_id.clone()).ok()?;
		Some((user, client))
	}
}

/// Tag additions (`true`) and removals (`false`) from a `t` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagChanges {
	pub add: Vec<Tag>,
	pub remove: Vec<Tag>,
}

impl TagChanges {
	pub fn is_empty(&self) -> bool {
		self.add.is_empty() && self.remove.is_empty()
	}
}

impl RawFrame {
	/// Validate the type-specific fields.
	pub fn decode(&self) -> Result<ClientFrame, FrameError> {
		match self.kind.as_str() {
			kind::LOGIN => {
				let user = self.str_field("u")?.trim().to_string();
				let client_id = self.str_field("m")?.trim().to_string();
				let token = self.str_field("tk")?.to_string();
				let timestamp = match self.body.get("ts") {
					Some(Value::Number(n)) => number_to_i64(n).ok_or(FrameError::InvalidField {
						field: "ts",
						expected: "integer unix seconds",
					})?,
					_ => {
						return Err(FrameError::InvalidField {
							field: "ts",
							expected: "number",
						});
					}
				};
				Ok(ClientFrame::Login(LoginFrame {
					user,
					client_id,
					token,
					timestamp,
				}))
			}
			kind::TAG => {
				let Some(Value::Object(d)) = self.body.get("d") else {
					return Err(FrameError::InvalidField {
						field: "d",
						expected: "object of tag -> bool",
					});
				};

				let mut changes = TagChanges::default();
				for (name, flag) in d {
					// Non-boolean values and blank names are ignored.
					let Value::Bool(flag) = flag else { continue };
					let Ok(tag) = Tag::new(name.clone()) else { continue };
					if *flag {
						changes.add.push(tag);
					} else {
						changes.remove.push(tag);
					}
				}
				Ok(ClientFrame::Tag(changes))
			}
			kind::ACK => {
				let Some(Value::Array(ids)) = self.body.get("id") else {
					return Err(FrameError::InvalidField {
						field: "id",
						expected: "array of message ids",
					});
				};
				let ids = ids
					.iter()
					.filter_map(|v| MessageId::new(stringify(v)).ok())
					.collect::<Vec<_>>();
				Ok(ClientFrame::Ack(ids))
			}
			other => Ok(ClientFrame::Unknown(other.to_string())),
		}
	}

	fn str_field(&self, field: &'static str) -> Result<&str, FrameError> {
		match self.body.get(field) {
			Some(Value::String(s)) => Ok(s.as_str()),
			_ => Err(FrameError::InvalidField {
				field,
				expected: "string",
			}),
		}
	}
}

fn number_to_i64(n: &Number) -> Option<i64> {
	n.as_i64().or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
}

fn stringify(v: &Value) -> String {
	match v {
		Value::String(s) => s.clone(),
		Value::Null => String::new(),
		other => other.to_string(),
	}
}

/// Node → client `r` / `e` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFrame {
	pub t: String,
	pub rt: String,
	pub i: String,
	pub c: u16,
	pub m: String,
}

impl ResponseFrame {
	/// Generic response to a frame of type `rt`.
	pub fn reply(rt: &str, id: &str, code: u16, message: impl Into<String>) -> Self {
		Self {
			t: kind::RESPONSE.to_string(),
			rt: rt.to_string(),
			i: id.to_string(),
			c: code,
			m: message.into(),
		}
	}

	/// Failure while handling a frame.
	pub fn error(rt: &str, id: &str, cause: impl Into<String>) -> Self {
		Self {
			t: kind::ERROR.to_string(),
			rt: rt.to_string(),
			i: id.to_string(),
			c: status::FAIL,
			m: cause.into(),
		}
	}
}

/// One pushed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushItem {
	pub id: String,
	pub ts: i64,
	pub data: String,
}

impl From<&StoredMessage> for PushItem {
	fn from(m: &StoredMessage) -> Self {
		Self {
			id: m.id.to_string(),
			ts: m.created_at,
			data: m.data.clone(),
		}
	}
}

/// Node → client `m` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushFrame {
	pub t: String,
	pub ms: Vec<PushItem>,
}

impl PushFrame {
	pub fn new(ms: Vec<PushItem>) -> Self {
		Self {
			t: kind::PUSH.to_string(),
			ms,
		}
	}
}

/// Loose view of any node → client frame, used by clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerFrame {
	#[serde(default)]
	pub t: String,
	#[serde(default)]
	pub rt: Option<String>,
	#[serde(default)]
	pub i: Option<String>,
	#[serde(default)]
	pub c: Option<u16>,
	#[serde(default)]
	pub m: Option<String>,
	#[serde(default)]
	pub ms: Vec<PushItem>,
}

/// Serialize an outbound frame to its text form.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, FrameError> {
	Ok(serde_json::to_string(frame)?)
}

/// Client → node frame builders.
pub mod client {
	use serde_json::{Map, Value, json};

	use crate::kind;

	pub fn login(id: &str, user: &str, client_id: &str, token: &str, ts: i64) -> String {
		json!({ "t": kind::LOGIN, "i": id, "u": user, "m": client_id, "tk": token, "ts": ts }).to_string()
	}

	pub fn tags(id: &str, changes: &[(String, bool)]) -> String {
		let d: Map<String, Value> = changes.iter().map(|(k, v)| (k.clone(), Value::Bool(*v))).collect();
		json!({ "t": kind::TAG, "i": id, "d": d }).to_string()
	}

	pub fn ack(id: &str, message_ids: &[String]) -> String {
		json!({ "t": kind::ACK, "i": id, "id": message_ids }).to_string()
	}
}
