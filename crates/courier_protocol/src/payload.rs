#![forbid(unsafe_code)]

use courier_domain::{MessageId, OutgoingMessage, ParseIdError, Tag, UserId, parse_id_list};
use serde::{Deserialize, Deserializer, Serialize};

/// Publish body shared by the admin endpoint (`{"d","us","ts"}`) and the
/// cluster envelope, where `MessageID` is also set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishBody {
	#[serde(rename = "MessageID", default, deserialize_with = "nullable")]
	pub message_id: String,

	#[serde(rename = "us", default, deserialize_with = "nullable")]
	pub users: Vec<String>,

	#[serde(rename = "ts", default, deserialize_with = "nullable")]
	pub tags: Vec<String>,

	#[serde(rename = "d", default, deserialize_with = "nullable")]
	pub data: String,
}

impl PublishBody {
	/// Convert into a domain message. Blank user/tag entries are dropped.
	pub fn into_outgoing(self, id: MessageId) -> OutgoingMessage {
		OutgoingMessage {
			id,
			users: parse_id_list::<UserId>(&self.users),
			tags: parse_id_list::<Tag>(&self.tags),
			data: self.data,
		}
	}

	/// Convert using the embedded `MessageID`.
	pub fn into_outgoing_with_embedded_id(self) -> Result<OutgoingMessage, ParseIdError> {
		let id = MessageId::new(self.message_id.clone())?;
		Ok(self.into_outgoing(id))
	}
}

impl From<&OutgoingMessage> for PublishBody {
	fn from(m: &OutgoingMessage) -> Self {
		Self {
			message_id: m.id.to_string(),
			users: m.users.iter().map(|u| u.to_string()).collect(),
			tags: m.tags.iter().map(|t| t.to_string()).collect(),
			data: m.data.clone(),
		}
	}
}

/// Replication-bus wrapper around a locally originated message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterEnvelope {
	pub node_name: String,
	pub message: PublishBody,
	/// Persisted creation time on the originating node (unix seconds).
	pub timestamp: i64,
}

/// Admin endpoint response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminResponse {
	pub code: String,
	pub data: String,
}

impl AdminResponse {
	pub fn new(code: u16, data: impl Into<String>) -> Self {
		Self {
			code: code.to_string(),
			data: data.into(),
		}
	}
}

// Peers may encode empty lists as `null`.
fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: Deserialize<'de> + Default,
{
	Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}
