#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

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

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id; surrounding whitespace is trimmed.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				let trimmed = id.trim();
				if trimmed.is_empty() {
					return Err(ParseIdError::Empty);
				}
				if trimmed.len() == id.len() {
					Ok(Self(id))
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

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}

		impl AsRef<str> for $name {
			fn as_ref(&self) -> &str {
				&self.0
			}
		}
	};
}

string_id!(
	/// Opaque user identity.
	UserId
);

string_id!(
	/// Identity of one client instance (device) of a user.
	ClientId
);

string_id!(
	/// Targeting label attached to a user.
	Tag
);

string_id!(
	/// Globally unique message id (decimal nanosecond timestamp when generated locally).
	MessageId
);

impl MessageId {
	/// New id derived from the nanosecond wall clock.
	pub fn generate() -> Self {
		Self(unix_nanos_now().to_string())
	}
}

/// Process-local sequence id of a live connection.
pub type ConnId = u64;

/// Current Unix time in nanoseconds.
#[inline]
pub fn unix_nanos_now() -> u128 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_nanos()
}

/// Current Unix time in seconds.
#[inline]
pub fn unix_secs_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_secs() as i64
}

/// A message as it was persisted: id, payload and creation time (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
	pub id: MessageId,
	pub data: String,
	pub created_at: i64,
}

/// Publish request: payload plus explicit recipients and tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
	pub id: MessageId,
	pub users: Vec<UserId>,
	pub tags: Vec<Tag>,
	pub data: String,
}

impl OutgoingMessage {
	/// Build a message with a freshly generated id.
	pub fn new(users: Vec<UserId>, tags: Vec<Tag>, data: impl Into<String>) -> Self {
		Self {
			id: MessageId::generate(),
			users,
			tags,
			data: data.into(),
		}
	}
}

/// Parse a list of raw strings into ids, skipping blank entries.
pub fn parse_id_list<T: FromStr<Err = ParseIdError>>(raw: &[String]) -> Vec<T> {
	raw.iter().filter_map(|s| s.parse::<T>().ok()).collect()
}
