#![forbid(unsafe_code)]

pub mod digest;
pub mod frames;
pub mod payload;

pub use digest::{DigestAlgorithm, sign_digest, token_digest, verify_sign, verify_token};
pub use frames::{
	ClientFrame, FrameError, LoginFrame, PushFrame, PushItem, RawFrame, ResponseFrame, ServerFrame, TagChanges, encode,
	parse_frame,
};
pub use payload::{AdminResponse, ClusterEnvelope, PublishBody};

/// Status codes carried in `c` (client frames) and `code` (admin responses).
pub mod status {
	pub const OK: u16 = 200;
	pub const FAIL: u16 = 400;
	pub const AUTH: u16 = 401;
}

/// Frame type discriminators (`t`).
pub mod kind {
	pub const LOGIN: &str = "l";
	pub const TAG: &str = "t";
	pub const ACK: &str = "a";
	pub const RESPONSE: &str = "r";
	pub const PUSH: &str = "m";
	pub const ERROR: &str = "e";
}
