use thiserror::Error;

use super::{channel::ChannelId, entry::Capability, literal::Literal};

#[derive(Debug, Error)]
pub enum Error {
	#[error("path not found: <path='{0}'>")]
	NotFound(String),
	#[error("entry at <path='{path}'> doesn't implement {capability}")]
	CapabilityMismatch { path: String, capability: Capability },
	#[error("entry at <path='{0}'> can't be subscribed to")]
	Unsubscribable(String),
	#[error("output of <path='{0}'> can't be returned inline, pass a Dest to store it")]
	OutputNotReturnable(String),
	#[error("malformed path: {0}")]
	MalformedPath(String),
	#[error("unsupported path pattern: <pattern='{0}'>")]
	UnsupportedPattern(String),
	#[error("structural error: {0}")]
	Structural(String),
	#[error("field <name='{field}'> {reason}")]
	Descriptive { field: String, reason: String },
	#[error("transport error: {0}")]
	Transport(String),
	#[error("remote error: {}", .0.describe())]
	Remote(Literal),
	#[error("channel <id='{0}'> already received a terminal packet")]
	ChannelTerminal(ChannelId),
	#[error("unknown operation: <op='{0}'>")]
	UnknownOperation(String),

	#[error(transparent)]
	Serialization(#[from] serde_json::Error),
	#[error(transparent)]
	Io(#[from] std::io::Error),
}

impl Error {
	pub(crate) fn missing(path: impl ToString) -> Self {
		Self::NotFound(path.to_string())
	}

	pub(crate) fn lacks(path: impl ToString, capability: Capability) -> Self {
		Self::CapabilityMismatch {
			path: path.to_string(),
			capability,
		}
	}

	/// The literal this error is reported as in a failed response or an `Error` packet.
	#[must_use]
	pub fn to_literal(&self) -> Literal {
		match self {
			Self::Remote(literal) => literal.clone(),
			other => Literal::string("", other.to_string()),
		}
	}
}
