use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::channel::{ChannelId, Status};

/// A request as it travels from client to server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestFrame {
	pub op: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dest: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub input: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub depth: Option<usize>,
	/// Correlation id, only sent by clients that don't run in lockstep.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<u64>,
}

/// The answer to one [`RequestFrame`].
///
/// A response opening a channel carries `Status: "Ok"` and the channel's id in `Chan`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseFrame {
	pub ok: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub status: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub chan: Option<ChannelId>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub output: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub id: Option<u64>,
}

impl ResponseFrame {
	#[must_use]
	pub const fn success(output: Option<Value>) -> Self {
		Self {
			ok: true,
			status: None,
			chan: None,
			output,
			id: None,
		}
	}

	#[must_use]
	pub const fn failure(output: Value) -> Self {
		Self {
			ok: false,
			status: None,
			chan: None,
			output: Some(output),
			id: None,
		}
	}

	#[must_use]
	pub fn channel(chan: ChannelId) -> Self {
		Self {
			ok: true,
			status: Some("Ok".to_string()),
			chan: Some(chan),
			output: None,
			id: None,
		}
	}

	#[must_use]
	pub fn with_id(mut self, id: Option<u64>) -> Self {
		self.id = id;
		self
	}
}

/// One packet of a channel, streamed after the response that opened it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChannelFrame {
	pub chan: ChannelId,
	pub status: Status,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub output: Option<Value>,
}

/// What an inbound frame is, judged by its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
	Request,
	Response,
	Channel,
}

impl FrameKind {
	pub(crate) fn of(frame: &Value) -> Self {
		if frame.get("Op").is_some() {
			Self::Request
		} else if frame.get("Ok").is_none() && frame.get("Chan").is_some() {
			Self::Channel
		} else {
			Self::Response
		}
	}
}

/// Upper-cases the first letter of every top-level key, so `{"op": "get"}` reads as `{"Op": "get"}`.
///
/// Keys already in the right case win over a normalized duplicate.
#[must_use]
pub fn normalize_keys(frame: Value) -> Value {
	let Value::Object(fields) = frame else {
		return frame;
	};

	let mut normalized = Map::with_capacity(fields.len());
	let mut lowered = Vec::new();

	for (key, value) in fields {
		match key.chars().next() {
			Some(first) if first.is_lowercase() => {
				let mut upper = first.to_uppercase().collect::<String>();
				upper.push_str(&key[first.len_utf8()..]);
				lowered.push((upper, value));
			}
			_ => {
				normalized.insert(key, value);
			}
		}
	}

	for (key, value) in lowered {
		normalized.entry(key).or_insert(value);
	}

	Value::Object(normalized)
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn request_frame_shape() {
		let frame = RequestFrame {
			op: "get".to_string(),
			path: Some("/mem/greeting".to_string()),
			..Default::default()
		};

		assert_eq!(
			serde_json::to_value(&frame).unwrap(),
			json!({"Op": "get", "Path": "/mem/greeting"})
		);

		let parsed: RequestFrame =
			serde_json::from_value(json!({"Op": "enumerate", "Path": "/", "Depth": 1})).unwrap();
		assert_eq!(parsed.depth, Some(1));
		assert_eq!(parsed.input, None);
	}

	#[test]
	fn response_frame_shapes() {
		assert_eq!(
			serde_json::to_value(ResponseFrame::success(None)).unwrap(),
			json!({"Ok": true})
		);
		assert_eq!(
			serde_json::to_value(ResponseFrame::channel(4).with_id(Some(9))).unwrap(),
			json!({"Ok": true, "Status": "Ok", "Chan": 4, "Id": 9})
		);
		assert_eq!(
			serde_json::to_value(ChannelFrame {
				chan: 4,
				status: Status::Done,
				output: None
			})
			.unwrap(),
			json!({"Chan": 4, "Status": "Done"})
		);
	}

	#[test]
	fn frame_kinds() {
		assert_eq!(FrameKind::of(&json!({"Op": "ping"})), FrameKind::Request);
		assert_eq!(FrameKind::of(&json!({"Ok": true, "Chan": 1})), FrameKind::Response);
		assert_eq!(
			FrameKind::of(&json!({"Chan": 1, "Status": "Next"})),
			FrameKind::Channel
		);
	}

	#[test]
	fn keys_get_normalized() {
		assert_eq!(
			normalize_keys(json!({"op": "get", "path": "/x", "Depth": 2})),
			json!({"Op": "get", "Path": "/x", "Depth": 2})
		);
		assert_eq!(
			normalize_keys(json!({"op": "ping", "Op": "get"})),
			json!({"Op": "get"})
		);
		assert_eq!(normalize_keys(json!([1, 2])), json!([1, 2]));
	}
}
