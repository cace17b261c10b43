use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use base64::prelude::*;
use serde_json::{json, Value};
use tracing::warn;

use super::{entry::Device, error::Error};

/// Authority stamped on error literals this crate synthesizes itself.
pub const AUTHORITY: &str = "skylink";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiteralKind {
	String,
	Folder,
	Blob,
	Error,
	Function,
	Device,
}

impl LiteralKind {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::String => "String",
			Self::Folder => "Folder",
			Self::Blob => "Blob",
			Self::Error => "Error",
			Self::Function => "Function",
			Self::Device => "Device",
		}
	}
}

impl fmt::Display for LiteralKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for LiteralKind {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"String" => Ok(Self::String),
			"Folder" => Ok(Self::Folder),
			"Blob" => Ok(Self::Blob),
			"Error" => Ok(Self::Error),
			"Function" => Ok(Self::Function),
			"Device" => Ok(Self::Device),
			other => Err(Error::Structural(format!("unknown literal type '{other}'"))),
		}
	}
}

/// A value that can travel over the wire, or at least stand in for one.
///
/// `Device` never leaves the process as-is: it only exists locally, and a [`Deflater`] registered
/// for it (see [`Reversal`](crate::Reversal)) decides what reference gets sent instead.
#[derive(Clone)]
pub enum Literal {
	String {
		name: String,
		value: String,
	},
	Folder {
		name: String,
		children: Vec<Literal>,
	},
	Blob {
		name: String,
		mime: String,
		data: Vec<u8>,
	},
	Error {
		name: String,
		code: String,
		authority: String,
		message: String,
	},
	Function {
		name: String,
	},
	Device {
		name: String,
		device: Arc<dyn Device>,
	},
}

impl Literal {
	pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
		Self::String {
			name: name.into(),
			value: value.into(),
		}
	}

	pub fn folder(name: impl Into<String>, children: Vec<Self>) -> Self {
		Self::Folder {
			name: name.into(),
			children,
		}
	}

	pub fn blob(name: impl Into<String>, mime: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
		Self::Blob {
			name: name.into(),
			mime: mime.into(),
			data: data.into(),
		}
	}

	pub fn error(
		name: impl Into<String>,
		code: impl Into<String>,
		authority: impl Into<String>,
		message: impl Into<String>,
	) -> Self {
		Self::Error {
			name: name.into(),
			code: code.into(),
			authority: authority.into(),
			message: message.into(),
		}
	}

	pub fn function(name: impl Into<String>) -> Self {
		Self::Function { name: name.into() }
	}

	pub fn device(name: impl Into<String>, device: Arc<dyn Device>) -> Self {
		Self::Device {
			name: name.into(),
			device,
		}
	}

	#[must_use]
	pub const fn kind(&self) -> LiteralKind {
		match self {
			Self::String { .. } => LiteralKind::String,
			Self::Folder { .. } => LiteralKind::Folder,
			Self::Blob { .. } => LiteralKind::Blob,
			Self::Error { .. } => LiteralKind::Error,
			Self::Function { .. } => LiteralKind::Function,
			Self::Device { .. } => LiteralKind::Device,
		}
	}

	#[must_use]
	pub fn name(&self) -> &str {
		match self {
			Self::String { name, .. }
			| Self::Folder { name, .. }
			| Self::Blob { name, .. }
			| Self::Error { name, .. }
			| Self::Function { name }
			| Self::Device { name, .. } => name,
		}
	}

	pub fn set_name(&mut self, new_name: impl Into<String>) {
		match self {
			Self::String { name, .. }
			| Self::Folder { name, .. }
			| Self::Blob { name, .. }
			| Self::Error { name, .. }
			| Self::Function { name }
			| Self::Device { name, .. } => *name = new_name.into(),
		}
	}

	#[must_use]
	pub fn with_name(mut self, name: impl Into<String>) -> Self {
		self.set_name(name);
		self
	}

	/// The text of a `String` literal.
	#[must_use]
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::String { value, .. } => Some(value),
			_ => None,
		}
	}

	#[must_use]
	pub fn children(&self) -> Option<&[Self]> {
		match self {
			Self::Folder { children, .. } => Some(children),
			_ => None,
		}
	}

	pub fn children_mut(&mut self) -> Option<&mut Vec<Self>> {
		match self {
			Self::Folder { children, .. } => Some(children),
			_ => None,
		}
	}

	pub fn append(&mut self, child: Self) -> Result<&mut Self, Error> {
		let kind = self.kind();
		let name = self.name().to_string();
		self.children_mut()
			.ok_or_else(|| Error::Descriptive {
				field: name,
				reason: format!("is a {kind}, can't append children to it"),
			})?
			.push(child);
		Ok(self)
	}

	#[must_use]
	pub fn child(&self, name: &str) -> Option<&Self> {
		self.children()?.iter().find(|child| child.name() == name)
	}

	/// Looks up a child by name, optionally failing when it's absent or of an unexpected type.
	pub fn get_child(
		&self,
		name: &str,
		required: bool,
		expected: Option<LiteralKind>,
	) -> Result<Option<&Self>, Error> {
		if self.children().is_none() {
			return Err(Error::Descriptive {
				field: self.name().to_string(),
				reason: format!("is a {}, not a Folder", self.kind()),
			});
		}

		match (self.child(name), expected) {
			(None, _) if required => Err(Error::Descriptive {
				field: name.to_string(),
				reason: format!("is required but missing from '{}'", self.name()),
			}),
			(Some(child), Some(kind)) if child.kind() != kind => Err(Error::Descriptive {
				field: name.to_string(),
				reason: format!("should be a {kind}, found a {}", child.kind()),
			}),
			(found, _) => Ok(found),
		}
	}

	/// Human readable summary, used when a literal is surfaced as an error.
	#[must_use]
	pub fn describe(&self) -> String {
		match self {
			Self::String { value, .. } => value.clone(),
			Self::Error {
				code,
				authority,
				message,
				..
			} => format!("{message} <code='{code}', authority='{authority}'>"),
			other => format!("<{} literal '{}'>", other.kind(), other.name()),
		}
	}
}

impl fmt::Debug for Literal {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::String { name, value } => f
				.debug_struct("String")
				.field("name", name)
				.field("value", value)
				.finish(),
			Self::Folder { name, children } => f
				.debug_struct("Folder")
				.field("name", name)
				.field("children", children)
				.finish(),
			Self::Blob { name, mime, data } => f
				.debug_struct("Blob")
				.field("name", name)
				.field("mime", mime)
				.field("len", &data.len())
				.finish(),
			Self::Error {
				name,
				code,
				authority,
				message,
			} => f
				.debug_struct("Error")
				.field("name", name)
				.field("code", code)
				.field("authority", authority)
				.field("message", message)
				.finish(),
			Self::Function { name } => f.debug_struct("Function").field("name", name).finish(),
			Self::Device { name, .. } => f
				.debug_struct("Device")
				.field("name", name)
				.finish_non_exhaustive(),
		}
	}
}

impl PartialEq for Literal {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::String { name: a, value: x }, Self::String { name: b, value: y }) => {
				a == b && x == y
			}
			(
				Self::Folder {
					name: a,
					children: x,
				},
				Self::Folder {
					name: b,
					children: y,
				},
			) => a == b && x == y,
			(
				Self::Blob {
					name: a,
					mime: m,
					data: x,
				},
				Self::Blob {
					name: b,
					mime: n,
					data: y,
				},
			) => a == b && m == n && x == y,
			(
				Self::Error {
					name: a,
					code: c,
					authority: p,
					message: x,
				},
				Self::Error {
					name: b,
					code: d,
					authority: q,
					message: y,
				},
			) => a == b && c == d && p == q && x == y,
			(Self::Function { name: a }, Self::Function { name: b }) => a == b,
			(Self::Device { name: a, device: x }, Self::Device { name: b, device: y }) => {
				a == b && std::ptr::addr_eq(Arc::as_ptr(x), Arc::as_ptr(y))
			}
			_ => false,
		}
	}
}

/// Turns a raw wire value of one `Type` into a literal, overriding the built-in handling.
pub trait Inflater: Send + Sync {
	fn inflate(&self, raw: &Value, codec: &LiteralCodec) -> Result<Literal, Error>;
}

/// Turns a literal of one kind into its wire value, overriding the built-in handling.
pub trait Deflater: Send + Sync {
	fn deflate(&self, literal: &Literal, codec: &LiteralCodec) -> Result<Value, Error>;
}

/// Wire (de)serialization for [`Literal`]s, with per-type extension hooks.
#[derive(Clone, Default)]
pub struct LiteralCodec {
	inflaters: HashMap<String, Arc<dyn Inflater>>,
	deflaters: HashMap<LiteralKind, Arc<dyn Deflater>>,
}

impl fmt::Debug for LiteralCodec {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("LiteralCodec")
			.field("inflaters", &self.inflaters.keys().collect::<Vec<_>>())
			.field("deflaters", &self.deflaters.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl LiteralCodec {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_inflater(&mut self, type_name: impl Into<String>, inflater: Arc<dyn Inflater>) {
		self.inflaters.insert(type_name.into(), inflater);
	}

	pub fn register_deflater(&mut self, kind: LiteralKind, deflater: Arc<dyn Deflater>) {
		self.deflaters.insert(kind, deflater);
	}

	/// Converts a wire value into a literal.
	///
	/// Never fails: anything malformed or of an unknown `Type` comes back as an `Error` literal
	/// describing the problem, so a bad remote payload shows up as a value instead of a fault.
	#[must_use]
	pub fn inflate(&self, raw: &Value) -> Literal {
		let name = text(raw, "Name");

		let Some(type_name) = raw.get("Type").and_then(Value::as_str) else {
			warn!(%raw, "Received literal without a Type");
			return bad_literal(name, "literal is missing its Type");
		};

		if let Some(inflater) = self.inflaters.get(type_name) {
			return inflater
				.inflate(raw, self)
				.unwrap_or_else(|e| bad_literal(name, e.to_string()));
		}

		match type_name {
			"String" => Literal::String {
				name,
				value: text(raw, "StringValue"),
			},
			"Folder" => Literal::Folder {
				name,
				children: raw
					.get("Children")
					.and_then(Value::as_array)
					.map(|children| children.iter().map(|child| self.inflate(child)).collect())
					.unwrap_or_default(),
			},
			"Blob" => match BASE64_STANDARD.decode(text(raw, "Data")) {
				Ok(data) => Literal::Blob {
					mime: text(raw, "Mime"),
					name,
					data,
				},
				Err(e) => bad_literal(name, format!("blob data isn't valid base64: {e}")),
			},
			"Error" => Literal::Error {
				code: text(raw, "Code"),
				authority: text(raw, "Authority"),
				message: text(raw, "StringValue"),
				name,
			},
			"Function" => Literal::Function { name },
			other => {
				warn!(type_name = other, "No inflater registered for literal type");
				bad_literal(name, format!("can't inflate literal of type '{other}'"))
			}
		}
	}

	/// Converts a literal into its wire value.
	///
	/// Unlike [`inflate`](Self::inflate) this fails hard: we control what we emit, and emitting
	/// something the far end can't represent is a bug on our side.
	pub fn deflate(&self, literal: &Literal) -> Result<Value, Error> {
		if let Some(deflater) = self.deflaters.get(&literal.kind()) {
			return deflater.deflate(literal, self);
		}

		Ok(match literal {
			Literal::String { name, value } => json!({
				"Type": "String",
				"Name": name,
				"StringValue": value,
			}),
			Literal::Folder { name, children } => json!({
				"Type": "Folder",
				"Name": name,
				"Children": children
					.iter()
					.map(|child| self.deflate(child))
					.collect::<Result<Vec<_>, _>>()?,
			}),
			Literal::Blob { name, mime, data } => json!({
				"Type": "Blob",
				"Name": name,
				"Mime": mime,
				"Data": BASE64_STANDARD.encode(data),
			}),
			Literal::Error {
				name,
				code,
				authority,
				message,
			} => json!({
				"Type": "Error",
				"Name": name,
				"Code": code,
				"Authority": authority,
				"StringValue": message,
			}),
			Literal::Function { name } => json!({
				"Type": "Function",
				"Name": name,
			}),
			Literal::Device { name, .. } => {
				return Err(Error::Structural(format!(
					"device literal '{name}' can't be sent without a registered Device deflater"
				)))
			}
		})
	}

	pub fn deflate_optional(&self, literal: Option<&Literal>) -> Result<Option<Value>, Error> {
		literal.map(|literal| self.deflate(literal)).transpose()
	}
}

fn text(raw: &Value, key: &str) -> String {
	raw.get(key)
		.and_then(Value::as_str)
		.unwrap_or_default()
		.to_string()
}

fn bad_literal(name: String, message: impl Into<String>) -> Literal {
	Literal::Error {
		name,
		code: "bad-literal".to_string(),
		authority: AUTHORITY.to_string(),
		message: message.into(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn string_wire_shape() {
		let codec = LiteralCodec::new();
		let raw = codec.deflate(&Literal::string("", "hi")).unwrap();

		assert_eq!(
			raw,
			json!({"Type": "String", "Name": "", "StringValue": "hi"})
		);
		assert_eq!(codec.inflate(&raw), Literal::string("", "hi"));
	}

	#[test]
	fn missing_name_defaults_to_empty() {
		let codec = LiteralCodec::new();
		let literal = codec.inflate(&json!({"Type": "String", "StringValue": "hi"}));
		assert_eq!(literal, Literal::string("", "hi"));
	}

	#[test]
	fn nested_folder_with_blob_survives_the_wire() {
		let codec = LiteralCodec::new();
		let tree = Literal::folder(
			"root",
			vec![
				Literal::blob("img", "image/png", vec![0_u8, 1, 2, 255]),
				Literal::folder("sub", vec![Literal::function("launch")]),
				Literal::error("oops", "E42", "tests", "it broke"),
			],
		);

		let raw = codec.deflate(&tree).unwrap();
		assert_eq!(raw["Children"][0]["Data"], "AAEC/w==");
		assert_eq!(raw["Children"][2]["StringValue"], "it broke");
		assert_eq!(codec.inflate(&raw), tree);
	}

	#[test]
	fn unknown_or_missing_type_inflates_to_error() {
		let codec = LiteralCodec::new();

		let unknown = codec.inflate(&json!({"Type": "Hologram", "Name": "x"}));
		assert_eq!(unknown.kind(), LiteralKind::Error);
		assert_eq!(unknown.name(), "x");

		let missing = codec.inflate(&json!({"Name": "y"}));
		assert_eq!(missing.kind(), LiteralKind::Error);

		let bad_blob = codec.inflate(&json!({"Type": "Blob", "Data": "%%%"}));
		assert_eq!(bad_blob.kind(), LiteralKind::Error);
	}

	#[test]
	fn device_without_deflater_fails_hard() {
		struct Nothing;

		#[async_trait::async_trait]
		impl Device for Nothing {
			async fn get_entry(
				&self,
				_path: &crate::PathFragment,
			) -> Result<Option<Box<dyn crate::Entry>>, Error> {
				Ok(None)
			}
		}

		let codec = LiteralCodec::new();
		let err = codec
			.deflate(&Literal::device("dev", Arc::new(Nothing)))
			.unwrap_err();
		assert!(matches!(err, Error::Structural(_)));
	}

	#[test]
	fn custom_inflater_takes_over_a_type() {
		struct Upper;

		impl Inflater for Upper {
			fn inflate(&self, raw: &Value, _codec: &LiteralCodec) -> Result<Literal, Error> {
				Ok(Literal::string(
					"",
					text(raw, "Shout").to_uppercase(),
				))
			}
		}

		let mut codec = LiteralCodec::new();
		codec.register_inflater("Shout", Arc::new(Upper));

		assert_eq!(
			codec.inflate(&json!({"Type": "Shout", "Shout": "hey"})),
			Literal::string("", "HEY")
		);
	}

	#[test]
	fn get_child_checks() {
		let folder = Literal::folder(
			"config",
			vec![Literal::string("host", "localhost"), Literal::folder("opts", vec![])],
		);

		assert_eq!(
			folder
				.get_child("host", true, Some(LiteralKind::String))
				.unwrap()
				.and_then(Literal::as_str),
			Some("localhost")
		);
		assert!(folder.get_child("port", false, None).unwrap().is_none());

		let missing = folder.get_child("port", true, None).unwrap_err();
		assert!(missing.to_string().contains("port"));

		let wrong = folder
			.get_child("opts", true, Some(LiteralKind::String))
			.unwrap_err();
		assert!(matches!(wrong, Error::Descriptive { ref field, .. } if field == "opts"));

		assert!(Literal::string("x", "y").get_child("a", false, None).is_err());
	}

	#[test]
	fn append_only_on_folders() {
		let mut folder = Literal::folder("f", vec![]);
		folder.append(Literal::string("a", "1")).unwrap();
		assert_eq!(folder.child("a"), Some(&Literal::string("a", "1")));

		let mut text = Literal::string("s", "v");
		assert!(text.append(Literal::string("a", "1")).is_err());
	}
}
