use std::{fmt, str::FromStr};

use super::{
	error::Error,
	literal::{Literal, LiteralKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
	Added,
	Changed,
	Removed,
	/// The initial state was fully sent, what follows are live changes.
	Ready,
}

impl NotificationKind {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Added => "Added",
			Self::Changed => "Changed",
			Self::Removed => "Removed",
			Self::Ready => "Ready",
		}
	}
}

impl fmt::Display for NotificationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for NotificationKind {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"Added" => Ok(Self::Added),
			"Changed" => Ok(Self::Changed),
			"Removed" => Ok(Self::Removed),
			"Ready" => Ok(Self::Ready),
			other => Err(Error::Descriptive {
				field: "type".to_string(),
				reason: format!("'{other}' isn't a notification type"),
			}),
		}
	}
}

/// One event of a subscription feed, carried as the output of a `Next` packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
	pub kind: NotificationKind,
	/// Path of the changed node relative to the subscribed entry, percent-encoded.
	pub path: String,
	pub entry: Option<Literal>,
}

impl Notification {
	pub fn added(path: impl Into<String>, entry: Literal) -> Self {
		Self {
			kind: NotificationKind::Added,
			path: path.into(),
			entry: Some(entry),
		}
	}

	pub fn changed(path: impl Into<String>, entry: Literal) -> Self {
		Self {
			kind: NotificationKind::Changed,
			path: path.into(),
			entry: Some(entry),
		}
	}

	pub fn removed(path: impl Into<String>) -> Self {
		Self {
			kind: NotificationKind::Removed,
			path: path.into(),
			entry: None,
		}
	}

	#[must_use]
	pub const fn ready() -> Self {
		Self {
			kind: NotificationKind::Ready,
			path: String::new(),
			entry: None,
		}
	}

	#[must_use]
	pub fn to_literal(&self) -> Literal {
		let mut children = vec![
			Literal::string("type", self.kind.as_str()),
			Literal::string("path", self.path.clone()),
		];
		if let Some(entry) = &self.entry {
			children.push(entry.clone().with_name("entry"));
		}

		Literal::folder("notif", children)
	}

	pub fn from_literal(literal: &Literal) -> Result<Self, Error> {
		let text = |name| -> Result<Option<String>, Error> {
			Ok(literal
				.get_child(name, false, Some(LiteralKind::String))?
				.and_then(Literal::as_str)
				.map(ToString::to_string))
		};

		let kind = text("type")?
			.ok_or_else(|| Error::Descriptive {
				field: "type".to_string(),
				reason: "is required in a notification".to_string(),
			})?
			.parse()?;

		Ok(Self {
			kind,
			path: text("path")?.unwrap_or_default(),
			entry: literal.child("entry").cloned(),
		})
	}
}
