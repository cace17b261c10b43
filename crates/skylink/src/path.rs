use std::{collections::HashMap, fmt, str::FromStr};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::warn;

use super::error::Error;

/// Characters left alone when encoding a single path segment, same as JavaScript's `encodeURIComponent`.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
	.remove(b'-')
	.remove(b'_')
	.remove(b'.')
	.remove(b'!')
	.remove(b'~')
	.remove(b'*')
	.remove(b'\'')
	.remove(b'(')
	.remove(b')');

#[must_use]
pub fn encode_segment(name: &str) -> String {
	utf8_percent_encode(name, SEGMENT).to_string()
}

#[must_use]
pub fn decode_segment(part: &str) -> String {
	percent_decode_str(part).decode_utf8_lossy().into_owned()
}

/// A slash separated path whose segments ("parts") are kept percent-encoded.
///
/// No part may be empty, except a single trailing one which marks a trailing slash.
/// Both `""` and `"/"` parse to the absolute empty path, which is the root of an [`Environment`].
///
/// [`Environment`]: crate::Environment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathFragment {
	absolute: bool,
	parts: Vec<String>,
}

impl Default for PathFragment {
	fn default() -> Self {
		Self::root()
	}
}

impl PathFragment {
	#[must_use]
	pub const fn root() -> Self {
		Self {
			absolute: true,
			parts: Vec::new(),
		}
	}

	pub fn parse(path: &str) -> Result<Self, Error> {
		if path.is_empty() || path == "/" {
			return Ok(Self::root());
		}

		let (absolute, body) = path
			.strip_prefix('/')
			.map_or((false, path), |body| (true, body));

		Self::from_parts(absolute, body.split('/').map(ToString::to_string))
	}

	/// Builds an absolute path out of already encoded parts.
	pub fn from_parts(
		absolute: bool,
		parts: impl IntoIterator<Item = String>,
	) -> Result<Self, Error> {
		let parts = parts.into_iter().collect::<Vec<_>>();

		if let Some(idx) = parts
			.iter()
			.take(parts.len().saturating_sub(1))
			.position(String::is_empty)
		{
			return Err(Error::MalformedPath(format!(
				"empty segment at position {idx} in '{}'",
				parts.join("/")
			)));
		}

		Ok(Self { absolute, parts })
	}

	/// Builds an absolute path out of plain names, encoding each one.
	pub fn from_names<I, S>(names: I) -> Result<Self, Error>
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		let mut path = Self::root();
		for name in names {
			path.push_name(name.as_ref())?;
		}
		Ok(path)
	}

	#[must_use]
	pub const fn is_absolute(&self) -> bool {
		self.absolute
	}

	#[must_use]
	pub fn parts(&self) -> &[String] {
		&self.parts
	}

	#[must_use]
	pub fn names(&self) -> Vec<String> {
		self.parts.iter().map(|part| decode_segment(part)).collect()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.parts.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.parts.is_empty()
	}

	#[must_use]
	pub fn has_trailing_slash(&self) -> bool {
		self.parts.last().is_some_and(String::is_empty)
	}

	pub fn push_name(&mut self, name: &str) -> Result<(), Error> {
		self.push_part(encode_segment(name))
	}

	pub fn push_part(&mut self, part: impl Into<String>) -> Result<(), Error> {
		let part = part.into();
		if part.is_empty() || part.contains('/') {
			return Err(Error::MalformedPath(format!(
				"can't push segment '{part}' onto '{self}'"
			)));
		}

		if self.has_trailing_slash() {
			self.parts.pop();
		}
		self.parts.push(part);

		Ok(())
	}

	pub fn pop_part(&mut self) -> Option<String> {
		self.parts.pop()
	}

	pub fn pop_name(&mut self) -> Option<String> {
		self.pop_part().map(|part| decode_segment(&part))
	}

	#[must_use]
	pub fn last_part(&self) -> Option<&str> {
		self.parts.last().map(String::as_str)
	}

	#[must_use]
	pub fn last_name(&self) -> Option<String> {
		self.last_part().map(decode_segment)
	}

	/// Copies the parts in `start..end`, clamped to the path length.
	#[must_use]
	pub fn slice(&self, start: usize, end: usize) -> Self {
		let end = end.min(self.parts.len());
		let start = start.min(end);

		Self {
			absolute: self.absolute,
			parts: self.parts[start..end].to_vec(),
		}
	}

	/// Appends every part of `other` after the parts of `self`.
	#[must_use]
	pub fn join(&self, other: &Self) -> Self {
		let mut parts = self.parts.clone();
		if self.has_trailing_slash() {
			parts.pop();
		}
		parts.extend(other.parts.iter().cloned());

		Self {
			absolute: self.absolute,
			parts,
		}
	}

	#[must_use]
	pub fn starts_with(&self, other: &Self) -> bool {
		let prefix = other
			.parts
			.strip_suffix(&[String::new()])
			.unwrap_or(&other.parts);

		self.absolute == other.absolute && self.parts.starts_with(prefix)
	}

	/// Checks that a pattern only uses the capture syntax [`match_with`](Self::match_with) understands.
	pub fn check_pattern(&self) -> Result<(), Error> {
		for (idx, part) in self.parts.iter().enumerate() {
			let Some(capture) = part.strip_prefix(':') else {
				continue;
			};

			if capture.contains('@') {
				return Err(Error::UnsupportedPattern(self.to_string()));
			}

			if capture.starts_with('*') && idx != self.parts.len() - 1 {
				return Err(Error::UnsupportedPattern(self.to_string()));
			}
		}

		Ok(())
	}

	/// Matches this path against a pattern made of literal parts, `:name` captures (optionally
	/// constrained with a `.ext` suffix) and a final `:*name` capturing every remaining part.
	#[must_use]
	pub fn match_with(&self, pattern: &Self) -> PathMatch {
		if let Err(e) = pattern.check_pattern() {
			warn!(%e, "Refusing to match against pattern");
			return PathMatch::failed();
		}

		if self.absolute != pattern.absolute {
			return PathMatch::failed();
		}

		let mut params = HashMap::new();

		for (idx, expected) in pattern.parts.iter().enumerate() {
			let Some(capture) = expected.strip_prefix(':') else {
				if self.parts.get(idx) != Some(expected) {
					return PathMatch::failed();
				}
				continue;
			};

			if let Some(name) = capture.strip_prefix('*') {
				params.insert(
					name.to_string(),
					PathParam::Rest(self.parts[idx.min(self.parts.len())..].to_vec()),
				);
				return PathMatch { ok: true, params };
			}

			let Some(part) = self.parts.get(idx).filter(|part| !part.is_empty()) else {
				return PathMatch::failed();
			};

			let (name, value) = match capture.split_once('.') {
				Some((name, ext)) => {
					let Some(stem) = part
						.strip_suffix(ext)
						.and_then(|rest| rest.strip_suffix('.'))
						.filter(|stem| !stem.is_empty())
					else {
						return PathMatch::failed();
					};
					(name, stem)
				}
				None => (capture, part.as_str()),
			};

			params.insert(name.to_string(), PathParam::Name(decode_segment(value)));
		}

		if self.parts.len() != pattern.parts.len() {
			return PathMatch::failed();
		}

		PathMatch { ok: true, params }
	}
}

impl fmt::Display for PathFragment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.absolute {
			write!(f, "/")?;
		}
		write!(f, "{}", self.parts.join("/"))
	}
}

impl FromStr for PathFragment {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

impl TryFrom<&str> for PathFragment {
	type Error = Error;

	fn try_from(value: &str) -> Result<Self, Self::Error> {
		Self::parse(value)
	}
}

impl TryFrom<String> for PathFragment {
	type Error = Error;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Self::parse(&value)
	}
}

impl TryFrom<&String> for PathFragment {
	type Error = Error;

	fn try_from(value: &String) -> Result<Self, Self::Error> {
		Self::parse(value)
	}
}

impl From<&Self> for PathFragment {
	fn from(value: &Self) -> Self {
		value.clone()
	}
}

/// A value captured by [`PathFragment::match_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathParam {
	/// A single decoded segment, from `:name`.
	Name(String),
	/// Every remaining segment, still percent-encoded, from `:*name`.
	Rest(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathMatch {
	pub ok: bool,
	pub params: HashMap<String, PathParam>,
}

impl PathMatch {
	fn failed() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn name(&self, key: &str) -> Option<&str> {
		match self.params.get(key) {
			Some(PathParam::Name(name)) => Some(name),
			_ => None,
		}
	}

	#[must_use]
	pub fn rest(&self, key: &str) -> Option<&[String]> {
		match self.params.get(key) {
			Some(PathParam::Rest(parts)) => Some(parts),
			_ => None,
		}
	}
}
