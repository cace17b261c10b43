use std::fmt;

use async_trait::async_trait;

use super::{
	channel::{Channel, ChannelFactory},
	enumeration::EnumerationWriter,
	error::Error,
	literal::Literal,
	path::PathFragment,
};

/// The five things an [`Entry`] may know how to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
	Get,
	Put,
	Enumerate,
	Invoke,
	Subscribe,
}

impl fmt::Display for Capability {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Get => "get",
			Self::Put => "put",
			Self::Enumerate => "enumerate",
			Self::Invoke => "invoke",
			Self::Subscribe => "subscribe",
		})
	}
}

#[async_trait]
pub trait Get: Send + Sync {
	/// Current value, `None` when the entry exists but holds nothing.
	async fn get(&self) -> Result<Option<Literal>, Error>;
}

#[async_trait]
pub trait Put: Send + Sync {
	/// Replaces the value, `None` unlinks it.
	async fn put(&self, value: Option<Literal>) -> Result<(), Error>;
}

#[async_trait]
pub trait Enumerate: Send + Sync {
	/// Describes this entry and, while [`EnumerationWriter::can_descend`] allows it, its children.
	async fn enumerate(&self, writer: &mut EnumerationWriter) -> Result<(), Error>;
}

#[async_trait]
pub trait Invoke: Send + Sync {
	async fn invoke(&self, input: Option<Literal>) -> Result<Invocation, Error>;
}

#[async_trait]
pub trait Subscribe: Send + Sync {
	/// Opens a live feed of [`Notification`](crate::Notification)s for this entry, down to `depth`.
	///
	/// Implementations must stop producing once [`ChannelSender::stopped`](crate::ChannelSender::stopped)
	/// resolves, ending the channel with a terminal packet.
	async fn subscribe(&self, depth: usize, channels: &ChannelFactory) -> Result<Channel, Error>;
}

/// One addressable node, built fresh for every path resolution.
///
/// An entry opts into each capability by returning itself from the matching accessor, the
/// dispatcher checks those at call time instead of assuming a method exists.
pub trait Entry: Send + Sync {
	fn as_get(&self) -> Option<&dyn Get> {
		None
	}

	fn as_put(&self) -> Option<&dyn Put> {
		None
	}

	fn as_enumerate(&self) -> Option<&dyn Enumerate> {
		None
	}

	fn as_invoke(&self) -> Option<&dyn Invoke> {
		None
	}

	fn as_subscribe(&self) -> Option<&dyn Subscribe> {
		None
	}

	fn supports(&self, capability: Capability) -> bool {
		match capability {
			Capability::Get => self.as_get().is_some(),
			Capability::Put => self.as_put().is_some(),
			Capability::Enumerate => self.as_enumerate().is_some(),
			Capability::Invoke => self.as_invoke().is_some(),
			Capability::Subscribe => self.as_subscribe().is_some(),
		}
	}
}

impl dyn Entry {
	pub fn getter(&self, path: &PathFragment) -> Result<&dyn Get, Error> {
		self.as_get()
			.ok_or_else(|| Error::lacks(path, Capability::Get))
	}

	pub fn putter(&self, path: &PathFragment) -> Result<&dyn Put, Error> {
		self.as_put()
			.ok_or_else(|| Error::lacks(path, Capability::Put))
	}

	pub fn enumerator(&self, path: &PathFragment) -> Result<&dyn Enumerate, Error> {
		self.as_enumerate()
			.ok_or_else(|| Error::lacks(path, Capability::Enumerate))
	}

	pub fn invoker(&self, path: &PathFragment) -> Result<&dyn Invoke, Error> {
		self.as_invoke()
			.ok_or_else(|| Error::lacks(path, Capability::Invoke))
	}
}

impl fmt::Debug for dyn Entry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let capabilities = [
			Capability::Get,
			Capability::Put,
			Capability::Enumerate,
			Capability::Invoke,
			Capability::Subscribe,
		]
		.into_iter()
		.filter(|capability| self.supports(*capability))
		.collect::<Vec<_>>();

		f.debug_struct("Entry")
			.field("capabilities", &capabilities)
			.finish()
	}
}

/// What an [`Invoke`] call produced.
pub enum Invocation {
	Empty,
	Literal(Literal),
	/// A live entry, flattened through its `get` when returned inline.
	Entry(Box<dyn Entry>),
	/// A stream of results, carried to the caller as a channel.
	Channel(Channel),
}

impl fmt::Debug for Invocation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Empty => write!(f, "Empty"),
			Self::Literal(literal) => f.debug_tuple("Literal").field(literal).finish(),
			Self::Entry(entry) => f.debug_tuple("Entry").field(entry).finish(),
			Self::Channel(channel) => f.debug_tuple("Channel").field(&channel.id()).finish(),
		}
	}
}

impl From<Option<Literal>> for Invocation {
	fn from(value: Option<Literal>) -> Self {
		value.map_or(Self::Empty, Self::Literal)
	}
}

impl From<Literal> for Invocation {
	fn from(value: Literal) -> Self {
		Self::Literal(value)
	}
}

/// Provider of every entry under the path it gets mounted at.
#[async_trait]
pub trait Device: Send + Sync + 'static {
	/// Awaited by [`Environment::bind`](crate::Environment::bind) before the device becomes visible.
	async fn ready(&self) -> Result<(), Error> {
		Ok(())
	}

	/// Resolves a path relative to the mount point, `None` when nothing lives there.
	async fn get_entry(&self, path: &PathFragment) -> Result<Option<Box<dyn Entry>>, Error>;
}
