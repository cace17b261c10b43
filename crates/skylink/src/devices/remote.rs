use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::{
	channel::{Channel, ChannelFactory},
	client::Client,
	entry::{Device, Entry, Enumerate, Get, Invocation, Invoke, Put, Subscribe},
	enumeration::EnumerationWriter,
	error::Error,
	literal::Literal,
	ops::Output,
	path::PathFragment,
};

/// Mirrors the subtree at `prefix` of whatever server `client` talks to.
///
/// Entries are resolved lazily: every capability is one remote operation, done when it's used.
/// The client is held weakly and must be kept alive elsewhere.
#[derive(Debug, Clone)]
pub struct RemoteDevice {
	client: Weak<Client>,
	prefix: PathFragment,
}

impl RemoteDevice {
	#[must_use]
	pub fn new(client: &Arc<Client>, prefix: PathFragment) -> Self {
		Self::from_weak(Arc::downgrade(client), prefix)
	}

	/// A proxy that doesn't keep the client alive.
	#[must_use]
	pub const fn from_weak(client: Weak<Client>, prefix: PathFragment) -> Self {
		Self { client, prefix }
	}

	#[must_use]
	pub const fn prefix(&self) -> &PathFragment {
		&self.prefix
	}
}

#[async_trait]
impl Device for RemoteDevice {
	async fn get_entry(&self, path: &PathFragment) -> Result<Option<Box<dyn Entry>>, Error> {
		Ok(Some(Box::new(RemoteEntry {
			client: self.client.clone(),
			path: self.prefix.join(path).to_string(),
		})))
	}
}

struct RemoteEntry {
	client: Weak<Client>,
	path: String,
}

impl RemoteEntry {
	fn client(&self) -> Result<Arc<Client>, Error> {
		self.client
			.upgrade()
			.ok_or_else(|| Error::Transport(format!("client behind '{}' is gone", self.path)))
	}
}

impl Entry for RemoteEntry {
	fn as_get(&self) -> Option<&dyn Get> {
		Some(self)
	}

	fn as_put(&self) -> Option<&dyn Put> {
		Some(self)
	}

	fn as_enumerate(&self) -> Option<&dyn Enumerate> {
		Some(self)
	}

	fn as_invoke(&self) -> Option<&dyn Invoke> {
		Some(self)
	}

	fn as_subscribe(&self) -> Option<&dyn Subscribe> {
		Some(self)
	}
}

#[async_trait]
impl Get for RemoteEntry {
	async fn get(&self) -> Result<Option<Literal>, Error> {
		self.client()?.get(&self.path).await
	}
}

#[async_trait]
impl Put for RemoteEntry {
	async fn put(&self, value: Option<Literal>) -> Result<(), Error> {
		let client = self.client()?;
		match value {
			Some(value) => client.store(&self.path, Some(value)).await,
			None => client.unlink(&self.path).await,
		}
	}
}

#[async_trait]
impl Enumerate for RemoteEntry {
	async fn enumerate(&self, writer: &mut EnumerationWriter) -> Result<(), Error> {
		let output = self
			.client()?
			.enumerate(&self.path, writer.remaining_depth())
			.await?;
		writer.visit_enumeration(output)?;
		Ok(())
	}
}

#[async_trait]
impl Invoke for RemoteEntry {
	async fn invoke(&self, input: Option<Literal>) -> Result<Invocation, Error> {
		Ok(match self.client()?.invoke(&self.path, input, None).await? {
			Output::Empty => Invocation::Empty,
			Output::Literal(literal) => Invocation::Literal(literal),
			Output::Channel(channel) => Invocation::Channel(channel),
		})
	}
}

#[async_trait]
impl Subscribe for RemoteEntry {
	async fn subscribe(&self, depth: usize, _channels: &ChannelFactory) -> Result<Channel, Error> {
		self.client()?.subscribe(&self.path, depth).await
	}
}
