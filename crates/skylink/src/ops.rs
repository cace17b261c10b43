use std::{
	collections::HashMap,
	fmt,
	str::FromStr,
	sync::{Arc, Mutex, PoisonError},
};

use tracing::{debug, instrument, trace};

use super::{
	channel::{Channel, ChannelControl, ChannelFactory, ChannelId, ChannelSender},
	entry::{Capability, Entry, Invocation},
	enumeration::EnumerationWriter,
	environment::Environment,
	error::Error,
	literal::Literal,
	notification::Notification,
	path::PathFragment,
};

/// The closed set of core operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
	Ping,
	Get,
	Store,
	Unlink,
	Enumerate,
	Subscribe,
	Invoke,
	Stop,
}

impl Operation {
	#[must_use]
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Ping => "ping",
			Self::Get => "get",
			Self::Store => "store",
			Self::Unlink => "unlink",
			Self::Enumerate => "enumerate",
			Self::Subscribe => "subscribe",
			Self::Invoke => "invoke",
			Self::Stop => "stop",
		}
	}
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Operation {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"ping" => Self::Ping,
			"get" => Self::Get,
			"store" => Self::Store,
			"unlink" => Self::Unlink,
			"enumerate" => Self::Enumerate,
			"subscribe" => Self::Subscribe,
			"invoke" => Self::Invoke,
			"stop" => Self::Stop,
			other => return Err(Error::UnknownOperation(other.to_string())),
		})
	}
}

/// A decoded request, with its `Input` already inflated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Request {
	pub op: String,
	pub path: Option<String>,
	pub dest: Option<String>,
	pub input: Option<Literal>,
	pub depth: Option<usize>,
}

impl Request {
	pub fn new(op: impl Into<String>) -> Self {
		Self {
			op: op.into(),
			..Default::default()
		}
	}

	#[must_use]
	pub fn path(mut self, path: impl Into<String>) -> Self {
		self.path = Some(path.into());
		self
	}

	#[must_use]
	pub fn dest(mut self, dest: impl Into<String>) -> Self {
		self.dest = Some(dest.into());
		self
	}

	#[must_use]
	pub fn input(mut self, input: Option<Literal>) -> Self {
		self.input = input;
		self
	}

	#[must_use]
	pub fn depth(mut self, depth: usize) -> Self {
		self.depth = Some(depth);
		self
	}

	fn required_path(&self) -> Result<PathFragment, Error> {
		parse_field("Path", self.path.as_deref())
	}

	fn required_dest(&self) -> Result<PathFragment, Error> {
		parse_field("Dest", self.dest.as_deref())
	}
}

fn parse_field(field: &str, value: Option<&str>) -> Result<PathFragment, Error> {
	let value = value.ok_or_else(|| Error::Descriptive {
		field: field.to_string(),
		reason: "is required for this operation".to_string(),
	})?;

	PathFragment::parse(value)
}

/// What an operation hands back to the connection.
pub enum Output {
	Empty,
	Literal(Literal),
	Channel(Channel),
}

impl fmt::Debug for Output {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Empty => write!(f, "Empty"),
			Self::Literal(literal) => f.debug_tuple("Literal").field(literal).finish(),
			Self::Channel(channel) => f.debug_tuple("Channel").field(&channel.id()).finish(),
		}
	}
}

impl From<Option<Literal>> for Output {
	fn from(value: Option<Literal>) -> Self {
		value.map_or(Self::Empty, Self::Literal)
	}
}

/// Runs the core operations against an [`Environment`].
///
/// Also keeps the registry of channels handed out over one connection, keyed by the id they are
/// known by on the wire, so `stop` can reach their producers.
pub struct CoreOps {
	env: Arc<Environment>,
	channels: Arc<ChannelFactory>,
	max_depth: Option<usize>,
	open_channels: Mutex<HashMap<ChannelId, ChannelControl>>,
}

impl fmt::Debug for CoreOps {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CoreOps")
			.field("env", &self.env)
			.field("max_depth", &self.max_depth)
			.finish_non_exhaustive()
	}
}

impl CoreOps {
	#[must_use]
	pub fn new(env: Arc<Environment>, channels: Arc<ChannelFactory>) -> Self {
		Self {
			env,
			channels,
			max_depth: None,
			open_channels: Mutex::default(),
		}
	}

	#[must_use]
	pub fn with_max_depth(mut self, max_depth: Option<usize>) -> Self {
		self.max_depth = max_depth;
		self
	}

	#[must_use]
	pub const fn env(&self) -> &Arc<Environment> {
		&self.env
	}

	#[must_use]
	pub const fn channels(&self) -> &Arc<ChannelFactory> {
		&self.channels
	}

	fn depth(&self, requested: Option<usize>) -> usize {
		let requested = requested.unwrap_or_default();
		self.max_depth
			.map_or(requested, |max_depth| requested.min(max_depth))
	}

	#[instrument(skip_all, fields(op = %request.op, path = ?request.path))]
	pub async fn dispatch(&self, request: Request) -> Result<Output, Error> {
		match request.op.parse::<Operation>()? {
			Operation::Ping => Ok(Output::Empty),
			Operation::Get => self.get(&request.required_path()?).await.map(Output::from),
			Operation::Store => {
				self.store(&request.required_dest()?, request.input)
					.await?;
				Ok(Output::Empty)
			}
			Operation::Unlink => {
				self.store(&request.required_path()?, None).await?;
				Ok(Output::Empty)
			}
			Operation::Enumerate => self
				.enumerate(&request.required_path()?, self.depth(request.depth))
				.await
				.map(Output::Literal),
			Operation::Subscribe => self
				.subscribe(&request.required_path()?, self.depth(request.depth))
				.await
				.map(Output::Channel),
			Operation::Invoke => {
				let dest = request
					.dest
					.as_deref()
					.map(PathFragment::parse)
					.transpose()?;
				self.invoke(&request.required_path()?, request.input, dest.as_ref())
					.await
			}
			Operation::Stop => {
				self.stop(&request.required_path()?)?;
				Ok(Output::Empty)
			}
		}
	}

	pub async fn get(&self, path: &PathFragment) -> Result<Option<Literal>, Error> {
		let entry = self.env.require_entry(path, Some(Capability::Get)).await?;
		entry.getter(path)?.get().await
	}

	pub async fn store(&self, dest: &PathFragment, input: Option<Literal>) -> Result<(), Error> {
		let entry = self.env.require_entry(dest, Some(Capability::Put)).await?;
		entry.putter(dest)?.put(input).await
	}

	pub async fn enumerate(&self, path: &PathFragment, depth: usize) -> Result<Literal, Error> {
		let entry = self
			.env
			.require_entry(path, Some(Capability::Enumerate))
			.await?;

		let mut writer = EnumerationWriter::new(depth);
		entry.enumerator(path)?.enumerate(&mut writer).await?;
		writer.to_output()
	}

	/// Opens a feed for `path`, falling back to a one-shot replay for entries that aren't reactive.
	pub async fn subscribe(&self, path: &PathFragment, depth: usize) -> Result<Channel, Error> {
		let entry = self.env.require_entry(path, None).await?;

		if let Some(subscribable) = entry.as_subscribe() {
			return subscribable.subscribe(depth, &self.channels).await;
		}

		let notifications = if let Some(enumerable) = entry.as_enumerate() {
			let mut writer = EnumerationWriter::new(depth);
			enumerable.enumerate(&mut writer).await?;
			writer
				.entries()
				.iter()
				.map(|node| Notification::added(node.name(), node.clone()))
				.collect()
		} else if let Some(gettable) = entry.as_get() {
			gettable
				.get()
				.await?
				.map(|value| Notification::added("", value))
				.into_iter()
				.collect::<Vec<_>>()
		} else {
			return Err(Error::Unsubscribable(path.to_string()));
		};

		debug!(%path, count = notifications.len(), "Replaying non-reactive entry as a subscription");
		let path = path.to_string();
		Ok(self.channels.start(move |sender| async move {
			replay(&sender, notifications, &path);
		}))
	}

	pub async fn invoke(
		&self,
		path: &PathFragment,
		input: Option<Literal>,
		dest: Option<&PathFragment>,
	) -> Result<Output, Error> {
		let entry = self
			.env
			.require_entry(path, Some(Capability::Invoke))
			.await?;
		let invocation = entry.invoker(path)?.invoke(input).await?;

		let Some(dest) = dest else {
			return match invocation {
				Invocation::Empty => Ok(Output::Empty),
				Invocation::Literal(literal) => Ok(Output::Literal(literal)),
				Invocation::Entry(output) => flatten(output.as_ref(), path)
					.await
					.map(Output::from),
				Invocation::Channel(channel) => Ok(Output::Channel(channel)),
			};
		};

		let value = match invocation {
			Invocation::Empty => None,
			Invocation::Literal(literal) => Some(literal),
			Invocation::Entry(output) => flatten(output.as_ref(), path).await?,
			Invocation::Channel(channel) => {
				channel.stop();
				return Err(Error::Structural(format!(
					"streamed output of '{path}' can't be stored at '{dest}'"
				)));
			}
		};

		self.store(dest, value).await?;
		Ok(Output::Empty)
	}

	/// Registers a channel about to be sent over the connection, returning its wire id.
	pub fn track(&self, channel: &Channel) -> ChannelId {
		let id = self.channels.allocate_id();
		self.open_channels
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(id, channel.control());
		id
	}

	/// Drops a channel from the registry once it went terminal.
	pub fn release(&self, id: ChannelId) {
		self.open_channels
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&id);
	}

	/// Handles `stop` for a `/chan/<id>` path.
	pub fn stop(&self, path: &PathFragment) -> Result<(), Error> {
		let matched = path.match_with(&PathFragment::parse("/chan/:id")?);
		let id = matched
			.name("id")
			.and_then(|id| id.parse::<ChannelId>().ok())
			.filter(|_| matched.ok)
			.ok_or_else(|| Error::MalformedPath(format!("'{path}' doesn't name a channel")))?;

		let control = self
			.open_channels
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&id)
			.ok_or_else(|| Error::missing(path))?;

		debug!(channel_id = id, "Stopping channel on request");
		control.stop();
		Ok(())
	}

	/// Ends every channel still open with an `Error` packet carrying `output`, returning how many
	/// were still alive.
	pub fn fail_all(&self, output: &Literal) -> usize {
		let open = std::mem::take(
			&mut *self
				.open_channels
				.lock()
				.unwrap_or_else(PoisonError::into_inner),
		);

		let mut failed = 0;
		for (id, control) in open {
			if control.fail(output.clone()) {
				trace!(channel_id = id, "Failed channel on shutdown");
				failed += 1;
			}
		}

		failed
	}
}

async fn flatten(output: &dyn Entry, path: &PathFragment) -> Result<Option<Literal>, Error> {
	match output.as_get() {
		Some(gettable) => gettable.get().await,
		None => Err(Error::OutputNotReturnable(path.to_string())),
	}
}

fn replay(sender: &ChannelSender, notifications: Vec<Notification>, path: &str) {
	let sent = notifications
		.into_iter()
		.chain([Notification::ready()])
		.try_for_each(|notification| sender.next(notification.to_literal()));

	let outcome = sent.and_then(|()| {
		sender.error(Literal::string(
			"nosub",
			format!("entry at '{path}' isn't reactive"),
		))
	});

	if let Err(e) = outcome {
		trace!(%e, %path, "Replay cut short");
	}
}
