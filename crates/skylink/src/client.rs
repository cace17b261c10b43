use std::{
	collections::{HashMap, VecDeque},
	fmt, mem,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex, PoisonError, RwLock, Weak,
	},
	time::Instant,
};

use async_channel as chan;
use serde_json::Value;
use tokio::{spawn, sync::oneshot, task::JoinHandle};
use tracing::{debug, instrument, trace, warn};

use super::{
	channel::{Channel, ChannelId, ChannelSender, Packet},
	config::{Config, Correlation},
	enumeration::EnumerationWriter,
	error::Error,
	literal::{Literal, LiteralCodec, AUTHORITY},
	observer::{ChannelEvent, NoopObserver, Observer, ShutdownHandler},
	ops::{Operation, Output, Request},
	transport::Link,
	wire::{ChannelFrame, FrameKind, RequestFrame, ResponseFrame},
};

type Waiter = oneshot::Sender<Result<ClientResponse, Error>>;

enum Pending {
	Lockstep(VecDeque<Waiter>),
	ById {
		last_id: u64,
		waiting: HashMap<u64, Waiter>,
	},
}

impl Pending {
	fn new(correlation: Correlation) -> Self {
		match correlation {
			Correlation::Lockstep => Self::Lockstep(VecDeque::new()),
			Correlation::Id => Self::ById {
				last_id: 0,
				waiting: HashMap::new(),
			},
		}
	}

	fn take_for(&mut self, id: Option<u64>) -> Option<Waiter> {
		match self {
			Self::Lockstep(queue) => queue.pop_front(),
			Self::ById { waiting, .. } => id.and_then(|id| waiting.remove(&id)),
		}
	}

	fn drain(&mut self) -> Vec<Waiter> {
		match self {
			Self::Lockstep(queue) => queue.drain(..).collect(),
			Self::ById { waiting, .. } => waiting.drain().map(|(_, waiter)| waiter).collect(),
		}
	}
}

/// A decoded response.
pub struct ClientResponse {
	pub ok: bool,
	pub output: Option<Literal>,
	/// Set when the response opened a channel.
	pub channel: Option<Channel>,
}

impl fmt::Debug for ClientResponse {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientResponse")
			.field("ok", &self.ok)
			.field("output", &self.output)
			.field("channel", &self.channel.as_ref().map(Channel::id))
			.finish()
	}
}

impl ClientResponse {
	/// The output of a successful response, a failed one becomes [`Error::Remote`].
	pub fn into_output(self) -> Result<Option<Literal>, Error> {
		if self.ok {
			Ok(self.output)
		} else {
			Err(Error::Remote(self.output.unwrap_or_else(|| {
				Literal::string("", "request failed without saying why")
			})))
		}
	}

	pub fn into_result(mut self) -> Result<Output, Error> {
		if let (true, Some(channel)) = (self.ok, self.channel.take()) {
			return Ok(Output::Channel(channel));
		}

		self.into_output().map(Output::from)
	}
}

/// Materializes what a successful response announced beyond its output.
///
/// Decoders added with [`Client::add_output_decoder`] are asked in order before the built-in one,
/// which opens the channel named by `Chan`.
pub trait OutputDecoder: Send + Sync {
	/// `None` when the response isn't this decoder's to handle.
	fn decode(&self, response: &ResponseFrame, client: &Client) -> Option<Channel>;
}

struct ChannelMaterializer;

impl OutputDecoder for ChannelMaterializer {
	fn decode(&self, response: &ResponseFrame, client: &Client) -> Option<Channel> {
		match (response.ok, response.chan) {
			(true, Some(id)) => Some(client.open_channel(id)),
			_ => None,
		}
	}
}

/// Errors every channel still open, the server won't send their terminal packets anymore.
struct AbandonChannels;

impl ShutdownHandler<Client> for AbandonChannels {
	fn on_shutdown(&self, client: &Client) {
		let channels = mem::take(&mut *client.lock_channels());
		for (id, sender) in channels {
			client.observer.on_channel_event(id, ChannelEvent::Abandoned);
			if sender.is_alive() {
				if let Err(e) = sender.error(Literal::error(
					"",
					"transport-lost",
					AUTHORITY,
					"connection closed while the channel was open",
				)) {
					trace!(channel_id = id, %e, "Channel terminated concurrently");
				}
			}
		}
	}
}

/// The requesting side of a connection.
///
/// Requests may be issued concurrently from any task. Responses are paired back either by order
/// or by `Id`, see [`Correlation`]. Responses announcing a channel materialize it before any
/// later frame is looked at, so no packet can arrive ahead of its channel.
pub struct Client {
	me: Weak<Self>,
	outbound: chan::Sender<Value>,
	pending: Mutex<Pending>,
	channels: Mutex<HashMap<ChannelId, ChannelSender>>,
	codec: LiteralCodec,
	observer: Arc<dyn Observer>,
	decoders: RwLock<Vec<Arc<dyn OutputDecoder>>>,
	shutdown_handlers: Mutex<Vec<Arc<dyn ShutdownHandler<Client>>>>,
	shut_down: AtomicBool,
}

impl fmt::Debug for Client {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Client")
			.field("codec", &self.codec)
			.field("shut_down", &self.shut_down)
			.finish_non_exhaustive()
	}
}

impl Client {
	/// A client speaking over `link`, with a task feeding it the inbound frames.
	#[must_use]
	pub fn spawn(link: Link, config: &Config) -> Arc<Self> {
		Self::spawn_with_observer(link, config, Arc::new(NoopObserver))
	}

	#[must_use]
	pub fn spawn_with_observer(link: Link, config: &Config, observer: Arc<dyn Observer>) -> Arc<Self> {
		let client = Self::with_parts(link.outbound, config, observer, |_| LiteralCodec::default());
		client.attach(link.inbound);
		client
	}

	/// A client that only sends; inbound frames must be handed to [`handle_inbound`](Self::handle_inbound).
	///
	/// `make_codec` gets a handle to the client being built, for inflaters that need to call back
	/// into it.
	pub fn with_parts(
		outbound: chan::Sender<Value>,
		config: &Config,
		observer: Arc<dyn Observer>,
		make_codec: impl FnOnce(&Weak<Self>) -> LiteralCodec,
	) -> Arc<Self> {
		Arc::new_cyclic(|me| Self {
			me: me.clone(),
			outbound,
			pending: Mutex::new(Pending::new(config.client.correlation)),
			channels: Mutex::default(),
			codec: make_codec(me),
			observer,
			decoders: RwLock::default(),
			shutdown_handlers: Mutex::new(vec![Arc::new(AbandonChannels)]),
			shut_down: AtomicBool::new(false),
		})
	}

	/// Feeds frames from `inbound` to this client, shutting it down once they stop.
	pub fn attach(self: &Arc<Self>, inbound: chan::Receiver<Value>) -> JoinHandle<()> {
		let me = Arc::downgrade(self);

		spawn(async move {
			while let Ok(frame) = inbound.recv().await {
				let Some(client) = me.upgrade() else {
					return;
				};
				client.handle_inbound(frame);
			}

			if let Some(client) = me.upgrade() {
				client.shutdown();
			}
		})
	}

	pub fn add_output_decoder(&self, decoder: Arc<dyn OutputDecoder>) {
		self.decoders
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.push(decoder);
	}

	/// Registers `handler` to run on [`shutdown`](Self::shutdown), or right away if that already
	/// happened.
	pub fn add_shutdown_handler(&self, handler: Arc<dyn ShutdownHandler<Self>>) {
		{
			let mut handlers = self
				.shutdown_handlers
				.lock()
				.unwrap_or_else(PoisonError::into_inner);
			if !self.is_shut_down() {
				handlers.push(handler);
				return;
			}
		}

		handler.on_shutdown(self);
	}

	#[must_use]
	pub fn is_shut_down(&self) -> bool {
		self.shut_down.load(Ordering::Acquire)
	}

	fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
		self.pending.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelId, ChannelSender>> {
		self.channels.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Routes one frame received from the server.
	pub fn handle_inbound(&self, frame: Value) {
		match FrameKind::of(&frame) {
			FrameKind::Channel => self.handle_channel_frame(frame),
			FrameKind::Response => self.handle_response(frame),
			FrameKind::Request => {
				warn!(%frame, "Client received a request frame, nothing here serves it");
			}
		}
	}

	fn handle_response(&self, frame: Value) {
		let response = match serde_json::from_value::<ResponseFrame>(frame) {
			Ok(response) => response,
			Err(e) => {
				warn!(%e, "Received a malformed response frame");
				return;
			}
		};

		let channel = self.decode_channel(&response);
		let decoded = ClientResponse {
			ok: response.ok,
			output: response.output.as_ref().map(|raw| self.codec.inflate(raw)),
			channel,
		};

		let waiter = self.lock_pending().take_for(response.id);
		let unclaimed = match waiter {
			Some(waiter) => match waiter.send(Ok(decoded)) {
				Ok(()) => return,
				Err(Ok(unclaimed)) => unclaimed,
				Err(Err(_)) => return,
			},
			None => {
				warn!(id = ?response.id, "Received a response nobody is waiting for");
				decoded
			}
		};

		if let Some(channel) = unclaimed.channel {
			trace!(channel_id = channel.id(), "Stopping channel nobody will consume");
			channel.stop();
		}
	}

	fn decode_channel(&self, response: &ResponseFrame) -> Option<Channel> {
		let registered = self
			.decoders
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone();

		registered
			.iter()
			.find_map(|decoder| decoder.decode(response, self))
			.or_else(|| ChannelMaterializer.decode(response, self))
	}

	/// Starts receiving packets for channel `id`. Stopping the returned channel sends `stop` for it.
	#[must_use]
	pub fn open_channel(&self, id: ChannelId) -> Channel {
		let (sender, channel) = Channel::pair(id);
		if self.lock_channels().insert(id, sender.clone()).is_some() {
			warn!(channel_id = id, "Server reused a channel id still open here");
		}
		self.observer.on_channel_event(id, ChannelEvent::Opened);

		// Consumer stops become `stop` requests, as long as the channel is still open.
		let stop = channel.stop_token();
		let me = self.me.clone();
		spawn(async move {
			stop.cancelled().await;
			if !sender.is_alive() {
				return;
			}

			let Some(client) = me.upgrade() else {
				return;
			};
			client
				.observer
				.on_channel_event(id, ChannelEvent::StopRequested);
			if let Err(e) = client.stop(id).await {
				debug!(channel_id = id, %e, "Failed to stop remote channel");
			}
		});

		channel
	}

	fn handle_channel_frame(&self, frame: Value) {
		let frame = match serde_json::from_value::<ChannelFrame>(frame) {
			Ok(frame) => frame,
			Err(e) => {
				warn!(%e, "Received a malformed channel frame");
				return;
			}
		};

		let sender = {
			let mut channels = self.lock_channels();
			if frame.status.is_terminal() {
				channels.remove(&frame.chan)
			} else {
				channels.get(&frame.chan).cloned()
			}
		};

		let Some(sender) = sender else {
			warn!(channel_id = frame.chan, "Received a packet for an unknown channel");
			return;
		};

		self.observer
			.on_channel_event(frame.chan, ChannelEvent::Packet(frame.status));

		let packet = Packet {
			status: frame.status,
			output: frame.output.as_ref().map(|raw| self.codec.inflate(raw)),
		};
		if let Err(e) = sender.handle(packet) {
			warn!(channel_id = frame.chan, %e, "Dropping channel packet");
		}
	}

	/// Sends one request and waits for its response.
	///
	/// Callers wanting a deadline wrap this in `tokio::time::timeout`; the core never gives up on
	/// its own.
	#[instrument(skip_all, fields(op = %request.op, path = ?request.path))]
	pub async fn volley(&self, request: Request) -> Result<ClientResponse, Error> {
		if self.is_shut_down() {
			return Err(Error::Transport("client is shut down".to_string()));
		}

		let started = Instant::now();
		let op = request.op.clone();
		let path = request.path.clone();

		let mut frame = RequestFrame {
			op: request.op,
			path: request.path,
			dest: request.dest,
			input: self.codec.deflate_optional(request.input.as_ref())?,
			depth: request.depth,
			id: None,
		};

		let (tx, rx) = oneshot::channel();
		{
			let mut pending = self.lock_pending();

			if let Pending::ById { last_id, .. } = &mut *pending {
				*last_id += 1;
				frame.id = Some(*last_id);
			}
			let raw = serde_json::to_value(&frame)?;

			match &mut *pending {
				Pending::Lockstep(queue) => queue.push_back(tx),
				Pending::ById { waiting, .. } => {
					waiting.insert(frame.id.unwrap_or_default(), tx);
				}
			}

			if self.outbound.try_send(raw).is_err() {
				match &mut *pending {
					Pending::Lockstep(queue) => {
						queue.pop_back();
					}
					Pending::ById { waiting, .. } => {
						waiting.remove(&frame.id.unwrap_or_default());
					}
				}
				return Err(Error::Transport("connection is closed".to_string()));
			}
		}

		let result = rx.await.map_err(|_| {
			Error::Transport("connection closed before the response arrived".to_string())
		})?;

		self.observer.on_operation(
			&op,
			path.as_deref(),
			started.elapsed(),
			result.as_ref().is_ok_and(|response| response.ok),
		);

		result
	}

	pub async fn ping(&self) -> Result<(), Error> {
		self.volley(Request::new(Operation::Ping.as_str()))
			.await?
			.into_output()
			.map(|_| ())
	}

	pub async fn get(&self, path: &str) -> Result<Option<Literal>, Error> {
		self.volley(Request::new(Operation::Get.as_str()).path(path))
			.await?
			.into_output()
	}

	/// Stores `input` at `dest`, `None` unlinks it.
	pub async fn store(&self, dest: &str, input: Option<Literal>) -> Result<(), Error> {
		self.volley(Request::new(Operation::Store.as_str()).dest(dest).input(input))
			.await?
			.into_output()
			.map(|_| ())
	}

	pub async fn unlink(&self, path: &str) -> Result<(), Error> {
		self.volley(Request::new(Operation::Unlink.as_str()).path(path))
			.await?
			.into_output()
			.map(|_| ())
	}

	/// The flat, path-keyed enumeration folder.
	pub async fn enumerate(&self, path: &str, depth: usize) -> Result<Literal, Error> {
		self.volley(
			Request::new(Operation::Enumerate.as_str())
				.path(path)
				.depth(depth),
		)
		.await?
		.into_output()?
		.ok_or_else(|| Error::Structural(format!("enumeration of '{path}' came back empty")))
	}

	/// The enumeration rebuilt into a nested folder.
	pub async fn enumerate_tree(&self, path: &str, depth: usize) -> Result<Option<Literal>, Error> {
		let mut writer = EnumerationWriter::new(depth);
		writer.visit_enumeration(self.enumerate(path, depth).await?)?;
		writer.reconstruct()
	}

	pub async fn subscribe(&self, path: &str, depth: usize) -> Result<Channel, Error> {
		match self
			.volley(
				Request::new(Operation::Subscribe.as_str())
					.path(path)
					.depth(depth),
			)
			.await?
			.into_result()?
		{
			Output::Channel(channel) => Ok(channel),
			_ => Err(Error::Structural(format!(
				"subscribing to '{path}' didn't open a channel"
			))),
		}
	}

	/// Invokes `path`, storing the output at `dest` when given instead of returning it.
	pub async fn invoke(
		&self,
		path: &str,
		input: Option<Literal>,
		dest: Option<&str>,
	) -> Result<Output, Error> {
		let mut request = Request::new(Operation::Invoke.as_str())
			.path(path)
			.input(input);
		if let Some(dest) = dest {
			request = request.dest(dest);
		}

		self.volley(request).await?.into_result()
	}

	/// Asks the server to stop channel `id`.
	pub async fn stop(&self, id: ChannelId) -> Result<(), Error> {
		self.volley(Request::new(Operation::Stop.as_str()).path(format!("/chan/{id}")))
			.await?
			.into_output()
			.map(|_| ())
	}

	/// Fails every pending request, then runs the shutdown handlers, the built-in one erroring
	/// every open channel. Only the first call does anything.
	pub fn shutdown(&self) {
		let handlers = {
			let mut handlers = self
				.shutdown_handlers
				.lock()
				.unwrap_or_else(PoisonError::into_inner);
			if self.shut_down.swap(true, Ordering::AcqRel) {
				return;
			}
			mem::take(&mut *handlers)
		};

		debug!("Client shutting down");
		self.outbound.close();

		let waiters = self.lock_pending().drain();
		for waiter in waiters {
			if waiter
				.send(Err(Error::Transport("connection lost".to_string())))
				.is_err()
			{
				trace!("Pending request was already abandoned");
			}
		}

		for handler in handlers {
			handler.on_shutdown(self);
		}
	}
}
