use std::{
	future::Future,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex, PoisonError,
	},
};

use async_channel as chan;
use serde::{Deserialize, Serialize};
use tokio::{spawn, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, Instrument};

use super::{
	error::Error,
	literal::{Literal, AUTHORITY},
};

pub type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
	Next,
	Error,
	Done,
}

impl Status {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		!matches!(self, Self::Next)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
	pub status: Status,
	pub output: Option<Literal>,
}

impl Packet {
	#[must_use]
	pub const fn next(output: Literal) -> Self {
		Self {
			status: Status::Next,
			output: Some(output),
		}
	}

	#[must_use]
	pub const fn error(output: Option<Literal>) -> Self {
		Self {
			status: Status::Error,
			output,
		}
	}

	#[must_use]
	pub const fn done() -> Self {
		Self {
			status: Status::Done,
			output: None,
		}
	}
}

/// How a channel ended, as seen by [`Channel::for_each`].
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
	Done,
	Error(Option<Literal>),
}

struct Shared {
	id: ChannelId,
	alive: Mutex<bool>,
	queue: chan::Sender<Packet>,
	stop: CancellationToken,
}

impl Shared {
	fn handle(&self, packet: Packet) -> Result<(), Error> {
		let mut alive = self.alive.lock().unwrap_or_else(PoisonError::into_inner);

		if !*alive {
			error!(
				channel_id = self.id,
				status = ?packet.status,
				"Packet handed to a channel that already terminated"
			);
			return Err(Error::ChannelTerminal(self.id));
		}

		let status = packet.status;
		if self.queue.try_send(packet).is_err() {
			trace!(channel_id = self.id, ?status, "Channel consumer is gone, dropping packet");
		}

		if status.is_terminal() {
			*alive = false;
			self.stop.cancel();
		}

		Ok(())
	}

	fn is_alive(&self) -> bool {
		*self.alive.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Delivers a terminal packet unless the channel already ended. Returns whether it did.
	fn end(&self, packet: Packet) -> bool {
		let mut alive = self.alive.lock().unwrap_or_else(PoisonError::into_inner);
		if !*alive {
			return false;
		}

		if self.queue.try_send(packet).is_err() {
			trace!(channel_id = self.id, "Channel consumer is gone, dropping terminal packet");
		}
		*alive = false;
		self.stop.cancel();

		true
	}
}

/// Ends the channel with an `Error` packet if every producer handle got dropped before a terminal
/// packet, so consumers never wait forever.
struct Producer(Arc<Shared>);

impl Drop for Producer {
	fn drop(&mut self) {
		if self.0.end(Packet::error(Some(Literal::error(
			"",
			"producer-dropped",
			AUTHORITY,
			"channel producer went away",
		)))) {
			debug!(channel_id = self.0.id, "Channel producer dropped without terminating");
		}
	}
}

/// Producer half of a [`Channel`].
#[derive(Clone)]
pub struct ChannelSender {
	producer: Arc<Producer>,
}

impl ChannelSender {
	fn shared(&self) -> &Shared {
		&self.producer.0
	}

	#[must_use]
	pub fn id(&self) -> ChannelId {
		self.shared().id
	}

	pub fn handle(&self, packet: Packet) -> Result<(), Error> {
		self.shared().handle(packet)
	}

	pub fn next(&self, output: Literal) -> Result<(), Error> {
		self.handle(Packet::next(output))
	}

	pub fn error(&self, output: Literal) -> Result<(), Error> {
		self.handle(Packet::error(Some(output)))
	}

	pub fn done(&self) -> Result<(), Error> {
		self.handle(Packet::done())
	}

	#[must_use]
	pub fn is_alive(&self) -> bool {
		self.shared().is_alive()
	}

	/// Whether the consumer asked to stop or the channel already terminated.
	#[must_use]
	pub fn is_stopped(&self) -> bool {
		self.shared().stop.is_cancelled()
	}

	/// Resolves once the consumer asked to stop or the channel terminated.
	pub async fn stopped(&self) {
		self.shared().stop.cancelled().await;
	}
}

/// Side handle on a channel for whoever carries it, usable after the [`Channel`] itself moved on.
#[derive(Clone)]
pub(crate) struct ChannelControl {
	shared: Arc<Shared>,
}

impl ChannelControl {
	/// Same as [`Channel::stop`].
	pub(crate) fn stop(&self) {
		if self.shared.is_alive() {
			self.shared.stop.cancel();
		}
	}

	/// Ends the channel with an `Error` packet carrying `output`, unless it already ended.
	pub(crate) fn fail(&self, output: Literal) -> bool {
		self.shared.end(Packet::error(Some(output)))
	}
}

/// Ordered, terminal-once stream of [`Packet`]s.
///
/// Packets are queued by [`handle`](Self::handle) and handed to the consumer one at a time: each
/// one is fully processed before the next is dequeued. After an `Error` or `Done` packet the
/// channel is terminal and any further `handle` fails.
pub struct Channel {
	shared: Arc<Shared>,
	queue: chan::Receiver<Packet>,
	finished: bool,
}

impl Channel {
	#[must_use]
	pub fn pair(id: ChannelId) -> (ChannelSender, Self) {
		Self::with_stop_token(id, CancellationToken::new())
	}

	fn with_stop_token(id: ChannelId, stop: CancellationToken) -> (ChannelSender, Self) {
		let (tx, rx) = chan::unbounded();
		let shared = Arc::new(Shared {
			id,
			alive: Mutex::new(true),
			queue: tx,
			stop,
		});

		(
			ChannelSender {
				producer: Arc::new(Producer(Arc::clone(&shared))),
			},
			Self {
				shared,
				queue: rx,
				finished: false,
			},
		)
	}

	#[must_use]
	pub fn id(&self) -> ChannelId {
		self.shared.id
	}

	pub fn handle(&self, packet: Packet) -> Result<(), Error> {
		self.shared.handle(packet)
	}

	#[must_use]
	pub fn is_alive(&self) -> bool {
		self.shared.is_alive()
	}

	/// Asks the producer to stop. It acknowledges by sending a terminal packet.
	pub fn stop(&self) {
		if self.is_alive() {
			debug!(channel_id = self.shared.id, "Stopping channel");
			self.shared.stop.cancel();
		}
	}

	pub(crate) fn stop_token(&self) -> CancellationToken {
		self.shared.stop.clone()
	}

	pub(crate) fn control(&self) -> ChannelControl {
		ChannelControl {
			shared: Arc::clone(&self.shared),
		}
	}

	/// Next packet in order, `None` once the terminal packet was received.
	pub async fn recv(&mut self) -> Option<Packet> {
		if self.finished {
			return None;
		}

		if let Ok(packet) = self.queue.recv().await {
			self.finished = packet.status.is_terminal();
			Some(packet)
		} else {
			self.finished = true;
			None
		}
	}

	/// Drains every packet, terminal one included, awaiting `effect` for each before moving on.
	pub fn for_each_packet<F, Fut>(mut self, mut effect: F) -> JoinHandle<()>
	where
		F: FnMut(Packet) -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send,
	{
		let span = tracing::debug_span!("channel", channel_id = self.shared.id);

		spawn(
			async move {
				while let Some(packet) = self.recv().await {
					effect(packet).await;
				}
			}
			.instrument(span),
		)
	}

	/// Feeds every `Next` output to `on_next` in order; the handle resolves with how the channel ended.
	pub fn for_each<F, Fut>(mut self, mut on_next: F) -> JoinHandle<Termination>
	where
		F: FnMut(Literal) -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send,
	{
		let span = tracing::debug_span!("channel", channel_id = self.shared.id);

		spawn(
			async move {
				while let Some(packet) = self.recv().await {
					match packet.status {
						Status::Next => {
							if let Some(output) = packet.output {
								on_next(output).await;
							} else {
								trace!("Skipping Next packet without output");
							}
						}
						Status::Error => return Termination::Error(packet.output),
						Status::Done => return Termination::Done,
					}
				}

				Termination::Error(None)
			}
			.instrument(span),
		)
	}

	/// A channel carrying `f` applied to every `Next` output; terminal packets pass through as-is.
	#[must_use]
	pub fn map<F>(self, mut f: F) -> Self
	where
		F: FnMut(Literal) -> Literal + Send + 'static,
	{
		self.derive(move |packet| match packet.status {
			Status::Next => Some(Packet {
				status: Status::Next,
				output: packet.output.map(&mut f),
			}),
			_ => Some(packet),
		})
	}

	/// A channel carrying only the `Next` packets whose output satisfies `predicate`.
	#[must_use]
	pub fn filter<F>(self, mut predicate: F) -> Self
	where
		F: FnMut(&Literal) -> bool + Send + 'static,
	{
		self.derive(move |packet| {
			let keep = packet.status.is_terminal()
				|| packet.output.as_ref().map_or(true, |output| predicate(output));
			keep.then_some(packet)
		})
	}

	fn derive<F>(mut self, mut transform: F) -> Self
	where
		F: FnMut(Packet) -> Option<Packet> + Send + 'static,
	{
		// Stopping the derived channel must reach the original producer, so they share a token.
		let (sender, derived) = Self::with_stop_token(self.shared.id, self.stop_token());

		spawn(async move {
			while let Some(packet) = self.recv().await {
				if let Some(packet) = transform(packet) {
					if sender.handle(packet).is_err() {
						break;
					}
				}
			}
		});

		derived
	}
}

/// Hands out channels with connection-unique ids.
#[derive(Debug, Default)]
pub struct ChannelFactory {
	next_id: AtomicU64,
}

impl ChannelFactory {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Next unused id, starting at 1.
	#[must_use]
	pub fn allocate_id(&self) -> ChannelId {
		self.next_id.fetch_add(1, Ordering::Relaxed) + 1
	}

	#[must_use]
	pub fn open(&self) -> (ChannelSender, Channel) {
		Channel::pair(self.allocate_id())
	}

	/// Opens a channel and spawns `producer` to feed it.
	pub fn start<F, Fut>(&self, producer: F) -> Channel
	where
		F: FnOnce(ChannelSender) -> Fut,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let (sender, channel) = self.open();
		spawn(producer(sender));
		channel
	}
}
