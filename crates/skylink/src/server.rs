use std::{
	collections::HashMap,
	fmt,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Instant,
};

use async_channel as chan;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{spawn, sync::Mutex, task::JoinHandle};
use tracing::{debug, instrument, trace, warn};

use super::{
	channel::{Channel, ChannelFactory, ChannelId},
	config::Config,
	environment::Environment,
	error::Error,
	literal::{Literal, LiteralCodec, AUTHORITY},
	observer::{ChannelEvent, NoopObserver, Observer, ShutdownHandler},
	ops::{CoreOps, Output, Request},
	transport::Link,
	wire::{normalize_keys, ChannelFrame, RequestFrame, ResponseFrame},
};

/// An operation served next to the core ones, looked up by its `Op` name before them.
#[async_trait]
pub trait OpExtension: Send + Sync {
	async fn call(&self, request: Request, ops: &CoreOps) -> Result<Output, Error>;
}

/// Work to run once the response frame went out, given the connection's outbound side.
pub type AfterSend = Box<dyn FnOnce(chan::Sender<Value>) + Send>;

/// What an [`OutputEncoder`] made of an operation's output.
pub enum Encoded {
	Response(ResponseFrame, Option<AfterSend>),
	/// Not this encoder's kind of output, the next one gets it.
	Declined(Output),
}

impl fmt::Debug for Encoded {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Response(response, after_send) => f
				.debug_tuple("Response")
				.field(response)
				.field(&after_send.is_some())
				.finish(),
			Self::Declined(output) => f.debug_tuple("Declined").field(output).finish(),
		}
	}
}

/// Connection state an [`OutputEncoder`] may draw on.
pub struct EncodeContext<'a> {
	pub ops: &'a Arc<CoreOps>,
	pub codec: &'a Arc<LiteralCodec>,
	pub observer: &'a Arc<dyn Observer>,
}

/// Turns an operation's output into its response frame.
///
/// Encoders registered with [`Server::with_output_encoder`] are asked in order before the
/// built-in ones, which carry channels and deflate literals.
pub trait OutputEncoder: Send + Sync {
	fn encode(&self, output: Output, cx: &EncodeContext<'_>) -> Result<Encoded, Error>;
}

/// Plain outputs: nothing, or one deflated literal.
struct LiteralEncoder;

impl OutputEncoder for LiteralEncoder {
	fn encode(&self, output: Output, cx: &EncodeContext<'_>) -> Result<Encoded, Error> {
		Ok(match output {
			Output::Empty => Encoded::Response(ResponseFrame::success(None), None),
			Output::Literal(literal) => Encoded::Response(
				ResponseFrame::success(Some(cx.codec.deflate(&literal)?)),
				None,
			),
			channel @ Output::Channel(_) => Encoded::Declined(channel),
		})
	}
}

/// Announces a channel under a fresh wire id, then streams its packets after the response.
struct ChannelCarrier;

impl OutputEncoder for ChannelCarrier {
	fn encode(&self, output: Output, cx: &EncodeContext<'_>) -> Result<Encoded, Error> {
		let Output::Channel(channel) = output else {
			return Ok(Encoded::Declined(output));
		};

		let id = cx.ops.track(&channel);
		let ops = Arc::clone(cx.ops);
		let codec = Arc::clone(cx.codec);
		let observer = Arc::clone(cx.observer);

		Ok(Encoded::Response(
			ResponseFrame::channel(id),
			Some(Box::new(move |outbound| {
				forward(id, channel, ops, codec, observer, outbound);
			})),
		))
	}
}

/// Ends the channels still open on the connection with a `server-shutdown` error.
struct FailOpenChannels;

impl ShutdownHandler<Server> for FailOpenChannels {
	fn on_shutdown(&self, server: &Server) {
		let failed = server.ops.fail_all(&Literal::error(
			"",
			"server-shutdown",
			AUTHORITY,
			"server connection shut down while the channel was open",
		));
		if failed > 0 {
			debug!(failed, "Failed open channels");
		}
	}
}

/// Serves one connection: decodes request frames, runs them one at a time in arrival order and
/// streams the packets of any channel a request opened.
pub struct Server {
	ops: Arc<CoreOps>,
	codec: Arc<LiteralCodec>,
	extensions: HashMap<String, Arc<dyn OpExtension>>,
	normalize_keys: bool,
	observer: Arc<dyn Observer>,
	encoders: Vec<Arc<dyn OutputEncoder>>,
	shutdown_handlers: Vec<Arc<dyn ShutdownHandler<Server>>>,
	turn: Mutex<()>,
	shut_down: AtomicBool,
}

impl fmt::Debug for Server {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Server")
			.field("ops", &self.ops)
			.field("codec", &self.codec)
			.field("extensions", &self.extensions.keys().collect::<Vec<_>>())
			.field("normalize_keys", &self.normalize_keys)
			.finish_non_exhaustive()
	}
}

impl Server {
	#[must_use]
	pub fn new(env: Arc<Environment>, config: &Config) -> Self {
		Self {
			ops: Arc::new(
				CoreOps::new(env, Arc::new(ChannelFactory::new()))
					.with_max_depth(config.server.max_depth),
			),
			codec: Arc::default(),
			extensions: HashMap::new(),
			normalize_keys: config.server.normalize_keys,
			observer: Arc::new(NoopObserver),
			encoders: Vec::new(),
			shutdown_handlers: vec![Arc::new(FailOpenChannels)],
			turn: Mutex::new(()),
			shut_down: AtomicBool::new(false),
		}
	}

	#[must_use]
	pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
		self.observer = observer;
		self
	}

	#[must_use]
	pub fn with_codec(mut self, codec: LiteralCodec) -> Self {
		self.codec = Arc::new(codec);
		self
	}

	#[must_use]
	pub fn with_extension(mut self, op: impl Into<String>, extension: Arc<dyn OpExtension>) -> Self {
		self.extensions.insert(op.into(), extension);
		self
	}

	#[must_use]
	pub fn with_output_encoder(mut self, encoder: Arc<dyn OutputEncoder>) -> Self {
		self.encoders.push(encoder);
		self
	}

	#[must_use]
	pub fn with_shutdown_handler(mut self, handler: Arc<dyn ShutdownHandler<Self>>) -> Self {
		self.shutdown_handlers.push(handler);
		self
	}

	#[must_use]
	pub fn ops(&self) -> &CoreOps {
		&self.ops
	}

	pub fn spawn(self, link: Link) -> JoinHandle<()> {
		spawn(async move { self.serve(link.inbound, link.outbound).await })
	}

	/// Processes frames until `inbound` closes or the peer stops reading, then shuts down.
	pub async fn serve(&self, inbound: chan::Receiver<Value>, outbound: chan::Sender<Value>) {
		while let Ok(frame) = inbound.recv().await {
			if let Err(e) = self.process(frame, &outbound).await {
				debug!(%e, "Connection went away");
				break;
			}
		}

		self.shutdown();
	}

	/// Runs one frame to completion and sends its response.
	///
	/// Callers racing each other are served in turn. Channel packets only start flowing after the
	/// response announcing the channel was sent.
	pub async fn process(&self, frame: Value, outbound: &chan::Sender<Value>) -> Result<(), Error> {
		let _turn = self.turn.lock().await;

		let (response, after_send) = self.handle_frame(frame).await;

		outbound
			.send(serde_json::to_value(&response)?)
			.await
			.map_err(|_| Error::Transport("outbound side is closed".to_string()))?;

		if let Some(after_send) = after_send {
			after_send(outbound.clone());
		}

		Ok(())
	}

	async fn handle_frame(&self, frame: Value) -> (ResponseFrame, Option<AfterSend>) {
		let frame = if self.normalize_keys {
			normalize_keys(frame)
		} else {
			frame
		};
		let id = frame.get("Id").and_then(Value::as_u64);

		let request = match serde_json::from_value::<RequestFrame>(frame) {
			Ok(request) => request,
			Err(e) => {
				warn!(%e, "Received a malformed request frame");
				return (self.failure(&e.into()).with_id(id), None);
			}
		};

		let op = request.op.clone();
		let path = request.path.clone();
		let started = Instant::now();

		let result = self.execute(self.decode(request)).await;
		self.observer
			.on_operation(&op, path.as_deref(), started.elapsed(), result.is_ok());

		let (response, after_send) = match result.and_then(|output| self.encode(output)) {
			Ok(encoded) => encoded,
			Err(e) => {
				debug!(%op, ?path, %e, "Operation failed");
				(self.failure(&e), None)
			}
		};

		(response.with_id(id), after_send)
	}

	fn decode(&self, frame: RequestFrame) -> Request {
		Request {
			op: frame.op,
			path: frame.path,
			dest: frame.dest,
			input: frame.input.as_ref().map(|raw| self.codec.inflate(raw)),
			depth: frame.depth,
		}
	}

	#[instrument(skip_all, fields(op = %request.op))]
	async fn execute(&self, request: Request) -> Result<Output, Error> {
		if let Some(extension) = self.extensions.get(&request.op) {
			trace!("Routing to extension");
			return extension.call(request, &self.ops).await;
		}

		self.ops.dispatch(request).await
	}

	fn encode(&self, mut output: Output) -> Result<(ResponseFrame, Option<AfterSend>), Error> {
		let cx = EncodeContext {
			ops: &self.ops,
			codec: &self.codec,
			observer: &self.observer,
		};
		let built_in: [&dyn OutputEncoder; 2] = [&ChannelCarrier, &LiteralEncoder];

		let registered = self
			.encoders
			.iter()
			.map(|encoder| -> &dyn OutputEncoder { encoder.as_ref() });

		for encoder in registered.chain(built_in) {
			match encoder.encode(output, &cx)? {
				Encoded::Response(response, after_send) => return Ok((response, after_send)),
				Encoded::Declined(declined) => output = declined,
			}
		}

		Err(Error::Structural(format!("no encoder took the output {output:?}")))
	}

	fn failure(&self, error: &Error) -> ResponseFrame {
		let output = self.codec.deflate(&error.to_literal()).unwrap_or_else(|e| {
			warn!(%e, "Failed to encode an error literal");
			json!({"Type": "String", "Name": "", "StringValue": error.to_string()})
		});

		ResponseFrame::failure(output)
	}

	/// Fails every channel still open on this connection, then runs the registered shutdown
	/// handlers. Only the first call does anything.
	pub fn shutdown(&self) {
		if self.shut_down.swap(true, Ordering::AcqRel) {
			return;
		}

		debug!("Server connection shutting down");
		for handler in &self.shutdown_handlers {
			handler.on_shutdown(self);
		}
	}
}

fn forward(
	id: ChannelId,
	channel: Channel,
	ops: Arc<CoreOps>,
	codec: Arc<LiteralCodec>,
	observer: Arc<dyn Observer>,
	outbound: chan::Sender<Value>,
) {
	observer.on_channel_event(id, ChannelEvent::Opened);

	channel.for_each_packet(move |packet| {
		let ops = Arc::clone(&ops);
		let codec = Arc::clone(&codec);
		let observer = Arc::clone(&observer);
		let outbound = outbound.clone();

		async move {
			let status = packet.status;
			observer.on_channel_event(id, ChannelEvent::Packet(status));
			if status.is_terminal() {
				ops.release(id);
			}

			let output = codec
				.deflate_optional(packet.output.as_ref())
				.unwrap_or_else(|e| {
					warn!(channel_id = id, %e, "Dropping a packet output that can't be encoded");
					None
				});

			let frame = match serde_json::to_value(ChannelFrame {
				chan: id,
				status,
				output,
			}) {
				Ok(frame) => frame,
				Err(e) => {
					warn!(channel_id = id, %e, "Failed to encode channel frame");
					return;
				}
			};

			if outbound.send(frame).await.is_err() {
				trace!(channel_id = id, "Connection closed, dropping channel packet");
			}
		}
	});
}

#[cfg(test)]
mod tests {
	use std::{
		sync::{atomic::AtomicUsize, Mutex as StdMutex, PoisonError},
		time::Duration,
	};

	use serde_json::json;
	use tokio::time::{sleep, timeout};
	use tracing_test::traced_test;

	use super::*;
	use crate::{
		channel::Status,
		devices::{FunctionDevice, TempDevice},
		entry::Invocation,
		transport::memory_pair,
	};

	fn serve(env: Environment, config: &Config) -> Link {
		let (server_side, peer) = memory_pair();
		Server::new(Arc::new(env), config).spawn(server_side);
		peer
	}

	async fn volley(peer: &Link, frame: Value) -> Value {
		peer.outbound.send(frame).await.unwrap();
		peer.inbound.recv().await.unwrap()
	}

	#[tokio::test]
	#[traced_test]
	async fn failures_become_string_outputs() {
		let peer = serve(Environment::new(), &Config::default());

		let response = volley(&peer, json!({"Op": "get", "Path": "/nowhere"})).await;
		assert_eq!(response["Ok"], json!(false));
		assert_eq!(response["Output"]["Type"], json!("String"));
		assert!(response["Output"]["StringValue"]
			.as_str()
			.unwrap()
			.contains("/nowhere"));

		let response = volley(&peer, json!({"Path": "/missing-op"})).await;
		assert_eq!(response["Ok"], json!(false));

		let response = volley(&peer, json!({"Op": "ping", "Id": 12})).await;
		assert_eq!(response, json!({"Ok": true, "Id": 12}));
	}

	#[tokio::test]
	#[traced_test]
	async fn lowercase_keys_are_tolerated() {
		let env = Environment::new();
		env.bind("/mem", Arc::new(TempDevice::new())).await.unwrap();
		let peer = serve(env, &Config::default());

		let response = volley(
			&peer,
			json!({"op": "store", "dest": "/mem/x", "input": {"Type": "String", "StringValue": "1"}}),
		)
		.await;
		assert_eq!(response, json!({"Ok": true}));

		let mut strict = Config::default();
		strict.server.normalize_keys = false;
		let peer = serve(Environment::new(), &strict);
		assert_eq!(volley(&peer, json!({"op": "ping"})).await["Ok"], json!(false));
	}

	#[tokio::test]
	#[traced_test]
	async fn requests_run_in_arrival_order() {
		let env = Environment::new();
		env.bind(
			"/slow",
			Arc::new(FunctionDevice::new("slow", |_| async {
				sleep(Duration::from_millis(50)).await;
				Ok::<_, Error>(Invocation::Literal(Literal::string("", "slow")))
			})),
		)
		.await
		.unwrap();
		let peer = serve(env, &Config::default());

		peer.outbound
			.send(json!({"Op": "invoke", "Path": "/slow", "Id": 1}))
			.await
			.unwrap();
		peer.outbound
			.send(json!({"Op": "ping", "Id": 2}))
			.await
			.unwrap();

		assert_eq!(peer.inbound.recv().await.unwrap()["Id"], json!(1));
		assert_eq!(peer.inbound.recv().await.unwrap()["Id"], json!(2));
	}

	#[tokio::test]
	#[traced_test]
	async fn channel_frames_follow_the_response() {
		let env = Environment::new();
		env.bind("/mem", Arc::new(TempDevice::new())).await.unwrap();
		let peer = serve(env, &Config::default());

		let response = volley(&peer, json!({"Op": "subscribe", "Path": "/mem", "Depth": 1})).await;
		assert_eq!(response["Ok"], json!(true));
		assert_eq!(response["Status"], json!("Ok"));
		let chan = response["Chan"].as_u64().unwrap();

		let ready = peer.inbound.recv().await.unwrap();
		assert_eq!(ready["Chan"], json!(chan));
		assert_eq!(ready["Status"], json!("Next"));

		let stopped = volley(&peer, json!({"Op": "stop", "Path": format!("/chan/{chan}")})).await;
		// the Done packet may race the stop response
		let (response, done) = if stopped.get("Ok").is_some() {
			(stopped, peer.inbound.recv().await.unwrap())
		} else {
			(peer.inbound.recv().await.unwrap(), stopped)
		};
		assert_eq!(response, json!({"Ok": true}));
		assert_eq!(done, json!({"Chan": chan, "Status": "Done"}));
	}

	struct Echo;

	#[async_trait]
	impl OpExtension for Echo {
		async fn call(&self, request: Request, _ops: &CoreOps) -> Result<Output, Error> {
			Ok(request.input.into())
		}
	}

	#[tokio::test]
	#[traced_test]
	async fn extensions_take_their_op() {
		let (server_side, peer) = memory_pair();
		Server::new(Arc::new(Environment::new()), &Config::default())
			.with_extension("echo", Arc::new(Echo))
			.spawn(server_side);

		let response = volley(
			&peer,
			json!({"Op": "echo", "Input": {"Type": "String", "Name": "", "StringValue": "back"}}),
		)
		.await;
		assert_eq!(
			response,
			json!({"Ok": true, "Output": {"Type": "String", "Name": "", "StringValue": "back"}})
		);
	}

	#[derive(Default)]
	struct Recorder(StdMutex<Vec<(ChannelId, ChannelEvent)>>);

	impl Recorder {
		fn events(&self) -> Vec<(ChannelId, ChannelEvent)> {
			self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
		}
	}

	impl Observer for Recorder {
		fn on_channel_event(&self, channel_id: ChannelId, event: ChannelEvent) {
			self.0
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.push((channel_id, event));
		}
	}

	#[derive(Default)]
	struct CountShutdowns(AtomicUsize);

	impl ShutdownHandler<Server> for CountShutdowns {
		fn on_shutdown(&self, _server: &Server) {
			self.0.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[tokio::test]
	#[traced_test]
	async fn shutdown_fails_open_channels_exactly_once() {
		let env = Environment::new();
		env.bind("/mem", Arc::new(TempDevice::new())).await.unwrap();

		let recorder = Arc::new(Recorder::default());
		let shutdowns = Arc::new(CountShutdowns::default());
		let server = Arc::new(
			Server::new(Arc::new(env), &Config::default())
				.with_observer(recorder.clone())
				.with_shutdown_handler(shutdowns.clone()),
		);

		let (server_side, peer) = memory_pair();
		spawn({
			let server = Arc::clone(&server);
			async move { server.serve(server_side.inbound, server_side.outbound).await }
		});

		let response = volley(&peer, json!({"Op": "subscribe", "Path": "/mem", "Depth": 1})).await;
		let chan = response["Chan"].as_u64().unwrap();
		assert_eq!(peer.inbound.recv().await.unwrap()["Status"], json!("Next"));

		server.shutdown();
		server.shutdown();

		let failed = timeout(Duration::from_secs(5), peer.inbound.recv())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(failed["Chan"], json!(chan));
		assert_eq!(failed["Status"], json!("Error"));
		assert_eq!(failed["Output"]["Code"], json!("server-shutdown"));

		sleep(Duration::from_millis(50)).await;
		assert!(peer.inbound.try_recv().is_err());
		assert_eq!(shutdowns.0.load(Ordering::SeqCst), 1);
		assert_eq!(
			recorder.events(),
			[
				(chan, ChannelEvent::Opened),
				(chan, ChannelEvent::Packet(Status::Next)),
				(chan, ChannelEvent::Packet(Status::Error)),
			]
		);
		assert!(logs_contain("Failed open channels"));
	}

	/// Sends literals named `inline` as the whole channel they stand for.
	struct Inline;

	impl OutputEncoder for Inline {
		fn encode(&self, output: Output, cx: &EncodeContext<'_>) -> Result<Encoded, Error> {
			match output {
				Output::Literal(literal) if literal.name() == "inline" => {
					let mut response = ResponseFrame::success(Some(cx.codec.deflate(&literal)?));
					response.status = Some("Inline".to_string());
					Ok(Encoded::Response(response, None))
				}
				other => Ok(Encoded::Declined(other)),
			}
		}
	}

	#[tokio::test]
	#[traced_test]
	async fn registered_encoders_go_first() {
		let (server_side, peer) = memory_pair();
		Server::new(Arc::new(Environment::new()), &Config::default())
			.with_extension("echo", Arc::new(Echo))
			.with_output_encoder(Arc::new(Inline))
			.spawn(server_side);

		let inline = volley(
			&peer,
			json!({"Op": "echo", "Input": {"Type": "String", "Name": "inline", "StringValue": "x"}}),
		)
		.await;
		assert_eq!(inline["Status"], json!("Inline"));

		let plain = volley(
			&peer,
			json!({"Op": "echo", "Input": {"Type": "String", "Name": "", "StringValue": "x"}}),
		)
		.await;
		assert_eq!(plain.get("Status"), None);
		assert_eq!(plain["Ok"], json!(true));
	}
}
