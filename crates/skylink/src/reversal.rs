use std::{
	mem, ptr,
	sync::{Arc, Mutex, PoisonError, Weak},
};

use async_channel as chan;
use serde_json::{json, Value};
use tokio::{spawn, task::JoinHandle};
use tracing::{debug, trace};

use super::{
	client::Client,
	config::Config,
	devices::RemoteDevice,
	entry::Device,
	environment::Environment,
	error::Error,
	literal::{Deflater, Inflater, Literal, LiteralCodec, LiteralKind},
	observer::{NoopObserver, Observer, ShutdownHandler},
	path::PathFragment,
	server::Server,
	transport::Link,
	wire::{normalize_keys, FrameKind},
};

#[derive(Default)]
struct Published {
	counter: u64,
	mounts: Vec<(Arc<dyn Device>, PathFragment)>,
}

/// Sends devices by reference: mounts them locally under a fresh path and ships that path.
///
/// A device crossing again reuses its first path. Everything published is unmounted once the
/// connection shuts down.
struct Publisher {
	env: Arc<Environment>,
	prefix: PathFragment,
	published: Mutex<Published>,
}

impl Publisher {
	fn new(env: Arc<Environment>, prefix: PathFragment) -> Self {
		Self {
			env,
			prefix,
			published: Mutex::default(),
		}
	}

	fn publish(&self, device: &Arc<dyn Device>) -> Result<PathFragment, Error> {
		let mut published = self.published.lock().unwrap_or_else(PoisonError::into_inner);

		if let Some((_, path)) = published
			.mounts
			.iter()
			.find(|(known, _)| ptr::addr_eq(Arc::as_ptr(known), Arc::as_ptr(device)))
		{
			trace!(%path, "Device already published");
			return Ok(path.clone());
		}

		let mut path = self.prefix.clone();
		path.push_part((published.counter + 1).to_string())?;
		published.counter += 1;

		self.env.mount(&path, Arc::clone(device));
		published.mounts.push((Arc::clone(device), path.clone()));

		Ok(path)
	}

	fn withdraw(&self) {
		let mounts = mem::take(
			&mut self
				.published
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.mounts,
		);

		for (_, path) in mounts {
			if self.env.unmount(&path) {
				debug!(%path, "Withdrew published device");
			}
		}
	}
}

impl Deflater for Publisher {
	fn deflate(&self, literal: &Literal, _codec: &LiteralCodec) -> Result<Value, Error> {
		let Literal::Device { name, device } = literal else {
			return Err(Error::Structural(format!(
				"only devices get published, not a {}",
				literal.kind()
			)));
		};

		let path = self.publish(device)?;
		debug!(%path, %name, "Published device");

		Ok(json!({
			"Type": "Device",
			"Name": name,
			"ReversalPrefix": path.to_string(),
		}))
	}
}

impl ShutdownHandler<Client> for Publisher {
	fn on_shutdown(&self, _client: &Client) {
		self.withdraw();
	}
}

/// Turns a received device reference into a proxy calling back over the same connection.
struct Proxies {
	client: Weak<Client>,
}

impl Inflater for Proxies {
	fn inflate(&self, raw: &Value, _codec: &LiteralCodec) -> Result<Literal, Error> {
		let prefix = raw
			.get("ReversalPrefix")
			.and_then(Value::as_str)
			.ok_or_else(|| Error::Descriptive {
				field: "ReversalPrefix".to_string(),
				reason: "is required for a device reference".to_string(),
			})?;
		let name = raw
			.get("Name")
			.and_then(Value::as_str)
			.unwrap_or_default();

		trace!(%prefix, "Materializing remote device");
		Ok(Literal::device(
			name,
			Arc::new(RemoteDevice::from_weak(
				self.client.clone(),
				PathFragment::parse(prefix)?,
			)),
		))
	}
}

/// A connection acting as a [`Client`] and a [`Server`] at once.
///
/// Frames carrying an `Op` go to the embedded server, which serves `env`; everything else is a
/// reply for the client. Device literals crossing the connection in either direction travel as
/// references, see [`ReversalConfig`](crate::ReversalConfig).
pub struct Reversal {
	client: Arc<Client>,
	server: Arc<Server>,
	env: Arc<Environment>,
	router: JoinHandle<()>,
}

impl std::fmt::Debug for Reversal {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Reversal")
			.field("client", &self.client)
			.field("server", &self.server)
			.finish_non_exhaustive()
	}
}

impl Reversal {
	pub fn spawn(link: Link, env: Arc<Environment>, config: &Config) -> Result<Self, Error> {
		Self::spawn_with_observer(link, env, config, Arc::new(NoopObserver))
	}

	pub fn spawn_with_observer(
		link: Link,
		env: Arc<Environment>,
		config: &Config,
		observer: Arc<dyn Observer>,
	) -> Result<Self, Error> {
		let publisher = Arc::new(Publisher::new(
			Arc::clone(&env),
			PathFragment::parse(&config.reversal.publish_prefix)?,
		));

		let mut shared_codec = None;
		let client = Client::with_parts(
			link.outbound.clone(),
			config,
			Arc::clone(&observer),
			|me| {
				let mut codec = LiteralCodec::new();
				codec.register_deflater(LiteralKind::Device, publisher.clone());
				codec.register_inflater(
					"Device",
					Arc::new(Proxies {
						client: me.clone(),
					}),
				);
				shared_codec = Some(codec.clone());
				codec
			},
		);

		client.add_shutdown_handler(publisher);

		let server = Arc::new(
			Server::new(Arc::clone(&env), config)
				.with_codec(shared_codec.unwrap_or_default())
				.with_observer(observer),
		);

		let (requests_tx, requests_rx) = chan::unbounded();
		spawn({
			let server = Arc::clone(&server);
			let outbound = link.outbound.clone();
			async move { server.serve(requests_rx, outbound).await }
		});

		let normalize = config.server.normalize_keys;
		let router = spawn({
			let client = Arc::clone(&client);
			async move {
				while let Ok(frame) = link.inbound.recv().await {
					let frame = if normalize {
						normalize_keys(frame)
					} else {
						frame
					};

					if FrameKind::of(&frame) == FrameKind::Request {
						if requests_tx.send(frame).await.is_err() {
							break;
						}
					} else {
						client.handle_inbound(frame);
					}
				}

				debug!("Reversed connection closed");
				requests_tx.close();
				client.shutdown();
			}
		});

		Ok(Self {
			client,
			server,
			env,
			router,
		})
	}

	/// The requesting half, talking to the peer's environment.
	#[must_use]
	pub const fn client(&self) -> &Arc<Client> {
		&self.client
	}

	#[must_use]
	pub const fn server(&self) -> &Arc<Server> {
		&self.server
	}

	/// The environment served to the peer, published devices included.
	#[must_use]
	pub const fn env(&self) -> &Arc<Environment> {
		&self.env
	}

	pub fn shutdown(&self) {
		self.client.shutdown();
		self.server.shutdown();
		self.router.abort();
	}
}

#[cfg(test)]
mod tests {
	use tracing_test::traced_test;

	use super::*;
	use crate::{devices::LiteralDevice, transport::memory_pair};

	#[tokio::test]
	#[traced_test]
	async fn device_references_round_trip_through_the_codec() {
		let (link, _peer) = memory_pair();
		let reversal = Reversal::spawn(link, Arc::new(Environment::new()), &Config::default()).unwrap();

		let device = Arc::new(LiteralDevice::new(Literal::string("", "x")));
		let codec = LiteralCodec::new();

		let raw = Publisher::new(Arc::clone(reversal.env()), PathFragment::parse("/pub").unwrap())
			.deflate(&Literal::device("api", device), &codec)
			.unwrap();
		assert_eq!(
			raw,
			json!({"Type": "Device", "Name": "api", "ReversalPrefix": "/pub/1"})
		);
		assert_eq!(
			reversal.env().mount_points(),
			[PathFragment::parse("/pub/1").unwrap()]
		);

		let inflated = Proxies {
			client: Arc::downgrade(reversal.client()),
		}
		.inflate(&raw, &codec)
		.unwrap();
		assert!(matches!(&inflated, Literal::Device { name, .. } if name == "api"));

		assert!(Proxies {
			client: Weak::new()
		}
		.inflate(&json!({"Type": "Device"}), &codec)
		.is_err());
	}

	#[tokio::test]
	#[traced_test]
	async fn publishing_reuses_paths_and_withdraws() {
		let env = Arc::new(Environment::new());
		let publisher = Publisher::new(Arc::clone(&env), PathFragment::parse("/pub").unwrap());

		let first: Arc<dyn Device> = Arc::new(LiteralDevice::new(Literal::string("", "1")));
		let second: Arc<dyn Device> = Arc::new(LiteralDevice::new(Literal::string("", "1")));

		let path = |device: &Arc<dyn Device>| publisher.publish(device).unwrap().to_string();
		assert_eq!(path(&first), "/pub/1");
		assert_eq!(path(&second), "/pub/2");
		assert_eq!(path(&first), "/pub/1");
		assert_eq!(env.mount_points().len(), 2);

		publisher.withdraw();
		assert!(env.mount_points().is_empty());
		assert_eq!(path(&first), "/pub/3");
	}
}
