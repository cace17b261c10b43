use std::{
	collections::{BTreeMap, BTreeSet},
	sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::spawn;
use tracing::{debug, trace};

use super::literal::{plain_names, visit_tree};
use crate::{
	channel::{Channel, ChannelFactory, ChannelSender},
	entry::{Device, Entry, Enumerate, Get, Put, Subscribe},
	enumeration::EnumerationWriter,
	error::Error,
	literal::Literal,
	notification::Notification,
	path::{encode_segment, PathFragment},
};

type Key = Vec<String>;

struct Subscriber {
	prefix: Key,
	depth: usize,
	sender: ChannelSender,
}

impl Subscriber {
	/// Path of `key` relative to the subscription, if it's within reach.
	fn relative_path(&self, key: &[String]) -> Option<String> {
		let rest = key.strip_prefix(self.prefix.as_slice())?;
		(rest.len() <= self.depth).then(|| encoded(rest))
	}
}

#[derive(Default)]
struct Store {
	values: BTreeMap<Key, Literal>,
	subscribers: Vec<Subscriber>,
}

impl Store {
	/// Deepest stored device strictly above `key`, with what's left of the path.
	fn mounted_device(&self, key: &[String]) -> Option<(Arc<dyn Device>, PathFragment)> {
		(0..key.len()).rev().find_map(|len| match self.values.get(&key[..len]) {
			Some(Literal::Device { device, .. }) => PathFragment::from_names(&key[len..])
				.ok()
				.map(|rest| (Arc::clone(device), rest)),
			_ => None,
		})
	}

	fn has_descendants(&self, key: &[String]) -> bool {
		// Descendants sort right after the key itself.
		self.values
			.range(key.to_vec()..)
			.find(|(candidate, _)| candidate.as_slice() != key)
			.is_some_and(|(candidate, _)| candidate.starts_with(key))
	}

	fn child_names(&self, key: &[String]) -> BTreeSet<String> {
		child_names(&self.values, key)
	}

	/// Clones every value at or below `key`. Devices come along as `Arc`s.
	fn subtree(&self, key: &[String]) -> BTreeMap<Key, Literal> {
		self.values
			.range(key.to_vec()..)
			.take_while(|(candidate, _)| candidate.starts_with(key))
			.map(|(candidate, value)| (candidate.clone(), value.clone()))
			.collect()
	}

	fn value_at(&self, key: &[String]) -> Option<Literal> {
		if let Some(value) = self.values.get(key) {
			return Some(value.clone());
		}

		self.has_descendants(key).then(|| {
			Literal::folder(
				key.last().cloned().unwrap_or_default(),
				self.child_names(key)
					.into_iter()
					.map(|name| Literal::folder(name, vec![]))
					.collect(),
			)
		})
	}

	fn prune(&mut self) {
		self.subscribers
			.retain(|subscriber| subscriber.sender.is_alive() && !subscriber.sender.is_stopped());
	}

	fn notify(&mut self, key: &[String], notification: impl Fn(String) -> Notification) {
		self.prune();

		for subscriber in &self.subscribers {
			if let Some(path) = subscriber.relative_path(key) {
				if let Err(e) = subscriber.sender.next(notification(path).to_literal()) {
					trace!(%e, "Subscriber went away mid-notification");
				}
			}
		}
	}
}

/// Ephemeral flat store of literals keyed by path.
///
/// Folders are implied by deeper keys. Storing a [`Literal::Device`] mounts that device: lookups
/// below its path are handed to it.
#[derive(Clone, Default)]
pub struct TempDevice {
	store: Arc<Mutex<Store>>,
}

impl std::fmt::Debug for TempDevice {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
		f.debug_struct("TempDevice")
			.field("values", &store.values.len())
			.field("subscribers", &store.subscribers.len())
			.finish()
	}
}

impl TempDevice {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Device for TempDevice {
	async fn get_entry(&self, path: &PathFragment) -> Result<Option<Box<dyn Entry>>, Error> {
		let key = plain_names(path);

		let mounted = self
			.store
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.mounted_device(&key);

		if let Some((device, rest)) = mounted {
			trace!(%path, %rest, "Delegating into stored device");
			return device.get_entry(&rest).await;
		}

		Ok(Some(Box::new(TempEntry {
			store: Arc::clone(&self.store),
			key,
		})))
	}
}

struct TempEntry {
	store: Arc<Mutex<Store>>,
	key: Key,
}

impl TempEntry {
	fn lock(&self) -> std::sync::MutexGuard<'_, Store> {
		self.store.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Entry for TempEntry {
	fn as_get(&self) -> Option<&dyn Get> {
		Some(self)
	}

	fn as_put(&self) -> Option<&dyn Put> {
		Some(self)
	}

	fn as_enumerate(&self) -> Option<&dyn Enumerate> {
		Some(self)
	}

	fn as_subscribe(&self) -> Option<&dyn Subscribe> {
		Some(self)
	}
}

#[async_trait]
impl Get for TempEntry {
	async fn get(&self) -> Result<Option<Literal>, Error> {
		Ok(self.lock().value_at(&self.key))
	}
}

#[async_trait]
impl Put for TempEntry {
	async fn put(&self, value: Option<Literal>) -> Result<(), Error> {
		let mut store = self.lock();

		if let Some(value) = value {
			let announced = announced(&value);
			let previous = store.values.insert(self.key.clone(), value);
			if previous.is_some() {
				store.notify(&self.key, |path| Notification::changed(path, announced.clone()));
			} else {
				store.notify(&self.key, |path| Notification::added(path, announced.clone()));
			}
			return Ok(());
		}

		let doomed = store
			.values
			.keys()
			.filter(|candidate| candidate.starts_with(&self.key))
			.cloned()
			.collect::<Vec<_>>();

		for key in doomed {
			store.values.remove(&key);
			store.notify(&key, Notification::removed);
		}

		Ok(())
	}
}

#[async_trait]
impl Enumerate for TempEntry {
	async fn enumerate(&self, writer: &mut EnumerationWriter) -> Result<(), Error> {
		// Stored devices are awaited below, so walk a copy rather than hold the lock.
		let snapshot = {
			let store = self.lock();
			if !self.key.is_empty()
				&& !store.values.contains_key(&self.key)
				&& !store.has_descendants(&self.key)
			{
				return Err(Error::missing(encoded(&self.key)));
			}
			store.subtree(&self.key)
		};

		walk(&snapshot, &mut self.key.clone(), writer).await
	}
}

#[async_trait]
impl Subscribe for TempEntry {
	async fn subscribe(&self, depth: usize, channels: &ChannelFactory) -> Result<Channel, Error> {
		let (sender, channel) = channels.open();
		let subscriber = Subscriber {
			prefix: self.key.clone(),
			depth,
			sender: sender.clone(),
		};

		{
			// Snapshot and registration under one lock, so no put slips in between.
			let mut store = self.lock();
			store.prune();

			for (key, value) in store.values.range(self.key.clone()..) {
				if !key.starts_with(&self.key) {
					break;
				}
				if let Some(path) = subscriber.relative_path(key) {
					sender.next(Notification::added(path, announced(value)).to_literal())?;
				}
			}
			sender.next(Notification::ready().to_literal())?;

			store.subscribers.push(subscriber);
		}

		let channel_id = channel.id();
		let store = Arc::clone(&self.store);
		spawn(async move {
			sender.stopped().await;
			store.lock().unwrap_or_else(PoisonError::into_inner).prune();
			if sender.is_alive() {
				debug!(channel_id, "Subscription stopped");
				if let Err(e) = sender.done() {
					trace!(%e, "Subscription already terminated");
				}
			}
		});

		Ok(channel)
	}
}

fn walk<'a>(
	values: &'a BTreeMap<Key, Literal>,
	key: &'a mut Key,
	writer: &'a mut EnumerationWriter,
) -> BoxFuture<'a, Result<(), Error>> {
	Box::pin(async move {
		match values.get(key.as_slice()) {
			Some(Literal::Device { device, .. }) => walk_device(device.as_ref(), writer).await,
			Some(value) => visit_tree(value, writer),
			None => {
				writer.visit(Literal::folder("", vec![]));
				if writer.can_descend() {
					for name in child_names(values, key) {
						writer.descend(name.clone());
						key.push(name);
						walk(values, key, writer).await?;
						key.pop();
						writer.ascend()?;
					}
				}
				Ok(())
			}
		}
	})
}

/// Continues an enumeration inside a stored device, from its root.
async fn walk_device(device: &dyn Device, writer: &mut EnumerationWriter) -> Result<(), Error> {
	let Some(entry) = device.get_entry(&PathFragment::root()).await? else {
		writer.visit(Literal::folder("", vec![]));
		return Ok(());
	};

	if let Some(enumerate) = entry.as_enumerate() {
		return enumerate.enumerate(writer).await;
	}

	let value = match entry.as_get() {
		Some(get) => get.get().await?,
		None => None,
	};
	match value {
		Some(value) => visit_tree(&value, writer),
		None => {
			writer.visit(Literal::folder("", vec![]));
			Ok(())
		}
	}
}

fn child_names(values: &BTreeMap<Key, Literal>, key: &[String]) -> BTreeSet<String> {
	values
		.range(key.to_vec()..)
		.take_while(|(candidate, _)| candidate.starts_with(key))
		.filter_map(|(candidate, _)| candidate.get(key.len()).cloned())
		.collect()
}

/// What subscribers are told about a stored value. Devices show up as plain folders.
fn announced(value: &Literal) -> Literal {
	match value {
		Literal::Device { name, .. } => Literal::folder(name.clone(), vec![]),
		other => other.clone(),
	}
}

fn encoded(names: &[String]) -> String {
	names
		.iter()
		.map(|name| encode_segment(name))
		.collect::<Vec<_>>()
		.join("/")
}

#[cfg(test)]
mod tests {
	use tracing_test::traced_test;

	use super::*;
	use crate::{
		channel::{Packet, Status},
		devices::LiteralDevice,
		notification::NotificationKind,
	};

	async fn entry(device: &TempDevice, path: &str) -> Box<dyn Entry> {
		device
			.get_entry(&PathFragment::parse(path).unwrap())
			.await
			.unwrap()
			.unwrap()
	}

	async fn put(device: &TempDevice, path: &str, value: Option<Literal>) {
		entry(device, path)
			.await
			.as_put()
			.unwrap()
			.put(value)
			.await
			.unwrap();
	}

	async fn get(device: &TempDevice, path: &str) -> Option<Literal> {
		entry(device, path).await.as_get().unwrap().get().await.unwrap()
	}

	fn notification(packet: Packet) -> Notification {
		assert_eq!(packet.status, Status::Next);
		Notification::from_literal(&packet.output.unwrap()).unwrap()
	}

	#[tokio::test]
	#[traced_test]
	async fn values_and_implied_folders() {
		let device = TempDevice::new();
		put(&device, "/greeting", Some(Literal::string("", "hi"))).await;
		put(&device, "/docs/a b", Some(Literal::string("", "1"))).await;
		put(&device, "/docs/c", Some(Literal::string("", "2"))).await;

		assert_eq!(get(&device, "/greeting").await, Some(Literal::string("", "hi")));
		assert_eq!(
			get(&device, "/docs").await,
			Some(Literal::folder(
				"docs",
				vec![Literal::folder("a b", vec![]), Literal::folder("c", vec![])]
			))
		);
		assert_eq!(get(&device, "/nothing").await, None);

		put(&device, "/docs", None).await;
		assert_eq!(get(&device, "/docs/c").await, None);
		assert_eq!(get(&device, "/docs").await, None);
	}

	#[tokio::test]
	#[traced_test]
	async fn enumerates_implied_tree() {
		let device = TempDevice::new();
		put(&device, "/x/y", Some(Literal::string("", "deep"))).await;
		put(&device, "/z", Some(Literal::string("", "top"))).await;

		let mut writer = EnumerationWriter::new(5);
		entry(&device, "/")
			.await
			.as_enumerate()
			.unwrap()
			.enumerate(&mut writer)
			.await
			.unwrap();

		assert_eq!(
			writer.reconstruct().unwrap(),
			Some(Literal::folder(
				"",
				vec![
					Literal::folder("x", vec![Literal::string("y", "deep")]),
					Literal::string("z", "top"),
				]
			))
		);

		let mut missing = EnumerationWriter::new(1);
		assert!(matches!(
			entry(&device, "/nope")
				.await
				.as_enumerate()
				.unwrap()
				.enumerate(&mut missing)
				.await,
			Err(Error::NotFound(_))
		));
	}

	#[tokio::test]
	#[traced_test]
	async fn subscription_replays_then_follows() {
		let device = TempDevice::new();
		let factory = ChannelFactory::new();
		put(&device, "/room/a", Some(Literal::string("", "1"))).await;

		let mut channel = entry(&device, "/room")
			.await
			.as_subscribe()
			.unwrap()
			.subscribe(1, &factory)
			.await
			.unwrap();

		let first = notification(channel.recv().await.unwrap());
		assert_eq!(first, Notification::added("a", Literal::string("entry", "1")));
		assert_eq!(
			notification(channel.recv().await.unwrap()).kind,
			NotificationKind::Ready
		);

		put(&device, "/room/a", Some(Literal::string("", "2"))).await;
		put(&device, "/room/b", Some(Literal::string("", "3"))).await;
		put(&device, "/room/deeper/c", Some(Literal::string("", "too deep"))).await;
		put(&device, "/elsewhere", Some(Literal::string("", "unrelated"))).await;
		put(&device, "/room/a", None).await;

		let kinds = [
			notification(channel.recv().await.unwrap()),
			notification(channel.recv().await.unwrap()),
			notification(channel.recv().await.unwrap()),
		]
		.map(|notification| (notification.kind, notification.path));
		assert_eq!(
			kinds,
			[
				(NotificationKind::Changed, "a".to_string()),
				(NotificationKind::Added, "b".to_string()),
				(NotificationKind::Removed, "a".to_string()),
			]
		);

		channel.stop();
		assert_eq!(channel.recv().await, Some(Packet::done()));
		assert_eq!(channel.recv().await, None);
	}

	#[tokio::test]
	#[traced_test]
	async fn stored_devices_get_mounted() {
		let device = TempDevice::new();
		let inner = LiteralDevice::new(Literal::folder(
			"",
			vec![Literal::string("version", "1.0")],
		));
		put(&device, "/api", Some(Literal::device("api", Arc::new(inner)))).await;

		assert_eq!(
			get(&device, "/api/version").await,
			Some(Literal::string("version", "1.0"))
		);
		assert!(matches!(get(&device, "/api").await, Some(Literal::Device { .. })));
	}

	#[tokio::test]
	#[traced_test]
	async fn enumeration_walks_into_stored_devices() {
		let device = TempDevice::new();
		let inner = LiteralDevice::new(Literal::folder("", vec![Literal::string("v", "1")]));
		put(&device, "/api", Some(Literal::device("api", Arc::new(inner)))).await;
		put(&device, "/plain", Some(Literal::string("", "p"))).await;

		let mut writer = EnumerationWriter::new(2);
		entry(&device, "/")
			.await
			.as_enumerate()
			.unwrap()
			.enumerate(&mut writer)
			.await
			.unwrap();

		assert!(writer
			.entries()
			.iter()
			.all(|entry| entry.kind() != crate::literal::LiteralKind::Device));
		assert_eq!(
			writer.reconstruct().unwrap(),
			Some(Literal::folder(
				"",
				vec![
					Literal::folder("api", vec![Literal::string("v", "1")]),
					Literal::string("plain", "p"),
				]
			))
		);

		let mut shallow = EnumerationWriter::new(1);
		entry(&device, "/")
			.await
			.as_enumerate()
			.unwrap()
			.enumerate(&mut shallow)
			.await
			.unwrap();
		assert_eq!(
			shallow.reconstruct().unwrap(),
			Some(Literal::folder(
				"",
				vec![Literal::folder("api", vec![]), Literal::string("plain", "p")]
			))
		);
	}

	#[tokio::test]
	#[traced_test]
	async fn subscribers_see_stored_devices_as_folders() {
		let device = TempDevice::new();
		let factory = ChannelFactory::new();
		let inner = || Arc::new(LiteralDevice::new(Literal::folder("", vec![])));
		put(&device, "/room/before", Some(Literal::device("before", inner()))).await;

		let mut channel = entry(&device, "/room")
			.await
			.as_subscribe()
			.unwrap()
			.subscribe(1, &factory)
			.await
			.unwrap();

		assert_eq!(
			notification(channel.recv().await.unwrap()),
			Notification::added("before", Literal::folder("entry", vec![]))
		);
		assert_eq!(
			notification(channel.recv().await.unwrap()).kind,
			NotificationKind::Ready
		);

		put(&device, "/room/after", Some(Literal::device("after", inner()))).await;
		assert_eq!(
			notification(channel.recv().await.unwrap()),
			Notification::added("after", Literal::folder("entry", vec![]))
		);
	}

	#[tokio::test]
	#[traced_test]
	async fn stopped_subscribers_are_dropped_without_further_puts() {
		let device = TempDevice::new();
		let factory = ChannelFactory::new();
		let subscribers = || {
			device
				.store
				.lock()
				.unwrap_or_else(PoisonError::into_inner)
				.subscribers
				.len()
		};

		let mut channel = entry(&device, "/")
			.await
			.as_subscribe()
			.unwrap()
			.subscribe(1, &factory)
			.await
			.unwrap();
		assert_eq!(
			notification(channel.recv().await.unwrap()).kind,
			NotificationKind::Ready
		);
		assert_eq!(subscribers(), 1);

		channel.stop();
		assert_eq!(channel.recv().await, Some(Packet::done()));
		assert_eq!(subscribers(), 0);

		let _fresh = entry(&device, "/")
			.await
			.as_subscribe()
			.unwrap()
			.subscribe(1, &factory)
			.await
			.unwrap();
		assert_eq!(subscribers(), 1);
	}
}
