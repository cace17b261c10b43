use std::{
	collections::{BTreeMap, BTreeSet},
	fmt,
	sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use tracing::{debug, instrument, trace, warn};

use super::{
	entry::{Capability, Device, Entry, Enumerate, Get},
	enumeration::EnumerationWriter,
	error::Error,
	literal::{Literal, AUTHORITY},
	path::{decode_segment, PathFragment},
};

type MountKey = Vec<String>;

/// Result of a longest-prefix lookup in the mount table.
#[derive(Clone)]
pub struct MountMatch {
	pub mount: PathFragment,
	pub device: Arc<dyn Device>,
	pub sub_path: PathFragment,
}

impl fmt::Debug for MountMatch {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("MountMatch")
			.field("mount", &self.mount)
			.field("sub_path", &self.sub_path)
			.finish_non_exhaustive()
	}
}

/// One immutable version of the mount table. Binds swap in a whole new one, so readers always see a
/// device together with the prefixes it implies.
#[derive(Clone, Default)]
struct Mounts {
	devices: BTreeMap<MountKey, Arc<dyn Device>>,
	prefixes: BTreeSet<MountKey>,
}

impl Mounts {
	fn key(path: &PathFragment) -> MountKey {
		path.parts()
			.iter()
			.filter(|part| !part.is_empty())
			.cloned()
			.collect()
	}

	fn match_path(&self, path: &PathFragment) -> Option<MountMatch> {
		let key = Self::key(path);

		(0..=key.len()).rev().find_map(|len| {
			self.devices.get(&key[..len]).map(|device| MountMatch {
				mount: path.slice(0, len),
				device: Arc::clone(device),
				sub_path: path.slice(len, path.len()),
			})
		})
	}

	/// Names of every mount or implied prefix exactly one level below `key`.
	fn child_names(&self, key: &[String]) -> Vec<String> {
		self.devices
			.keys()
			.chain(self.prefixes.iter())
			.filter(|candidate| candidate.len() == key.len() + 1 && candidate.starts_with(key))
			.map(|candidate| candidate[key.len()].clone())
			.collect::<BTreeSet<_>>()
			.into_iter()
			.collect()
	}

	async fn resolve(
		self: &Arc<Self>,
		path: &PathFragment,
	) -> Result<Option<Box<dyn Entry>>, Error> {
		if let Some(MountMatch {
			device, sub_path, ..
		}) = self.match_path(path)
		{
			if let Some(entry) = device.get_entry(&sub_path).await? {
				return Ok(Some(entry));
			}
		}

		let key = Self::key(path);
		if self.prefixes.contains(&key) {
			return Ok(Some(Box::new(VirtualEnvEntry {
				mounts: Arc::clone(self),
				path: path.clone(),
				key,
			})));
		}

		Ok(None)
	}
}

/// Mount table mapping absolute path prefixes to [`Device`]s.
///
/// Lookups pick the single longest mounted prefix of the requested path. Directories implied by a
/// deeper mount (binding `/a/b` implies `/a`) resolve to a synthesized folder listing what's below.
///
/// A child environment (see [`Environment::child`]) first resolves against its own mounts, then
/// against each ancestor in order, nearest first. Ancestors are kept as a flat list of
/// `(environment, offset)` pairs, never as a chain of parent pointers.
pub struct Environment {
	mounts: RwLock<Arc<Mounts>>,
	ancestors: Vec<Ancestor>,
}

struct Ancestor {
	env: Arc<Environment>,
	offset: PathFragment,
}

impl fmt::Debug for Environment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Environment")
			.field("mounts", &self.mount_points())
			.field(
				"ancestors",
				&self
					.ancestors
					.iter()
					.map(|ancestor| ancestor.offset.to_string())
					.collect::<Vec<_>>(),
			)
			.finish()
	}
}

impl Default for Environment {
	fn default() -> Self {
		Self::new()
	}
}

impl Environment {
	#[must_use]
	pub fn new() -> Self {
		Self {
			mounts: RwLock::new(Arc::default()),
			ancestors: Vec::new(),
		}
	}

	/// A new environment falling back to `parent`, where path `/x` of the child is `offset/x` there.
	#[must_use]
	pub fn child(parent: &Arc<Self>, offset: PathFragment) -> Self {
		let mut ancestors = vec![Ancestor {
			env: Arc::clone(parent),
			offset: offset.clone(),
		}];

		ancestors.extend(parent.ancestors.iter().map(|ancestor| Ancestor {
			env: Arc::clone(&ancestor.env),
			offset: ancestor.offset.join(&offset),
		}));

		Self {
			mounts: RwLock::new(Arc::default()),
			ancestors,
		}
	}

	fn snapshot(&self) -> Arc<Mounts> {
		Arc::clone(&self.mounts.read().unwrap_or_else(PoisonError::into_inner))
	}

	/// Mounts `device` at an absolute `path`, once the device reports ready.
	///
	/// Binding the same path again replaces the previous device.
	#[instrument(skip(self, device), err)]
	pub async fn bind(&self, path: &str, device: Arc<dyn Device>) -> Result<(), Error> {
		let path = PathFragment::parse(path)?;
		if !path.is_absolute() {
			return Err(Error::MalformedPath(format!(
				"devices must be bound at absolute paths, got '{path}'"
			)));
		}

		device.ready().await?;
		self.mount(&path, device);

		Ok(())
	}

	/// Mounts without waiting on [`Device::ready`].
	pub(crate) fn mount(&self, path: &PathFragment, device: Arc<dyn Device>) {
		let key = Mounts::key(path);

		let mut guard = self.mounts.write().unwrap_or_else(PoisonError::into_inner);
		let mut next = Mounts::clone(&guard);

		next.prefixes
			.extend((0..key.len()).map(|len| key[..len].to_vec()));
		if next.devices.insert(key, device).is_some() {
			debug!(%path, "Replaced device");
		} else {
			debug!(%path, "Bound device");
		}

		*guard = Arc::new(next);
	}

	/// Removes the device mounted exactly at `path`, dropping prefixes nothing implies anymore.
	pub(crate) fn unmount(&self, path: &PathFragment) -> bool {
		let key = Mounts::key(path);

		let mut guard = self.mounts.write().unwrap_or_else(PoisonError::into_inner);
		if !guard.devices.contains_key(&key) {
			return false;
		}

		let mut next = Mounts::clone(&guard);
		next.devices.remove(&key);
		next.prefixes = next
			.devices
			.keys()
			.flat_map(|key| (0..key.len()).map(|len| key[..len].to_vec()))
			.collect();

		*guard = Arc::new(next);
		debug!(%path, "Unmounted device");

		true
	}

	#[must_use]
	pub fn mount_points(&self) -> Vec<PathFragment> {
		self.snapshot()
			.devices
			.keys()
			.filter_map(|key| PathFragment::from_parts(true, key.iter().cloned()).ok())
			.collect()
	}

	#[must_use]
	pub fn match_path(&self, path: &PathFragment) -> Option<MountMatch> {
		self.snapshot().match_path(path)
	}

	async fn resolve_local(&self, path: &PathFragment) -> Result<Option<Box<dyn Entry>>, Error> {
		self.snapshot().resolve(path).await
	}

	/// Resolves a path to an entry, `None` when nothing lives there.
	pub async fn get_entry(&self, path: &PathFragment) -> Result<Option<Box<dyn Entry>>, Error> {
		if path.parts().iter().any(|part| part == "..") {
			return Err(Error::MalformedPath(format!(
				"path traversal isn't supported: '{path}'"
			)));
		}

		if let Some(entry) = self.resolve_local(path).await? {
			return Ok(Some(entry));
		}

		for ancestor in &self.ancestors {
			let outer = ancestor.offset.join(path);
			trace!(%path, %outer, "Falling back to ancestor environment");

			if let Some(entry) = ancestor.env.resolve_local(&outer).await? {
				return Ok(Some(entry));
			}
		}

		Ok(None)
	}

	/// Resolves a path that must exist and, optionally, support `capability`.
	pub async fn require_entry(
		&self,
		path: &PathFragment,
		capability: Option<Capability>,
	) -> Result<Box<dyn Entry>, Error> {
		let entry = self
			.get_entry(path)
			.await?
			.ok_or_else(|| Error::missing(path))?;

		match capability {
			Some(capability) if !entry.supports(capability) => Err(Error::lacks(path, capability)),
			_ => Ok(entry),
		}
	}
}

#[async_trait]
impl Device for Environment {
	async fn get_entry(&self, path: &PathFragment) -> Result<Option<Box<dyn Entry>>, Error> {
		Self::get_entry(self, path).await
	}
}

/// Stand-in for a directory that only exists because something got mounted below it.
struct VirtualEnvEntry {
	mounts: Arc<Mounts>,
	path: PathFragment,
	key: MountKey,
}

impl VirtualEnvEntry {
	fn child_path(&self, name: &str) -> Result<PathFragment, Error> {
		let mut path = self.path.clone();
		path.push_part(name)?;
		Ok(path)
	}
}

impl Entry for VirtualEnvEntry {
	fn as_get(&self) -> Option<&dyn Get> {
		Some(self)
	}

	fn as_enumerate(&self) -> Option<&dyn Enumerate> {
		Some(self)
	}
}

#[async_trait]
impl Get for VirtualEnvEntry {
	async fn get(&self) -> Result<Option<Literal>, Error> {
		let children = self
			.mounts
			.child_names(&self.key)
			.iter()
			.map(|part| Literal::folder(decode_segment(part), vec![]))
			.collect();

		Ok(Some(Literal::folder(
			self.path.last_name().unwrap_or_default(),
			children,
		)))
	}
}

#[async_trait]
impl Enumerate for VirtualEnvEntry {
	async fn enumerate(&self, writer: &mut EnumerationWriter) -> Result<(), Error> {
		writer.visit(Literal::folder("", vec![]));
		if !writer.can_descend() {
			return Ok(());
		}

		for part in self.mounts.child_names(&self.key) {
			writer.descend(decode_segment(&part));

			match self.mounts.resolve(&self.child_path(&part)?).await {
				Ok(Some(entry)) => {
					if let Some(enumerable) = entry.as_enumerate() {
						enumerable.enumerate(writer).await?;
					} else if let Some(gettable) = entry.as_get() {
						writer.visit(
							gettable
								.get()
								.await?
								.unwrap_or_else(|| Literal::folder("", vec![])),
						);
					} else {
						writer.visit(Literal::folder("", vec![]));
					}
				}
				Ok(None) => {
					writer.visit(Literal::folder("", vec![]));
				}
				Err(e) => {
					warn!(path = %self.path, child = %part, %e, "Failed to enumerate mount");
					writer.visit(Literal::error("", "enumerate-failed", AUTHORITY, e.to_string()));
				}
			}

			writer.ascend()?;
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use tracing_test::traced_test;

	use super::*;

	/// Records which sub-path it was asked for, answering with a string literal.
	struct Echo(&'static str);

	struct EchoEntry {
		device: &'static str,
		sub_path: String,
	}

	impl Entry for EchoEntry {
		fn as_get(&self) -> Option<&dyn Get> {
			Some(self)
		}
	}

	#[async_trait]
	impl Get for EchoEntry {
		async fn get(&self) -> Result<Option<Literal>, Error> {
			Ok(Some(Literal::string(self.device, self.sub_path.clone())))
		}
	}

	#[async_trait]
	impl Device for Echo {
		async fn get_entry(&self, path: &PathFragment) -> Result<Option<Box<dyn Entry>>, Error> {
			Ok(Some(Box::new(EchoEntry {
				device: self.0,
				sub_path: path.to_string(),
			})))
		}
	}

	fn path(s: &str) -> PathFragment {
		PathFragment::parse(s).unwrap()
	}

	async fn echo(env: &Environment, p: &str) -> Literal {
		env.require_entry(&path(p), Some(Capability::Get))
			.await
			.unwrap()
			.getter(&path(p))
			.unwrap()
			.get()
			.await
			.unwrap()
			.unwrap()
	}

	#[tokio::test]
	#[traced_test]
	async fn longest_prefix_wins() {
		let env = Environment::new();
		env.bind("/a", Arc::new(Echo("a"))).await.unwrap();
		env.bind("/a/b", Arc::new(Echo("a/b"))).await.unwrap();

		assert_eq!(echo(&env, "/a/b/c").await, Literal::string("a/b", "/c"));
		assert_eq!(echo(&env, "/a/bc").await, Literal::string("a", "/bc"));
		assert_eq!(echo(&env, "/a").await, Literal::string("a", "/"));

		let matched = env.match_path(&path("/a/b/c")).unwrap();
		assert_eq!(matched.mount, path("/a/b"));
		assert_eq!(matched.sub_path, path("/c"));

		assert!(env.match_path(&path("/z")).is_none());
	}

	#[tokio::test]
	#[traced_test]
	async fn rebinding_replaces() {
		let env = Environment::new();
		env.bind("/x", Arc::new(Echo("old"))).await.unwrap();
		env.bind("/x", Arc::new(Echo("new"))).await.unwrap();

		assert_eq!(echo(&env, "/x").await, Literal::string("new", "/"));
		assert_eq!(env.mount_points(), [path("/x")]);
	}

	#[tokio::test]
	#[traced_test]
	async fn unmounting_forgets_implied_prefixes() {
		let env = Environment::new();
		env.bind("/a/b", Arc::new(Echo("ab"))).await.unwrap();
		env.bind("/a/c/d", Arc::new(Echo("acd"))).await.unwrap();

		assert!(env.unmount(&path("/a/c/d")));
		assert!(!env.unmount(&path("/a/c/d")));
		assert_eq!(env.mount_points(), [path("/a/b")]);
		assert!(env.get_entry(&path("/a/c")).await.unwrap().is_none());
		assert!(env.get_entry(&path("/a")).await.unwrap().is_some());

		assert!(env.unmount(&path("/a/b")));
		assert!(env.mount_points().is_empty());
		assert!(env.get_entry(&path("/a")).await.unwrap().is_none());
	}

	#[tokio::test]
	#[traced_test]
	async fn implied_prefixes_are_listable() {
		let env = Environment::new();
		env.bind("/a/b", Arc::new(Echo("ab"))).await.unwrap();
		env.bind("/a/c/d", Arc::new(Echo("acd"))).await.unwrap();

		let listing = env
			.require_entry(&path("/a"), Some(Capability::Get))
			.await
			.unwrap()
			.getter(&path("/a"))
			.unwrap()
			.get()
			.await
			.unwrap()
			.unwrap();

		assert_eq!(
			listing,
			Literal::folder(
				"a",
				vec![Literal::folder("b", vec![]), Literal::folder("c", vec![])]
			)
		);

		let mut writer = EnumerationWriter::new(1);
		env.require_entry(&path("/"), Some(Capability::Enumerate))
			.await
			.unwrap()
			.enumerator(&path("/"))
			.unwrap()
			.enumerate(&mut writer)
			.await
			.unwrap();
		let names = writer
			.entries()
			.iter()
			.map(Literal::name)
			.collect::<Vec<_>>();
		assert_eq!(names, ["", "a"]);
	}

	#[tokio::test]
	#[traced_test]
	async fn missing_paths_and_capabilities() {
		let env = Environment::new();
		env.bind("/a/b", Arc::new(Echo("ab"))).await.unwrap();

		assert!(env.get_entry(&path("/nope")).await.unwrap().is_none());
		assert!(matches!(
			env.require_entry(&path("/nope"), None).await,
			Err(Error::NotFound(_))
		));
		assert!(matches!(
			env.require_entry(&path("/a/b"), Some(Capability::Invoke))
				.await,
			Err(Error::CapabilityMismatch {
				capability: Capability::Invoke,
				..
			})
		));
		assert!(matches!(
			env.bind("relative", Arc::new(Echo("r"))).await,
			Err(Error::MalformedPath(_))
		));
	}

	#[tokio::test]
	#[traced_test]
	async fn child_environments_fall_back_outward() {
		let root = Arc::new(Environment::new());
		root.bind("/srv/shared", Arc::new(Echo("shared")))
			.await
			.unwrap();
		root.bind("/srv/app/config", Arc::new(Echo("app-config")))
			.await
			.unwrap();

		let app = Arc::new(Environment::child(&root, path("/srv/app")));
		app.bind("/local", Arc::new(Echo("local"))).await.unwrap();

		let session = Environment::child(&app, path("/"));
		session
			.bind("/config", Arc::new(Echo("session-config")))
			.await
			.unwrap();

		// local mounts shadow ancestors
		assert_eq!(
			echo(&session, "/config").await,
			Literal::string("session-config", "/")
		);
		// nearest ancestor next
		assert_eq!(echo(&session, "/local/x").await, Literal::string("local", "/x"));
		// then the root, with offsets composed
		assert_eq!(
			echo(&app, "/config/y").await,
			Literal::string("app-config", "/y")
		);

		// can't climb above where the child was rooted
		assert!(session.get_entry(&path("/shared")).await.unwrap().is_none());
		assert!(matches!(
			session.get_entry(&path("/../shared")).await,
			Err(Error::MalformedPath(_))
		));
	}
}
