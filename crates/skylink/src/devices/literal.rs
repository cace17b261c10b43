use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use crate::{
	entry::{Device, Entry, Enumerate, Get, Put},
	enumeration::EnumerationWriter,
	error::Error,
	literal::Literal,
	path::PathFragment,
};

/// Serves an in-memory literal tree, every node of it gettable, puttable and enumerable.
#[derive(Debug, Clone)]
pub struct LiteralDevice {
	root: Arc<RwLock<Literal>>,
}

impl LiteralDevice {
	#[must_use]
	pub fn new(root: Literal) -> Self {
		Self {
			root: Arc::new(RwLock::new(root)),
		}
	}

	pub async fn snapshot(&self) -> Literal {
		self.root.read().await.clone()
	}
}

#[async_trait]
impl Device for LiteralDevice {
	async fn get_entry(&self, path: &PathFragment) -> Result<Option<Box<dyn Entry>>, Error> {
		let names = plain_names(path);

		// A missing node still resolves while its parent folder exists, so it can be put into.
		let root = self.root.read().await;
		let reachable = match names.split_last() {
			None => true,
			Some((_, parent)) => matches!(descend(&root, parent), Some(Literal::Folder { .. })),
		};

		Ok(reachable.then(|| -> Box<dyn Entry> {
			Box::new(LiteralEntry {
				root: Arc::clone(&self.root),
				names,
			})
		}))
	}
}

struct LiteralEntry {
	root: Arc<RwLock<Literal>>,
	names: Vec<String>,
}

impl LiteralEntry {
	fn path(&self) -> String {
		PathFragment::from_names(&self.names).map_or_else(|_| self.names.join("/"), |path| path.to_string())
	}
}

impl Entry for LiteralEntry {
	fn as_get(&self) -> Option<&dyn Get> {
		Some(self)
	}

	fn as_put(&self) -> Option<&dyn Put> {
		Some(self)
	}

	fn as_enumerate(&self) -> Option<&dyn Enumerate> {
		Some(self)
	}
}

#[async_trait]
impl Get for LiteralEntry {
	async fn get(&self) -> Result<Option<Literal>, Error> {
		Ok(descend(&*self.root.read().await, &self.names).cloned())
	}
}

#[async_trait]
impl Put for LiteralEntry {
	async fn put(&self, value: Option<Literal>) -> Result<(), Error> {
		let mut root = self.root.write().await;

		let Some((name, parent_names)) = self.names.split_last() else {
			*root = value.unwrap_or_else(|| Literal::folder("", vec![]));
			return Ok(());
		};

		let children = descend_mut(&mut root, parent_names)
			.and_then(Literal::children_mut)
			.ok_or_else(|| Error::missing(self.path()))?;

		let existing = children.iter().position(|child| child.name() == name);
		match (value, existing) {
			(Some(value), Some(idx)) => children[idx] = value.with_name(name.clone()),
			(Some(value), None) => children.push(value.with_name(name.clone())),
			(None, Some(idx)) => {
				children.remove(idx);
			}
			(None, None) => trace!(path = %self.path(), "Nothing to unlink"),
		}

		Ok(())
	}
}

#[async_trait]
impl Enumerate for LiteralEntry {
	async fn enumerate(&self, writer: &mut EnumerationWriter) -> Result<(), Error> {
		let root = self.root.read().await;
		let node = descend(&root, &self.names).ok_or_else(|| Error::missing(self.path()))?;

		visit_tree(node, writer)
	}
}

/// Decoded names of a sub-path, trailing slash marker dropped.
pub(crate) fn plain_names(path: &PathFragment) -> Vec<String> {
	path.names()
		.into_iter()
		.filter(|name| !name.is_empty())
		.collect()
}

fn descend<'a>(root: &'a Literal, names: &[String]) -> Option<&'a Literal> {
	names
		.iter()
		.try_fold(root, |node, name| node.child(name))
}

fn descend_mut<'a>(root: &'a mut Literal, names: &[String]) -> Option<&'a mut Literal> {
	names.iter().try_fold(root, |node, name| {
		node.children_mut()?
			.iter_mut()
			.find(|child| child.name() == name)
	})
}

/// Writes `node` and, depth allowing, everything below it. Folders are visited as empty shells
/// and filled back in by their children.
pub(crate) fn visit_tree(node: &Literal, writer: &mut EnumerationWriter) -> Result<(), Error> {
	let Literal::Folder { children, .. } = node else {
		writer.visit(node.clone());
		return Ok(());
	};

	writer.visit(Literal::folder("", vec![]));
	if writer.can_descend() {
		for child in children {
			writer.descend(child.name());
			visit_tree(child, writer)?;
			writer.ascend()?;
		}
	}

	Ok(())
}
