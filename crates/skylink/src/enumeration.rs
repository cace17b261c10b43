use tracing::warn;

use super::{
	error::Error,
	literal::Literal,
	path::{decode_segment, encode_segment},
};

/// Name given to the folder returned by [`EnumerationWriter::to_output`].
pub const OUTPUT_NAME: &str = "enumeration";

/// Collects a depth-bounded walk of a subtree as a flat, path-keyed log.
///
/// Producers call [`visit`](Self::visit) for the node they're on, then [`descend`](Self::descend) and
/// [`ascend`](Self::ascend) around each child for as long as [`can_descend`](Self::can_descend) says
/// so. Every visited literal gets renamed to its path relative to the enumeration root.
///
/// Parents must be visited before their children, [`reconstruct`](Self::reconstruct) relies on it.
#[derive(Debug, Clone)]
pub struct EnumerationWriter {
	depth: usize,
	names: Vec<String>,
	entries: Vec<Literal>,
}

impl EnumerationWriter {
	#[must_use]
	pub const fn new(depth: usize) -> Self {
		Self {
			depth,
			names: Vec::new(),
			entries: Vec::new(),
		}
	}

	#[must_use]
	pub const fn depth(&self) -> usize {
		self.depth
	}

	#[must_use]
	pub fn entries(&self) -> &[Literal] {
		&self.entries
	}

	fn current_path(&self) -> String {
		self.names
			.iter()
			.map(|name| encode_segment(name))
			.collect::<Vec<_>>()
			.join("/")
	}

	pub fn visit(&mut self, literal: Literal) -> &mut Self {
		let path = self.current_path();
		self.entries.push(literal.with_name(path));
		self
	}

	#[must_use]
	pub fn can_descend(&self) -> bool {
		self.names.len() < self.depth
	}

	#[must_use]
	pub fn remaining_depth(&self) -> usize {
		self.depth.saturating_sub(self.names.len())
	}

	pub fn descend(&mut self, name: impl Into<String>) -> &mut Self {
		self.names.push(name.into());
		self
	}

	pub fn ascend(&mut self) -> Result<&mut Self, Error> {
		if self.names.pop().is_none() {
			return Err(Error::Structural(
				"enumeration ascended above its root".to_string(),
			));
		}
		Ok(self)
	}

	/// Splices the flattened output of another enumeration in at the current position.
	pub fn visit_enumeration(&mut self, output: Literal) -> Result<&mut Self, Error> {
		let kind = output.kind();
		let Literal::Folder { children, .. } = output else {
			return Err(Error::Structural(format!(
				"can't splice a {kind} in as an enumeration"
			)));
		};

		let prefix = self.current_path();
		for child in children {
			let name = match (prefix.is_empty(), child.name().is_empty()) {
				(true, _) => child.name().to_string(),
				(false, true) => prefix.clone(),
				(false, false) => format!("{prefix}/{}", child.name()),
			};
			self.entries.push(child.with_name(name));
		}

		Ok(self)
	}

	/// The flat log as a wire folder.
	pub fn to_output(&self) -> Result<Literal, Error> {
		if !self.names.is_empty() {
			return Err(Error::Structural(format!(
				"enumeration finished while still inside '{}'",
				self.current_path()
			)));
		}

		Ok(Literal::folder(OUTPUT_NAME, self.entries.clone()))
	}

	/// Rebuilds the nested tree the flat log describes, `None` if nothing got visited.
	pub fn reconstruct(&self) -> Result<Option<Literal>, Error> {
		let mut stack = Vec::<Literal>::new();

		for entry in &self.entries {
			let path = entry.name();

			if path.is_empty() {
				if !stack.is_empty() {
					return Err(Error::Structural(
						"found an out-of-order enumeration root".to_string(),
					));
				}
				stack.push(entry.clone());
				continue;
			}

			if stack.is_empty() {
				return Err(Error::Structural(format!(
					"enumeration entry '{path}' came before its root"
				)));
			}

			let parts = path.split('/').collect::<Vec<_>>();
			while parts.len() < stack.len() {
				fold_top(&mut stack)?;
			}

			if parts.len() != stack.len() {
				warn!(%path, "Enumeration entry has no visited parent, skipping it");
				continue;
			}

			let child = entry
				.clone()
				.with_name(decode_segment(parts[parts.len() - 1]));

			if matches!(child, Literal::Folder { .. }) {
				stack.push(child);
			} else if let Some(parent) = stack.last_mut() {
				parent.append(child)?;
			}
		}

		while stack.len() > 1 {
			fold_top(&mut stack)?;
		}

		Ok(stack.pop())
	}
}

fn fold_top(stack: &mut Vec<Literal>) -> Result<(), Error> {
	if let Some(top) = stack.pop() {
		if let Some(parent) = stack.last_mut() {
			parent.append(top)?;
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn shell(literal: &Literal) -> Literal {
		match literal {
			Literal::Folder { name, .. } => Literal::folder(name.clone(), vec![]),
			other => other.clone(),
		}
	}

	fn walk(literal: &Literal, writer: &mut EnumerationWriter) {
		writer.visit(shell(literal));
		if let Some(children) = literal.children() {
			if writer.can_descend() {
				for child in children {
					writer.descend(child.name());
					walk(child, writer);
					writer.ascend().unwrap();
				}
			}
		}
	}

	fn sample() -> Literal {
		Literal::folder(
			"",
			vec![
				Literal::folder(
					"docs",
					vec![
						Literal::string("readme.md", "# hi"),
						Literal::folder("drafts", vec![Literal::string("a b", "draft")]),
					],
				),
				Literal::string("motd", "hello"),
				Literal::folder("empty", vec![]),
				Literal::function("launch"),
			],
		)
	}

	#[test]
	fn flat_log_uses_encoded_paths() {
		let mut writer = EnumerationWriter::new(5);
		walk(&sample(), &mut writer);

		let names = writer
			.entries()
			.iter()
			.map(Literal::name)
			.collect::<Vec<_>>();
		assert_eq!(
			names,
			[
				"",
				"docs",
				"docs/readme.md",
				"docs/drafts",
				"docs/drafts/a%20b",
				"motd",
				"empty",
				"launch"
			]
		);

		let output = writer.to_output().unwrap();
		assert_eq!(output.name(), OUTPUT_NAME);
		assert_eq!(output.children().unwrap().len(), 8);
	}

	#[test]
	fn reconstruct_round_trips() {
		let mut writer = EnumerationWriter::new(10);
		walk(&sample(), &mut writer);

		assert_eq!(writer.reconstruct().unwrap(), Some(sample()));
	}

	#[test]
	fn depth_bounds_the_walk() {
		let mut zero = EnumerationWriter::new(0);
		walk(&sample(), &mut zero);
		assert_eq!(zero.entries().len(), 1);
		assert_eq!(zero.reconstruct().unwrap(), Some(Literal::folder("", vec![])));

		let mut one = EnumerationWriter::new(1);
		walk(&sample(), &mut one);
		let tree = one.reconstruct().unwrap().unwrap();
		let docs = tree.child("docs").unwrap();
		assert!(docs.children().unwrap().is_empty());
		assert_eq!(tree.children().unwrap().len(), 4);
	}

	#[test]
	fn splices_sub_enumerations() {
		let mut inner = EnumerationWriter::new(1);
		walk(&Literal::folder("", vec![Literal::string("x", "1")]), &mut inner);
		let inner_output = inner.to_output().unwrap();

		let mut outer = EnumerationWriter::new(2);
		outer.visit(Literal::folder("", vec![]));
		outer.descend("mnt");
		outer.visit_enumeration(inner_output).unwrap();
		outer.ascend().unwrap();

		let names = outer
			.entries()
			.iter()
			.map(Literal::name)
			.collect::<Vec<_>>();
		assert_eq!(names, ["", "mnt", "mnt/x"]);

		assert_eq!(
			outer.reconstruct().unwrap(),
			Some(Literal::folder(
				"",
				vec![Literal::folder("mnt", vec![Literal::string("x", "1")])]
			))
		);

		assert!(outer
			.visit_enumeration(Literal::string("", "nope"))
			.is_err());
	}

	#[test]
	fn unbalanced_walks_are_rejected() {
		let mut writer = EnumerationWriter::new(1);
		assert!(writer.ascend().is_err());

		writer.visit(Literal::folder("", vec![])).descend("child");
		assert!(writer.to_output().is_err());
		assert!(!writer.can_descend());
		assert_eq!(writer.remaining_depth(), 0);
	}

	#[test]
	fn second_root_is_out_of_order() {
		let mut writer = EnumerationWriter::new(1);
		writer.visit(Literal::folder("", vec![]));
		writer.visit(Literal::folder("", vec![]));
		assert!(writer.reconstruct().is_err());
	}
}
