use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};

use super::literal::plain_names;
use crate::{
	entry::{Device, Entry, Get, Invocation, Invoke},
	error::Error,
	literal::Literal,
	path::PathFragment,
};

type Handler = Arc<dyn Fn(Option<Literal>) -> BoxFuture<'static, Result<Invocation, Error>> + Send + Sync>;

/// A device made of a single invokable root entry.
#[derive(Clone)]
pub struct FunctionDevice {
	name: String,
	handler: Handler,
}

impl fmt::Debug for FunctionDevice {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FunctionDevice")
			.field("name", &self.name)
			.finish_non_exhaustive()
	}
}

impl FunctionDevice {
	pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
	where
		F: Fn(Option<Literal>) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Invocation, Error>> + Send + 'static,
	{
		Self {
			name: name.into(),
			handler: Arc::new(move |input| handler(input).boxed()),
		}
	}
}

#[async_trait]
impl Device for FunctionDevice {
	async fn get_entry(&self, path: &PathFragment) -> Result<Option<Box<dyn Entry>>, Error> {
		if !plain_names(path).is_empty() {
			return Ok(None);
		}

		Ok(Some(Box::new(FunctionEntry {
			name: self.name.clone(),
			handler: Arc::clone(&self.handler),
		})))
	}
}

struct FunctionEntry {
	name: String,
	handler: Handler,
}

impl Entry for FunctionEntry {
	fn as_get(&self) -> Option<&dyn Get> {
		Some(self)
	}

	fn as_invoke(&self) -> Option<&dyn Invoke> {
		Some(self)
	}
}

#[async_trait]
impl Get for FunctionEntry {
	async fn get(&self) -> Result<Option<Literal>, Error> {
		Ok(Some(Literal::function(self.name.clone())))
	}
}

#[async_trait]
impl Invoke for FunctionEntry {
	async fn invoke(&self, input: Option<Literal>) -> Result<Invocation, Error> {
		(self.handler)(input).await
	}
}
