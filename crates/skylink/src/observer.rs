use std::time::Duration;

use tracing::debug;

use super::channel::{ChannelId, Status};

/// Lifecycle points of a channel carried over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
	Opened,
	Packet(Status),
	StopRequested,
	/// The connection went away while the channel was still alive.
	Abandoned,
}

/// Hooks for metrics or tracing collaborators, handed to [`Server`](crate::Server) and
/// [`Client`](crate::Client) at construction.
///
/// Every method has an empty default, implementors pick what they care about.
pub trait Observer: Send + Sync {
	/// Called once per finished operation, on whichever side ran it.
	fn on_operation(&self, _op: &str, _path: Option<&str>, _elapsed: Duration, _ok: bool) {}

	fn on_channel_event(&self, _channel_id: ChannelId, _event: ChannelEvent) {}
}

/// Runs when a [`Server`](crate::Server) or [`Client`](crate::Client) shuts down, once per
/// side, in registration order after the built-in cleanup.
pub trait ShutdownHandler<T: ?Sized>: Send + Sync {
	fn on_shutdown(&self, side: &T);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Reports everything as `debug!` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
	fn on_operation(&self, op: &str, path: Option<&str>, elapsed: Duration, ok: bool) {
		debug!(
			op,
			path = path.unwrap_or_default(),
			?elapsed,
			ok,
			"Operation finished"
		);
	}

	fn on_channel_event(&self, channel_id: ChannelId, event: ChannelEvent) {
		debug!(channel_id, ?event, "Channel event");
	}
}

#[cfg(test)]
mod tests {
	use tracing_test::traced_test;

	use super::*;

	#[test]
	#[traced_test]
	fn tracing_observer_logs_operations_and_channel_events() {
		let observer = TracingObserver;

		observer.on_operation("get", Some("/mem/a"), Duration::from_millis(3), true);
		assert!(logs_contain("Operation finished"));
		assert!(logs_contain("/mem/a"));
		assert!(logs_contain("ok=true"));

		observer.on_channel_event(7, ChannelEvent::Packet(Status::Done));
		assert!(logs_contain("Channel event"));
		assert!(logs_contain("channel_id=7"));
		assert!(logs_contain("Packet(Done)"));
	}
}
