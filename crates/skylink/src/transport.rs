//! Frame carriers between a [`Client`](crate::Client) and a [`Server`](crate::Server).

use async_channel as chan;
use serde_json::Value;
use tokio::{
	io::{split, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
	spawn,
};
use tracing::{debug, error, trace, warn};

/// One end of a bidirectional stream of JSON frames.
///
/// The far end is gone once `inbound` yields an error; closing `outbound` hangs up.
#[derive(Debug, Clone)]
pub struct Link {
	pub outbound: chan::Sender<Value>,
	pub inbound: chan::Receiver<Value>,
}

impl Link {
	pub fn close(&self) {
		self.outbound.close();
		self.inbound.close();
	}
}

/// Two links wired to each other, for peers living in the same process.
#[must_use]
pub fn memory_pair() -> (Link, Link) {
	let (left_tx, right_rx) = chan::unbounded();
	let (right_tx, left_rx) = chan::unbounded();

	(
		Link {
			outbound: left_tx,
			inbound: left_rx,
		},
		Link {
			outbound: right_tx,
			inbound: right_rx,
		},
	)
}

/// Carries frames as newline-delimited JSON over any byte stream.
///
/// Spawns a reader and a writer task. EOF, an I/O failure or an undecodable line closes the
/// inbound side; the writer stops once every outbound sender is gone.
pub fn json_lines<T>(io: T) -> Link
where
	T: AsyncRead + AsyncWrite + Send + 'static,
{
	let (reader, mut writer) = split(io);
	let (inbound_tx, inbound_rx) = chan::unbounded::<Value>();
	let (outbound_tx, outbound_rx) = chan::unbounded::<Value>();

	spawn(async move {
		let mut lines = BufReader::new(reader).lines();

		loop {
			match lines.next_line().await {
				Ok(Some(line)) if line.trim().is_empty() => {}
				Ok(Some(line)) => match serde_json::from_str::<Value>(&line) {
					Ok(frame) => {
						if inbound_tx.send(frame).await.is_err() {
							trace!("Inbound frames no longer consumed");
							break;
						}
					}
					Err(e) => {
						warn!(%e, "Received a line that isn't JSON, hanging up");
						break;
					}
				},
				Ok(None) => {
					debug!("Peer closed the stream");
					break;
				}
				Err(e) => {
					error!(?e, "Failed to read from stream");
					break;
				}
			}
		}

		inbound_tx.close();
	});

	spawn(async move {
		while let Ok(frame) = outbound_rx.recv().await {
			let mut line = frame.to_string();
			line.push('\n');

			if let Err(e) = writer.write_all(line.as_bytes()).await {
				error!(?e, "Failed to write frame");
				break;
			}
			if let Err(e) = writer.flush().await {
				error!(?e, "Failed to flush stream");
				break;
			}
		}

		outbound_rx.close();
		if let Err(e) = writer.shutdown().await {
			trace!(?e, "Failed to shut the stream down");
		}
	});

	Link {
		outbound: outbound_tx,
		inbound: inbound_rx,
	}
}
