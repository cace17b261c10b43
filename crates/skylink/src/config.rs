use std::{io::ErrorKind, path::Path};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, instrument};

use super::error::Error;

/// How a client pairs responses with the requests that caused them.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
	/// Responses come back in request order, nothing extra goes on the wire.
	Lockstep,
	/// Every request carries an `Id` the response echoes.
	#[default]
	Id,
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
	#[serde(default)]
	pub correlation: Correlation,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
	/// Upper-case the first letter of inbound frame keys.
	#[serde(default = "default_true")]
	pub normalize_keys: bool,
	/// Clamp for the `Depth` of `enumerate` and `subscribe`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub max_depth: Option<usize>,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			normalize_keys: true,
			max_depth: None,
		}
	}
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReversalConfig {
	/// Where devices sent over a reversed connection get published locally.
	#[serde(default = "default_publish_prefix")]
	pub publish_prefix: String,
}

impl Default for ReversalConfig {
	fn default() -> Self {
		Self {
			publish_prefix: default_publish_prefix(),
		}
	}
}

const fn default_true() -> bool {
	true
}

fn default_publish_prefix() -> String {
	"/pub".to_string()
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub client: ClientConfig,
	#[serde(default)]
	pub server: ServerConfig,
	#[serde(default)]
	pub reversal: ReversalConfig,
}

impl Config {
	/// Reads a JSON config file, falling back to the defaults when there is none.
	#[instrument(skip_all, fields(path = %path.as_ref().display()), err)]
	pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
		match fs::read(path.as_ref()).await {
			Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
			Err(e) if e.kind() == ErrorKind::NotFound => {
				debug!("No config file, using defaults");
				Ok(Self::default())
			}
			Err(e) => Err(e.into()),
		}
	}

	pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
		fs::write(path, serde_json::to_vec_pretty(self)?).await?;
		Ok(())
	}

	pub fn from_json_str(raw: &str) -> Result<Self, Error> {
		Ok(serde_json::from_str(raw)?)
	}
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;

	use super::*;

	#[test]
	fn defaults_fill_missing_sections() {
		let config = Config::from_json_str(r#"{"server": {"max_depth": 3}}"#).unwrap();

		assert_eq!(config.client.correlation, Correlation::Id);
		assert!(config.server.normalize_keys);
		assert_eq!(config.server.max_depth, Some(3));
		assert_eq!(config.reversal.publish_prefix, "/pub");

		assert_eq!(Config::from_json_str("{}").unwrap(), Config::default());
		assert!(Config::from_json_str(r#"{"client": {"correlation": "telepathy"}}"#).is_err());
	}

	#[tokio::test]
	async fn load_and_save() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("skylink.json");

		assert_eq!(Config::load(&path).await.unwrap(), Config::default());

		let mut config = Config::default();
		config.client.correlation = Correlation::Lockstep;
		config.reversal.publish_prefix = "/shared".to_string();
		config.save(&path).await.unwrap();

		assert_eq!(Config::load(&path).await.unwrap(), config);

		fs::write(&path, b"{ not json").await.unwrap();
		assert!(matches!(
			Config::load(&path).await,
			Err(Error::Serialization(_))
		));
	}
}
