use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use http::Method;
use serde::{Deserialize, Serialize};

/// Version label every unversioned API publishes its endpoints under.
pub const DEFAULT_VERSION: &str = "default";

/// One node's copy of a service routing record. Replicated across the
/// cluster through the presence tracker; `ref_number`, `timestamp`,
/// `node_name` and `phx_ref` identify the replica, everything else is the
/// routing substance.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ApiDefinition {
	pub id: String,
	pub name: String,
	#[serde(default)]
	pub auth: AuthSpec,
	pub proxy: ProxySpec,
	#[serde(default)]
	pub versioned: bool,
	pub version_data: BTreeMap<String, VersionData>,
	#[serde(default)]
	pub ref_number: i64,
	#[serde(default = "Utc::now")]
	pub timestamp: DateTime<Utc>,
	#[serde(default)]
	pub node_name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub phx_ref: Option<String>,
}

impl ApiDefinition {
	/// Structural equality for quorum votes: compares the routing substance
	/// and `ref_number`, ignoring the volatile replica identity fields.
	pub fn same_definition(&self, other: &ApiDefinition) -> bool {
		self.id == other.id
			&& self.name == other.name
			&& self.auth == other.auth
			&& self.proxy == other.proxy
			&& self.versioned == other.versioned
			&& self.version_data == other.version_data
			&& self.ref_number == other.ref_number
	}

	/// Endpoints served under the `default` version.
	pub fn default_endpoints(&self) -> &[Endpoint] {
		self
			.version_data
			.get(DEFAULT_VERSION)
			.map(|v| v.endpoints.as_slice())
			.unwrap_or(&[])
	}
}

#[derive(Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum AuthType {
	#[serde(rename = "none")]
	None,
	#[serde(rename = "jwt")]
	Jwt,
}

impl Default for AuthType {
	fn default() -> Self {
		Self::None
	}
}

/// Where the forwarder looks for credentials on a secured endpoint.
#[derive(Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSpec {
	pub auth_type: AuthType,
	pub use_header: bool,
	pub header_name: String,
	pub use_query: bool,
	pub query_name: String,
}

impl Default for AuthSpec {
	fn default() -> Self {
		AuthSpec {
			auth_type: AuthType::None,
			use_header: true,
			header_name: "authorization".to_string(),
			use_query: true,
			query_name: "token".to_string(),
		}
	}
}

/// Upstream addressing. `target_url` is either a literal host or, when
/// `use_env` is set, the name of an environment variable holding the host
/// (`localhost` when unset).
#[derive(Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
	pub target_url: String,
	pub port: u16,
	#[serde(default)]
	pub use_env: bool,
}

#[derive(Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VersionData {
	#[serde(default)]
	pub endpoints: Vec<Endpoint>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
	pub id: String,
	#[serde(with = "http_serde::method")]
	pub method: Method,
	pub path: String,
	#[serde(default)]
	pub not_secured: bool,
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;

	/// Minimal definition used across registry and matcher tests.
	pub fn api(id: &str, node: &str, ref_number: i64) -> ApiDefinition {
		let mut version_data = BTreeMap::new();
		version_data.insert(
			DEFAULT_VERSION.to_string(),
			VersionData {
				endpoints: vec![Endpoint {
					id: format!("get:/{id}"),
					method: Method::GET,
					path: format!("/{id}"),
					not_secured: true,
				}],
			},
		);
		ApiDefinition {
			id: id.to_string(),
			name: id.to_string(),
			auth: AuthSpec::default(),
			proxy: ProxySpec {
				target_url: "localhost".to_string(),
				port: 8080,
				use_env: false,
			},
			versioned: false,
			version_data,
			ref_number,
			timestamp: Utc::now(),
			node_name: node.to_string(),
			phx_ref: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn same_definition_ignores_replica_identity() {
		let a = test_support::api("movies", "node-a", 0);
		let mut b = a.clone();
		b.node_name = "node-b".to_string();
		b.phx_ref = Some("ref".to_string());
		b.timestamp = Utc::now();
		assert!(a.same_definition(&b));

		b.name = "renamed".to_string();
		assert!(!a.same_definition(&b));
	}

	#[test]
	fn same_definition_tracks_ref_number() {
		let a = test_support::api("movies", "node-a", 0);
		let mut b = a.clone();
		b.ref_number = 1;
		assert!(!a.same_definition(&b));
	}
}
