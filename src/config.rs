use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use chrono::Utc;
use http::Method;
use serde::{Deserialize, Serialize};

use crate::audit::AuditConfig;
use crate::authn::JwtConfig;
use crate::ratelimit::RateLimitConfig;
use crate::types::{
	ApiDefinition, AuthSpec, AuthType, DEFAULT_VERSION, Endpoint, ProxySpec, VersionData,
};

/// Gateway settings plus the static route seed. The seed only primes the
/// registry on boot; live mutations go through the management API and are
/// replicated by the tracker.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
	pub node_name: String,
	pub listen: SocketAddr,
	pub admin_listen: SocketAddr,
	pub upstream_timeout_secs: u64,
	pub jwt: JwtConfig,
	pub rate_limit: RateLimitConfig,
	pub audit: AuditConfig,
	pub routes: Vec<RouteRecord>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			node_name: "gateway-local".to_string(),
			listen: "0.0.0.0:4000".parse().expect("default listen addr"),
			admin_listen: "127.0.0.1:4010".parse().expect("default admin addr"),
			upstream_timeout_secs: 30,
			jwt: JwtConfig::default(),
			rate_limit: RateLimitConfig::default(),
			audit: AuditConfig::default(),
			routes: Vec::new(),
		}
	}
}

/// One seed route. `host` names the environment variable holding the
/// backend host, falling back to `localhost` when unset.
#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RouteRecord {
	pub path: String,
	#[serde(with = "http_serde::method")]
	pub method: Method,
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub auth: bool,
}

impl Config {
	/// Read a config file. A bare JSON array is accepted as a plain route
	/// seed with default settings.
	pub fn load(path: &Path) -> anyhow::Result<Config> {
		let raw = std::fs::read_to_string(path)?;
		if let Ok(routes) = serde_json::from_str::<Vec<RouteRecord>>(&raw) {
			return Ok(Config {
				routes,
				..Default::default()
			});
		}
		Ok(serde_json::from_str(&raw)?)
	}

	/// Fold the seed records into API definitions, one per `(host, port)`
	/// backend, each record becoming an endpoint under the default version.
	pub fn seed_apis(&self, node_name: &str) -> Vec<ApiDefinition> {
		let mut grouped: BTreeMap<(String, u16), Vec<&RouteRecord>> = BTreeMap::new();
		for record in &self.routes {
			grouped
				.entry((record.host.clone(), record.port))
				.or_default()
				.push(record);
		}
		grouped
			.into_iter()
			.map(|((host, port), records)| {
				let id = format!("{}-{}", host.to_ascii_lowercase().replace('_', "-"), port);
				let secured = records.iter().any(|r| r.auth);
				let endpoints = records
					.iter()
					.map(|record| Endpoint {
						id: format!("{}:{}", record.method.as_str().to_ascii_lowercase(), record.path),
						method: record.method.clone(),
						path: record.path.clone(),
						not_secured: !record.auth,
					})
					.collect();
				let mut version_data = BTreeMap::new();
				version_data.insert(DEFAULT_VERSION.to_string(), VersionData { endpoints });
				ApiDefinition {
					id: id.clone(),
					name: id,
					auth: AuthSpec {
						auth_type: if secured { AuthType::Jwt } else { AuthType::None },
						..Default::default()
					},
					proxy: ProxySpec {
						target_url: host,
						port,
						use_env: true,
					},
					versioned: false,
					version_data,
					ref_number: 0,
					timestamp: Utc::now(),
					node_name: node_name.to_string(),
					phx_ref: None,
				}
			})
			.collect()
	}
}
