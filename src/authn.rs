use std::collections::HashSet;

use http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::map::Map;
use tracing::debug;

use crate::types::AuthSpec;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
	#[error("the token is invalid or malformed: {0:?}")]
	InvalidToken(jsonwebtoken::errors::Error),
	#[error("no token presented")]
	Missing,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct JwtConfig {
	/// HS256 shared secret. Endpoints requiring auth reject everything when
	/// it is empty.
	pub secret: String,
	pub issuer: Option<HashSet<String>>,
	pub audience: Option<HashSet<String>>,
}

/// Verifies bearer tokens against the gateway's shared-secret key.
#[derive(Clone)]
pub struct JwtAuthenticator {
	key: DecodingKey,
	issuer: Option<HashSet<String>>,
	audience: Option<HashSet<String>>,
}

impl std::fmt::Debug for JwtAuthenticator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"JwtAuthenticator {{ issuer: {:?}, audience: {:?} }}",
			self.issuer, self.audience
		)
	}
}

#[derive(Clone, Debug, Default)]
pub struct Claims {
	pub inner: Map<String, Value>,
}

impl Claims {
	pub fn subject(&self) -> Option<&str> {
		self.inner.get("sub").and_then(Value::as_str)
	}
}

impl JwtAuthenticator {
	pub fn new(config: &JwtConfig) -> Self {
		JwtAuthenticator {
			key: DecodingKey::from_secret(config.secret.as_bytes()),
			issuer: config.issuer.clone(),
			audience: config.audience.clone(),
		}
	}

	pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
		let validation = {
			let mut validation = Validation::new(Algorithm::HS256);
			validation.iss = self.issuer.clone();
			if let Some(audience) = &self.audience {
				validation.aud = Some(audience.clone());
			}
			validation
		};
		let token_data = decode::<Map<String, Value>>(token, &self.key, &validation)
			.map_err(AuthError::InvalidToken)?;
		Ok(Claims {
			inner: token_data.claims,
		})
	}

	/// Apply the any-token-passes rule: the request is authenticated iff at
	/// least one harvested candidate verifies.
	pub fn authenticate(
		&self,
		auth: &AuthSpec,
		headers: &HeaderMap,
		query: Option<&str>,
	) -> Result<Claims, AuthError> {
		let candidates = collect_tokens(auth, headers, query);
		if candidates.is_empty() {
			return Err(AuthError::Missing);
		}
		let mut last_error = AuthError::Missing;
		for candidate in candidates {
			match self.verify(&candidate) {
				Ok(claims) => return Ok(claims),
				Err(err) => {
					debug!(%err, "token rejected");
					last_error = err;
				},
			}
		}
		Err(last_error)
	}
}

/// Gather candidate tokens from the configured auth header(s) and query
/// parameter. Header values may carry a `Bearer` prefix; the query value is
/// whitespace-split so a single parameter can present several tokens.
pub fn collect_tokens(auth: &AuthSpec, headers: &HeaderMap, query: Option<&str>) -> Vec<String> {
	let mut tokens = Vec::new();
	if auth.use_header {
		for value in headers.get_all(auth.header_name.as_str()) {
			if let Ok(value) = value.to_str() {
				let value = value.trim();
				let token = value
					.strip_prefix("Bearer ")
					.or_else(|| value.strip_prefix("bearer "))
					.unwrap_or(value);
				if !token.is_empty() {
					tokens.push(token.to_string());
				}
			}
		}
	}
	if auth.use_query {
		if let Some(query) = query {
			let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).unwrap_or_default();
			for (key, value) in pairs {
				if key == auth.query_name {
					tokens.extend(value.split_whitespace().map(str::to_string));
				}
			}
		}
	}
	tokens
}

#[cfg(test)]
mod tests {
	use chrono::{Duration, Utc};
	use http::HeaderValue;
	use jsonwebtoken::{EncodingKey, Header, encode};
	use serde_json::json;

	use super::*;

	const SECRET: &str = "mysecret";

	fn authenticator() -> JwtAuthenticator {
		JwtAuthenticator::new(&JwtConfig {
			secret: SECRET.to_string(),
			..Default::default()
		})
	}

	fn token(secret: &str) -> String {
		let claims = json!({
			"sub": "john.doe",
			"exp": (Utc::now() + Duration::hours(1)).timestamp(),
		});
		encode(
			&Header::default(),
			&claims,
			&EncodingKey::from_secret(secret.as_bytes()),
		)
		.unwrap()
	}

	#[test]
	fn verifies_valid_token_and_exposes_subject() {
		let claims = authenticator().verify(&token(SECRET)).unwrap();
		assert_eq!(claims.subject(), Some("john.doe"));
	}

	#[test]
	fn rejects_token_signed_with_other_secret() {
		assert!(authenticator().verify(&token("wrong")).is_err());
	}

	#[test]
	fn collects_header_and_query_tokens() {
		let auth = AuthSpec::default();
		let mut headers = HeaderMap::new();
		headers.append("authorization", HeaderValue::from_static("Bearer aaa"));
		headers.append("authorization", HeaderValue::from_static("bbb"));

		let tokens = collect_tokens(&auth, &headers, Some("token=ccc%20ddd&other=x"));
		assert_eq!(tokens, vec!["aaa", "bbb", "ccc", "ddd"]);
	}

	#[test]
	fn honours_disabled_sources() {
		let auth = AuthSpec {
			use_header: false,
			use_query: false,
			..Default::default()
		};
		let mut headers = HeaderMap::new();
		headers.insert("authorization", HeaderValue::from_static("aaa"));
		assert!(collect_tokens(&auth, &headers, Some("token=bbb")).is_empty());
	}

	#[test]
	fn any_valid_token_authenticates() {
		let auth = AuthSpec::default();
		let mut headers = HeaderMap::new();
		headers.insert("authorization", HeaderValue::from_static("Bearer garbage"));

		let query = format!("token={}", token(SECRET));
		let claims = authenticator()
			.authenticate(&auth, &headers, Some(&query))
			.unwrap();
		assert_eq!(claims.subject(), Some("john.doe"));
	}

	#[test]
	fn missing_tokens_fail_closed() {
		let auth = AuthSpec::default();
		let headers = HeaderMap::new();
		assert!(matches!(
			authenticator().authenticate(&auth, &headers, None),
			Err(AuthError::Missing)
		));
	}
}
