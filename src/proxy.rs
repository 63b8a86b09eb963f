use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{FromRequest, Multipart, Request};
use axum::response::Response;
use chrono::Utc;
use http::header::{
	CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderMap, TRANSFER_ENCODING,
};
use http::{Method, StatusCode};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditSink};
use crate::authn::JwtAuthenticator;
use crate::config::Config;
use crate::matcher;
use crate::ratelimit::{Passage, RateLimiter};
use crate::registry::Registry;
use crate::types::{ApiDefinition, AuthType, Endpoint, ProxySpec};

// Largest request body the forwarder will buffer for JSON re-serialization.
const BODY_LIMIT: usize = 16 * 1024 * 1024;

// Conventional field name marking the file part of an upload.
const FILE_PART: &str = "qqfile";

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("Route is not available")]
	RouteNotFound,
	#[error("Method not supported.")]
	MethodUnsupported,
	#[error("Too many requests.")]
	RateLimited,
	#[error("Missing or invalid token")]
	Unauthenticated,
	#[error("Invalid request body.")]
	InvalidRequest,
	#[error("Could not reach the backend service.")]
	Upstream(#[source] reqwest::Error),
	#[error("The backend service timed out.")]
	UpstreamTimeout,
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
			ProxyError::MethodUnsupported => StatusCode::METHOD_NOT_ALLOWED,
			ProxyError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
			ProxyError::Unauthenticated => StatusCode::UNAUTHORIZED,
			ProxyError::InvalidRequest => StatusCode::BAD_REQUEST,
			ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
		}
	}

	/// Gateway-introduced errors answer as `{"message": <string>}`.
	pub fn into_response(self) -> Response {
		let body = serde_json::json!({ "message": self.to_string() });
		::http::Response::builder()
			.status(self.status())
			.header(CONTENT_TYPE, "application/json")
			.body(Body::from(body.to_string()))
			.expect("static error response")
	}
}

impl From<reqwest::Error> for ProxyError {
	fn from(err: reqwest::Error) -> Self {
		if err.is_timeout() {
			ProxyError::UpstreamTimeout
		} else {
			ProxyError::Upstream(err)
		}
	}
}

/// The request-side core: matches, gates, forwards and streams back.
pub struct Gateway {
	registry: Arc<Registry>,
	authenticator: JwtAuthenticator,
	limiter: RateLimiter,
	audit: AuditSink,
	client: reqwest::Client,
}

impl Gateway {
	pub fn new(registry: Arc<Registry>, config: &Config, audit: AuditSink) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.timeout(Duration::from_secs(config.upstream_timeout_secs))
			.build()?;
		Ok(Gateway {
			registry,
			authenticator: JwtAuthenticator::new(&config.jwt),
			limiter: RateLimiter::new(config.rate_limit.clone()),
			audit,
			client,
		})
	}

	/// Per-request entrypoint. Errors never escape: each one is converted
	/// to its HTTP shape.
	pub async fn handle_request(&self, req: Request, source_ip: IpAddr) -> Response {
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		match self.forward(req, source_ip).await {
			Ok(response) => response,
			Err(err) => {
				debug!(%method, %path, %err, "request rejected");
				err.into_response()
			},
		}
	}

	async fn forward(&self, req: Request, source_ip: IpAddr) -> Result<Response, ProxyError> {
		let (api, endpoint) = matcher::match_request(
			&self.registry.snapshot(),
			req.method(),
			req.uri().path(),
		)
		.ok_or(ProxyError::RouteNotFound)?;

		let host = resolve_host(&api.proxy);
		let authority = format!("{}:{}", host_without_scheme(&host), api.proxy.port);

		if self.limiter.request_passage(&authority, source_ip) == Passage::Denied {
			return Err(ProxyError::RateLimited);
		}

		let subject = self.authorize(&api, &endpoint, &req)?;

		let base = if host.contains("://") {
			format!("{}:{}", host, api.proxy.port)
		} else {
			format!("http://{}:{}", host, api.proxy.port)
		};
		let path = req.uri().path().to_string();
		let url = format!("{base}{path}");

		let response = self.dispatch(req, &url).await?;

		if subject.audited {
			self.audit.publish(AuditEvent {
				api_id: api.id.clone(),
				endpoint_id: endpoint.id.clone(),
				method: endpoint.method.clone(),
				path,
				source_ip,
				timestamp: Utc::now(),
				token_subject: subject.token_subject,
			});
		}
		Ok(response)
	}

	/// Auth gate. Secured endpoints accept a request iff at least one
	/// presented token verifies.
	fn authorize(
		&self,
		api: &ApiDefinition,
		endpoint: &Endpoint,
		req: &Request,
	) -> Result<AuthOutcome, ProxyError> {
		if endpoint.not_secured || api.auth.auth_type == AuthType::None {
			return Ok(AuthOutcome {
				audited: false,
				token_subject: None,
			});
		}
		let claims = self
			.authenticator
			.authenticate(&api.auth, req.headers(), req.uri().query())
			.map_err(|_| ProxyError::Unauthenticated)?;
		Ok(AuthOutcome {
			audited: true,
			token_subject: claims.subject().map(str::to_string),
		})
	}

	async fn dispatch(&self, req: Request, url: &str) -> Result<Response, ProxyError> {
		let method = req.method().clone();
		let query = req.uri().query().map(str::to_string);
		let headers = req.headers().clone();

		let upstream = if matches!(method.as_str(), "GET" | "HEAD" | "OPTIONS" | "DELETE") {
			let url = match query.as_deref().map(reencode_query) {
				Some(Some(q)) if !q.is_empty() => format!("{url}?{q}"),
				_ => url.to_string(),
			};
			self
				.client
				.request(method, url)
				.headers(upstream_headers(&headers, false))
				.send()
				.await?
		} else if method == Method::POST && is_multipart(&headers) {
			let form = read_multipart(req).await?;
			self
				.client
				.post(url)
				.headers(upstream_headers(&headers, true))
				.multipart(form)
				.send()
				.await?
		} else if matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
			let content_type = headers
				.get(CONTENT_TYPE)
				.and_then(|v| v.to_str().ok())
				.unwrap_or("")
				.to_string();
			let bytes = axum::body::to_bytes(req.into_body(), BODY_LIMIT)
				.await
				.map_err(|_| ProxyError::InvalidRequest)?;
			let params = parse_params(&content_type, &bytes)?;
			self
				.client
				.request(method, url)
				.headers(upstream_headers(&headers, true))
				.json(&params)
				.send()
				.await?
		} else {
			return Err(ProxyError::MethodUnsupported);
		};

		stream_response(upstream).await
	}
}

struct AuthOutcome {
	audited: bool,
	token_subject: Option<String>,
}

fn resolve_host(proxy: &ProxySpec) -> String {
	if proxy.use_env {
		std::env::var(&proxy.target_url).unwrap_or_else(|_| "localhost".to_string())
	} else {
		proxy.target_url.clone()
	}
}

fn host_without_scheme(host: &str) -> &str {
	match host.find("://") {
		Some(idx) => &host[idx + 3..],
		None => host,
	}
}

/// Re-encode the request query onto the upstream URL. Bracketed keys like
/// `a[b]` survive the round trip, so nested parameter structures carry over.
fn reencode_query(query: &str) -> Option<String> {
	let pairs: Vec<(String, String)> = serde_urlencoded::from_str(query).ok()?;
	serde_urlencoded::to_string(&pairs).ok()
}

fn is_multipart(headers: &HeaderMap) -> bool {
	headers
		.get(CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|v| v.to_ascii_lowercase().starts_with("multipart/form-data"))
}

/// Parse the body the way it was declared and hand it on as JSON.
fn parse_params(content_type: &str, bytes: &[u8]) -> Result<Value, ProxyError> {
	if bytes.is_empty() {
		return Ok(Value::Object(Map::new()));
	}
	let content_type = content_type.to_ascii_lowercase();
	if content_type.contains("json") || content_type.is_empty() {
		return serde_json::from_slice(bytes).map_err(|_| ProxyError::InvalidRequest);
	}
	if content_type.contains("x-www-form-urlencoded") {
		let pairs: Vec<(String, String)> =
			serde_urlencoded::from_bytes(bytes).map_err(|_| ProxyError::InvalidRequest)?;
		let mut object = Map::new();
		for (key, value) in pairs {
			object.insert(key, Value::String(value));
		}
		return Ok(Value::Object(object));
	}
	Err(ProxyError::InvalidRequest)
}

/// Rebuild an upload as an outgoing multipart form: the `qqfile` part keeps
/// its filename and content type, every other field rides along as text.
async fn read_multipart(req: Request) -> Result<reqwest::multipart::Form, ProxyError> {
	let mut multipart = Multipart::from_request(req, &())
		.await
		.map_err(|_| ProxyError::InvalidRequest)?;
	let mut form = reqwest::multipart::Form::new();
	while let Some(field) = multipart
		.next_field()
		.await
		.map_err(|_| ProxyError::InvalidRequest)?
	{
		let name = field.name().unwrap_or_default().to_string();
		if name == FILE_PART || field.file_name().is_some() {
			let file_name = field.file_name().unwrap_or(FILE_PART).to_string();
			let content_type = field.content_type().map(str::to_string);
			let data = field.bytes().await.map_err(|_| ProxyError::InvalidRequest)?;
			let mut part = reqwest::multipart::Part::bytes(data.to_vec()).file_name(file_name);
			if let Some(content_type) = content_type {
				part = part
					.mime_str(&content_type)
					.map_err(|_| ProxyError::InvalidRequest)?;
			}
			form = form.part(name, part);
		} else {
			let value = field.text().await.map_err(|_| ProxyError::InvalidRequest)?;
			form = form.text(name, value);
		}
	}
	Ok(form)
}

/// Request headers forwarded upstream. Hop-by-hop and framing headers are
/// dropped; when the client rebuilds the body it also owns the content type.
fn upstream_headers(headers: &HeaderMap, rebuilt_body: bool) -> HeaderMap {
	let mut forwarded = HeaderMap::new();
	for (name, value) in headers {
		if [HOST, CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION].contains(name) {
			continue;
		}
		if rebuilt_body && *name == CONTENT_TYPE {
			continue;
		}
		forwarded.append(name.clone(), value.clone());
	}
	forwarded
}

/// True when the upstream declares chunked transfer, matching `chunked` as
/// a case-insensitive substring across all header values.
fn wants_streaming(headers: &HeaderMap) -> bool {
	headers
		.get_all(TRANSFER_ENCODING)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.any(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// Relay the upstream response: chunked upstreams are streamed through,
/// everything else is answered in one shot.
async fn stream_response(upstream: reqwest::Response) -> Result<Response, ProxyError> {
	let status = upstream.status();
	let streaming = wants_streaming(upstream.headers());

	let mut builder = ::http::Response::builder().status(status);
	if let Some(headers) = builder.headers_mut() {
		for (name, value) in upstream.headers() {
			if *name == TRANSFER_ENCODING || (streaming && *name == CONTENT_LENGTH) {
				continue;
			}
			headers.append(name.clone(), value.clone());
		}
	}

	let body = if streaming {
		Body::from_stream(upstream.bytes_stream())
	} else {
		Body::from(upstream.bytes().await?)
	};
	builder.body(body).map_err(|err| {
		warn!(%err, "failed to assemble upstream response");
		ProxyError::InvalidRequest
	})
}
