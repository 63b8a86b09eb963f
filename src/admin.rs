use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::registry::{Registry, RegistryError};
use crate::types::ApiDefinition;

/// Management surface for the local node: CRUD on API definitions plus a
/// health probe. Mutations replicate to the cluster through the tracker.
#[derive(Clone)]
pub struct App {
	registry: Arc<Registry>,
}

impl App {
	pub fn new(registry: Arc<Registry>) -> Self {
		Self { registry }
	}

	pub fn router(&self) -> Router {
		Router::new()
			.route("/healthz", get(|| async { "ok" }))
			.route("/apis", get(list_handler))
			.route(
				"/apis/{id}",
				get(get_handler)
					.post(add_handler)
					.put(update_handler)
					.delete(delete_handler),
			)
			.with_state(self.clone())
	}
}

fn error_response(err: RegistryError) -> Response {
	let status = match err {
		RegistryError::AlreadyTracked => StatusCode::CONFLICT,
		RegistryError::NotFound => StatusCode::NOT_FOUND,
	};
	(status, Json(json!({ "message": err.to_string() }))).into_response()
}

async fn list_handler(State(app): State<App>) -> Json<Vec<ApiDefinition>> {
	Json(app.registry.list_apis())
}

async fn get_handler(State(app): State<App>, Path(id): Path<String>) -> Response {
	match app.registry.get_api(&id) {
		Some(api) => Json(api).into_response(),
		None => error_response(RegistryError::NotFound),
	}
}

async fn add_handler(
	State(app): State<App>,
	Path(id): Path<String>,
	Json(def): Json<ApiDefinition>,
) -> Response {
	match app.registry.add_api(&id, def).await {
		Ok(()) => (StatusCode::CREATED, Json(app.registry.get_api(&id))).into_response(),
		Err(err) => error_response(err),
	}
}

async fn update_handler(
	State(app): State<App>,
	Path(id): Path<String>,
	Json(def): Json<ApiDefinition>,
) -> Response {
	match app.registry.update_api(&id, def).await {
		Ok(()) => Json(app.registry.get_api(&id)).into_response(),
		Err(err) => error_response(err),
	}
}

async fn delete_handler(State(app): State<App>, Path(id): Path<String>) -> Response {
	match app.registry.delete_api(&id).await {
		Ok(()) => StatusCode::NO_CONTENT.into_response(),
		Err(err) => error_response(err),
	}
}

#[cfg(test)]
mod tests {
	use axum::body::Body;
	use http::Request;
	use tower::ServiceExt;

	use super::*;
	use crate::tracker::PresenceTracker;
	use crate::types::test_support::api;

	fn app() -> App {
		let (tracker, _events) = PresenceTracker::new("node-a");
		App::new(Arc::new(Registry::new("node-a", Arc::new(tracker))))
	}

	async fn send(app: &App, request: Request<Body>) -> (StatusCode, serde_json::Value) {
		let response = app.router().oneshot(request).await.unwrap();
		let status = response.status();
		let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
			.await
			.unwrap();
		let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
		(status, value)
	}

	fn add_request(id: &str) -> Request<Body> {
		let def = serde_json::to_string(&api(id, "ignored", 0)).unwrap();
		Request::builder()
			.method("POST")
			.uri(format!("/apis/{id}"))
			.header("content-type", "application/json")
			.body(Body::from(def))
			.unwrap()
	}

	#[tokio::test]
	async fn add_list_get_delete_round_trip() {
		let app = app();

		let (status, body) = send(&app, add_request("movies")).await;
		assert_eq!(status, StatusCode::CREATED);
		assert_eq!(body["id"], "movies");
		assert_eq!(body["nodeName"], "node-a");

		let (status, body) = send(
			&app,
			Request::builder()
				.uri("/apis")
				.body(Body::empty())
				.unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body.as_array().unwrap().len(), 1);

		let (status, body) = send(
			&app,
			Request::builder()
				.uri("/apis/movies")
				.body(Body::empty())
				.unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["refNumber"], 0);

		let (status, _) = send(
			&app,
			Request::builder()
				.method("DELETE")
				.uri("/apis/movies")
				.body(Body::empty())
				.unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::NO_CONTENT);

		let (status, body) = send(
			&app,
			Request::builder()
				.uri("/apis/movies")
				.body(Body::empty())
				.unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::NOT_FOUND);
		assert_eq!(body["message"], "api not found");
	}

	#[tokio::test]
	async fn duplicate_add_answers_409() {
		let app = app();
		let (status, _) = send(&app, add_request("movies")).await;
		assert_eq!(status, StatusCode::CREATED);
		let (status, body) = send(&app, add_request("movies")).await;
		assert_eq!(status, StatusCode::CONFLICT);
		assert_eq!(body["message"], "api is already tracked");
	}

	#[tokio::test]
	async fn update_bumps_the_ref_number() {
		let app = app();
		send(&app, add_request("movies")).await;

		let def = serde_json::to_string(&api("movies", "ignored", 0)).unwrap();
		let (status, body) = send(
			&app,
			Request::builder()
				.method("PUT")
				.uri("/apis/movies")
				.header("content-type", "application/json")
				.body(Body::from(def))
				.unwrap(),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["refNumber"], 1);
	}

	#[tokio::test]
	async fn healthz_answers_ok() {
		let app = app();
		let response = app
			.router()
			.oneshot(
				Request::builder()
					.uri("/healthz")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
	}
}
