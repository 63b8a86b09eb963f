use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::Response;
use tracing::info;

use crate::proxy::Gateway;

/// Thin adapter between the HTTP listener and the gateway core: every
/// method and path lands in [`Gateway::handle_request`].
#[derive(Clone)]
pub struct App {
	gateway: Arc<Gateway>,
}

impl App {
	pub fn new(gateway: Arc<Gateway>) -> Self {
		Self { gateway }
	}

	pub fn router(&self) -> Router {
		// No routes on purpose: every method and path falls through to the
		// gateway core.
		Router::new()
			.fallback(proxy_handler)
			.with_state(self.clone())
	}
}

async fn proxy_handler(
	State(app): State<App>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	req: Request,
) -> Response {
	app.gateway.handle_request(req, peer.ip()).await
}

pub async fn serve(listener: tokio::net::TcpListener, gateway: Arc<Gateway>) -> anyhow::Result<()> {
	info!("proxy listening on {}", listener.local_addr()?);
	let app = App::new(gateway);
	let svc = app
		.router()
		.into_make_service_with_connect_info::<SocketAddr>();
	axum::serve(listener, svc).await?;
	Ok(())
}
