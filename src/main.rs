use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{self, EnvFilter};

use edgegate::admin::App as AdminApp;
use edgegate::audit::{AuditSink, KafkaAuditWriter, run_sink};
use edgegate::config::Config;
use edgegate::inbound;
use edgegate::proxy::Gateway;
use edgegate::registry::{Registry, run_presence_loop};
use edgegate::tracker::PresenceTracker;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Config file: gateway settings, or a bare JSON array of route records
	#[arg(short, long, value_name = "file")]
	file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let cfg = match &args.file {
		Some(path) => Config::load(path)?,
		None => {
			warn!("no config file given, starting with an empty registry");
			Config::default()
		},
	};

	let ct = CancellationToken::new();
	let (tracker, events) = PresenceTracker::new(cfg.node_name.clone());
	let tracker = Arc::new(tracker);
	let registry = Arc::new(Registry::new(cfg.node_name.clone(), tracker.clone()));

	let mut run_set = JoinSet::new();
	run_set.spawn(run_presence_loop(registry.clone(), events, ct.clone()));

	for api in cfg.seed_apis(&cfg.node_name) {
		let id = api.id.clone();
		match registry.add_api(&id, api).await {
			Ok(()) => info!(api = %id, "seeded api"),
			Err(err) => warn!(api = %id, %err, "failed to seed api"),
		}
	}

	let (audit, audit_rx) = AuditSink::new(cfg.audit.queue);
	let writer = KafkaAuditWriter::from_env(&cfg.audit)?;
	run_set.spawn(run_sink(audit_rx, writer, ct.clone()));

	let gateway = Arc::new(Gateway::new(registry.clone(), &cfg, audit)?);

	let proxy_listener = tokio::net::TcpListener::bind(cfg.listen).await?;
	run_set.spawn(async move {
		if let Err(err) = inbound::serve(proxy_listener, gateway).await {
			warn!(%err, "proxy listener failed");
		}
	});

	let admin_listener = tokio::net::TcpListener::bind(cfg.admin_listen).await?;
	info!("admin listening on {}", cfg.admin_listen);
	let admin = AdminApp::new(registry).router();
	run_set.spawn(async move {
		if let Err(err) = axum::serve(admin_listener, admin).await {
			warn!(%err, "admin listener failed");
		}
	});

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			info!("shutting down");
			ct.cancel();
		},
		result = run_set.join_next() => {
			if let Some(Err(err)) = result {
				warn!(%err, "task exited unexpectedly");
			}
			ct.cancel();
		},
	}
	run_set.shutdown().await;
	Ok(())
}
