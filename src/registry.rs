use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::tracker::{PresenceEvent, Tracker, TrackerError};
use crate::types::ApiDefinition;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
	#[error("api is already tracked")]
	AlreadyTracked,
	#[error("api not found")]
	NotFound,
}

/// Per-node authoritative view of the API definitions. All mutations are
/// serialized behind one writer lock; the matcher hot path reads a snapshot
/// map that is republished after each mutation and never waits on tracker
/// traffic.
pub struct Registry {
	node: String,
	tracker: Arc<dyn Tracker>,
	local: RwLock<BTreeMap<String, ApiDefinition>>,
	write: Mutex<()>,
}

impl Registry {
	pub fn new(node: impl Into<String>, tracker: Arc<dyn Tracker>) -> Self {
		Registry {
			node: node.into(),
			tracker,
			local: RwLock::new(BTreeMap::new()),
			write: Mutex::new(()),
		}
	}

	pub fn node(&self) -> &str {
		&self.node
	}

	/// Snapshot of all local replicas, in lexicographic `api_id` order.
	pub fn list_apis(&self) -> Vec<ApiDefinition> {
		self
			.local
			.read()
			.expect("registry lock poisoned")
			.values()
			.cloned()
			.collect()
	}

	/// The local replica, or `None` when this node does not host the API.
	pub fn get_api(&self, id: &str) -> Option<ApiDefinition> {
		self
			.local
			.read()
			.expect("registry lock poisoned")
			.get(id)
			.cloned()
	}

	/// Snapshot map handed to the matcher. `BTreeMap` keeps iteration
	/// order stable across nodes.
	pub fn snapshot(&self) -> BTreeMap<String, ApiDefinition> {
		self.local.read().expect("registry lock poisoned").clone()
	}

	fn publish(&self, id: &str, def: ApiDefinition) {
		self
			.local
			.write()
			.expect("registry lock poisoned")
			.insert(id.to_string(), def);
	}

	fn withdraw(&self, id: &str) {
		self
			.local
			.write()
			.expect("registry lock poisoned")
			.remove(id);
	}

	/// Attach this node's identity and announce the definition. Fails when
	/// the tracker already holds `(id, self)`.
	pub async fn add_api(&self, id: &str, mut def: ApiDefinition) -> Result<(), RegistryError> {
		let _guard = self.write.lock().await;
		def.id = id.to_string();
		def.node_name = self.node.clone();
		def.ref_number = 0;
		def.timestamp = Utc::now();
		let phx_ref = match self.tracker.track(id, def.clone()).await {
			Ok(phx_ref) => phx_ref,
			Err(TrackerError::AlreadyTracked) => return Err(RegistryError::AlreadyTracked),
			Err(TrackerError::NotTracked) => return Err(RegistryError::NotFound),
		};
		def.phx_ref = Some(phx_ref);
		info!(api = id, "api added");
		self.publish(id, def);
		Ok(())
	}

	/// Bump the logical version and re-announce.
	pub async fn update_api(&self, id: &str, mut def: ApiDefinition) -> Result<(), RegistryError> {
		let _guard = self.write.lock().await;
		let local = self
			.tracker
			.find_by_node(id, &self.node)
			.await
			.ok_or(RegistryError::NotFound)?;
		def.id = id.to_string();
		def.node_name = self.node.clone();
		def.ref_number = local.ref_number + 1;
		def.timestamp = Utc::now();
		let phx_ref = match self.tracker.update(id, def.clone()).await {
			Ok(phx_ref) => phx_ref,
			Err(_) => return Err(RegistryError::NotFound),
		};
		def.phx_ref = Some(phx_ref);
		info!(api = id, ref_number = def.ref_number, "api updated");
		self.publish(id, def);
		Ok(())
	}

	pub async fn delete_api(&self, id: &str) -> Result<(), RegistryError> {
		let _guard = self.write.lock().await;
		if self.tracker.find_by_node(id, &self.node).await.is_none() {
			return Err(RegistryError::NotFound);
		}
		self.tracker.untrack(id).await;
		info!(api = id, "api deleted");
		self.withdraw(id);
		Ok(())
	}

	/// Reconcile a join announced anywhere in the cluster. The rule is
	/// monotone on `ref_number`; at equal refs a strict majority of matching
	/// replicas wins, and an exact half falls back to the newer wall-clock
	/// timestamp.
	pub async fn on_join(&self, id: &str, incoming: ApiDefinition) {
		let _guard = self.write.lock().await;
		let local = self.tracker.find_by_node(id, &self.node).await;
		let Some(local) = local else {
			// Nothing held here yet: bootstrap from the peer's replica,
			// keeping its ref_number and node_name.
			match self.tracker.track(id, incoming.clone()).await {
				Ok(phx_ref) => {
					let mut def = incoming;
					def.phx_ref = Some(phx_ref);
					info!(api = id, node = %def.node_name, "adopted api from peer");
					self.publish(id, def);
				},
				// Raced with another announcement of the same id; the
				// follow-up join event reconciles it.
				Err(err) => debug!(api = id, %err, "skipping join"),
			}
			return;
		};

		if local.ref_number > incoming.ref_number {
			debug!(api = id, "join skipped, local replica is newer");
			return;
		}
		if local.ref_number == incoming.ref_number {
			if local.same_definition(&incoming) {
				return;
			}
			let replicas = self.tracker.find_all(id).await;
			let total = replicas.len();
			let matching = replicas
				.iter()
				.filter(|r| r.same_definition(&incoming))
				.count();
			let adopt = if 2 * matching > total {
				true
			} else if 2 * matching < total {
				false
			} else {
				incoming.timestamp > local.timestamp
			};
			if !adopt {
				debug!(
					api = id,
					matching, total, "join skipped, no quorum for incoming definition"
				);
				return;
			}
			info!(api = id, matching, total, "join accepted by quorum");
		} else {
			info!(
				api = id,
				local = local.ref_number,
				incoming = incoming.ref_number,
				"join accepted, incoming replica is newer"
			);
		}

		match self.tracker.update(id, incoming.clone()).await {
			Ok(phx_ref) => {
				let mut def = incoming;
				def.phx_ref = Some(phx_ref);
				self.publish(id, def);
			},
			Err(err) => warn!(api = id, %err, "tracker update failed during join"),
		}
	}

	/// Reconcile a leave. The presence token guards against stale leaves: a
	/// replica is only withdrawn for a matching token, or when the departing
	/// foreign replica is genuinely gone from the cluster view.
	pub async fn on_leave(&self, id: &str, departing: ApiDefinition) {
		let _guard = self.write.lock().await;
		let Some(local) = self.tracker.find_by_node(id, &self.node).await else {
			return;
		};
		let withdraw = if departing.node_name == self.node {
			departing.phx_ref == local.phx_ref
		} else {
			let foreign_gone = self
				.tracker
				.find_by_node(id, &departing.node_name)
				.await
				.is_none();
			local.phx_ref == departing.phx_ref || foreign_gone
		};
		if !withdraw {
			debug!(api = id, node = %departing.node_name, "stale leave ignored");
			return;
		}
		info!(api = id, node = %departing.node_name, "api withdrawn on leave");
		self.tracker.untrack(id).await;
		self.withdraw(id);
	}
}

/// Drains tracker callbacks into the registry until cancelled. Errors never
/// escape: each event is an idempotent reconciliation.
pub async fn run_presence_loop(
	registry: Arc<Registry>,
	mut events: mpsc::UnboundedReceiver<PresenceEvent>,
	ct: CancellationToken,
) {
	loop {
		tokio::select! {
			_ = ct.cancelled() => {
				info!("presence loop cancelled");
				return;
			},
			event = events.recv() => {
				match event {
					Some(PresenceEvent::Join { id, meta }) => registry.on_join(&id, meta).await,
					Some(PresenceEvent::Leave { id, meta }) => registry.on_leave(&id, meta).await,
					None => return,
				}
			},
		}
	}
}
