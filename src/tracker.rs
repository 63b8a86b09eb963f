use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use textnonce::TextNonce;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::ApiDefinition;

/// Presence change delivered to the registry. Events may arrive for local or
/// foreign replicas, possibly more than once; the registry reconciles
/// idempotently.
#[derive(Clone, Debug)]
pub enum PresenceEvent {
	Join { id: String, meta: ApiDefinition },
	Leave { id: String, meta: ApiDefinition },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TrackerError {
	#[error("already tracked")]
	AlreadyTracked,
	#[error("not tracked")]
	NotTracked,
}

/// Cluster-wide presence map of `(api_id, node) -> definition`. The cluster
/// transport is not the registry's concern: it talks to this contract only.
#[async_trait]
pub trait Tracker: Send + Sync {
	/// Announce a local replica. Fails if `(api_id, self)` is already
	/// tracked. Returns the presence token assigned to the replica.
	async fn track(&self, id: &str, meta: ApiDefinition) -> Result<String, TrackerError>;

	/// Withdraw the local replica.
	async fn untrack(&self, id: &str);

	/// Replace the metadata of the local replica, assigning a fresh
	/// presence token.
	async fn update(&self, id: &str, meta: ApiDefinition) -> Result<String, TrackerError>;

	async fn list_by_node(&self, node: &str) -> Vec<ApiDefinition>;

	async fn find_by_node(&self, id: &str, node: &str) -> Option<ApiDefinition>;

	/// Every replica of `id` across the cluster.
	async fn find_all(&self, id: &str) -> Vec<ApiDefinition>;
}

/// In-memory tracker for one node. A gossip layer feeds foreign presence in
/// through [`PresenceTracker::apply_remote_join`] and
/// [`PresenceTracker::apply_remote_leave`]; local announcements go through
/// the [`Tracker`] operations.
pub struct PresenceTracker {
	node: String,
	// api_id -> node_name -> definition
	replicas: RwLock<HashMap<String, BTreeMap<String, ApiDefinition>>>,
	events: mpsc::UnboundedSender<PresenceEvent>,
}

impl PresenceTracker {
	pub fn new(node: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<PresenceEvent>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(
			PresenceTracker {
				node: node.into(),
				replicas: RwLock::new(HashMap::new()),
				events: tx,
			},
			rx,
		)
	}

	pub fn node(&self) -> &str {
		&self.node
	}

	fn emit(&self, event: PresenceEvent) {
		// The receiver dropping means the registry is shutting down.
		let _ = self.events.send(event);
	}

	fn fresh_ref() -> String {
		TextNonce::new().into_string()
	}

	/// Inject a foreign join observed by the cluster layer. Duplicate
	/// deliveries overwrite the same slot and re-emit the event.
	pub fn apply_remote_join(&self, id: &str, meta: ApiDefinition) {
		debug!(api = id, node = %meta.node_name, "remote join");
		self
			.replicas
			.write()
			.expect("tracker lock poisoned")
			.entry(id.to_string())
			.or_default()
			.insert(meta.node_name.clone(), meta.clone());
		self.emit(PresenceEvent::Join {
			id: id.to_string(),
			meta,
		});
	}

	/// Inject a foreign leave. The stored replica is only dropped when its
	/// presence token matches the departing one, so a stale leave cannot
	/// clobber a newer announcement; the event is delivered either way and
	/// the registry applies its own guard.
	pub fn apply_remote_leave(&self, id: &str, meta: ApiDefinition) {
		debug!(api = id, node = %meta.node_name, "remote leave");
		{
			let mut replicas = self.replicas.write().expect("tracker lock poisoned");
			if let Some(nodes) = replicas.get_mut(id) {
				let current = nodes.get(&meta.node_name).and_then(|m| m.phx_ref.clone());
				if current.is_none() || current == meta.phx_ref {
					nodes.remove(&meta.node_name);
					if nodes.is_empty() {
						replicas.remove(id);
					}
				}
			}
		}
		self.emit(PresenceEvent::Leave {
			id: id.to_string(),
			meta,
		});
	}
}

#[async_trait]
impl Tracker for PresenceTracker {
	async fn track(&self, id: &str, mut meta: ApiDefinition) -> Result<String, TrackerError> {
		let phx_ref = Self::fresh_ref();
		{
			let mut replicas = self.replicas.write().expect("tracker lock poisoned");
			let nodes = replicas.entry(id.to_string()).or_default();
			if nodes.contains_key(&self.node) {
				return Err(TrackerError::AlreadyTracked);
			}
			meta.phx_ref = Some(phx_ref.clone());
			nodes.insert(self.node.clone(), meta.clone());
		}
		self.emit(PresenceEvent::Join {
			id: id.to_string(),
			meta,
		});
		Ok(phx_ref)
	}

	async fn untrack(&self, id: &str) {
		let removed = {
			let mut replicas = self.replicas.write().expect("tracker lock poisoned");
			match replicas.get_mut(id) {
				Some(nodes) => {
					let removed = nodes.remove(&self.node);
					if nodes.is_empty() {
						replicas.remove(id);
					}
					removed
				},
				None => None,
			}
		};
		if let Some(meta) = removed {
			self.emit(PresenceEvent::Leave {
				id: id.to_string(),
				meta,
			});
		}
	}

	async fn update(&self, id: &str, mut meta: ApiDefinition) -> Result<String, TrackerError> {
		let phx_ref = Self::fresh_ref();
		{
			let mut replicas = self.replicas.write().expect("tracker lock poisoned");
			let nodes = replicas.get_mut(id).ok_or(TrackerError::NotTracked)?;
			if !nodes.contains_key(&self.node) {
				return Err(TrackerError::NotTracked);
			}
			meta.phx_ref = Some(phx_ref.clone());
			nodes.insert(self.node.clone(), meta.clone());
		}
		self.emit(PresenceEvent::Join {
			id: id.to_string(),
			meta,
		});
		Ok(phx_ref)
	}

	async fn list_by_node(&self, node: &str) -> Vec<ApiDefinition> {
		self
			.replicas
			.read()
			.expect("tracker lock poisoned")
			.values()
			.filter_map(|nodes| nodes.get(node).cloned())
			.collect()
	}

	async fn find_by_node(&self, id: &str, node: &str) -> Option<ApiDefinition> {
		self
			.replicas
			.read()
			.expect("tracker lock poisoned")
			.get(id)
			.and_then(|nodes| nodes.get(node).cloned())
	}

	async fn find_all(&self, id: &str) -> Vec<ApiDefinition> {
		self
			.replicas
			.read()
			.expect("tracker lock poisoned")
			.get(id)
			.map(|nodes| nodes.values().cloned().collect())
			.unwrap_or_default()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::test_support::api;

	#[tokio::test]
	async fn track_assigns_ref_and_rejects_duplicates() {
		let (tracker, mut rx) = PresenceTracker::new("node-a");
		let phx_ref = tracker.track("movies", api("movies", "node-a", 0)).await.unwrap();
		assert!(!phx_ref.is_empty());

		let stored = tracker.find_by_node("movies", "node-a").await.unwrap();
		assert_eq!(stored.phx_ref.as_deref(), Some(phx_ref.as_str()));

		assert_eq!(
			tracker.track("movies", api("movies", "node-a", 0)).await,
			Err(TrackerError::AlreadyTracked)
		);

		match rx.recv().await.unwrap() {
			PresenceEvent::Join { id, .. } => assert_eq!(id, "movies"),
			other => panic!("expected join, got {other:?}"),
		}
	}

	#[tokio::test]
	async fn update_replaces_meta_with_fresh_ref() {
		let (tracker, _rx) = PresenceTracker::new("node-a");
		let first = tracker.track("movies", api("movies", "node-a", 0)).await.unwrap();
		let second = tracker.update("movies", api("movies", "node-a", 1)).await.unwrap();
		assert_ne!(first, second);

		let stored = tracker.find_by_node("movies", "node-a").await.unwrap();
		assert_eq!(stored.ref_number, 1);

		tracker.untrack("movies").await;
		assert_eq!(
			tracker.update("movies", api("movies", "node-a", 2)).await,
			Err(TrackerError::NotTracked)
		);
	}

	#[tokio::test]
	async fn remote_join_and_leave_round_trip() {
		let (tracker, mut rx) = PresenceTracker::new("node-a");
		let mut foreign = api("movies", "node-b", 0);
		foreign.phx_ref = Some("ref-b".to_string());
		tracker.apply_remote_join("movies", foreign.clone());

		assert_eq!(tracker.find_all("movies").await.len(), 1);
		assert!(tracker.find_by_node("movies", "node-b").await.is_some());

		tracker.apply_remote_leave("movies", foreign);
		assert!(tracker.find_by_node("movies", "node-b").await.is_none());

		assert!(matches!(rx.recv().await, Some(PresenceEvent::Join { .. })));
		assert!(matches!(rx.recv().await, Some(PresenceEvent::Leave { .. })));
	}

	#[tokio::test]
	async fn stale_remote_leave_keeps_newer_replica() {
		let (tracker, _rx) = PresenceTracker::new("node-a");
		let mut current = api("movies", "node-b", 1);
		current.phx_ref = Some("ref-new".to_string());
		tracker.apply_remote_join("movies", current);

		let mut stale = api("movies", "node-b", 0);
		stale.phx_ref = Some("ref-old".to_string());
		tracker.apply_remote_leave("movies", stale);

		let kept = tracker.find_by_node("movies", "node-b").await.unwrap();
		assert_eq!(kept.phx_ref.as_deref(), Some("ref-new"));
	}

	#[tokio::test]
	async fn list_by_node_filters_on_author() {
		let (tracker, _rx) = PresenceTracker::new("node-a");
		tracker.track("movies", api("movies", "node-a", 0)).await.unwrap();
		tracker.apply_remote_join("shows", api("shows", "node-b", 0));

		assert_eq!(tracker.list_by_node("node-a").await.len(), 1);
		assert_eq!(tracker.list_by_node("node-b").await.len(), 1);
		assert_eq!(tracker.list_by_node("node-c").await.len(), 0);
	}
}
