use std::net::IpAddr;

use chrono::{DateTime, Utc};
use http::Method;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One authenticated forwarded request. Fire-and-forget: the request path
/// only enqueues, the sink task owns delivery.
#[derive(Clone, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
	pub api_id: String,
	pub endpoint_id: String,
	#[serde(with = "http_serde::method")]
	pub method: Method,
	pub path: String,
	pub source_ip: IpAddr,
	pub timestamp: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub token_subject: Option<String>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditConfig {
	pub topic: String,
	/// Bounded queue depth between request handlers and the sink task.
	/// When the sink lags behind, the oldest events are dropped first.
	pub queue: usize,
}

impl Default for AuditConfig {
	fn default() -> Self {
		AuditConfig {
			topic: "gateway-audit-log".to_string(),
			queue: 512,
		}
	}
}

/// Handle the forwarder publishes through. Backed by a broadcast channel:
/// sends never block, and a slow consumer loses the oldest entries rather
/// than stalling request handling.
#[derive(Clone)]
pub struct AuditSink {
	tx: broadcast::Sender<AuditEvent>,
}

impl AuditSink {
	pub fn new(queue: usize) -> (Self, broadcast::Receiver<AuditEvent>) {
		let (tx, rx) = broadcast::channel(queue.max(1));
		(AuditSink { tx }, rx)
	}

	pub fn publish(&self, event: AuditEvent) {
		// Err means no consumer is attached; auditing is best-effort.
		let _ = self.tx.send(event);
	}
}

/// Drain the audit queue into the writer until cancelled. Lag and delivery
/// failures are logged and dropped, never surfaced to request handling.
pub async fn run_sink(
	mut rx: broadcast::Receiver<AuditEvent>,
	writer: KafkaAuditWriter,
	ct: CancellationToken,
) {
	loop {
		tokio::select! {
			_ = ct.cancelled() => {
				info!("audit sink cancelled");
				return;
			},
			event = rx.recv() => {
				match event {
					Ok(event) => {
						if let Err(err) = writer.write(&event).await {
							warn!(%err, "failed to deliver audit event");
						}
					},
					Err(broadcast::error::RecvError::Lagged(n)) => {
						warn!(dropped = n, "audit sink lagged, oldest events dropped");
					},
					Err(broadcast::error::RecvError::Closed) => return,
				}
			},
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum AuditError {
	#[error("failed to serialize audit event: {0}")]
	Serialization(#[from] serde_json::Error),
	#[cfg(feature = "kafka")]
	#[error("kafka delivery failed: {0}")]
	Kafka(String),
}

/// Kafka-backed writer. Brokers come from `KAFKA_HOSTS`; without the
/// `kafka` feature (or the variable) events are drained to the log so the
/// gateway behaves identically with and without a broker.
pub struct KafkaAuditWriter {
	topic: String,
	#[cfg(feature = "kafka")]
	producer: Option<rdkafka::producer::FutureProducer>,
}

impl KafkaAuditWriter {
	#[cfg(feature = "kafka")]
	pub fn from_env(config: &AuditConfig) -> anyhow::Result<Self> {
		use rdkafka::ClientConfig;

		let producer = match std::env::var("KAFKA_HOSTS") {
			Ok(hosts) => Some(
				ClientConfig::new()
					.set("bootstrap.servers", hosts)
					.create()?,
			),
			Err(_) => {
				info!("KAFKA_HOSTS unset, audit events will be logged only");
				None
			},
		};
		Ok(KafkaAuditWriter {
			topic: config.topic.clone(),
			producer,
		})
	}

	#[cfg(not(feature = "kafka"))]
	pub fn from_env(config: &AuditConfig) -> anyhow::Result<Self> {
		Ok(KafkaAuditWriter {
			topic: config.topic.clone(),
		})
	}

	pub async fn write(&self, event: &AuditEvent) -> Result<(), AuditError> {
		let payload = serde_json::to_vec(event)?;

		#[cfg(feature = "kafka")]
		if let Some(producer) = &self.producer {
			use rdkafka::producer::FutureRecord;
			use std::time::Duration;

			let record = FutureRecord::to(&self.topic)
				.key(&event.api_id)
				.payload(&payload);
			if let Err((err, _)) = producer.send(record, Duration::from_secs(5)).await {
				return Err(AuditError::Kafka(err.to_string()));
			}
			return Ok(());
		}

		info!(
			topic = %self.topic,
			event = %String::from_utf8_lossy(&payload),
			"audit event"
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn event(path: &str) -> AuditEvent {
		AuditEvent {
			api_id: "movies".to_string(),
			endpoint_id: "get:/myapi/movies".to_string(),
			method: Method::GET,
			path: path.to_string(),
			source_ip: IpAddr::from([1, 2, 3, 4]),
			timestamp: Utc::now(),
			token_subject: Some("john.doe".to_string()),
		}
	}

	#[test]
	fn serializes_with_wire_names() {
		let value = serde_json::to_value(event("/myapi/movies")).unwrap();
		assert_eq!(value["apiId"], "movies");
		assert_eq!(value["method"], "GET");
		assert_eq!(value["sourceIp"], "1.2.3.4");
		assert_eq!(value["tokenSubject"], "john.doe");
	}

	#[test]
	fn subject_is_omitted_when_absent() {
		let mut e = event("/myapi/movies");
		e.token_subject = None;
		let value = serde_json::to_value(e).unwrap();
		assert!(value.get("tokenSubject").is_none());
	}

	#[tokio::test]
	async fn slow_consumer_drops_oldest_events() {
		let (sink, mut rx) = AuditSink::new(2);
		for i in 0..4 {
			sink.publish(event(&format!("/r/{i}")));
		}
		assert!(matches!(
			rx.recv().await,
			Err(broadcast::error::RecvError::Lagged(2))
		));
		assert_eq!(rx.recv().await.unwrap().path, "/r/2");
		assert_eq!(rx.recv().await.unwrap().path, "/r/3");
	}

	#[tokio::test]
	async fn publish_without_consumer_is_a_noop() {
		let (sink, rx) = AuditSink::new(2);
		drop(rx);
		sink.publish(event("/r/0"));
	}
}
