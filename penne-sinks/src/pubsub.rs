// Copyright 2025 Penne Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Google Cloud Pub/Sub sink.
//!
//! Publishes the pipe-delimited [`ChangeRecord`] of each event to a topic
//! and reports the event delivered once the server returned a message id.
//! The topic and a subscription on it are created at startup if missing.

use crate::record::ChangeRecord;
use async_trait::async_trait;
use chrono_tz::Tz;
use google_cloud_googleapis::pubsub::v1::PubsubMessage;
use google_cloud_pubsub::client::{Client, ClientConfig};
use google_cloud_pubsub::publisher::Publisher;
use google_cloud_pubsub::subscription::SubscriptionConfig;
use penne_core::event::ChangeEvent;
use penne_core::sink::{Delivery, SinkAdapter, SinkError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace};

/// Registry name of this sink.
pub const SINK_NAME: &str = "pubsub";

/// Ack deadline of a subscription created at startup.
pub const SUBSCRIPTION_ACK_DEADLINE_SECS: i32 = 60;

/// Message retention of a subscription created at startup.
pub const SUBSCRIPTION_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for [`PubSubSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubConfig {
    /// GCP project owning the topic
    pub project_id: String,
    /// Topic id
    pub topic: String,
    /// Subscription id ensured on the topic
    pub subscription: String,
    /// Zone for the cluster time column
    pub time_zone: Tz,
}

impl PubSubConfig {
    /// Topic named after the database and subscription named after the
    /// collection, unless overridden.
    ///
    /// # Errors
    ///
    /// Returns an error if the project or either resolved name is empty.
    pub fn resolve(
        project_id: impl Into<String>,
        topic: Option<String>,
        subscription: Option<String>,
        database: &str,
        collection: &str,
        time_zone: Tz,
    ) -> Result<Self, String> {
        let project_id = project_id.into();
        if project_id.trim().is_empty() {
            return Err("GCP project id is required".to_string());
        }
        let topic = topic
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| database.to_string());
        let subscription = subscription
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| collection.to_string());
        if topic.is_empty() || subscription.is_empty() {
            return Err("Pub/Sub topic and subscription names must not be empty".to_string());
        }
        Ok(Self {
            project_id,
            topic,
            subscription,
            time_zone,
        })
    }
}

/// Publishing side of the sink.
#[async_trait]
pub trait PublishApi: Send + Sync {
    /// Publishes one message and waits for its server-assigned id.
    async fn publish(&self, data: Vec<u8>) -> Result<String, SinkError>;

    /// Flushes and stops background publishing.
    async fn shutdown(&self) {}
}

/// [`PublishApi`] over the Pub/Sub client's batching publisher.
pub struct TopicPublisher {
    publisher: Publisher,
}

#[async_trait]
impl PublishApi for TopicPublisher {
    async fn publish(&self, data: Vec<u8>) -> Result<String, SinkError> {
        let message = PubsubMessage {
            data,
            ..Default::default()
        };
        let awaiter = self.publisher.publish(message).await;
        awaiter
            .get()
            .await
            .map_err(|status| SinkError::write_msg(format!("Pub/Sub publish failed: {status}"), true))
    }

    async fn shutdown(&self) {
        let mut publisher = self.publisher.clone();
        publisher.shutdown().await;
    }
}

/// Publishes one Pub/Sub message per event.
pub struct PubSubSink {
    config: PubSubConfig,
    api: Arc<dyn PublishApi>,
}

impl std::fmt::Debug for PubSubSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubSink").field("config", &self.config).finish_non_exhaustive()
    }
}

impl PubSubSink {
    /// Connects with Application Default Credentials, ensures the topic
    /// and subscription exist and starts a publisher.
    ///
    /// # Errors
    ///
    /// Returns a connection error if authentication or the client fails,
    /// or a write error if the topic or subscription cannot be created.
    pub async fn new(config: PubSubConfig) -> Result<Self, SinkError> {
        let client_config = ClientConfig {
            project_id: Some(config.project_id.clone()),
            ..Default::default()
        }
        .with_auth()
        .await
        .map_err(|e| SinkError::connection_msg(format!("Pub/Sub authentication failed: {e}")))?;
        let client = Client::new(client_config)
            .await
            .map_err(|e| SinkError::connection_msg(format!("Pub/Sub client failed: {e}")))?;

        let topic = client.topic(&config.topic);
        let topic_exists = topic
            .exists(None)
            .await
            .map_err(|e| SinkError::connection_msg(format!("failed to check topic existence: {e}")))?;
        if !topic_exists {
            info!(topic = %config.topic, "Topic does not exist, creating it");
            topic
                .create(None, None)
                .await
                .map_err(|e| SinkError::write_msg(format!("failed to create topic: {e}"), false))?;
        }

        let subscription = client.subscription(&config.subscription);
        let subscription_exists = subscription.exists(None).await.map_err(|e| {
            SinkError::connection_msg(format!("failed to check subscription existence: {e}"))
        })?;
        if !subscription_exists {
            info!(subscription = %config.subscription, "Subscription does not exist, creating it");
            let subscription_config = SubscriptionConfig {
                ack_deadline_seconds: SUBSCRIPTION_ACK_DEADLINE_SECS,
                message_retention_duration: Some(SUBSCRIPTION_RETENTION),
                ..Default::default()
            };
            subscription
                .create(topic.fully_qualified_name(), subscription_config, None)
                .await
                .map_err(|e| SinkError::write_msg(format!("failed to create subscription: {e}"), false))?;
        }

        let publisher = topic.new_publisher(None);
        info!(
            project = %config.project_id,
            topic = %config.topic,
            subscription = %config.subscription,
            "Pub/Sub sink initialized"
        );
        Ok(Self::with_api(config, Arc::new(TopicPublisher { publisher })))
    }

    /// Builds a sink on top of an explicit publisher.
    pub fn with_api(config: PubSubConfig, api: Arc<dyn PublishApi>) -> Self {
        Self { config, api }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }
}

#[async_trait]
impl SinkAdapter for PubSubSink {
    fn name(&self) -> &str {
        SINK_NAME
    }

    async fn deliver(&self, event: &ChangeEvent) -> Result<Delivery, SinkError> {
        let line = ChangeRecord::from_event(event, self.config.time_zone).to_pipe_line();
        let message_id = self.api.publish(line.into_bytes()).await?;
        trace!(topic = %self.config.topic, message_id = %message_id, "Published change record");
        Ok(Delivery::Delivered)
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.api.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use penne_core::event::{Namespace, OperationType};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        messages: Mutex<Vec<Vec<u8>>>,
        shut_down: AtomicBool,
    }

    #[async_trait]
    impl PublishApi for RecordingPublisher {
        async fn publish(&self, data: Vec<u8>) -> Result<String, SinkError> {
            let mut messages = self.messages.lock().unwrap();
            messages.push(data);
            Ok(messages.len().to_string())
        }

        async fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn names_default_to_namespace() {
        let config = PubSubConfig::resolve("proj", None, Some(" ".to_string()), "shop", "orders", Tz::UTC)
            .unwrap();
        assert_eq!(config.topic, "shop");
        assert_eq!(config.subscription, "orders");

        let config = PubSubConfig::resolve("proj", Some("cdc".to_string()), None, "shop", "orders", Tz::UTC)
            .unwrap();
        assert_eq!(config.topic, "cdc");
    }

    #[test]
    fn project_is_required() {
        assert!(PubSubConfig::resolve("", None, None, "shop", "orders", Tz::UTC).is_err());
    }

    #[tokio::test]
    async fn publishes_record_without_trailing_newline() {
        let publisher = Arc::new(RecordingPublisher::default());
        let config = PubSubConfig::resolve("proj", None, None, "shop", "orders", Tz::UTC).unwrap();
        let sink = PubSubSink::with_api(config, Arc::clone(&publisher) as Arc<dyn PublishApi>);

        let event = ChangeEvent::new("00000", OperationType::Delete, Namespace::new("shop", "orders"));
        assert_eq!(sink.deliver(&event).await.unwrap(), Delivery::Delivered);
        sink.close().await.unwrap();

        let messages = publisher.messages.lock().unwrap();
        let text = std::str::from_utf8(&messages[0]).unwrap();
        assert!(text.starts_with(r#"{"_data":"00000"}|delete|"#));
        assert!(!text.ends_with('\n'));
        assert!(publisher.shut_down.load(Ordering::SeqCst));
    }
}
