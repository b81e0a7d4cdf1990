//! Topic subscription consumer over the broker's REST peek-lock API.
//!
//! `POST .../messages/head` locks the next message (201) or reports an empty
//! subscription (204). The lock URI returned in `Location` is then deleted to
//! complete the message or unlocked with `PUT` to abandon it. A bodiless
//! `POST` to the same URI extends the lock while a scan is still running.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{
    Client, StatusCode,
    header::{AUTHORIZATION, CONTENT_LENGTH, HeaderMap, LOCATION},
};
use serde::Deserialize;
use sonarq_config::ServiceBusConfig;
use sonarq_core::{
    error::{Result, ScanError},
    scan::orchestration::{InboundMessage, MessageSource},
};
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    http::{ensure_success, transport_error},
    signing::sas_token,
};

const TOKEN_TTL_SECS: i64 = 60 * 60;
const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;
const BROKER_PROPERTIES: &str = "brokerproperties";

/// Lock metadata the broker attaches to every peek-locked message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BrokerProperties {
    pub message_id: String,
    pub lock_token: String,
    #[serde(default)]
    pub delivery_count: u32,
    #[serde(default)]
    pub sequence_number: Option<i64>,
}

impl BrokerProperties {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|err| {
            ScanError::Transport(format!("malformed BrokerProperties header: {err}"))
        })
    }
}

struct CachedToken {
    value: String,
    expires_at: i64,
}

pub struct ServiceBusSource {
    client: Client,
    key_name: String,
    key: String,
    entity_uri: String,
    receive_timeout: Duration,
    token: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for ServiceBusSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBusSource")
            .field("entity_uri", &self.entity_uri)
            .field("key_name", &self.key_name)
            .field("receive_timeout", &self.receive_timeout)
            .finish_non_exhaustive()
    }
}

impl ServiceBusSource {
    /// `receive_timeout` is the server-side long-poll window per receive.
    pub fn new(client: Client, config: &ServiceBusConfig, receive_timeout: Duration) -> Self {
        Self {
            client,
            key_name: config.connection.key_name.clone(),
            key: config.connection.key.clone(),
            entity_uri: entity_uri(
                config.connection.endpoint.as_str(),
                &config.topic,
                &config.subscription,
            ),
            receive_timeout,
            token: Mutex::new(None),
        }
    }

    async fn authorization(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at - now > TOKEN_REFRESH_MARGIN_SECS
        {
            return Ok(token.value.clone());
        }

        let expires_at = now + TOKEN_TTL_SECS;
        let value = sas_token(&self.entity_uri, &self.key_name, &self.key, expires_at)?;
        debug!(expires_at, "refreshed broker SAS token");
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at,
        });
        Ok(value)
    }

    fn inbound_from(&self, headers: &HeaderMap, body: Vec<u8>) -> Result<InboundMessage> {
        let raw = headers
            .get(BROKER_PROPERTIES)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ScanError::Transport("locked message without BrokerProperties header".into())
            })?;
        let properties = BrokerProperties::parse(raw)?;

        let receipt = headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| lock_uri(&self.entity_uri, &properties));

        Ok(InboundMessage {
            message_id: properties.message_id,
            body,
            delivery_count: properties.delivery_count.max(1),
            receipt,
        })
    }
}

#[async_trait]
impl MessageSource for ServiceBusSource {
    async fn receive(&self) -> Result<Option<InboundMessage>> {
        let url = format!(
            "{}/messages/head?timeout={}",
            self.entity_uri,
            self.receive_timeout.as_secs().max(1)
        );
        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, self.authorization().await?)
            .header(CONTENT_LENGTH, 0)
            .timeout(self.receive_timeout + Duration::from_secs(10))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::CREATED | StatusCode::OK => {
                let headers = response.headers().clone();
                let body = response.bytes().await.map_err(transport_error)?;
                self.inbound_from(&headers, body.to_vec()).map(Some)
            }
            other => {
                ensure_success(response).await?;
                Err(ScanError::Transport(format!(
                    "unexpected receive status {other}"
                )))
            }
        }
    }

    async fn complete(&self, message: &InboundMessage) -> Result<()> {
        let response = self
            .client
            .delete(&message.receipt)
            .header(AUTHORIZATION, self.authorization().await?)
            .send()
            .await
            .map_err(transport_error)?;
        ensure_success(response).await?;
        debug!(message_id = %message.message_id, "message completed");
        Ok(())
    }

    async fn abandon(&self, message: &InboundMessage) -> Result<()> {
        let response = self
            .client
            .put(&message.receipt)
            .header(AUTHORIZATION, self.authorization().await?)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(transport_error)?;
        ensure_success(response).await?;
        debug!(message_id = %message.message_id, "message abandoned");
        Ok(())
    }

    async fn renew(&self, message: &InboundMessage) -> Result<()> {
        let response = self
            .client
            .post(&message.receipt)
            .header(AUTHORIZATION, self.authorization().await?)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await
            .map_err(transport_error)?;
        ensure_success(response).await?;
        debug!(message_id = %message.message_id, "message lock renewed");
        Ok(())
    }
}

/// `https://{namespace}/{topic}/subscriptions/{subscription}`
pub fn entity_uri(endpoint: &str, topic: &str, subscription: &str) -> String {
    format!(
        "{}/{}/subscriptions/{}",
        endpoint.trim_end_matches('/'),
        urlencoding::encode(topic),
        urlencoding::encode(subscription)
    )
}

/// Lock URI for brokers that omit `Location`.
pub fn lock_uri(entity_uri: &str, properties: &BrokerProperties) -> String {
    format!(
        "{entity_uri}/messages/{}/{}",
        urlencoding::encode(&properties.message_id),
        urlencoding::encode(&properties.lock_token)
    )
}
