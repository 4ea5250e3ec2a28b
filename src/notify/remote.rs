//! Remote notifier - HTTP client for the pipeline-tracking service
//!
//! Protocol:
//! - `POST {base}/pipelines` with `{name, nodes}`; `201 Created` with a
//!   JSON-encoded pipeline id
//! - `PUT {base}/pipelines/{id}` with `[{_id, state?, children?}]` per update

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::notifier::Notifier;
use super::pipeline::{NodeStates, NodeUpdate, PipelineDefinition};
use crate::error::{BatchError, Result};
use crate::util::{CONNECT_TIMEOUT, NOTIFY_TIMEOUT};

fn notification_error(reason: impl Into<String>) -> BatchError {
    BatchError::Notification {
        reason: reason.into(),
    }
}

/// Notifier backed by a registered remote pipeline
pub struct RemoteNotifier {
    client: reqwest::Client,
    pipeline_url: String,
    /// Mirror used to drop state regressions before they are sent
    states: NodeStates,
    /// One request in flight at a time; the transport does not order
    /// concurrent requests
    send_lock: Mutex<()>,
}

impl RemoteNotifier {
    /// Register `definition` with the service at `base_url`
    #[instrument(skip(definition), fields(pipeline = %definition.name))]
    pub async fn register(base_url: &str, definition: &PipelineDefinition) -> Result<Self> {
        definition.validate()?;

        let base = Url::parse(base_url)
            .map_err(|e| notification_error(format!("invalid URL '{}': {}", base_url, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(notification_error(format!(
                "unsupported URL scheme '{}'",
                base.scheme()
            )));
        }
        let base = base.as_str().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("batchpipe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| notification_error(format!("cannot build HTTP client: {}", e)))?;

        let endpoint = format!("{}/pipelines", base);
        let response = client
            .post(&endpoint)
            .json(definition)
            .send()
            .await
            .map_err(|e| notification_error(format!("POST {} failed: {}", endpoint, e)))?;

        let status = response.status();
        if status != StatusCode::CREATED {
            return Err(notification_error(format!(
                "POST {} returned {} (expected 201 Created)",
                endpoint, status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| notification_error(format!("invalid pipeline id: {}", e)))?;
        let id = match body {
            Value::String(s) if !s.is_empty() => s,
            Value::Number(n) => n.to_string(),
            other => return Err(notification_error(format!("invalid pipeline id: {}", other))),
        };

        let pipeline_url = format!("{}/pipelines/{}", base, id);
        info!(%pipeline_url, "pipeline registered");

        Ok(Self {
            client,
            pipeline_url,
            states: NodeStates::new(),
            send_lock: Mutex::new(()),
        })
    }

    /// Last state accepted for `node`
    pub fn state_of(&self, node: &str) -> Option<super::NodeState> {
        self.states.get(node)
    }
}

#[async_trait]
impl Notifier for RemoteNotifier {
    async fn update(&self, mut update: NodeUpdate) {
        if update.is_empty() {
            return;
        }

        if let Some(state) = update.state {
            if !self.states.advance(&update.node, state) {
                debug!(node = %update.node, %state, "dropping state regression");
                update.state = None;
                if update.is_empty() {
                    return;
                }
            }
        }

        let _in_flight = self.send_lock.lock().await;
        match self
            .client
            .put(&self.pipeline_url)
            .json(&[&update])
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                debug!(node = %update.node, state = ?update.state, "node updated");
            }
            Ok(response) => {
                warn!(node = %update.node, status = %response.status(), "tracking service rejected update");
            }
            Err(e) => {
                warn!(node = %update.node, error = %e, "failed to deliver update");
            }
        }
    }

    fn pipeline_url(&self) -> Option<&str> {
        Some(&self.pipeline_url)
    }
}
