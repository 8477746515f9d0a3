//! Predictor for externally hosted models

use async_trait::async_trait;
use modelplane_core::{Endpoint, ModelPlaneError, ModelPlaneResult};
use std::time::Duration;
use tracing::debug;

use crate::traits::{InferenceInput, InferenceOutput, Predictor};

/// Forwards inference requests as JSON to a remote endpoint
pub struct RemotePredictor {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RemotePredictor {
    pub fn new(client: reqwest::Client, endpoint: &Endpoint, timeout: Duration) -> Self {
        Self {
            client,
            url: endpoint.predict_url(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// POST `input` to `url` and decode the JSON body
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    input: &InferenceInput,
) -> ModelPlaneResult<InferenceOutput> {
    let response = client
        .post(url)
        .timeout(timeout)
        .json(&input.payload)
        .send()
        .await
        .map_err(|e| ModelPlaneError::runtime(format!("predict request to {} failed: {}", url, e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ModelPlaneError::runtime(format!(
            "predict request to {} returned {}: {}",
            url, status, body
        )));
    }

    let payload = response
        .json()
        .await
        .map_err(|e| ModelPlaneError::Serialization(format!("predict response: {}", e)))?;
    Ok(InferenceOutput { payload })
}

#[async_trait]
impl Predictor for RemotePredictor {
    async fn predict(&self, input: &InferenceInput) -> ModelPlaneResult<InferenceOutput> {
        debug!(url = %self.url, "Forwarding prediction");
        post_json(&self.client, &self.url, self.timeout, input).await
    }

    fn close(&mut self) {
        debug!(url = %self.url, "Released remote predictor");
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
