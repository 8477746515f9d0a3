//! Single-owner predictor handle

use modelplane_core::{ModelPlaneError, ModelPlaneResult};
use tracing::debug;

use crate::traits::{InferenceInput, InferenceOutput, Predictor};

/// Owns a predictor and closes it when dropped.
///
/// The handle is the only path to `Predictor::close`, so a predictor is
/// released exactly once no matter how many clones of the surrounding `Arc`
/// were in flight.
pub struct PredictorHandle {
    model_id: String,
    predictor: Option<Box<dyn Predictor>>,
}

impl PredictorHandle {
    pub fn new(model_id: impl Into<String>, predictor: Box<dyn Predictor>) -> Self {
        Self {
            model_id: model_id.into(),
            predictor: Some(predictor),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn name(&self) -> &'static str {
        self.predictor.as_ref().map_or("closed", |p| p.name())
    }

    pub async fn predict(&self, input: &InferenceInput) -> ModelPlaneResult<InferenceOutput> {
        let predictor = self
            .predictor
            .as_ref()
            .ok_or_else(|| ModelPlaneError::runtime(format!("predictor for {} is closed", self.model_id)))?;
        predictor.predict(input).await
    }
}

impl Drop for PredictorHandle {
    fn drop(&mut self) {
        if let Some(mut predictor) = self.predictor.take() {
            debug!(model_id = %self.model_id, kind = predictor.name(), "Closing predictor");
            predictor.close();
        }
    }
}

impl std::fmt::Debug for PredictorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictorHandle")
            .field("model_id", &self.model_id)
            .field("kind", &self.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingPredictor {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Predictor for CountingPredictor {
        async fn predict(&self, input: &InferenceInput) -> ModelPlaneResult<InferenceOutput> {
            Ok(InferenceOutput {
                payload: input.payload.clone(),
            })
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_closed_once_after_last_clone() {
        let closed = Arc::new(AtomicUsize::new(0));
        let handle = Arc::new(PredictorHandle::new(
            "m1",
            Box::new(CountingPredictor {
                closed: closed.clone(),
            }),
        ));

        let in_flight = handle.clone();
        drop(handle);
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        let output = in_flight
            .predict(&InferenceInput::new(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(output.payload["x"], 1);

        drop(in_flight);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
