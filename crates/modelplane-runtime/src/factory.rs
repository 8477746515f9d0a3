//! Default predictor construction, one strategy per function category

use async_trait::async_trait;
use modelplane_core::ModelPlaneResult;
use std::time::Duration;
use tracing::info;

use crate::builtin::KMeansPredictor;
use crate::process::{ProcessRuntime, ProcessRuntimeConfig};
use crate::remote::RemotePredictor;
use crate::traits::{Predictor, PredictorFactory, PredictorSpec};

pub struct DefaultPredictorFactory {
    client: reqwest::Client,
    process: ProcessRuntime,
    predict_timeout: Duration,
}

impl DefaultPredictorFactory {
    pub fn new(config: ProcessRuntimeConfig) -> Self {
        let client = reqwest::Client::new();
        let predict_timeout = config.predict_timeout;
        Self {
            process: ProcessRuntime::new(config, client.clone()),
            client,
            predict_timeout,
        }
    }
}

#[async_trait]
impl PredictorFactory for DefaultPredictorFactory {
    async fn create(&self, model_id: &str, spec: PredictorSpec) -> ModelPlaneResult<Box<dyn Predictor>> {
        info!(model_id = model_id, kind = spec.kind(), "Building predictor");
        match spec {
            PredictorSpec::Remote { endpoint } => Ok(Box::new(RemotePredictor::new(
                self.client.clone(),
                &endpoint,
                self.predict_timeout,
            ))),
            PredictorSpec::LocalBinary { artifact, format } => {
                let predictor = self.process.launch(model_id, &artifact, format).await?;
                Ok(Box::new(predictor))
            }
            PredictorSpec::BuiltIn { params } => Ok(Box::new(KMeansPredictor::from_params(&params)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::InferenceInput;
    use modelplane_core::{Endpoint, ModelFormat, ModelPlaneError};
    use serde_json::json;

    fn factory(work_dir: std::path::PathBuf) -> DefaultPredictorFactory {
        DefaultPredictorFactory::new(ProcessRuntimeConfig {
            server_path: "/nonexistent/model-server".into(),
            work_dir,
            ..ProcessRuntimeConfig::default()
        })
    }

    #[tokio::test]
    async fn test_builds_per_category() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path().to_path_buf());

        let remote = factory
            .create(
                "m1",
                PredictorSpec::Remote {
                    endpoint: Endpoint::new("127.0.0.1".into(), 8080),
                },
            )
            .await
            .unwrap();
        assert_eq!(remote.name(), "remote");

        let kmeans = factory
            .create(
                "m2",
                PredictorSpec::BuiltIn {
                    params: json!({"centroids": [[0.0], [5.0]]}),
                },
            )
            .await
            .unwrap();
        let output = kmeans
            .predict(&InferenceInput::new(json!({"points": [[4.0]]})))
            .await
            .unwrap();
        assert_eq!(output.payload["clusters"], json!([1]));
    }

    #[tokio::test]
    async fn test_local_binary_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let result = factory(dir.path().to_path_buf())
            .create(
                "m3",
                PredictorSpec::LocalBinary {
                    artifact: vec![1, 2, 3],
                    format: ModelFormat::Onnx,
                },
            )
            .await;
        assert!(matches!(result, Err(ModelPlaneError::Runtime(_))));
    }
}
