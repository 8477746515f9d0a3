//! Built-in algorithm predictors

use async_trait::async_trait;
use modelplane_core::{ModelPlaneError, ModelPlaneResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::traits::{InferenceInput, InferenceOutput, Predictor};

#[derive(Debug, Deserialize)]
struct KMeansParams {
    centroids: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct KMeansInput {
    points: Vec<Vec<f64>>,
}

#[derive(Debug, Serialize)]
struct KMeansOutput {
    clusters: Vec<usize>,
}

/// Assigns each input point to its nearest centroid
#[derive(Debug)]
pub struct KMeansPredictor {
    centroids: Vec<Vec<f64>>,
    dimension: usize,
}

impl KMeansPredictor {
    /// Build from `{"centroids": [[f64, ...], ...]}`
    pub fn from_params(params: &Value) -> ModelPlaneResult<Self> {
        let params: KMeansParams = serde_json::from_value(params.clone())
            .map_err(|e| ModelPlaneError::validation(format!("invalid k-means parameters: {}", e)))?;

        let dimension = params
            .centroids
            .first()
            .map(Vec::len)
            .ok_or_else(|| ModelPlaneError::validation("k-means model has no centroids"))?;
        if dimension == 0 || params.centroids.iter().any(|c| c.len() != dimension) {
            return Err(ModelPlaneError::validation(
                "k-means centroids must share one non-zero dimension",
            ));
        }

        Ok(Self {
            centroids: params.centroids,
            dimension,
        })
    }

    fn nearest(&self, point: &[f64]) -> usize {
        let mut best = (0, f64::INFINITY);
        for (index, centroid) in self.centroids.iter().enumerate() {
            let distance: f64 = centroid
                .iter()
                .zip(point)
                .map(|(c, p)| (c - p) * (c - p))
                .sum();
            if distance < best.1 {
                best = (index, distance);
            }
        }
        best.0
    }
}

#[async_trait]
impl Predictor for KMeansPredictor {
    async fn predict(&self, input: &InferenceInput) -> ModelPlaneResult<InferenceOutput> {
        let input: KMeansInput = serde_json::from_value(input.payload.clone())
            .map_err(|e| ModelPlaneError::validation(format!("invalid k-means input: {}", e)))?;

        if let Some(bad) = input.points.iter().find(|p| p.len() != self.dimension) {
            return Err(ModelPlaneError::validation(format!(
                "point has dimension {}, expected {}",
                bad.len(),
                self.dimension
            )));
        }

        let output = KMeansOutput {
            clusters: input.points.iter().map(|p| self.nearest(p)).collect(),
        };
        Ok(InferenceOutput {
            payload: serde_json::to_value(output)?,
        })
    }

    fn close(&mut self) {
        self.centroids.clear();
    }

    fn name(&self) -> &'static str {
        "kmeans"
    }
}
