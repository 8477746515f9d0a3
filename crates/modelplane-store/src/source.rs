//! Fetch model content supplied by reference

use modelplane_core::{ContentSource, ModelPlaneError, ModelPlaneResult};
use std::path::Path;
use tracing::info;

/// Resolves a [`ContentSource`] into bytes, enforcing the size limit
pub struct ContentFetcher {
    client: reqwest::Client,
    max_size: u64,
}

impl ContentFetcher {
    pub fn new(max_size: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            max_size,
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Fail with `SizeLimitExceeded` when `size` is over the limit
    pub fn check_size(&self, size: u64) -> ModelPlaneResult<()> {
        if size > self.max_size {
            return Err(ModelPlaneError::SizeLimitExceeded {
                size,
                limit: self.max_size,
            });
        }
        Ok(())
    }

    /// Fetch the full content
    pub async fn fetch(&self, source: &ContentSource) -> ModelPlaneResult<Vec<u8>> {
        match source {
            ContentSource::Url(url) => self.fetch_url(url).await,
            ContentSource::File(path) => self.fetch_file(path).await,
            ContentSource::Inline(bytes) => {
                self.check_size(bytes.len() as u64)?;
                Ok(bytes.clone())
            }
        }
    }

    async fn fetch_url(&self, url: &str) -> ModelPlaneResult<Vec<u8>> {
        info!(url = url, "Downloading model content");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ModelPlaneError::TransientInfra(format!("download {}: {}", url, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ModelPlaneError::not_found(format!("model content at {}", url)));
        }
        if !status.is_success() {
            return Err(ModelPlaneError::TransientInfra(format!(
                "download {} returned {}",
                url, status
            )));
        }

        if let Some(length) = response.content_length() {
            self.check_size(length)?;
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ModelPlaneError::TransientInfra(format!("download {}: {}", url, e)))?;
        self.check_size(bytes.len() as u64)?;

        info!(url = url, size = bytes.len(), "Downloaded model content");
        Ok(bytes.to_vec())
    }

    async fn fetch_file(&self, path: &Path) -> ModelPlaneResult<Vec<u8>> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ModelPlaneError::not_found(format!("model file {}", path.display()))
            } else {
                ModelPlaneError::Io(e)
            }
        })?;
        self.check_size(metadata.len())?;

        let bytes = tokio::fs::read(path).await?;
        info!(path = %path.display(), size = bytes.len(), "Read model content");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_fetch_inline() {
        let fetcher = ContentFetcher::new(4);
        let bytes = fetcher
            .fetch(&ContentSource::Inline(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        let err = fetcher
            .fetch(&ContentSource::Inline(vec![0; 5]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ModelPlaneError::SizeLimitExceeded { size: 5, limit: 4 }
        ));
    }

    #[tokio::test]
    async fn test_fetch_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"model-bytes").unwrap();

        let fetcher = ContentFetcher::new(1024);
        let bytes = fetcher
            .fetch(&ContentSource::File(file.path().to_path_buf()))
            .await
            .unwrap();
        assert_eq!(bytes, b"model-bytes");
    }

    #[tokio::test]
    async fn test_fetch_file_too_large() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 64]).unwrap();

        let fetcher = ContentFetcher::new(32);
        let err = fetcher
            .fetch(&ContentSource::File(file.path().to_path_buf()))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelPlaneError::SizeLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_fetch_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ContentFetcher::new(32);
        let err = fetcher
            .fetch(&ContentSource::File(dir.path().join("missing.onnx")))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelPlaneError::ResourceNotFound(_)));
    }
}
