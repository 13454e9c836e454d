// master/src/state.rs

use anyhow::{bail, Context, Result};
use common::{BlobStore, Executor, Job, JobId, ObjectStoreBlobs, Transform, TransformId};
use object_store::aws::AmazonS3Builder;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::info;

use crate::config::Settings;

#[derive(Clone)]
pub struct AppState {
    pub transforms: Arc<Mutex<HashMap<TransformId, Transform>>>,
    pub jobs: Arc<Mutex<HashMap<JobId, Job>>>,
    pub executor: Arc<dyn Executor>,
    pub blobs: Arc<dyn BlobStore>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(settings: Settings, executor: Arc<dyn Executor>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            transforms: Arc::new(Mutex::new(HashMap::new())),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            executor,
            blobs,
            settings: Arc::new(settings),
        }
    }
}

/// Toma el lock aunque esté envenenado.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Object store según `OBJECT_STORE_URL`.
pub fn build_blob_store(settings: &Settings) -> Result<Arc<dyn BlobStore>> {
    let url = settings.object_store_url.as_str();
    let blobs = if url == "memory://" {
        ObjectStoreBlobs::in_memory()
    } else if let Some(root) = url.strip_prefix("file://") {
        ObjectStoreBlobs::local(root).with_context(|| format!("no se pudo abrir {root}"))?
    } else if let Some(rest) = url.strip_prefix("s3://") {
        // el bucket sale de JOBS_BUCKET; la URL sólo puede repetirlo
        let named = rest.split('/').next().unwrap_or_default();
        if !named.is_empty() && named != settings.jobs_bucket {
            bail!(
                "OBJECT_STORE_URL apunta al bucket {named} pero JOBS_BUCKET es {}",
                settings.jobs_bucket
            );
        }
        // credenciales y endpoint (MinIO) desde AWS_*
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(&settings.jobs_bucket)
            .build()
            .with_context(|| format!("object store inválido: {url}"))?;
        ObjectStoreBlobs::bucket(Arc::new(store), settings.jobs_bucket.clone())
    } else {
        bail!("OBJECT_STORE_URL no soportada: {url}");
    };
    info!("object store: {}", url);
    Ok(Arc::new(blobs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(url: &str) -> Settings {
        Settings {
            bind_addr: "127.0.0.1:0".into(),
            object_store_url: url.into(),
            public_url: "http://localhost:9000".into(),
            jobs_bucket: "jobs".into(),
            python_bin: "python3".into(),
            execution_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn build_blob_store_acepta_memoria_y_directorio() {
        assert!(build_blob_store(&settings("memory://")).is_ok());
        let dir = std::env::temp_dir().join(format!("transforms-{}", uuid::Uuid::new_v4()));
        assert!(build_blob_store(&settings(&format!("file://{}", dir.display()))).is_ok());
        assert!(build_blob_store(&settings("ftp://x")).is_err());
    }

    #[test]
    fn build_blob_store_rechaza_bucket_distinto_de_jobs_bucket() {
        let err = build_blob_store(&settings("s3://outputs")).err().unwrap();
        assert!(err.to_string().contains("JOBS_BUCKET es jobs"));
        let err = build_blob_store(&settings("s3://outputs/prefijo")).err().unwrap();
        assert!(err.to_string().contains("outputs"));
    }
}
