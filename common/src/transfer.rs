//! Transferencia de los valores de salida de un job: inline en el job o
//! codificados y guardados en el object store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::encoders::{encode_json, get_buffer_from_value, EncodedValue};
use crate::error::{Error, Result};
use crate::job::{Job, JobId};
use crate::json_schema::JsonSchema;
use crate::mime;
use crate::opaque;
use crate::value::OutputValue;
use crate::variables::{OutputWithValue, Transfer};

pub const DEFAULT_JOBS_BUCKET: &str = "jobs";

/// Escritura de objetos binarios.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Prepara el bucket al arrancar el servicio.
    async fn ensure_bucket(&self, _bucket: &str) -> Result<()> {
        Ok(())
    }
}

/// `BlobStore` sobre el crate `object_store`.
pub struct ObjectStoreBlobs {
    store: Arc<dyn ObjectStore>,
    /// Bucket al que está atado el store (S3, MinIO). Sin él, el store
    /// contiene todos los buckets y el bucket va como prefijo de la ruta.
    bound_bucket: Option<String>,
    /// Raíz en disco de un store local.
    local_root: Option<PathBuf>,
    /// El backend guarda atributos (content type) junto al objeto.
    attributes: bool,
}

impl ObjectStoreBlobs {
    /// Store ya atado al bucket `name`.
    pub fn bucket(store: Arc<dyn ObjectStore>, name: impl Into<String>) -> Self {
        Self {
            store,
            bound_bucket: Some(name.into()),
            local_root: None,
            attributes: true,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            bound_bucket: None,
            local_root: None,
            attributes: true,
        }
    }

    /// Directorio local; `LocalFileSystem` no soporta atributos.
    pub fn local(root: &str) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            store: Arc::new(LocalFileSystem::new_with_prefix(root)?),
            bound_bucket: None,
            local_root: Some(PathBuf::from(root)),
            attributes: false,
        })
    }

    /// Prefijo del bucket dentro del store; `None` si el store es el bucket.
    fn prefix(&self, bucket: &str) -> Result<Option<Path>> {
        match &self.bound_bucket {
            Some(bound) if bound == bucket => Ok(None),
            Some(bound) => Err(Error::UnknownBucket {
                requested: bucket.to_string(),
                bound: bound.clone(),
            }),
            None => Ok(Some(Path::from(bucket))),
        }
    }

    fn path(&self, bucket: &str, key: &str) -> Result<Path> {
        Ok(match self.prefix(bucket)? {
            Some(_) => Path::from(format!("{bucket}/{key}")),
            None => Path::from(key),
        })
    }

    pub async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let result = self.store.get(&self.path(bucket, key)?).await?;
        Ok(result.bytes().await?)
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobs {
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let path = self.path(bucket, key)?;
        let mut opts = PutOptions::default();
        if self.attributes {
            let mut attributes = Attributes::new();
            attributes.insert(Attribute::ContentType, content_type.to_string().into());
            opts.attributes = attributes;
        }
        let size = bytes.len();
        self.store.put_opts(&path, PutPayload::from(bytes), opts).await?;
        debug!("objeto guardado: {} ({} bytes, {})", path, size, content_type);
        Ok(())
    }

    /// Comprueba que el bucket exista y sea alcanzable listando su raíz.
    async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        let prefix = self.prefix(bucket)?;
        if let Some(root) = &self.local_root {
            std::fs::create_dir_all(root.join(bucket))?;
        }
        let listing = self.store.list_with_delimiter(prefix.as_ref()).await?;
        info!(
            "bucket {} listo ({} objetos, {} prefijos)",
            bucket,
            listing.objects.len(),
            listing.common_prefixes.len()
        );
        Ok(())
    }
}

/// Clave del objeto: `job-<id>/<output id con '.' y '_' -> '-'>-<6 hex>.<ext>`.
pub fn object_key(job_id: &JobId, output_id: &str, extension: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "job-{job_id}/{}-{}{extension}",
        output_id.replace(['.', '_'], "-"),
        &suffix[..6]
    )
}

/// Copia los valores de salida al job (inline) o al object store (URI).
pub struct JobTransfer<'a> {
    store: &'a dyn BlobStore,
    bucket: &'a str,
    public_url: &'a str,
}

impl<'a> JobTransfer<'a> {
    pub fn new(store: &'a dyn BlobStore, bucket: &'a str, public_url: &'a str) -> Self {
        Self {
            store,
            bucket,
            public_url,
        }
    }

    pub async fn transfer_values(&self, job: &mut Job, values: &HashMap<String, OutputValue>) -> Result<()> {
        let job_id = job.id.clone();
        for output in job.outputs.iter_mut() {
            if output.output.transfer == Transfer::Ignore {
                continue;
            }
            let Some(value) = values.get(&output.output.id) else {
                warn!("job {}: la salida {} no tiene valor", job_id, output.output.id);
                continue;
            };
            self.transfer_value(&job_id, output, value)
                .await
                .map_err(|e| e.for_output(&output.output.id, value.repr()))?;
        }
        info!("job {}: {} salidas transferidas", job_id, job.outputs.len());
        Ok(())
    }

    async fn transfer_value(&self, job_id: &JobId, output: &mut OutputWithValue, value: &OutputValue) -> Result<()> {
        let mut schema = output.output.json_schema.clone();
        schema.update_with_value(value);

        let transfer = output.output.transfer;
        let result = if schema.has_content_type() {
            self.value_with_known_content_type(job_id, &output.output.id, transfer, &schema, value)
                .await
        } else if schema.has_json_schema() {
            self.value_with_known_schema(job_id, &output.output.id, transfer, &mut schema, value)
                .await
        } else {
            self.value_unknown(job_id, &output.output.id, transfer, &mut schema, value)
                .await
        };
        output.output.json_schema = schema;
        output.value = result?;
        Ok(())
    }

    async fn value_with_known_content_type(
        &self,
        job_id: &JobId,
        output_id: &str,
        transfer: Transfer,
        schema: &JsonSchema,
        value: &OutputValue,
    ) -> Result<Value> {
        if transfer == Transfer::Json {
            return Err(Error::NotImplemented("String-encoded JSON is not implemented.".into()));
        }
        let encoded = get_buffer_from_value(schema, value)?;
        let content_type = schema.content_type().unwrap_or(mime::APPLICATION_OCTET_STREAM);
        self.store_value(job_id, output_id, encoded, content_type).await
    }

    async fn value_with_known_schema(
        &self,
        job_id: &JobId,
        output_id: &str,
        transfer: Transfer,
        schema: &mut JsonSchema,
        value: &OutputValue,
    ) -> Result<Value> {
        let json = json_value(value)?;
        if transfer == Transfer::Json {
            return Ok(json.clone());
        }
        schema.set_content_type(mime::APPLICATION_JSON);
        let encoded = EncodedValue {
            bytes: encode_json(json)?,
            extension: ".json".into(),
        };
        self.store_value(job_id, output_id, encoded, mime::APPLICATION_JSON).await
    }

    async fn value_unknown(
        &self,
        job_id: &JobId,
        output_id: &str,
        transfer: Transfer,
        schema: &mut JsonSchema,
        value: &OutputValue,
    ) -> Result<Value> {
        if transfer == Transfer::Json {
            return json_value(value).cloned();
        }
        schema.set_content_type(mime::APPLICATION_OCTET_STREAM);
        let encoded = EncodedValue {
            bytes: opaque::encode(value),
            extension: opaque::EXTENSION.into(),
        };
        self.store_value(job_id, output_id, encoded, mime::APPLICATION_OCTET_STREAM)
            .await
    }

    async fn store_value(
        &self,
        job_id: &JobId,
        output_id: &str,
        encoded: EncodedValue,
        content_type: &str,
    ) -> Result<Value> {
        let key = object_key(job_id, output_id, &encoded.extension);
        self.store.put(self.bucket, &key, encoded.bytes, content_type).await?;
        Ok(Value::String(format!(
            "{}/{}/{}",
            self.public_url.trim_end_matches('/'),
            self.bucket,
            key
        )))
    }
}

fn json_value(value: &OutputValue) -> Result<&Value> {
    value.as_json().ok_or_else(|| {
        Error::Validation(format!(
            "The output value of type {:?} is not JSON-serializable.",
            value.type_name()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::value::NdArray;
    use crate::variables::Output;
    use chrono::Utc;
    use serde_json::json;

    const PUBLIC_URL: &str = "http://localhost:9000";

    fn job(outputs: Vec<(&str, Value, Transfer)>) -> Job {
        Job {
            id: "abc".into(),
            transform_id: "t".into(),
            user_id: "u".into(),
            status: JobStatus::Running,
            inputs: vec![],
            outputs: outputs
                .into_iter()
                .map(|(id, schema, transfer)| {
                    OutputWithValue::from(Output {
                        id: id.into(),
                        name: id.rsplit('.').next().unwrap_or(id).into(),
                        json_schema: serde_json::from_value(schema).unwrap(),
                        transfer,
                    })
                })
                .collect(),
            created_at: Utc::now(),
            done_at: None,
            error: None,
        }
    }

    fn values(items: Vec<(&str, OutputValue)>) -> HashMap<String, OutputValue> {
        items.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn key_of(uri: &Value) -> String {
        let uri = uri.as_str().unwrap();
        uri.strip_prefix(&format!("{PUBLIC_URL}/jobs/")).unwrap().to_string()
    }

    #[test]
    fn object_key_reemplaza_puntos_y_guiones_bajos() {
        let key = object_key(&"628d".to_string(), "pipeline.output_0", ".wav");
        assert!(key.starts_with("job-628d/pipeline-output-0-"));
        assert!(key.ends_with(".wav"));
        let suffix = key.trim_start_matches("job-628d/pipeline-output-0-").trim_end_matches(".wav");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn valores_json_quedan_inline() {
        let store = ObjectStoreBlobs::in_memory();
        let mut job = job(vec![("pipeline.0", json!({}), Transfer::Json)]);
        let vals = values(vec![("pipeline.0", OutputValue::Json(json!(["test", [4, 14]])))]);
        JobTransfer::new(&store, DEFAULT_JOBS_BUCKET, PUBLIC_URL)
            .transfer_values(&mut job, &vals)
            .await
            .unwrap();
        assert_eq!(job.outputs[0].value, json!(["test", [4, 14]]));
    }

    #[tokio::test]
    async fn audio_se_guarda_como_wav() {
        let store = ObjectStoreBlobs::in_memory();
        let mut job = job(vec![(
            "pipeline.0",
            json!({"contentMediaType": "audio/*", "x-contentMediaEncoding": {"rate": 8000}}),
            Transfer::Uri,
        )]);
        let arr = NdArray::from_i16(vec![4], &[0, 100, -100, 0]).unwrap();
        let vals = values(vec![("pipeline.0", OutputValue::Array(arr))]);
        JobTransfer::new(&store, DEFAULT_JOBS_BUCKET, PUBLIC_URL)
            .transfer_values(&mut job, &vals)
            .await
            .unwrap();

        let out = &job.outputs[0];
        assert_eq!(out.output.json_schema.content_type(), Some("audio/x-wav"));
        let key = key_of(&out.value);
        assert!(key.starts_with("job-abc/pipeline-0-"));
        assert!(key.ends_with(".wav"));

        let bytes = store.get(DEFAULT_JOBS_BUCKET, &key).await.unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
    }

    #[tokio::test]
    async fn schema_conocido_por_uri_se_guarda_como_json() {
        let store = ObjectStoreBlobs::in_memory();
        let mut job = job(vec![("f.0", json!({"type": "integer"}), Transfer::Uri)]);
        let vals = values(vec![("f.0", OutputValue::Json(json!(42)))]);
        JobTransfer::new(&store, DEFAULT_JOBS_BUCKET, PUBLIC_URL)
            .transfer_values(&mut job, &vals)
            .await
            .unwrap();

        let out = &job.outputs[0];
        assert_eq!(out.output.json_schema.content_type(), Some("application/json"));
        let key = key_of(&out.value);
        assert!(key.ends_with(".json"));
        assert_eq!(store.get(DEFAULT_JOBS_BUCKET, &key).await.unwrap().as_ref(), b"42");
    }

    #[tokio::test]
    async fn valor_desconocido_por_uri_usa_el_codec_opaco() {
        let store = ObjectStoreBlobs::in_memory();
        let mut job = job(vec![("f.0", json!({}), Transfer::Uri)]);
        let value = OutputValue::Object {
            type_name: "Model".into(),
            state: json!({"w": 1}),
        };
        let vals = values(vec![("f.0", value.clone())]);
        JobTransfer::new(&store, DEFAULT_JOBS_BUCKET, PUBLIC_URL)
            .transfer_values(&mut job, &vals)
            .await
            .unwrap();

        let key = key_of(&job.outputs[0].value);
        assert!(key.ends_with(".pickle"));
        let bytes = store.get(DEFAULT_JOBS_BUCKET, &key).await.unwrap();
        assert_eq!(opaque::decode(&bytes).unwrap(), value);
    }

    #[tokio::test]
    async fn valor_no_json_por_json_falla_con_422() {
        let store = ObjectStoreBlobs::in_memory();
        let mut job = job(vec![("f.0", json!({}), Transfer::Json)]);
        let vals = values(vec![(
            "f.0",
            OutputValue::Object {
                type_name: "Model".into(),
                state: Value::Null,
            },
        )]);
        let err = JobTransfer::new(&store, DEFAULT_JOBS_BUCKET, PUBLIC_URL)
            .transfer_values(&mut job, &vals)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 422);
        assert!(err.to_string().starts_with("Output f.0:"));
    }

    #[tokio::test]
    async fn content_type_con_transfer_json_no_esta_implementado() {
        let store = ObjectStoreBlobs::in_memory();
        let mut job = job(vec![("f.0", json!({"contentMediaType": "image/png"}), Transfer::Json)]);
        let vals = values(vec![("f.0", OutputValue::Bytes(vec![1]))]);
        let err = JobTransfer::new(&store, DEFAULT_JOBS_BUCKET, PUBLIC_URL)
            .transfer_values(&mut job, &vals)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Output { ref source, .. } if matches!(**source, Error::NotImplemented(_))));
    }

    #[tokio::test]
    async fn salidas_ignoradas_no_se_tocan() {
        let store = ObjectStoreBlobs::in_memory();
        let mut job = job(vec![("f.0", json!({}), Transfer::Ignore)]);
        let vals = values(vec![("f.0", OutputValue::Json(json!(1)))]);
        JobTransfer::new(&store, DEFAULT_JOBS_BUCKET, PUBLIC_URL)
            .transfer_values(&mut job, &vals)
            .await
            .unwrap();
        assert_eq!(job.outputs[0].value, Value::Null);
    }

    #[tokio::test]
    async fn ensure_bucket_lista_el_store() {
        let store = ObjectStoreBlobs::in_memory();
        store.ensure_bucket(DEFAULT_JOBS_BUCKET).await.unwrap();

        let root = std::env::temp_dir().join(format!("blobs-{}", Uuid::new_v4()));
        let local = ObjectStoreBlobs::local(&root.display().to_string()).unwrap();
        local.ensure_bucket(DEFAULT_JOBS_BUCKET).await.unwrap();
        assert!(root.join(DEFAULT_JOBS_BUCKET).is_dir());

        // un archivo ocupa el lugar del bucket: el arranque tiene que fallar
        std::fs::write(root.join("roto"), b"x").unwrap();
        assert!(local.ensure_bucket("roto").await.is_err());
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn store_atado_rechaza_otro_bucket() {
        let store = ObjectStoreBlobs::bucket(Arc::new(InMemory::new()), "outputs");
        store.ensure_bucket("outputs").await.unwrap();
        assert!(matches!(
            store.ensure_bucket(DEFAULT_JOBS_BUCKET).await,
            Err(Error::UnknownBucket { .. })
        ));

        let mut job = job(vec![("f.0", json!({"type": "integer"}), Transfer::Uri)]);
        let vals = values(vec![("f.0", OutputValue::Json(json!(42)))]);
        let err = JobTransfer::new(&store, DEFAULT_JOBS_BUCKET, PUBLIC_URL)
            .transfer_values(&mut job, &vals)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 500);

        store.put("outputs", "a.json", b"1".to_vec(), "application/json").await.unwrap();
        assert_eq!(store.get("outputs", "a.json").await.unwrap().as_ref(), b"1");
    }
}
