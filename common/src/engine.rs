//! Motor de ejecución de jobs: ejecuta el punto de entrada, reparte el
//! resultado entre las salidas y las transfiere.

use tracing::{error, info};

use crate::error::Result;
use crate::executor::{prepare_inputs, prepare_outputs, Executor};
use crate::job::Job;
use crate::transfer::{BlobStore, JobTransfer};
use crate::transform::Transform;

pub struct JobEngine<'a> {
    executor: &'a dyn Executor,
    store: &'a dyn BlobStore,
    bucket: &'a str,
    public_url: &'a str,
}

impl<'a> JobEngine<'a> {
    pub fn new(executor: &'a dyn Executor, store: &'a dyn BlobStore, bucket: &'a str, public_url: &'a str) -> Self {
        Self {
            executor,
            store,
            bucket,
            public_url,
        }
    }

    /// Corre el job hasta `SUCCEEDED` o `FAILED`. Si falla, el job queda con
    /// el mensaje de error y el error se devuelve al llamador.
    pub async fn run(&self, transform: &Transform, job: &mut Job) -> Result<()> {
        job.mark_running();
        info!("job {}: ejecutando {}", job.id, transform.entry_point.name);

        match self.execute(transform, job).await {
            Ok(()) => {
                job.mark_succeeded();
                info!("job {} terminado", job.id);
                Ok(())
            }
            Err(e) => {
                error!("job {} falló: {}", job.id, e);
                job.mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn execute(&self, transform: &Transform, job: &mut Job) -> Result<()> {
        let inputs = prepare_inputs(job);
        let raw = self
            .executor
            .execute(&transform.source, &transform.entry_point.name, &inputs)
            .await?;
        let values = prepare_outputs(&transform.entry_point, raw)?;
        JobTransfer::new(self.store, self.bucket, self.public_url)
            .transfer_values(job, &values)
            .await
    }
}
