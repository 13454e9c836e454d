//! Núcleo de la plataforma de transforms: compilación de scripts a
//! transforms, armado de jobs, ejecución y transferencia de salidas.

pub mod error;

/* --------- Tipos y schemas --------- */

pub mod json_schema;
pub mod mime;
pub mod value;
pub mod variables;

/* --------- Análisis estático y compilación --------- */

pub mod callgraph;
pub mod compiler;
pub mod script;
pub mod transform;
pub mod typing;

/* --------- Jobs --------- */

pub mod engine;
pub mod executor;
pub mod job;
pub mod job_builder;

/* --------- Codecs y transferencia --------- */

pub mod encoders;
pub mod opaque;
pub mod transfer;

pub use compiler::TransformBuilder;
pub use engine::JobEngine;
pub use error::{Error, ExecutionError, Result};
pub use executor::{Executor, RawResult};
pub use job::{Job, JobId, JobIn, JobStatus};
pub use job_builder::JobBuilder;
pub use json_schema::JsonSchema;
pub use transfer::{BlobStore, ObjectStoreBlobs, DEFAULT_JOBS_BUCKET};
pub use transform::{EntryPointIn, ExposedFunction, Transform, TransformId, TransformIn, UserId};
pub use value::OutputValue;
pub use variables::{Input, InputIn, Output, OutputIn, OutputWithValue, Transfer};
