use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transform::{TransformId, UserId};
use crate::variables::{Input, InputIn, OutputIn, OutputWithValue};

pub type JobId = String;

/// Pedido de ejecución de un transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobIn {
    pub transform_id: TransformId,
    #[serde(default)]
    pub inputs: Vec<InputIn>,
    #[serde(default)]
    pub outputs: Vec<OutputIn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Accepted,
    Running,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub transform_id: TransformId,
    pub user_id: UserId,
    pub status: JobStatus,
    pub inputs: Vec<Input>,
    pub outputs: Vec<OutputWithValue>,

    /// -------- Tiempos del job --------
    pub created_at: DateTime<Utc>,
    pub done_at: Option<DateTime<Utc>>,

    /// Mensaje de error si el job falló.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
    }

    pub fn mark_succeeded(&mut self) {
        self.status = JobStatus::Succeeded;
        self.done_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.done_at = Some(Utc::now());
        self.error = Some(error.into());
    }
}
