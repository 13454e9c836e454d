use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::json_schema::JsonSchema;

/// Modo de transferencia del valor de una salida.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transfer {
    #[default]
    Ignore,
    Json,
    Uri,
}

/// Entrada de una función expuesta, tal como la manda el cliente.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputIn {
    pub id: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub id: String,
    pub name: String,
    #[serde(rename = "schema")]
    pub json_schema: JsonSchema,
    /// Argumento posicional sin default.
    pub required: bool,
    /// El cliente puede fijar su valor en un job.
    pub modifiable: bool,
    #[serde(default)]
    pub value: Value,
}

/// Salida pedida por el cliente al crear un job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputIn {
    pub id: String,
    #[serde(rename = "schema", default)]
    pub json_schema: JsonSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<Transfer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub id: String,
    pub name: String,
    #[serde(rename = "schema")]
    pub json_schema: JsonSchema,
    #[serde(default)]
    pub transfer: Transfer,
}

/// Salida de un job: inline (`json`) o la URI del objeto guardado (`uri`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputWithValue {
    #[serde(flatten)]
    pub output: Output,
    #[serde(default)]
    pub value: Value,
}

impl From<Output> for OutputWithValue {
    fn from(output: Output) -> Self {
        Self {
            output,
            value: Value::Null,
        }
    }
}
