use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::job::{Job, JobIn, JobStatus};
use crate::transform::Transform;
use crate::variables::{Input, InputIn, Output, OutputIn, OutputWithValue, Transfer};

/// Arma un job a partir del transform guardado y lo pedido por el cliente.
pub struct JobBuilder<'a> {
    job_in: &'a JobIn,
    user_id: &'a str,
    transform: &'a Transform,
}

impl<'a> JobBuilder<'a> {
    pub fn new(job_in: &'a JobIn, user_id: &'a str, transform: &'a Transform) -> Self {
        Self {
            job_in,
            user_id,
            transform,
        }
    }

    pub fn create(&self) -> Result<Job> {
        // en orden de preorden; un id repetido queda con la última aparición
        let mut transform_inputs: Vec<&Input> = Vec::new();
        let mut transform_outputs: Vec<&Output> = Vec::new();
        for callee in self.transform.walk_callees() {
            transform_inputs.extend(&callee.inputs);
            transform_outputs.extend(&callee.outputs);
        }

        let job = Job {
            id: Uuid::new_v4().to_string(),
            transform_id: self.transform.id.clone(),
            user_id: self.user_id.to_string(),
            status: JobStatus::Accepted,
            inputs: self.extract_inputs(&dedup(transform_inputs, |i| &i.id))?,
            outputs: self.extract_outputs(&dedup(transform_outputs, |o| &o.id))?,
            created_at: Utc::now(),
            done_at: None,
            error: None,
        };
        debug!(
            "job {} armado: {} entradas, {} salidas",
            job.id,
            job.inputs.len(),
            job.outputs.len()
        );
        Ok(job)
    }

    /// Entradas modificables del transform, con los valores del cliente.
    fn extract_inputs(&self, transform_inputs: &[&Input]) -> Result<Vec<Input>> {
        let job_inputs: HashMap<&str, &InputIn> = self.job_in.inputs.iter().map(|i| (i.id.as_str(), i)).collect();
        check_known("input", job_inputs.keys().copied(), transform_inputs.iter().map(|i| i.id.as_str()))?;

        let mut out = Vec::new();
        for transform_input in transform_inputs {
            if !transform_input.modifiable {
                continue;
            }
            let mut input = (*transform_input).clone();
            if let Some(job_input) = job_inputs.get(input.id.as_str()) {
                input.value = job_input.value.clone();
            } else if input.required {
                return Err(Error::MissingInput(input.id));
            }
            out.push(input);
        }
        Ok(out)
    }

    /// Salidas del transform que se transfieren, combinadas con lo pedido.
    fn extract_outputs(&self, transform_outputs: &[&Output]) -> Result<Vec<OutputWithValue>> {
        let job_outputs: HashMap<&str, &OutputIn> = self.job_in.outputs.iter().map(|o| (o.id.as_str(), o)).collect();
        check_known("output", job_outputs.keys().copied(), transform_outputs.iter().map(|o| o.id.as_str()))?;

        let mut out = Vec::new();
        for transform_output in transform_outputs {
            if transform_output.transfer == Transfer::Ignore {
                continue;
            }
            let mut output = (*transform_output).clone();
            if let Some(job_output) = job_outputs.get(output.id.as_str()) {
                if let Some(transfer) = job_output.transfer {
                    output.transfer = transfer;
                }
                output.json_schema = output.json_schema.merge(&job_output.json_schema)?;
            }
            out.push(output.into());
        }
        Ok(out)
    }
}

fn dedup<'t, T>(items: Vec<&'t T>, id: impl Fn(&T) -> &String) -> Vec<&'t T> {
    let last: HashMap<&String, usize> = items.iter().enumerate().map(|(i, item)| (id(*item), i)).collect();
    items
        .iter()
        .enumerate()
        .filter(|(i, item)| last.get(id(**item)) == Some(i))
        .map(|(_, item)| *item)
        .collect()
}

fn check_known<'i>(
    kind: &'static str,
    requested: impl Iterator<Item = &'i str>,
    known: impl Iterator<Item = &'i str>,
) -> Result<()> {
    let known: BTreeSet<&str> = known.collect();
    let unknown: BTreeSet<&str> = requested.filter(|id| !known.contains(id)).collect();
    if unknown.is_empty() {
        return Ok(());
    }
    Err(Error::UnknownVariables {
        kind,
        ids: unknown.into_iter().map(str::to_string).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::TransformBuilder;
    use crate::transform::{EntryPointIn, TransformIn};
    use serde_json::{json, Value};

    const SOURCE: &str = r#"
from typing import Annotated
import numpy as np

@exposed
def helper(x: int = 1) -> int:
    return x

@exposed
def pipeline(param1: str, param2: int = 3) -> tuple[Annotated[np.ndarray, media_type('audio')], int]:
    return np.zeros(10), helper(param2)
"#;

    fn transform() -> Transform {
        let t = TransformIn {
            name: "t".into(),
            description: String::new(),
            public: true,
            language: "python".into(),
            source: SOURCE.into(),
            entry_point: EntryPointIn { name: "pipeline".into() },
        };
        TransformBuilder::new(&t, "user-1").create().unwrap()
    }

    fn job_in(inputs: Value, outputs: Value) -> JobIn {
        serde_json::from_value(json!({"transform_id": "t", "inputs": inputs, "outputs": outputs})).unwrap()
    }

    #[test]
    fn combina_entradas_con_los_valores_del_cliente() {
        let t = transform();
        let job_in = job_in(json!([{"id": "pipeline.param1", "value": "test"}]), json!([]));
        let job = JobBuilder::new(&job_in, "user-1", &t).create().unwrap();

        assert_eq!(job.status, JobStatus::Accepted);
        let values: Vec<(&str, &Value)> = job.inputs.iter().map(|i| (i.id.as_str(), &i.value)).collect();
        assert_eq!(
            values,
            vec![("pipeline.param1", &json!("test")), ("pipeline.param2", &json!(3))]
        );
    }

    #[test]
    fn entrada_requerida_sin_valor_falla() {
        let t = transform();
        let err = JobBuilder::new(&job_in(json!([]), json!([])), "u", &t).create().unwrap_err();
        assert!(matches!(err, Error::MissingInput(id) if id == "pipeline.param1"));
    }

    #[test]
    fn ids_desconocidos_fallan_ordenados() {
        let t = transform();
        let job_in = job_in(
            json!([{"id": "pipeline.param1", "value": "a"}, {"id": "z.y", "value": 1}, {"id": "a.b", "value": 1}]),
            json!([]),
        );
        let err = JobBuilder::new(&job_in, "u", &t).create().unwrap_err();
        match err {
            Error::UnknownVariables { kind, ids } => {
                assert_eq!(kind, "input");
                assert_eq!(ids, vec!["a.b", "z.y"]);
            }
            other => panic!("error inesperado: {other:?}"),
        }

        let job_in = job_in_with_output("pipeline.9");
        assert!(matches!(
            JobBuilder::new(&job_in, "u", &t).create(),
            Err(Error::UnknownVariables { kind: "output", .. })
        ));
    }

    fn job_in_with_output(id: &str) -> JobIn {
        job_in(
            json!([{"id": "pipeline.param1", "value": "a"}]),
            json!([{"id": id, "schema": {"contentMediaType": "audio/x-wav"}}]),
        )
    }

    #[test]
    fn salidas_ignoradas_no_se_incluyen_y_se_mergean_schemas() {
        let t = transform();
        let job = JobBuilder::new(&job_in_with_output("pipeline.0"), "u", &t).create().unwrap();
        let ids: Vec<&str> = job.outputs.iter().map(|o| o.output.id.as_str()).collect();
        assert_eq!(ids, vec!["pipeline.0", "pipeline.1"]);

        let audio = &job.outputs[0].output;
        assert_eq!(audio.transfer, Transfer::Uri);
        assert_eq!(audio.json_schema.content_type(), Some("audio/x-wav"));
    }

    #[test]
    fn salida_de_un_callee_puede_pedirse_pero_se_ignora() {
        let t = transform();
        let job = JobBuilder::new(&job_in_with_output_plain("pipeline.helper.0"), "u", &t).create().unwrap();
        assert!(job.outputs.iter().all(|o| o.output.id != "pipeline.helper.0"));
    }

    fn job_in_with_output_plain(id: &str) -> JobIn {
        job_in(json!([{"id": "pipeline.param1", "value": "a"}]), json!([{"id": id}]))
    }

    #[test]
    fn transfer_pedido_reemplaza_el_guardado() {
        let t = transform();
        let job_in = job_in(
            json!([{"id": "pipeline.param1", "value": "a"}]),
            json!([{"id": "pipeline.1", "transfer": "uri"}]),
        );
        let job = JobBuilder::new(&job_in, "u", &t).create().unwrap();
        assert_eq!(job.outputs[1].output.transfer, Transfer::Uri);
        assert_eq!(
            serde_json::to_value(&job.outputs[1].output.json_schema).unwrap(),
            json!({"type": "integer"})
        );
    }

    #[test]
    fn content_type_incompatible_falla() {
        let t = transform();
        let job_in = job_in(
            json!([{"id": "pipeline.param1", "value": "a"}]),
            json!([{"id": "pipeline.0", "schema": {"contentMediaType": "image/png"}}]),
        );
        assert!(matches!(
            JobBuilder::new(&job_in, "u", &t).create(),
            Err(Error::IncompatibleMediaType { .. })
        ));
    }
}
