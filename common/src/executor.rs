//! Colaborador que ejecuta el punto de entrada y adaptación de su resultado
//! a las salidas del job.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Error, ExecutionError, Result};
use crate::job::Job;
use crate::transform::ExposedFunction;
use crate::value::OutputValue;

/// Resultado crudo del punto de entrada.
#[derive(Debug, Clone, PartialEq)]
pub enum RawResult {
    Single(OutputValue),
    Tuple(Vec<OutputValue>),
}

impl RawResult {
    /// Decodifica el formato de cable del driver. Una tupla de primer nivel
    /// llega como `{"$tuple": [...]}`.
    pub fn from_wire(value: Value) -> Result<Self> {
        if let Value::Object(obj) = &value {
            if let (1, Some(Value::Array(items))) = (obj.len(), obj.get("$tuple")) {
                return items
                    .iter()
                    .cloned()
                    .map(OutputValue::from_wire)
                    .collect::<Result<Vec<_>>>()
                    .map(RawResult::Tuple);
            }
        }
        OutputValue::from_wire(value).map(RawResult::Single)
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Ejecuta `entry_point` con los argumentos por nombre de `inputs`.
    async fn execute(
        &self,
        source: &str,
        entry_point: &str,
        inputs: &Map<String, Value>,
    ) -> std::result::Result<RawResult, ExecutionError>;
}

/// Argumentos por nombre del punto de entrada.
pub fn prepare_inputs(job: &Job) -> Map<String, Value> {
    job.inputs
        .iter()
        .map(|input| (input.name.clone(), input.value.clone()))
        .collect()
}

/// Reparte el resultado entre las salidas declaradas del punto de entrada.
pub fn prepare_outputs(entry_point: &ExposedFunction, result: RawResult) -> Result<HashMap<String, OutputValue>> {
    let outputs = &entry_point.outputs;
    match outputs.len() {
        0 => Ok(HashMap::new()),
        1 => {
            let value = match result {
                RawResult::Single(v) => v,
                RawResult::Tuple(items) => OutputValue::tuple(items),
            };
            Ok(HashMap::from([(outputs[0].id.clone(), value)]))
        }
        expected => {
            let items = match result {
                RawResult::Tuple(items) => items,
                RawResult::Single(_) => {
                    return Err(Error::from(ExecutionError::OutputArity { expected, actual: 1 }));
                }
            };
            if items.len() != expected {
                return Err(ExecutionError::OutputArity {
                    expected,
                    actual: items.len(),
                }
                .into());
            }
            Ok(outputs.iter().map(|o| o.id.clone()).zip(items).collect())
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Executor de prueba: devuelve un resultado fijo y guarda las llamadas.
    pub struct FakeExecutor {
        result: std::result::Result<RawResult, String>,
        pub calls: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    impl FakeExecutor {
        pub fn returning(result: RawResult) -> Self {
            Self {
                result: Ok(result),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                result: Err(message.to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        async fn execute(
            &self,
            _source: &str,
            entry_point: &str,
            inputs: &Map<String, Value>,
        ) -> std::result::Result<RawResult, ExecutionError> {
            self.calls
                .lock()
                .unwrap()
                .push((entry_point.to_string(), inputs.clone()));
            self.result.clone().map_err(ExecutionError::Runtime)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use serde_json::json;

    fn json(v: Value) -> OutputValue {
        OutputValue::Json(v)
    }

    #[test]
    fn una_salida_recibe_el_resultado_completo() {
        let ep = compile("def f() -> tuple:\n    return 1, 2\n", "").unwrap();
        let result = RawResult::Tuple(vec![json(json!(1)), json(json!(2))]);
        let values = prepare_outputs(&ep, result).unwrap();
        assert_eq!(values["f.0"], OutputValue::Json(json!([1, 2])));
    }

    #[test]
    fn varias_salidas_se_reparten_por_posicion() {
        let ep = compile("def f() -> tuple[int, str]:\n    return 1, 'a'\n", "").unwrap();
        let values = prepare_outputs(&ep, RawResult::Tuple(vec![json(json!(1)), json(json!("a"))])).unwrap();
        assert_eq!(values["f.0"], json(json!(1)));
        assert_eq!(values["f.1"], json(json!("a")));
    }

    #[test]
    fn aridad_incorrecta_falla_con_422() {
        let ep = compile("def f() -> tuple[int, str]:\n    return 1\n", "").unwrap();
        let err = prepare_outputs(&ep, RawResult::Single(json(json!(1)))).unwrap_err();
        assert!(matches!(
            err,
            Error::Execution(ExecutionError::OutputArity { expected: 2, actual: 1 })
        ));
        assert_eq!(err.status_code(), 422);

        let err = prepare_outputs(&ep, RawResult::Tuple(vec![json(json!(1)); 3])).unwrap_err();
        assert!(err.to_string().contains("expected 2, got 3"));
    }

    #[test]
    fn sin_salidas_el_mapa_queda_vacio() {
        let mut ep = compile("def f():\n    pass\n", "").unwrap();
        ep.outputs.clear();
        assert!(prepare_outputs(&ep, RawResult::Single(json(Value::Null))).unwrap().is_empty());
    }

    #[test]
    fn from_wire_separa_tuplas_de_primer_nivel() {
        assert_eq!(
            RawResult::from_wire(json!({"$tuple": [{"$bytes": "AQ=="}, 2]})).unwrap(),
            RawResult::Tuple(vec![OutputValue::Bytes(vec![1]), json(json!(2))])
        );
        assert_eq!(
            RawResult::from_wire(json!({"$tuple": [1, "a"]})).unwrap(),
            RawResult::Tuple(vec![json(json!(1)), json(json!("a"))])
        );
        assert_eq!(
            RawResult::from_wire(json!([1, 2])).unwrap(),
            RawResult::Single(json(json!([1, 2])))
        );
    }
}
