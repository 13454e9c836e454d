//! Compilación de un script a un transform: grafo de llamadas entre
//! funciones expuestas, punto de entrada y schemas de entradas y salidas.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::callgraph::CallGraph;
use crate::error::{Error, Result};
use crate::json_schema::JsonSchema;
use crate::script::{self, DefaultValue, FunctionDef, Param, ParamKind, ScriptModule};
use crate::transform::{ExposedFunction, Transform, TransformIn, DEFAULT_LANGUAGE};
use crate::typing::{self, TypeExpr};
use crate::variables::{Input, Output, Transfer};

pub struct TransformBuilder<'a> {
    transform_in: &'a TransformIn,
    user_id: &'a str,
}

impl<'a> TransformBuilder<'a> {
    pub fn new(transform_in: &'a TransformIn, user_id: &'a str) -> Self {
        Self { transform_in, user_id }
    }

    pub fn create(&self) -> Result<Transform> {
        let language = self.transform_in.language.to_ascii_lowercase();
        if language != DEFAULT_LANGUAGE {
            return Err(Error::UnsupportedLanguage(self.transform_in.language.clone()));
        }

        let entry_point = compile(&self.transform_in.source, &self.transform_in.entry_point.name)?;
        let description = if self.transform_in.description.is_empty() {
            entry_point.description.clone()
        } else {
            self.transform_in.description.clone()
        };

        let transform = Transform {
            id: Uuid::new_v4().to_string(),
            name: self.transform_in.name.clone(),
            description,
            public: self.transform_in.public,
            language,
            source: self.transform_in.source.clone(),
            entry_point,
            user_id: self.user_id.to_string(),
            created_at: Utc::now(),
        };
        info!(
            "transform {} compilado: entry point {}, {} funciones expuestas",
            transform.id,
            transform.entry_point.name,
            transform.walk_callees().len()
        );
        Ok(transform)
    }
}

/// Compila el fuente y devuelve el árbol de funciones expuestas desde el
/// punto de entrada.
pub fn compile(source: &str, entry_point_name: &str) -> Result<ExposedFunction> {
    let module = script::parse(source)?;
    let mut graph = CallGraph::build(&module.functions)?;

    // Un script con una única función la expone implícitamente.
    let sole_function = match module.functions.as_slice() {
        [only] => Some(only),
        _ => None,
    };
    let mut exposed: HashMap<&str, &FunctionDef> = module.exposed().map(|f| (f.name.as_str(), f)).collect();
    if let Some(only) = sole_function {
        exposed.insert(only.name.as_str(), only);
    }

    let exposed_names: HashSet<&str> = exposed.keys().copied().collect();
    let non_exposed = graph.nodes();
    graph.prune_nodes(
        non_exposed
            .iter()
            .map(String::as_str)
            .filter(|n| !exposed_names.contains(n)),
    );
    let dependencies = graph.ordered_dependencies();
    debug!("dependencias entre funciones expuestas: {:?}", dependencies);

    let entry_name = resolve_entry_point(sole_function, &graph, &exposed, entry_point_name)?;
    let compiler = Compiler {
        module: &module,
        exposed: &exposed,
        dependencies: &dependencies,
    };
    let entry = exposed
        .get(entry_name.as_str())
        .ok_or_else(|| Error::MissingEntryPoint(Some(entry_name.clone())))?;
    compiler.exposed_function(entry, None)
}

fn resolve_entry_point(
    sole_function: Option<&FunctionDef>,
    graph: &CallGraph,
    exposed: &HashMap<&str, &FunctionDef>,
    declared: &str,
) -> Result<String> {
    if let Some(only) = sole_function {
        return Ok(only.name.clone());
    }
    if graph.node_count() == 1 {
        if let Some(name) = graph.nodes().into_iter().next() {
            return Ok(name);
        }
    }
    if declared.is_empty() {
        return Err(Error::MissingEntryPoint(None));
    }
    if !exposed.contains_key(declared) {
        return Err(Error::MissingEntryPoint(Some(declared.to_string())));
    }
    Ok(declared.to_string())
}

struct Compiler<'m> {
    module: &'m ScriptModule,
    exposed: &'m HashMap<&'m str, &'m FunctionDef>,
    dependencies: &'m BTreeMap<String, Vec<String>>,
}

impl Compiler<'_> {
    fn exposed_function(&self, func: &FunctionDef, parent_id: Option<&str>) -> Result<ExposedFunction> {
        let id = match parent_id {
            Some(parent) => format!("{parent}.{}", func.name),
            None => func.name.clone(),
        };
        let is_entry = parent_id.is_none();

        let inputs = func
            .params
            .iter()
            .map(|p| self.input(&id, p, is_entry))
            .collect::<Result<Vec<_>>>()?;
        let outputs = self.outputs(&id, func, is_entry)?;

        let mut callees = Vec::new();
        for name in self.dependencies.get(&func.name).into_iter().flatten() {
            if let Some(callee) = self.exposed.get(name.as_str()) {
                callees.push(self.exposed_function(callee, Some(&id))?);
            }
        }

        Ok(ExposedFunction {
            id,
            name: func.name.clone(),
            description: func.docstring.clone().unwrap_or_default(),
            inputs,
            outputs,
            callees,
        })
    }

    fn input(&self, func_id: &str, param: &Param, is_entry: bool) -> Result<Input> {
        let mut json_schema = self.schema(param.annotation.as_ref())?;
        let variadic = param.kind != ParamKind::Regular;

        let (value, modifiable) = match &param.default {
            Some(DefaultValue::Literal(v)) => {
                json_schema.insert("default", v.clone());
                (v.clone(), is_entry && !variadic)
            }
            Some(DefaultValue::Opaque(expr)) => {
                debug!("default no representable para {}.{}: {}", func_id, param.name, expr);
                (Value::Null, false)
            }
            None => (Value::Null, is_entry && !variadic),
        };

        Ok(Input {
            id: format!("{func_id}.{}", param.name),
            name: param.name.clone(),
            json_schema,
            required: is_entry && !variadic && param.default.is_none(),
            modifiable,
            value,
        })
    }

    fn outputs(&self, func_id: &str, func: &FunctionDef, is_entry: bool) -> Result<Vec<Output>> {
        let returns = func.returns.as_ref().map(|t| t.resolve(&self.module.aliases));
        typing::output_types(returns.as_ref())
            .into_iter()
            .map(|(name, tp)| {
                let json_schema = self.schema(Some(&tp))?;
                let transfer = if is_entry {
                    extract_output_transfer(&json_schema)
                } else {
                    Transfer::Ignore
                };
                Ok(Output {
                    id: format!("{func_id}.{name}"),
                    name,
                    json_schema,
                    transfer,
                })
            })
            .collect()
    }

    /// Schema de una anotación: tipo base más los metadatos de `Annotated`.
    fn schema(&self, annotation: Option<&TypeExpr>) -> Result<JsonSchema> {
        let Some(tp) = annotation else {
            return Ok(JsonSchema::new());
        };
        let (core, extra) = typing::extract_annotations(&tp.resolve(&self.module.aliases));
        let mut schema = typing::schema_for(&core);
        schema.extend(&extra)?;
        typing::update_with_type(&mut schema, &core)?;
        Ok(schema)
    }
}

/// Transferencia por defecto de una salida del punto de entrada.
pub fn extract_output_transfer(schema: &JsonSchema) -> Transfer {
    if !schema.has_content_type() || schema.has_json_schema() {
        Transfer::Json
    } else {
        Transfer::Uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::EntryPointIn;
    use serde_json::json;

    fn transform_in(source: &str, entry_point: &str) -> TransformIn {
        TransformIn {
            name: "Test transform".into(),
            description: String::new(),
            public: true,
            language: "python".into(),
            source: source.into(),
            entry_point: EntryPointIn { name: entry_point.into() },
        }
    }

    fn schema_json(schema: &JsonSchema) -> Value {
        serde_json::to_value(schema).unwrap()
    }

    #[test]
    fn pipeline_simple_con_tupla() {
        let source = r#"
def pipeline(param1: str, param2: int = 3) -> tuple:
    """Devuelve el parámetro y una lista."""
    return param1, [param2 + 1, param2 + 11]
"#;
        let t = TransformBuilder::new(&transform_in(source, ""), "user-1").create().unwrap();
        let ep = &t.entry_point;
        assert_eq!(ep.id, "pipeline");
        assert_eq!(t.description, "Devuelve el parámetro y una lista.");

        assert_eq!(ep.inputs.len(), 2);
        let p1 = &ep.inputs[0];
        assert_eq!((p1.id.as_str(), p1.required, p1.modifiable), ("pipeline.param1", true, true));
        assert_eq!(schema_json(&p1.json_schema), json!({"type": "string"}));
        let p2 = &ep.inputs[1];
        assert_eq!((p2.required, p2.modifiable), (false, true));
        assert_eq!(p2.value, json!(3));
        assert_eq!(schema_json(&p2.json_schema), json!({"type": "integer", "default": 3}));

        assert_eq!(ep.outputs.len(), 1);
        assert_eq!(ep.outputs[0].id, "pipeline.0");
        assert_eq!(ep.outputs[0].transfer, Transfer::Json);
        assert_eq!(schema_json(&ep.outputs[0].json_schema), json!({"type": "array"}));
    }

    #[test]
    fn funcion_unica_ignora_el_entry_point_declarado() {
        let source = "def main(x):\n    return x\n";
        let ep = compile(source, "otro").unwrap();
        assert_eq!(ep.name, "main");
    }

    #[test]
    fn arbol_de_funciones_expuestas() {
        let source = r#"
from streamunolib import exposed

@exposed
def c(param_c: int):
    pass

def b(param_b: str):
    c(2)
    c(3)

@exposed
def pipeline(param1_pipeline: str = 'default1', param2_pipeline: int = 42) -> str:
    b(param1_pipeline)
    return 'ok'
"#;
        let ep = compile(source, "pipeline").unwrap();
        let ids: Vec<&str> = ep.walk_callees().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["pipeline", "pipeline.c", "pipeline.c"]);

        let c = &ep.callees[0];
        assert_eq!(c.inputs[0].id, "pipeline.c.param_c");
        assert!(!c.inputs[0].required);
        assert!(!c.inputs[0].modifiable);
        assert_eq!(c.outputs[0].transfer, Transfer::Ignore);

        assert_eq!(ep.inputs[0].value, json!("default1"));
        assert_eq!(ep.outputs[0].transfer, Transfer::Json);
    }

    #[test]
    fn entry_point_faltante_o_desconocido() {
        let source = "@exposed\ndef a():\n    pass\n\n@exposed\ndef b():\n    pass\n";
        assert!(matches!(compile(source, ""), Err(Error::MissingEntryPoint(None))));
        assert!(matches!(compile(source, "c"), Err(Error::MissingEntryPoint(Some(n))) if n == "c"));
        assert_eq!(compile(source, "b").unwrap().name, "b");
    }

    #[test]
    fn unica_funcion_expuesta_es_el_entry_point() {
        let source = "def helper():\n    pass\n\n@exposed\ndef main():\n    helper()\n";
        assert_eq!(compile(source, "").unwrap().name, "main");
    }

    #[test]
    fn salida_de_audio_se_transfiere_por_uri() {
        let source = r#"
from typing import Annotated
import numpy as np

@exposed
def sonify(data: list[float]) -> Annotated[np.ndarray, media_type('audio', rate=8000)]:
    return np.array(data)
"#;
        let ep = compile(source, "sonify").unwrap();
        let out = &ep.outputs[0];
        assert_eq!(out.transfer, Transfer::Uri);
        assert_eq!(
            schema_json(&out.json_schema),
            json!({"contentMediaType": "audio/*", "x-contentMediaEncoding": {"rate": 8000}})
        );
    }

    #[test]
    fn content_type_con_tipo_concreto_se_transfiere_por_json() {
        let source = "@exposed\ndef f() -> Annotated[str, media_type('text')]:\n    return 'x'\n";
        assert_eq!(compile(source, "f").unwrap().outputs[0].transfer, Transfer::Json);
    }

    #[test]
    fn salidas_de_named_tuple_declarado_como_clase() {
        let source = r#"
from typing import NamedTuple

class Out(NamedTuple):
    x: int
    y: float

@exposed
def f() -> Out:
    return Out(1, 2.0)
"#;
        let ep = compile(source, "f").unwrap();
        let ids: Vec<&str> = ep.outputs.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["f.x", "f.y"]);
        assert_eq!(schema_json(&ep.outputs[1].json_schema), json!({"type": "number"}));
    }

    #[test]
    fn default_opaco_no_es_modificable() {
        let source = "import numpy as np\n\n@exposed\ndef f(a=np.zeros(3)):\n    return a\n";
        let input = &compile(source, "f").unwrap().inputs[0];
        assert!(!input.modifiable);
        assert!(!input.required);
        assert_eq!(input.value, Value::Null);
    }

    #[test]
    fn ciclos_y_lenguajes_no_soportados_fallan() {
        let source = "@exposed\ndef a():\n    b()\n\n@exposed\ndef b():\n    a()\n";
        assert!(matches!(compile(source, "a"), Err(Error::CyclicDependency(_))));

        let mut t = transform_in("def f(): pass\n", "");
        t.language = "julia".into();
        assert!(matches!(
            TransformBuilder::new(&t, "u").create(),
            Err(Error::UnsupportedLanguage(_))
        ));
    }

    #[test]
    fn media_type_invalido_falla_al_compilar() {
        let source = "def f() -> Annotated[bytes, media_type('audio/X')]:\n    pass\n";
        assert!(matches!(compile(source, ""), Err(Error::InvalidMediaType(_))));
    }
}
