//! Modelo estático de las anotaciones de tipo del script y su traducción a
//! JSON schema.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use tracing::warn;
use tree_sitter::Node;

use crate::error::{Error, Result};
use crate::json_schema::{JsonSchema, CONTENT_MEDIA_ENCODING, CONTENT_MEDIA_TYPE};
use crate::mime;
use crate::script::{eval_literal, named_children, node_text, string_literal};

/// Profundidad máxima al resolver alias (evita ciclos `A = B`, `B = A`).
const MAX_ALIAS_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    Any,
    None,
    /// Nombre simple o con puntos: `int`, `np.ndarray`.
    Name(String),
    /// `list[int]`, `tuple[int, float]`, `dict[str, int]`, `Optional[str]`...
    Generic { base: String, args: Vec<TypeExpr> },
    Union(Vec<TypeExpr>),
    Literal(Vec<Value>),
    Annotated { base: Box<TypeExpr>, metadata: Vec<Metadata> },
    NamedTuple { name: String, fields: Vec<(String, TypeExpr)> },
    /// Expresión que no sabemos interpretar (texto fuente).
    Unknown(String),
}

/// Metadato adjunto con `Annotated[T, ...]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Metadata {
    Mapping(Map<String, Value>),
    Other(String),
}

/// Tipo no traducible a JSON schema; se registra como warning.
#[derive(Debug)]
struct ExoticType(String);

/* =========================
   Parseo desde el árbol de tree-sitter
   ========================= */

impl TypeExpr {
    pub fn from_node(node: Node, src: &[u8]) -> TypeExpr {
        match node.kind() {
            "type" | "parenthesized_expression" => match node.named_child(0) {
                Some(inner) => TypeExpr::from_node(inner, src),
                None => TypeExpr::Unknown(node_text(node, src)),
            },
            "none" => TypeExpr::None,
            "ellipsis" => TypeExpr::Name("...".into()),
            "identifier" | "attribute" | "member_type" => named_type(&node_text(node, src)),
            "string" | "concatenated_string" => match string_literal(node, src) {
                // referencia adelantada: "Out"
                Some(s) => named_type(s.trim()),
                None => TypeExpr::Unknown(node_text(node, src)),
            },
            "subscript" => {
                let base = node
                    .child_by_field_name("value")
                    .map(|v| node_text(v, src))
                    .unwrap_or_default();
                let mut cursor = node.walk();
                let args: Vec<Node> = node.children_by_field_name("subscript", &mut cursor).collect();
                generic(&base, &args, src)
            }
            "generic_type" => {
                let children = named_children(node);
                let base = children
                    .iter()
                    .find(|c| c.kind() != "type_parameter")
                    .map(|c| node_text(*c, src))
                    .unwrap_or_default();
                let args = children
                    .iter()
                    .find(|c| c.kind() == "type_parameter")
                    .map(|p| named_children(*p))
                    .unwrap_or_default();
                generic(&base, &args, src)
            }
            "binary_operator" | "union_type" => {
                let op = node
                    .child_by_field_name("operator")
                    .map(|o| node_text(o, src))
                    .unwrap_or_else(|| "|".to_string());
                if op != "|" {
                    return TypeExpr::Unknown(node_text(node, src));
                }
                let members = named_children(node)
                    .into_iter()
                    .flat_map(|c| match TypeExpr::from_node(c, src) {
                        TypeExpr::Union(inner) => inner,
                        other => vec![other],
                    })
                    .collect();
                TypeExpr::Union(members)
            }
            "call" => call_type(node, src),
            _ => TypeExpr::Unknown(node_text(node, src)),
        }
    }

    /// Reemplaza nombres por los alias definidos a nivel de módulo.
    pub fn resolve(&self, aliases: &HashMap<String, TypeExpr>) -> TypeExpr {
        self.resolve_depth(aliases, 0)
    }

    fn resolve_depth(&self, aliases: &HashMap<String, TypeExpr>, depth: usize) -> TypeExpr {
        if depth > MAX_ALIAS_DEPTH {
            return self.clone();
        }
        let r = |t: &TypeExpr| t.resolve_depth(aliases, depth + 1);
        match self {
            TypeExpr::Name(n) => match aliases.get(n) {
                Some(target) => r(target),
                None => self.clone(),
            },
            TypeExpr::Generic { base, args } => TypeExpr::Generic {
                base: base.clone(),
                args: args.iter().map(r).collect(),
            },
            TypeExpr::Union(members) => TypeExpr::Union(members.iter().map(r).collect()),
            TypeExpr::Annotated { base, metadata } => match r(base) {
                // Annotated anidados se aplanan, como en typing
                TypeExpr::Annotated { base: inner, metadata: inner_meta } => TypeExpr::Annotated {
                    base: inner,
                    metadata: inner_meta.into_iter().chain(metadata.iter().cloned()).collect(),
                },
                base => TypeExpr::Annotated {
                    base: Box::new(base),
                    metadata: metadata.clone(),
                },
            },
            TypeExpr::NamedTuple { name, fields } => TypeExpr::NamedTuple {
                name: name.clone(),
                fields: fields.iter().map(|(f, t)| (f.clone(), r(t))).collect(),
            },
            _ => self.clone(),
        }
    }
}

fn short_name(name: &str) -> &str {
    name.strip_prefix("typing.")
        .or_else(|| name.strip_prefix("collections.abc."))
        .or_else(|| name.strip_prefix("collections."))
        .unwrap_or(name)
}

fn named_type(text: &str) -> TypeExpr {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    match short_name(&compact) {
        "Any" => TypeExpr::Any,
        "None" | "NoneType" => TypeExpr::None,
        _ => TypeExpr::Name(compact),
    }
}

fn generic(base: &str, args: &[Node], src: &[u8]) -> TypeExpr {
    let compact: String = base.chars().filter(|c| !c.is_whitespace()).collect();
    match short_name(&compact) {
        "Annotated" => {
            let Some((first, rest)) = args.split_first() else {
                return TypeExpr::Unknown(compact);
            };
            TypeExpr::Annotated {
                base: Box::new(TypeExpr::from_node(*first, src)),
                metadata: rest.iter().map(|m| metadata_from_node(*m, src)).collect(),
            }
        }
        "Literal" => TypeExpr::Literal(
            args.iter()
                .map(|a| unwrap_type(*a))
                .filter_map(|a| eval_literal(a, src))
                .collect(),
        ),
        "Optional" => match args.first() {
            Some(a) => TypeExpr::Union(vec![TypeExpr::from_node(*a, src), TypeExpr::None]),
            None => TypeExpr::Unknown(compact),
        },
        "Union" => TypeExpr::Union(args.iter().map(|a| TypeExpr::from_node(*a, src)).collect()),
        _ => TypeExpr::Generic {
            args: args.iter().map(|a| TypeExpr::from_node(*a, src)).collect(),
            base: compact,
        },
    }
}

fn unwrap_type(node: Node) -> Node {
    if node.kind() == "type" {
        if let Some(inner) = node.named_child(0) {
            return inner;
        }
    }
    node
}

/// `NamedTuple("Out", x=int)`, `NamedTuple("Out", [("x", int)])`,
/// `namedtuple("Out", "x, y")`.
fn call_type(node: Node, src: &[u8]) -> TypeExpr {
    let func = node
        .child_by_field_name("function")
        .map(|f| node_text(f, src))
        .unwrap_or_default();
    let args = node
        .child_by_field_name("arguments")
        .map(named_children)
        .unwrap_or_default();

    let name = args
        .first()
        .and_then(|a| string_literal(*a, src))
        .unwrap_or_default();

    match short_name(&func) {
        "NamedTuple" => {
            let mut fields = Vec::new();
            for arg in args.iter().skip(1) {
                match arg.kind() {
                    "keyword_argument" => {
                        let (Some(k), Some(v)) =
                            (arg.child_by_field_name("name"), arg.child_by_field_name("value"))
                        else {
                            continue;
                        };
                        fields.push((node_text(k, src), TypeExpr::from_node(v, src)));
                    }
                    "list" | "tuple" => {
                        for pair in named_children(*arg) {
                            let items = named_children(pair);
                            if let (Some(k), Some(v)) = (items.first(), items.get(1)) {
                                if let Some(k) = string_literal(*k, src) {
                                    fields.push((k, TypeExpr::from_node(*v, src)));
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            TypeExpr::NamedTuple { name, fields }
        }
        "namedtuple" => {
            let spec = args.get(1);
            let names: Vec<String> = match spec {
                Some(s) if matches!(s.kind(), "list" | "tuple") => named_children(*s)
                    .into_iter()
                    .filter_map(|n| string_literal(n, src))
                    .collect(),
                Some(s) => string_literal(*s, src)
                    .unwrap_or_default()
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
                    .collect(),
                None => Vec::new(),
            };
            TypeExpr::NamedTuple {
                name,
                fields: names.into_iter().map(|n| (n, TypeExpr::Any)).collect(),
            }
        }
        _ => TypeExpr::Unknown(node_text(node, src)),
    }
}

fn metadata_from_node(node: Node, src: &[u8]) -> Metadata {
    let node = unwrap_type(node);
    match node.kind() {
        "dictionary" => match eval_literal(node, src) {
            Some(Value::Object(map)) => Metadata::Mapping(map),
            _ => Metadata::Other(node_text(node, src)),
        },
        "call" => {
            let func = node
                .child_by_field_name("function")
                .map(|f| node_text(f, src))
                .unwrap_or_default();
            if func == "media_type" || func.ends_with(".media_type") {
                media_type_call(node, src)
            } else {
                Metadata::Other(node_text(node, src))
            }
        }
        _ => Metadata::Other(node_text(node, src)),
    }
}

/// `media_type("audio", rate=44100, format="int16")`.
fn media_type_call(node: Node, src: &[u8]) -> Metadata {
    let mut mapping = Map::new();
    let mut encoding = Map::new();
    let args = node
        .child_by_field_name("arguments")
        .map(named_children)
        .unwrap_or_default();

    for arg in args {
        if arg.kind() == "keyword_argument" {
            let (Some(k), Some(v)) = (arg.child_by_field_name("name"), arg.child_by_field_name("value")) else {
                continue;
            };
            let value = eval_literal(v, src).unwrap_or_else(|| Value::String(node_text(v, src)));
            encoding.insert(node_text(k, src), value);
        } else if let Some(kind) = string_literal(arg, src) {
            mapping.insert(
                CONTENT_MEDIA_TYPE.into(),
                Value::String(mime::media_type_from_kind(&kind)),
            );
        }
    }
    if !encoding.is_empty() {
        mapping.insert(CONTENT_MEDIA_ENCODING.into(), Value::Object(encoding));
    }
    Metadata::Mapping(mapping)
}

/* =========================
   Anotaciones y salidas
   ========================= */

/// Separa los metadatos tipo mapa de `Annotated[...]` en campos extra del
/// schema; el resto de los metadatos queda sobre el tipo.
pub fn extract_annotations(tp: &TypeExpr) -> (TypeExpr, Map<String, Value>) {
    let TypeExpr::Annotated { base, metadata } = tp else {
        return (tp.clone(), Map::new());
    };

    let mut extra = Map::new();
    let mut others = Vec::new();
    for meta in metadata {
        match meta {
            Metadata::Mapping(m) => {
                for (k, v) in m {
                    extra.insert(k.clone(), v.clone());
                }
            }
            Metadata::Other(_) => others.push(meta.clone()),
        }
    }

    if others.is_empty() {
        return ((**base).clone(), extra);
    }
    (
        TypeExpr::Annotated {
            base: base.clone(),
            metadata: others,
        },
        extra,
    )
}

/// Descompone el tipo de retorno en una o varias salidas con nombre.
pub fn output_types(tp: Option<&TypeExpr>) -> Vec<(String, TypeExpr)> {
    let Some(tp) = tp else {
        return vec![("0".to_string(), TypeExpr::Any)];
    };

    match tp {
        TypeExpr::NamedTuple { fields, .. } if !fields.is_empty() => fields.clone(),
        TypeExpr::Generic { base, args } if is_tuple(base) && !is_variadic(args) && !args.is_empty() => args
            .iter()
            .enumerate()
            .map(|(i, t)| (i.to_string(), t.clone()))
            .collect(),
        _ => vec![("0".to_string(), tp.clone())],
    }
}

fn is_tuple(base: &str) -> bool {
    matches!(short_name(base), "tuple" | "Tuple")
}

fn is_variadic(args: &[TypeExpr]) -> bool {
    matches!(args.last(), Some(TypeExpr::Name(n)) if n == "...")
}

/* =========================
   Schema
   ========================= */

/// JSON schema para una anotación. Un tipo exótico no es fatal: se registra
/// un warning y se usa el schema sin restricciones `{}`.
pub fn schema_for(tp: &TypeExpr) -> JsonSchema {
    match try_schema(tp) {
        Ok(map) => JsonSchema::from_map(map),
        Err(ExoticType(name)) => {
            warn!("no se pudo derivar un JSON schema para el tipo {}; se usa Any", name);
            JsonSchema::new()
        }
    }
}

fn obj(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

fn try_schema(tp: &TypeExpr) -> std::result::Result<Map<String, Value>, ExoticType> {
    Ok(match tp {
        TypeExpr::Any => Map::new(),
        TypeExpr::None => obj(json!({"type": "null"})),
        TypeExpr::Name(name) => match short_name(name) {
            "str" => obj(json!({"type": "string"})),
            "int" => obj(json!({"type": "integer"})),
            "float" => obj(json!({"type": "number"})),
            "bool" => obj(json!({"type": "boolean"})),
            "bytes" | "bytearray" => obj(json!({"type": "string", "contentEncoding": "base64"})),
            "list" | "List" | "Sequence" | "tuple" | "Tuple" => obj(json!({"type": "array"})),
            "set" | "Set" | "frozenset" | "FrozenSet" => obj(json!({"type": "array", "uniqueItems": true})),
            "dict" | "Dict" | "Mapping" => obj(json!({"type": "object"})),
            "object" => Map::new(),
            _ => return Err(ExoticType(name.clone())),
        },
        TypeExpr::Generic { base, args } => generic_schema(base, args)?,
        TypeExpr::Union(members) => {
            let any_of = members
                .iter()
                .map(|m| try_schema(m).map(Value::Object))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            obj(json!({"anyOf": any_of}))
        }
        TypeExpr::Literal(values) => {
            let mut m = Map::new();
            if let Some(t) = common_json_type(values) {
                m.insert("type".into(), Value::String(t.into()));
            }
            m.insert("enum".into(), Value::Array(values.clone()));
            m
        }
        TypeExpr::Annotated { base, metadata } => {
            let mut m = try_schema(base)?;
            for meta in metadata {
                if let Metadata::Mapping(extra) = meta {
                    for (k, v) in extra {
                        m.insert(k.clone(), v.clone());
                    }
                }
            }
            m
        }
        TypeExpr::NamedTuple { fields, .. } => {
            let mut properties = Map::new();
            for (name, t) in fields {
                properties.insert(name.clone(), Value::Object(try_schema(t)?));
            }
            let required: Vec<Value> = fields.iter().map(|(n, _)| Value::String(n.clone())).collect();
            obj(json!({
                "type": "object",
                "properties": properties,
                "required": required,
                "additionalProperties": false,
            }))
        }
        TypeExpr::Unknown(text) => return Err(ExoticType(text.clone())),
    })
}

fn generic_schema(base: &str, args: &[TypeExpr]) -> std::result::Result<Map<String, Value>, ExoticType> {
    let item = |i: usize| -> std::result::Result<Value, ExoticType> {
        match args.get(i) {
            Some(t) => try_schema(t).map(Value::Object),
            None => Ok(json!({})),
        }
    };
    Ok(match short_name(base) {
        "list" | "List" | "Sequence" => obj(json!({"type": "array", "items": item(0)?})),
        "set" | "Set" | "frozenset" | "FrozenSet" => {
            obj(json!({"type": "array", "items": item(0)?, "uniqueItems": true}))
        }
        "tuple" | "Tuple" if is_variadic(args) => obj(json!({"type": "array", "items": item(0)?})),
        "tuple" | "Tuple" => {
            let prefix = args
                .iter()
                .map(|t| try_schema(t).map(Value::Object))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            obj(json!({
                "type": "array",
                "prefixItems": prefix,
                "items": false,
                "minItems": args.len(),
                "maxItems": args.len(),
            }))
        }
        "dict" | "Dict" | "Mapping" => obj(json!({"type": "object", "additionalProperties": item(1)?})),
        _ => return Err(ExoticType(format!("{base}[...]"))),
    })
}

fn common_json_type(values: &[Value]) -> Option<&'static str> {
    let kind = |v: &Value| match v {
        Value::String(_) => Some("string"),
        Value::Bool(_) => Some("boolean"),
        Value::Number(n) if n.is_f64() => Some("number"),
        Value::Number(_) => Some("integer"),
        Value::Null => Some("null"),
        _ => None,
    };
    let first = kind(values.first()?)?;
    values.iter().all(|v| kind(v) == Some(first)).then_some(first)
}

/// Content type implícito en tipos conocidos de medios (imágenes, pistas de
/// audio). Si ya hay un content type declarado debe ser del mismo tipo.
pub fn update_with_type(schema: &mut JsonSchema, tp: &TypeExpr) -> Result<()> {
    let TypeExpr::Name(name) = tp else {
        return Ok(());
    };
    let implied = match name.as_str() {
        "Image" | "Image.Image" | "PIL.Image.Image" => "image",
        "Track" | "sonounolib.Track" => "audio",
        _ => return Ok(()),
    };

    match schema.content_type() {
        None => schema.set_content_type(format!("{implied}/*")),
        Some(ct) => {
            let (top, _) = mime::split_content_type(ct)?;
            if top != implied {
                return Err(Error::IncompatibleMediaType {
                    declared: format!("{implied}/*"),
                    requested: ct.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::parse_type_source;

    fn tp(src: &str) -> TypeExpr {
        parse_type_source(src).unwrap()
    }

    fn schema_json(src: &str) -> Value {
        serde_json::to_value(schema_for(&tp(src))).unwrap()
    }

    #[test]
    fn schema_de_tipos_basicos() {
        assert_eq!(schema_json("str"), json!({"type": "string"}));
        assert_eq!(schema_json("int"), json!({"type": "integer"}));
        assert_eq!(schema_json("float"), json!({"type": "number"}));
        assert_eq!(schema_json("Any"), json!({}));
        assert_eq!(schema_json("list[int]"), json!({"type": "array", "items": {"type": "integer"}}));
        assert_eq!(
            schema_json("dict[str, float]"),
            json!({"type": "object", "additionalProperties": {"type": "number"}})
        );
    }

    #[test]
    fn schema_de_tupla_y_union() {
        assert_eq!(
            schema_json("tuple[int, str]"),
            json!({
                "type": "array",
                "prefixItems": [{"type": "integer"}, {"type": "string"}],
                "items": false,
                "minItems": 2,
                "maxItems": 2,
            })
        );
        assert_eq!(
            schema_json("Optional[int]"),
            json!({"anyOf": [{"type": "integer"}, {"type": "null"}]})
        );
        assert_eq!(
            schema_json("int | str"),
            json!({"anyOf": [{"type": "integer"}, {"type": "string"}]})
        );
        assert_eq!(
            schema_json("Literal['a', 'b']"),
            json!({"type": "string", "enum": ["a", "b"]})
        );
    }

    #[test]
    fn tipo_exotico_cae_en_any() {
        assert_eq!(schema_json("np.ndarray"), json!({}));
        assert_eq!(schema_json("list[MyClass]"), json!({}));
    }

    #[test]
    fn extract_annotations_separa_mapas() {
        let (core, extra) = extract_annotations(&tp("int"));
        assert_eq!(core, TypeExpr::Name("int".into()));
        assert!(extra.is_empty());

        let (core, extra) = extract_annotations(&tp("Annotated[int, media_type('jpg')]"));
        assert_eq!(core, TypeExpr::Name("int".into()));
        assert_eq!(Value::Object(extra), json!({"contentMediaType": "image/jpeg"}));

        let (core, extra) = extract_annotations(&tp("Annotated[int, 2, media_type('jpg'), 3]"));
        assert_eq!(
            core,
            TypeExpr::Annotated {
                base: Box::new(TypeExpr::Name("int".into())),
                metadata: vec![Metadata::Other("2".into()), Metadata::Other("3".into())],
            }
        );
        assert_eq!(Value::Object(extra), json!({"contentMediaType": "image/jpeg"}));

        let (core, extra) = extract_annotations(&tp("Annotated[int, {}]"));
        assert_eq!(core, TypeExpr::Name("int".into()));
        assert!(extra.is_empty());

        let (_, extra) = extract_annotations(&tp("Annotated[int, media_type('image', info=None)]"));
        assert_eq!(
            Value::Object(extra),
            json!({"contentMediaType": "image/*", "x-contentMediaEncoding": {"info": null}})
        );
    }

    #[test]
    fn output_types_descompone_el_retorno() {
        let names = |t: Option<&TypeExpr>| -> Vec<String> {
            output_types(t).into_iter().map(|(n, _)| n).collect()
        };
        assert_eq!(output_types(None), vec![("0".to_string(), TypeExpr::Any)]);
        assert_eq!(names(Some(&tp("str"))), vec!["0"]);
        assert_eq!(names(Some(&tp("tuple"))), vec!["0"]);
        assert_eq!(names(Some(&tp("list[int]"))), vec!["0"]);
        assert_eq!(
            output_types(Some(&tp("tuple[int, float]"))),
            vec![
                ("0".to_string(), TypeExpr::Name("int".into())),
                ("1".to_string(), TypeExpr::Name("float".into())),
            ]
        );
        assert_eq!(names(Some(&tp("namedtuple('Out1', 'x, y')"))), vec!["x", "y"]);
        assert_eq!(
            output_types(Some(&tp("NamedTuple('Out2', x=int, y=float)"))),
            vec![
                ("x".to_string(), TypeExpr::Name("int".into())),
                ("y".to_string(), TypeExpr::Name("float".into())),
            ]
        );
    }

    #[test]
    fn update_with_type_agrega_content_type_de_imagenes() {
        let mut s = JsonSchema::new();
        update_with_type(&mut s, &TypeExpr::Name("PIL.Image.Image".into())).unwrap();
        assert_eq!(s.content_type(), Some("image/*"));

        let mut s = JsonSchema::new();
        s.set_content_type("audio/*");
        assert!(update_with_type(&mut s, &TypeExpr::Name("Image".into())).is_err());
    }

    #[test]
    fn alias_se_resuelven() {
        let mut aliases = HashMap::new();
        aliases.insert("Out".to_string(), tp("Annotated[np.ndarray, media_type('audio')]"));
        let resolved = TypeExpr::Name("Out".into()).resolve(&aliases);
        let (core, extra) = extract_annotations(&resolved);
        assert_eq!(core, TypeExpr::Name("np.ndarray".into()));
        assert_eq!(extra[CONTENT_MEDIA_TYPE], json!("audio/*"));
    }
}
