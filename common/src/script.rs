//! Parseo estático del script Python con tree-sitter: funciones definidas,
//! decoradores, parámetros, docstrings, llamadas y alias de tipo.

use std::collections::HashMap;

use serde_json::{Map, Number, Value};
use tracing::debug;
use tree_sitter::{Node, Parser};

use crate::error::{Error, Result};
use crate::typing::TypeExpr;

/// Nombre del decorador que marca una función como expuesta.
pub const EXPOSED_DECORATOR: &str = "exposed";

#[derive(Debug, Clone, Default)]
pub struct ScriptModule {
    /// Todas las funciones del archivo (anidadas y métodos incluidos), en
    /// orden textual.
    pub functions: Vec<FunctionDef>,
    /// Alias de tipo y named tuples declarados a nivel de módulo.
    pub aliases: HashMap<String, TypeExpr>,
}

impl ScriptModule {
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn exposed(&self) -> impl Iterator<Item = &FunctionDef> {
        self.functions.iter().filter(|f| f.is_exposed())
    }
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    /// Líneas (1-based) de inicio y fin.
    pub span: (usize, usize),
    pub top_level: bool,
    pub decorators: Vec<String>,
    pub params: Vec<Param>,
    pub returns: Option<TypeExpr>,
    pub docstring: Option<String>,
    /// Llamadas a identificadores simples, en orden textual.
    pub calls: Vec<String>,
}

impl FunctionDef {
    pub fn is_exposed(&self) -> bool {
        self.top_level
            && self.name != EXPOSED_DECORATOR
            && self
                .decorators
                .iter()
                .any(|d| d == EXPOSED_DECORATOR || d.ends_with(".exposed"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Regular,
    /// `*args`
    VarPositional,
    /// `**kwargs`
    VarKeyword,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub annotation: Option<TypeExpr>,
    pub default: Option<DefaultValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    /// Literal representable en JSON.
    Literal(Value),
    /// Expresión arbitraria; se guarda el texto fuente.
    Opaque(String),
}

/* =========================
   Entrada principal
   ========================= */

pub fn parse(source: &str) -> Result<ScriptModule> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| Error::UnsupportedLanguage(format!("python ({e})")))?;
    let tree = parser.parse(source, None).ok_or_else(|| Error::ScriptSyntax {
        line: 0,
        message: "the parser could not process the source".into(),
    })?;

    let root = tree.root_node();
    let src = source.as_bytes();
    if root.has_error() {
        return Err(syntax_error(root, src));
    }

    let mut module = ScriptModule::default();
    collect_functions(root, src, &mut module.functions);
    collect_aliases(root, src, &mut module.aliases);
    debug!(
        "script parseado: {} funciones, {} alias",
        module.functions.len(),
        module.aliases.len()
    );
    Ok(module)
}

fn syntax_error(root: Node, src: &[u8]) -> Error {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            let message = if node.is_missing() {
                format!("missing {}", node.kind())
            } else {
                format!("invalid syntax near {:?}", node_text(node, src))
            };
            return Error::ScriptSyntax {
                line: node.start_position().row + 1,
                message,
            };
        }
        // en orden: el primer error textual queda arriba de la pila
        let mut children = all_children(node);
        children.reverse();
        stack.extend(children.into_iter().filter(|c| c.has_error()));
    }
    Error::ScriptSyntax {
        line: root.start_position().row + 1,
        message: "invalid syntax".into(),
    }
}

/* =========================
   Funciones
   ========================= */

fn collect_functions(node: Node, src: &[u8], out: &mut Vec<FunctionDef>) {
    for child in all_children(node) {
        if child.kind() == "function_definition" {
            out.push(function_def(child, src));
        }
        collect_functions(child, src, out);
    }
}

fn function_def(node: Node, src: &[u8]) -> FunctionDef {
    let name = field_text(node, "name", src);
    let parent = node.parent();
    let decorated = parent.filter(|p| p.kind() == "decorated_definition");
    let scope = decorated.and_then(|d| d.parent()).or(parent);
    let top_level = scope.is_some_and(|s| s.kind() == "module");

    let decorators = decorated
        .map(|d| {
            named_children(d)
                .into_iter()
                .filter(|c| c.kind() == "decorator")
                .filter_map(|c| c.named_child(0))
                .map(|expr| match expr.kind() {
                    // @exposed() cuenta igual que @exposed
                    "call" => field_text(expr, "function", src),
                    _ => node_text(expr, src),
                })
                .collect()
        })
        .unwrap_or_default();

    let params = node
        .child_by_field_name("parameters")
        .map(|p| named_children(p).into_iter().filter_map(|c| param(c, src)).collect())
        .unwrap_or_default();

    let returns = node
        .child_by_field_name("return_type")
        .map(|t| TypeExpr::from_node(t, src));

    let body = node.child_by_field_name("body");
    let docstring = body.and_then(|b| docstring(b, src));
    let mut calls = Vec::new();
    if let Some(body) = body {
        collect_calls(body, src, &mut calls);
    }

    FunctionDef {
        name,
        span: (node.start_position().row + 1, node.end_position().row + 1),
        top_level,
        decorators,
        params,
        returns,
        docstring,
        calls,
    }
}

fn param(node: Node, src: &[u8]) -> Option<Param> {
    let annotation = node
        .child_by_field_name("type")
        .map(|t| TypeExpr::from_node(t, src));
    let default = node.child_by_field_name("value").map(|v| match eval_literal(v, src) {
        Some(value) => DefaultValue::Literal(value),
        None => DefaultValue::Opaque(node_text(v, src)),
    });

    let target = match node.kind() {
        "identifier" | "list_splat_pattern" | "dictionary_splat_pattern" => node,
        "default_parameter" | "typed_default_parameter" => node.child_by_field_name("name")?,
        "typed_parameter" => node.named_child(0)?,
        // `*` y `/` no son parámetros
        _ => return None,
    };

    let (name, kind) = match target.kind() {
        "list_splat_pattern" => (splat_name(target, src), ParamKind::VarPositional),
        "dictionary_splat_pattern" => (splat_name(target, src), ParamKind::VarKeyword),
        _ => (node_text(target, src), ParamKind::Regular),
    };

    Some(Param {
        name,
        kind,
        annotation,
        default,
    })
}

fn splat_name(node: Node, src: &[u8]) -> String {
    node.named_child(0)
        .map(|n| node_text(n, src))
        .unwrap_or_else(|| node_text(node, src).trim_start_matches('*').to_string())
}

fn docstring(body: Node, src: &[u8]) -> Option<String> {
    let first = named_children(body).into_iter().next()?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let expr = first.named_child(0)?;
    string_literal(expr, src).map(|s| clean_doc(&s))
}

/// Recorta líneas vacías en los bordes y la indentación común, como
/// `inspect.cleandoc`.
fn clean_doc(doc: &str) -> String {
    let mut lines: Vec<&str> = doc.lines().collect();
    let indent = lines
        .iter()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .map(|l| ascii_indent(l))
        .min()
        .unwrap_or(0);

    let mut cleaned: Vec<String> = Vec::with_capacity(lines.len());
    if let Some(first) = lines.first_mut() {
        cleaned.push(first.trim().to_string());
    }
    for line in lines.iter().skip(1) {
        let cut = indent.min(ascii_indent(line));
        cleaned.push(line[cut..].trim_end().to_string());
    }
    while cleaned.first().is_some_and(|l| l.is_empty()) {
        cleaned.remove(0);
    }
    while cleaned.last().is_some_and(|l| l.is_empty()) {
        cleaned.pop();
    }
    cleaned.join("\n")
}

/// Bytes de espacios y tabs al comienzo de la línea.
fn ascii_indent(line: &str) -> usize {
    line.len() - line.trim_start_matches([' ', '\t']).len()
}

/// Llamadas `f(...)` con `f` identificador, en orden textual. Los cuerpos
/// de funciones anidadas no cuentan.
fn collect_calls(node: Node, src: &[u8], out: &mut Vec<String>) {
    for child in all_children(node) {
        match child.kind() {
            "function_definition" => continue,
            "call" => {
                if let Some(func) = child.child_by_field_name("function") {
                    if func.kind() == "identifier" {
                        out.push(node_text(func, src));
                    }
                }
            }
            _ => {}
        }
        collect_calls(child, src, out);
    }
}

/* =========================
   Alias de tipo
   ========================= */

fn collect_aliases(root: Node, src: &[u8], aliases: &mut HashMap<String, TypeExpr>) {
    for stmt in named_children(root) {
        match stmt.kind() {
            "expression_statement" => {
                let Some(assign) = stmt.named_child(0).filter(|a| a.kind() == "assignment") else {
                    continue;
                };
                let (Some(left), Some(right)) =
                    (assign.child_by_field_name("left"), assign.child_by_field_name("right"))
                else {
                    continue;
                };
                if left.kind() != "identifier" {
                    continue;
                }
                let tp = TypeExpr::from_node(right, src);
                if !matches!(tp, TypeExpr::Unknown(_)) {
                    aliases.insert(node_text(left, src), tp);
                }
            }
            "class_definition" => {
                if let Some((name, tp)) = named_tuple_class(stmt, src) {
                    aliases.insert(name, tp);
                }
            }
            "decorated_definition" => {
                if let Some(class) = stmt
                    .child_by_field_name("definition")
                    .filter(|d| d.kind() == "class_definition")
                {
                    if let Some((name, tp)) = named_tuple_class(class, src) {
                        aliases.insert(name, tp);
                    }
                }
            }
            _ => {}
        }
    }
}

/// `class Out(NamedTuple): x: int`
fn named_tuple_class(node: Node, src: &[u8]) -> Option<(String, TypeExpr)> {
    let name = field_text(node, "name", src);
    let bases = node.child_by_field_name("superclasses")?;
    let is_named_tuple = named_children(bases)
        .into_iter()
        .any(|b| matches!(node_text(b, src).as_str(), "NamedTuple" | "typing.NamedTuple"));
    if !is_named_tuple {
        return None;
    }

    let mut fields = Vec::new();
    for stmt in named_children(node.child_by_field_name("body")?) {
        let Some(assign) = stmt.named_child(0).filter(|a| a.kind() == "assignment") else {
            continue;
        };
        let (Some(left), Some(tp)) = (assign.child_by_field_name("left"), assign.child_by_field_name("type"))
        else {
            continue;
        };
        fields.push((node_text(left, src), TypeExpr::from_node(tp, src)));
    }
    Some((name.clone(), TypeExpr::NamedTuple { name, fields }))
}

/* =========================
   Helpers de nodos y literales
   ========================= */

pub(crate) fn node_text(node: Node, src: &[u8]) -> String {
    node.utf8_text(src).unwrap_or_default().to_string()
}

fn field_text(node: Node, field: &str, src: &[u8]) -> String {
    node.child_by_field_name(field)
        .map(|n| node_text(n, src))
        .unwrap_or_default()
}

fn all_children(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    node.children(&mut cursor).collect()
}

/// Hijos con nombre, sin comentarios.
pub(crate) fn named_children(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor)
        .filter(|c| c.kind() != "comment")
        .collect()
}

/// Contenido de un literal de string (sin f-strings ni bytes).
pub(crate) fn string_literal(node: Node, src: &[u8]) -> Option<String> {
    match node.kind() {
        "string" => {}
        "concatenated_string" => {
            return named_children(node)
                .into_iter()
                .map(|n| string_literal(n, src))
                .collect();
        }
        _ => return None,
    }

    let text = node_text(node, src);
    let start = text.find(['\'', '"'])?;
    let prefix = text[..start].to_ascii_lowercase();
    if prefix.contains('f') || prefix.contains('b') {
        return None;
    }
    let body = &text[start..];
    let quote = if body.starts_with("\"\"\"") || body.starts_with("'''") {
        &body[..3]
    } else {
        &body[..1]
    };
    let inner = body.strip_prefix(quote)?.strip_suffix(quote)?;
    if prefix.contains('r') {
        return Some(inner.to_string());
    }
    Some(unescape(inner))
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\n') => {}
            Some(other @ ('\\' | '\'' | '"')) => out.push(other),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Evalúa estáticamente un literal Python a JSON. `None` si la expresión no
/// es un literal representable.
pub(crate) fn eval_literal(node: Node, src: &[u8]) -> Option<Value> {
    match node.kind() {
        "integer" => parse_int(&node_text(node, src)).map(Value::from),
        "float" => {
            let text = node_text(node, src).replace('_', "");
            Number::from_f64(text.parse().ok()?).map(Value::Number)
        }
        "string" | "concatenated_string" => string_literal(node, src).map(Value::String),
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "none" => Some(Value::Null),
        "unary_operator" => {
            let op = field_text(node, "operator", src);
            let arg = eval_literal(node.child_by_field_name("argument")?, src)?;
            match (op.as_str(), arg) {
                ("+", v @ Value::Number(_)) => Some(v),
                ("-", Value::Number(n)) => {
                    if let Some(i) = n.as_i64() {
                        Some(Value::from(-i))
                    } else {
                        Number::from_f64(-n.as_f64()?).map(Value::Number)
                    }
                }
                _ => None,
            }
        }
        "list" | "tuple" | "set" => named_children(node)
            .into_iter()
            .map(|c| eval_literal(c, src))
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        "dictionary" => {
            let mut map = Map::new();
            for pair in named_children(node) {
                if pair.kind() != "pair" {
                    return None;
                }
                let key = eval_literal(pair.child_by_field_name("key")?, src)?;
                let Value::String(key) = key else {
                    return None;
                };
                map.insert(key, eval_literal(pair.child_by_field_name("value")?, src)?);
            }
            Some(Value::Object(map))
        }
        "parenthesized_expression" | "type" => eval_literal(node.named_child(0)?, src),
        _ => None,
    }
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.replace('_', "").to_ascii_lowercase();
    if let Some(hex) = text.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(oct) = text.strip_prefix("0o") {
        return i64::from_str_radix(oct, 8).ok();
    }
    if let Some(bin) = text.strip_prefix("0b") {
        return i64::from_str_radix(bin, 2).ok();
    }
    text.parse().ok()
}

/// Parsea una anotación de tipo suelta (usado por los tests de tipos).
#[cfg(test)]
pub(crate) fn parse_type_source(annotation: &str) -> Result<TypeExpr> {
    let source = format!("def _f() -> {annotation}:\n    pass\n");
    let module = parse(&source)?;
    module
        .functions
        .into_iter()
        .next()
        .and_then(|f| f.returns)
        .ok_or_else(|| Error::Validation(format!("no return annotation in {annotation:?}")))
}
