use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::variables::{Input, Output};

pub type TransformId = String;
pub type UserId = String;

pub const DEFAULT_LANGUAGE: &str = "python";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryPointIn {
    #[serde(default)]
    pub name: String,
}

/// El transform, tal como lo envía el usuario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformIn {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_public")]
    pub public: bool,
    #[serde(default = "default_language")]
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub entry_point: EntryPointIn,
}

fn default_public() -> bool {
    true
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

/// Descriptor de una función expuesta. Los callees forman un árbol: una
/// función llamada desde varios lugares aparece una vez por camino.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposedFunction {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<Input>,
    #[serde(default)]
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub callees: Vec<ExposedFunction>,
}

impl ExposedFunction {
    /// Recorre el árbol en preorden, empezando por `self`.
    pub fn walk_callees(&self) -> Vec<&ExposedFunction> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(f) = stack.pop() {
            out.push(f);
            stack.extend(f.callees.iter().rev());
        }
        out
    }
}

/// El transform compilado, tal como se guarda y se devuelve al usuario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub id: TransformId,
    pub name: String,
    pub description: String,
    pub public: bool,
    pub language: String,
    pub source: String,
    pub entry_point: ExposedFunction,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
}

impl Transform {
    pub fn walk_callees(&self) -> Vec<&ExposedFunction> {
        self.entry_point.walk_callees()
    }

    /// Visible para el usuario: propio o público.
    pub fn readable_by(&self, user_id: &str) -> bool {
        self.public || self.user_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn func(id: &str, callees: Vec<ExposedFunction>) -> ExposedFunction {
        ExposedFunction {
            id: id.into(),
            name: id.rsplit('.').next().unwrap_or(id).into(),
            description: String::new(),
            inputs: vec![],
            outputs: vec![],
            callees,
        }
    }

    #[test]
    fn walk_callees_en_preorden() {
        let tree = func(
            "p",
            vec![func("p.a", vec![func("p.a.c", vec![])]), func("p.b", vec![])],
        );
        let ids: Vec<&str> = tree.walk_callees().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["p", "p.a", "p.a.c", "p.b"]);
    }

    #[test]
    fn transform_in_con_valores_por_defecto() {
        let t: TransformIn = serde_json::from_str(r#"{"name": "t", "source": "def f(): pass"}"#).unwrap();
        assert!(t.public);
        assert_eq!(t.language, "python");
        assert_eq!(t.entry_point.name, "");
    }
}
