use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::mime;
use crate::value::OutputValue;

pub const CONTENT_MEDIA_TYPE: &str = "contentMediaType";
pub const CONTENT_MEDIA_ENCODING: &str = "x-contentMediaEncoding";

/// Claves que hacen que el schema valide una instancia concreta.
const INSTANCE_KEYS: [&str; 3] = ["type", "enum", "const"];

/// JSON schema abierto (mapa de claves reconocidas) asociado a una variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonSchema(Map<String, Value>);

impl JsonSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Tiene `contentMediaType`.
    pub fn has_content_type(&self) -> bool {
        self.0.contains_key(CONTENT_MEDIA_TYPE)
    }

    /// Tiene `type`, `enum` o `const`, es decir valida una instancia concreta.
    pub fn has_json_schema(&self) -> bool {
        INSTANCE_KEYS.iter().any(|k| self.0.contains_key(*k))
    }

    pub fn content_type(&self) -> Option<&str> {
        self.0.get(CONTENT_MEDIA_TYPE).and_then(Value::as_str)
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.0
            .insert(CONTENT_MEDIA_TYPE.into(), Value::String(content_type.into()));
    }

    pub fn encoding(&self) -> Option<&Map<String, Value>> {
        self.0.get(CONTENT_MEDIA_ENCODING).and_then(Value::as_object)
    }

    /// Extiende el schema con otro mapa (p. ej. metadatos de `Annotated`).
    /// Claves planas se pisan; content type y encoding se combinan.
    pub fn extend(&mut self, extra: &Map<String, Value>) -> Result<()> {
        *self = self.merge(&JsonSchema(extra.clone()))?;
        Ok(())
    }

    /// Combina el schema guardado con el pedido por el job.
    ///
    /// - claves planas: gana `requested`, salvo `type`/`enum`/`const` ya
    ///   definidos en el schema guardado.
    /// - `contentMediaType`: merge MIME (falla si son incompatibles).
    /// - `x-contentMediaEncoding`: unión de mapas.
    pub fn merge(&self, requested: &JsonSchema) -> Result<JsonSchema> {
        let mut merged = self.0.clone();
        for (k, v) in &requested.0 {
            if INSTANCE_KEYS.contains(&k.as_str()) && self.0.contains_key(k) {
                continue;
            }
            merged.insert(k.clone(), v.clone());
        }

        let content_type = mime::merge_content_types(self.content_type(), requested.content_type())?;
        if let Some(ct) = content_type {
            mime::split_content_type(&ct)?;
            merged.insert(CONTENT_MEDIA_TYPE.into(), Value::String(ct));
        }

        if let Some(encoding) = mime::merge_encoding_maps(self.encoding(), requested.encoding()) {
            merged.insert(CONTENT_MEDIA_ENCODING.into(), Value::Object(encoding));
        }

        Ok(JsonSchema(merged))
    }

    /// Completa el content type con lo que se puede inferir del valor devuelto.
    pub fn update_with_value(&mut self, value: &OutputValue) {
        if self.has_json_schema() {
            return;
        }

        let mut content_type = self.content_type().map(str::to_string);
        if matches!(value, OutputValue::Array(_) | OutputValue::Bytes(_)) && content_type.is_none() {
            content_type = Some(mime::APPLICATION_OCTET_STREAM.to_string());
        }

        if let Some(ct) = content_type {
            self.set_content_type(mime::concretize(&ct));
        }
    }
}

impl From<Map<String, Value>> for JsonSchema {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::value::NdArray;
    use serde_json::json;

    fn schema(v: Value) -> JsonSchema {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn clasifica_schemas() {
        assert!(schema(json!({"type": "string"})).has_json_schema());
        assert!(schema(json!({"enum": [1, 2]})).has_json_schema());
        assert!(!schema(json!({"contentMediaType": "audio/*"})).has_json_schema());
        assert!(schema(json!({"contentMediaType": "audio/*"})).has_content_type());
        assert!(!schema(json!({})).has_content_type());
    }

    #[test]
    fn merge_combina_content_type_y_encoding() {
        let stored = schema(json!({
            "title": "salida",
            "contentMediaType": "audio/*",
            "x-contentMediaEncoding": {"rate": 44100, "format": "int16"},
        }));
        let requested = schema(json!({
            "contentMediaType": "audio/x-wav",
            "x-contentMediaEncoding": {"format": "int32"},
        }));
        let merged = stored.merge(&requested).unwrap();
        assert_eq!(
            serde_json::to_value(&merged).unwrap(),
            json!({
                "title": "salida",
                "contentMediaType": "audio/x-wav",
                "x-contentMediaEncoding": {"rate": 44100, "format": "int32"},
            })
        );
    }

    #[test]
    fn merge_no_pisa_el_tipo_declarado() {
        let stored = schema(json!({"type": "integer"}));
        let requested = schema(json!({"type": "string", "title": "x"}));
        let merged = stored.merge(&requested).unwrap();
        assert_eq!(merged.get("type"), Some(&json!("integer")));
        assert_eq!(merged.get("title"), Some(&json!("x")));
    }

    #[test]
    fn merge_con_comodin_mantiene_el_declarado() {
        let stored = schema(json!({"contentMediaType": "application/octet-stream"}));
        let requested = schema(json!({"contentMediaType": "application/*"}));
        assert_eq!(
            stored.merge(&requested).unwrap().content_type(),
            Some("application/octet-stream")
        );
    }

    #[test]
    fn merge_incompatible_falla() {
        let stored = schema(json!({"contentMediaType": "audio/*"}));
        let requested = schema(json!({"contentMediaType": "image/png"}));
        assert!(matches!(
            stored.merge(&requested),
            Err(Error::IncompatibleMediaType { .. })
        ));
    }

    #[test]
    fn update_with_value_infiere_octet_stream_para_arreglos() {
        let mut s = JsonSchema::new();
        let arr = NdArray::from_i16(vec![1], &[0]).unwrap();
        s.update_with_value(&OutputValue::Array(arr));
        assert_eq!(s.content_type(), Some("application/octet-stream"));
    }

    #[test]
    fn update_with_value_concreta_comodines() {
        let mut s = schema(json!({"contentMediaType": "audio/*"}));
        s.update_with_value(&OutputValue::Json(json!(1)));
        assert_eq!(s.content_type(), Some("audio/x-wav"));
    }

    #[test]
    fn update_with_value_ignora_schemas_conocidos() {
        let mut s = schema(json!({"type": "array"}));
        s.update_with_value(&OutputValue::Bytes(vec![1, 2]));
        assert!(!s.has_content_type());
    }
}
