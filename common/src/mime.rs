//! Álgebra mínima de tipos MIME: validación, compatibilidad y merge entre el
//! content type declarado en el script y el pedido por el job.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

static REGEX_MIME_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(application|audio|image|text|video)/(\*|[a-z0-9-]+)$")
        .expect("regex de MIME válida")
});

pub const APPLICATION_JSON: &str = "application/json";
pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";

/// Tipo concreto por defecto para cada comodín.
const DEFAULT_CONTENT_TYPE: [(&str, &str); 5] = [
    ("application/*", APPLICATION_OCTET_STREAM),
    ("audio/*", "audio/x-wav"),
    ("image/*", "image/png"),
    ("text/*", "text/plain"),
    ("video/*", "video/mp4"),
];

/// Extensiones preferidas cuando la tabla de mime_guess da varias.
const PREFERRED_EXTENSIONS: [(&str, &str); 9] = [
    (APPLICATION_JSON, "json"),
    (APPLICATION_OCTET_STREAM, "bin"),
    ("audio/x-wav", "wav"),
    ("audio/wav", "wav"),
    ("audio/mpeg", "mp3"),
    ("image/png", "png"),
    ("image/jpeg", "jpg"),
    ("text/plain", "txt"),
    ("video/mp4", "mp4"),
];

/// Separa un content type en (tipo, subtipo).
pub fn split_content_type(content_type: &str) -> Result<(&str, &str)> {
    let caps = REGEX_MIME_TYPE
        .captures(content_type)
        .ok_or_else(|| Error::InvalidMediaType(content_type.to_string()))?;
    match (caps.get(1), caps.get(2)) {
        (Some(t), Some(s)) => Ok((t.as_str(), s.as_str())),
        _ => Err(Error::InvalidMediaType(content_type.to_string())),
    }
}

/// Mismo tipo y (algún subtipo comodín o subtipos iguales).
pub fn compatible_content_types(type1: &str, type2: &str) -> Result<bool> {
    let (t1, s1) = split_content_type(type1)?;
    let (t2, s2) = split_content_type(type2)?;
    Ok(t1 == t2 && (s1 == "*" || s2 == "*" || s1 == s2))
}

/// Combina el content type guardado en el transform con el pedido por el job.
///
/// Si el pedido termina en `/*` gana el declarado (más específico); si no,
/// se adopta el pedido.
pub fn merge_content_types(declared: Option<&str>, requested: Option<&str>) -> Result<Option<String>> {
    let (declared, requested) = match (declared, requested) {
        (None, other) | (other, None) => return Ok(other.map(str::to_string)),
        (Some(d), Some(r)) => (d, r),
    };

    if !compatible_content_types(declared, requested)? {
        return Err(Error::IncompatibleMediaType {
            declared: declared.to_string(),
            requested: requested.to_string(),
        });
    }
    if requested.ends_with("/*") {
        return Ok(Some(declared.to_string()));
    }
    Ok(Some(requested.to_string()))
}

/// Unión superficial de mapas de encoding, `b` pisa a `a`.
pub fn merge_encoding_maps(a: Option<&Map<String, Value>>, b: Option<&Map<String, Value>>) -> Option<Map<String, Value>> {
    if a.is_none() && b.is_none() {
        return None;
    }
    let mut merged = a.cloned().unwrap_or_default();
    if let Some(b) = b {
        for (k, v) in b {
            merged.insert(k.clone(), v.clone());
        }
    }
    Some(merged)
}

pub fn default_content_type(content_type: &str) -> Option<&'static str> {
    DEFAULT_CONTENT_TYPE
        .iter()
        .find(|(wildcard, _)| *wildcard == content_type)
        .map(|(_, concrete)| *concrete)
}

/// Reemplaza un comodín por su tipo concreto por defecto.
pub fn concretize(content_type: &str) -> String {
    default_content_type(content_type)
        .unwrap_or(content_type)
        .to_string()
}

/// Extensión (con punto) para un content type, o "" si no se conoce.
pub fn extension_for(content_type: &str) -> String {
    if let Some((_, ext)) = PREFERRED_EXTENSIONS.iter().find(|(ct, _)| *ct == content_type) {
        return format!(".{ext}");
    }
    mime_guess::get_mime_extensions_str(content_type)
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default()
}

/// Interpreta el primer argumento de `media_type(...)`: un MIME completo,
/// un tipo de primer nivel (`"audio"` -> `audio/*`) o una extensión de archivo.
pub fn media_type_from_kind(kind: &str) -> String {
    if kind.contains('/') {
        return kind.to_string();
    }
    if matches!(kind, "application" | "audio" | "image" | "text" | "video") {
        return format!("{kind}/*");
    }
    mime_guess::from_ext(kind)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| kind.to_string())
}
