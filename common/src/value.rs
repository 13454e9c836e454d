//! Valores producidos por la ejecución de un transform.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Bool,
    UInt8,
    Int8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    UInt64,
    Int64,
    Float32,
    Float64,
}

impl DType {
    pub fn from_name(name: &str) -> Option<DType> {
        Some(match name {
            "bool" => DType::Bool,
            "uint8" => DType::UInt8,
            "int8" => DType::Int8,
            "uint16" => DType::UInt16,
            "int16" => DType::Int16,
            "uint32" => DType::UInt32,
            "int32" => DType::Int32,
            "uint64" => DType::UInt64,
            "int64" => DType::Int64,
            "float32" => DType::Float32,
            "float64" => DType::Float64,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::UInt8 => "uint8",
            DType::Int8 => "int8",
            DType::UInt16 => "uint16",
            DType::Int16 => "int16",
            DType::UInt32 => "uint32",
            DType::Int32 => "int32",
            DType::UInt64 => "uint64",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        }
    }

    pub fn itemsize(self) -> usize {
        match self {
            DType::Bool | DType::UInt8 | DType::Int8 => 1,
            DType::UInt16 | DType::Int16 => 2,
            DType::UInt32 | DType::Int32 | DType::Float32 => 4,
            DType::UInt64 | DType::Int64 | DType::Float64 => 8,
        }
    }

    /// Descriptor NPY (little-endian).
    pub fn npy_descr(self) -> &'static str {
        match self {
            DType::Bool => "|b1",
            DType::UInt8 => "|u1",
            DType::Int8 => "|i1",
            DType::UInt16 => "<u2",
            DType::Int16 => "<i2",
            DType::UInt32 => "<u4",
            DType::Int32 => "<i4",
            DType::UInt64 => "<u8",
            DType::Int64 => "<i8",
            DType::Float32 => "<f4",
            DType::Float64 => "<f8",
        }
    }
}

/// Arreglo numérico n-dimensional, datos contiguos en orden C, little-endian.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl NdArray {
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.itemsize();
        if data.len() != expected {
            return Err(Error::Validation(format!(
                "array data has {} bytes, expected {expected} for shape {shape:?} and dtype {}",
                data.len(),
                dtype.name()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_i16(shape: Vec<usize>, values: &[i16]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::Int16, shape, data)
    }

    pub fn from_f64(shape: Vec<usize>, values: &[f64]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::Float64, shape, data)
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodifica todos los elementos como f64 (para castear de formato).
    pub fn to_f64_vec(&self) -> Vec<f64> {
        let size = self.dtype.itemsize();
        self.data
            .chunks_exact(size)
            .map(|c| match self.dtype {
                DType::Bool => f64::from(c[0] != 0),
                DType::UInt8 => f64::from(c[0]),
                DType::Int8 => f64::from(c[0] as i8),
                DType::UInt16 => f64::from(u16::from_le_bytes([c[0], c[1]])),
                DType::Int16 => f64::from(i16::from_le_bytes([c[0], c[1]])),
                DType::UInt32 => f64::from(u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                DType::Int32 => f64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                DType::Float32 => f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                DType::UInt64 => u64::from_le_bytes(eight(c)) as f64,
                DType::Int64 => i64::from_le_bytes(eight(c)) as f64,
                DType::Float64 => f64::from_le_bytes(eight(c)),
            })
            .collect()
    }
}

fn eight(c: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&c[..8]);
    out
}

/// Valor crudo de una salida, tal como lo devuelve el colaborador de ejecución.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    /// Cualquier valor representable en JSON.
    Json(Value),
    Array(NdArray),
    Bytes(Vec<u8>),
    /// Tupla con elementos no representables en JSON.
    Tuple(Vec<OutputValue>),
    /// Objeto arbitrario del script; `state` es su estado best-effort.
    Object { type_name: String, state: Value },
}

impl OutputValue {
    /// Decodifica el formato etiquetado del driver de ejecución.
    pub fn from_wire(value: Value) -> Result<Self> {
        let Value::Object(mut obj) = value else {
            return Ok(OutputValue::Json(value));
        };
        if obj.len() != 1 {
            return Ok(OutputValue::Json(Value::Object(obj)));
        }

        if let Some(arr) = obj.remove("$ndarray") {
            return decode_ndarray(&arr).map(OutputValue::Array);
        }
        if let Some(data) = obj.remove("$bytes") {
            let data = data
                .as_str()
                .ok_or_else(|| Error::Encoding("$bytes must be a base64 string".into()))?;
            return decode_base64(data).map(OutputValue::Bytes);
        }
        if let Some(Value::Array(items)) = obj.get("$tuple") {
            let items = items
                .iter()
                .cloned()
                .map(OutputValue::from_wire)
                .collect::<Result<Vec<_>>>()?;
            return Ok(OutputValue::tuple(items));
        }
        // diccionario del usuario con claves que empiezan con '$'
        if let Some(Value::Object(inner)) = obj.get("$dict") {
            return Ok(OutputValue::Json(Value::Object(inner.clone())));
        }
        if let Some(o) = obj.remove("$object") {
            let type_name = o
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("object")
                .to_string();
            let state = o.get("state").cloned().unwrap_or(Value::Null);
            return Ok(OutputValue::Object { type_name, state });
        }
        Ok(OutputValue::Json(Value::Object(obj)))
    }

    /// Agrupa valores como una tupla; si todos son JSON queda como arreglo JSON.
    pub fn tuple(values: Vec<OutputValue>) -> Self {
        if values.iter().all(|v| matches!(v, OutputValue::Json(_))) {
            let items = values
                .into_iter()
                .filter_map(|v| match v {
                    OutputValue::Json(j) => Some(j),
                    _ => None,
                })
                .collect();
            return OutputValue::Json(Value::Array(items));
        }
        OutputValue::Tuple(values)
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            OutputValue::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn type_name(&self) -> String {
        match self {
            OutputValue::Json(Value::Null) => "NoneType".into(),
            OutputValue::Json(Value::Bool(_)) => "bool".into(),
            OutputValue::Json(Value::Number(n)) if n.is_f64() => "float".into(),
            OutputValue::Json(Value::Number(_)) => "int".into(),
            OutputValue::Json(Value::String(_)) => "str".into(),
            OutputValue::Json(Value::Array(_)) => "list".into(),
            OutputValue::Json(Value::Object(_)) => "dict".into(),
            OutputValue::Array(_) => "ndarray".into(),
            OutputValue::Bytes(_) => "bytes".into(),
            OutputValue::Tuple(_) => "tuple".into(),
            OutputValue::Object { type_name, .. } => type_name.clone(),
        }
    }

    /// Representación corta para mensajes de error.
    pub fn repr(&self) -> String {
        let full = match self {
            OutputValue::Json(v) => v.to_string(),
            OutputValue::Array(a) => format!("ndarray(dtype={}, shape={:?})", a.dtype.name(), a.shape),
            OutputValue::Bytes(b) => format!("bytes(len={})", b.len()),
            OutputValue::Tuple(items) => {
                let inner: Vec<String> = items.iter().map(OutputValue::repr).collect();
                format!("({})", inner.join(", "))
            }
            OutputValue::Object { type_name, state } => format!("<{type_name} {state}>"),
        };
        if full.chars().count() > 200 {
            let cut: String = full.chars().take(200).collect();
            return format!("{cut}...");
        }
        full
    }
}

fn decode_base64(data: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(data)
        .map_err(|e| Error::Encoding(format!("invalid base64 payload: {e}")))
}

fn decode_ndarray(arr: &Value) -> Result<NdArray> {
    let dtype_name = arr.get("dtype").and_then(Value::as_str).unwrap_or_default();
    let dtype = DType::from_name(dtype_name)
        .ok_or_else(|| Error::Encoding(format!("unsupported array dtype {dtype_name:?}")))?;
    let shape = arr
        .get("shape")
        .and_then(Value::as_array)
        .map(|dims| dims.iter().map(decode_dim).collect::<Result<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();
    let data = decode_base64(arr.get("data").and_then(Value::as_str).unwrap_or_default())?;
    NdArray::new(dtype, shape, data)
}

fn decode_dim(dim: &Value) -> Result<usize> {
    dim.as_u64()
        .and_then(|d| usize::try_from(d).ok())
        .ok_or_else(|| Error::Encoding(format!("ndarray shape must contain non-negative integers, got {dim}")))
}

/// Inverso de `from_wire`.
pub fn to_wire(value: &OutputValue) -> Value {
    match value {
        OutputValue::Json(Value::Object(o)) if o.keys().any(|k| k.starts_with('$')) => json!({"$dict": o}),
        OutputValue::Json(v) => v.clone(),
        OutputValue::Array(a) => json!({"$ndarray": {
            "dtype": a.dtype.name(),
            "shape": a.shape,
            "data": BASE64.encode(&a.data),
        }}),
        OutputValue::Bytes(b) => json!({"$bytes": BASE64.encode(b)}),
        OutputValue::Tuple(items) => json!({"$tuple": items.iter().map(to_wire).collect::<Vec<_>>()}),
        OutputValue::Object { type_name, state } => {
            let mut o = Map::new();
            o.insert("type".into(), Value::String(type_name.clone()));
            o.insert("state".into(), state.clone());
            json!({"$object": o})
        }
    }
}
