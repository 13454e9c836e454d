//! Codec binario autodescriptivo para valores sin content type conocido.
//!
//! Formato: magic `SOB1` seguido de un valor. Cada valor empieza con un byte
//! de tag; los largos son `u32` big-endian.
//!
//! | tag | valor |
//! |-----|-------|
//! | `N` | null |
//! | `T` / `F` | bool |
//! | `i` | i64 |
//! | `u` | u64 |
//! | `f` | f64 |
//! | `s` | string UTF-8 (largo + bytes) |
//! | `l` | lista (cantidad + valores) |
//! | `m` | mapa (cantidad + pares string/valor) |
//! | `b` | bytes (largo + bytes) |
//! | `a` | ndarray (dtype string, ndim, dims `u64`, datos little-endian) |
//! | `t` | tupla (cantidad + valores) |
//! | `o` | objeto (nombre de tipo string + estado) |

use bytes::{Buf, BufMut, BytesMut};
use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};
use crate::value::{DType, NdArray, OutputValue};

pub const MAGIC: &[u8; 4] = b"SOB1";
pub const EXTENSION: &str = ".pickle";

pub fn encode(value: &OutputValue) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(MAGIC);
    put_value(&mut buf, value);
    buf.to_vec()
}

pub fn decode(data: &[u8]) -> Result<OutputValue> {
    let mut buf = data;
    if buf.len() < MAGIC.len() || &buf[..MAGIC.len()] != MAGIC {
        return Err(corrupt("missing SOB1 header"));
    }
    buf.advance(MAGIC.len());
    let value = get_value(&mut buf)?;
    if buf.has_remaining() {
        return Err(corrupt("trailing bytes"));
    }
    Ok(value)
}

fn put_value(buf: &mut BytesMut, value: &OutputValue) {
    match value {
        OutputValue::Json(v) => put_json(buf, v),
        OutputValue::Array(a) => {
            buf.put_u8(b'a');
            put_str(buf, a.dtype.name());
            buf.put_u32(a.shape.len() as u32);
            for dim in &a.shape {
                buf.put_u64(*dim as u64);
            }
            put_bytes(buf, &a.data);
        }
        OutputValue::Bytes(b) => {
            buf.put_u8(b'b');
            put_bytes(buf, b);
        }
        OutputValue::Tuple(items) => {
            buf.put_u8(b't');
            buf.put_u32(items.len() as u32);
            for item in items {
                put_value(buf, item);
            }
        }
        OutputValue::Object { type_name, state } => {
            buf.put_u8(b'o');
            put_str(buf, type_name);
            put_json(buf, state);
        }
    }
}

fn put_json(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => buf.put_u8(b'N'),
        Value::Bool(true) => buf.put_u8(b'T'),
        Value::Bool(false) => buf.put_u8(b'F'),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                buf.put_u8(b'i');
                buf.put_i64(i);
            } else if let Some(u) = n.as_u64() {
                buf.put_u8(b'u');
                buf.put_u64(u);
            } else {
                buf.put_u8(b'f');
                buf.put_f64(n.as_f64().unwrap_or(f64::NAN));
            }
        }
        Value::String(s) => {
            buf.put_u8(b's');
            put_str(buf, s);
        }
        Value::Array(items) => {
            buf.put_u8(b'l');
            buf.put_u32(items.len() as u32);
            for item in items {
                put_json(buf, item);
            }
        }
        Value::Object(map) => {
            buf.put_u8(b'm');
            buf.put_u32(map.len() as u32);
            for (k, v) in map {
                put_str(buf, k);
                put_json(buf, v);
            }
        }
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn corrupt(msg: &str) -> Error {
    Error::Encoding(format!("corrupt opaque payload: {msg}"))
}

fn need(buf: &&[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(corrupt("unexpected end of data"));
    }
    Ok(())
}

fn get_len(buf: &mut &[u8]) -> Result<usize> {
    need(buf, 4)?;
    Ok(buf.get_u32() as usize)
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = get_len(buf)?;
    need(buf, len)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    String::from_utf8(get_bytes(buf)?).map_err(|_| corrupt("invalid UTF-8 string"))
}

fn get_value(buf: &mut &[u8]) -> Result<OutputValue> {
    need(buf, 1)?;
    match buf[0] {
        b'a' => {
            buf.advance(1);
            let name = get_string(buf)?;
            let dtype = DType::from_name(&name).ok_or_else(|| corrupt("unknown dtype"))?;
            let ndim = get_len(buf)?;
            let mut shape = Vec::with_capacity(ndim.min(32));
            for _ in 0..ndim {
                need(buf, 8)?;
                shape.push(buf.get_u64() as usize);
            }
            let data = get_bytes(buf)?;
            Ok(OutputValue::Array(NdArray::new(dtype, shape, data)?))
        }
        b'b' => {
            buf.advance(1);
            Ok(OutputValue::Bytes(get_bytes(buf)?))
        }
        b't' => {
            buf.advance(1);
            let count = get_len(buf)?;
            let items = (0..count).map(|_| get_value(buf)).collect::<Result<Vec<_>>>()?;
            Ok(OutputValue::Tuple(items))
        }
        b'o' => {
            buf.advance(1);
            let type_name = get_string(buf)?;
            let state = get_json(buf)?;
            Ok(OutputValue::Object { type_name, state })
        }
        _ => get_json(buf).map(OutputValue::Json),
    }
}

fn get_json(buf: &mut &[u8]) -> Result<Value> {
    need(buf, 1)?;
    let tag = buf.get_u8();
    Ok(match tag {
        b'N' => Value::Null,
        b'T' => Value::Bool(true),
        b'F' => Value::Bool(false),
        b'i' => {
            need(buf, 8)?;
            Value::from(buf.get_i64())
        }
        b'u' => {
            need(buf, 8)?;
            Value::from(buf.get_u64())
        }
        b'f' => {
            need(buf, 8)?;
            Number::from_f64(buf.get_f64()).map_or(Value::Null, Value::Number)
        }
        b's' => Value::String(get_string(buf)?),
        b'l' => {
            let count = get_len(buf)?;
            Value::Array((0..count).map(|_| get_json(buf)).collect::<Result<Vec<_>>>()?)
        }
        b'm' => {
            let count = get_len(buf)?;
            let mut map = Map::new();
            for _ in 0..count {
                let k = get_string(buf)?;
                map.insert(k, get_json(buf)?);
            }
            Value::Object(map)
        }
        other => return Err(corrupt(&format!("unknown tag {other:#04x}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valores_mixtos_ida_y_vuelta() {
        let value = OutputValue::Tuple(vec![
            OutputValue::Json(json!({"a": [1, -2, 3.5, null, true], "b": "ñ"})),
            OutputValue::Array(NdArray::from_i16(vec![2, 2], &[1, 2, 3, 4]).unwrap()),
            OutputValue::Bytes(vec![0, 255]),
            OutputValue::Object {
                type_name: "Track".into(),
                state: json!({"rate": 8000}),
            },
        ]);
        let encoded = encode(&value);
        assert_eq!(&encoded[..4], b"SOB1");
        assert_eq!(decode(&encoded).unwrap(), value);
    }

    #[test]
    fn decode_rechaza_datos_truncados() {
        let encoded = encode(&OutputValue::Json(json!("hola")));
        assert!(decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(decode(b"XXXX").is_err());
    }
}
