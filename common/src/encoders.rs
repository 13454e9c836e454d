//! Codificación de valores de salida a bytes según su content type.

use std::io::{Cursor, Write};

use hound::{SampleFormat, WavSpec, WavWriter};
use serde_json::{Map, Value};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{Error, Result};
use crate::json_schema::JsonSchema;
use crate::mime;
use crate::opaque;
use crate::value::{DType, NdArray, OutputValue};

/// Content types de audio que se codifican como WAV.
const WAVE_CONTENT_TYPES: [&str; 4] = ["audio/x-wav", "audio/wav", "audio/wave", "audio/vnd.wave"];

pub const NPZ_EXTENSION: &str = ".npz";
const NPZ_MEMBER: &str = "value.npy";

/// Bytes listos para guardar y la extensión del archivo (con punto).
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedValue {
    pub bytes: Vec<u8>,
    pub extension: String,
}

/// Elige el codec según el tipo del valor y el content type del schema.
pub fn get_buffer_from_value(schema: &JsonSchema, value: &OutputValue) -> Result<EncodedValue> {
    let content_type = schema
        .content_type()
        .ok_or_else(|| Error::Validation("the output schema has no contentMediaType".into()))?;
    let extension = mime::extension_for(content_type);

    let (bytes, extension) = match value {
        OutputValue::Bytes(b) => (b.clone(), extension),
        OutputValue::Array(array) if WAVE_CONTENT_TYPES.contains(&content_type) => {
            (WaveEncoder.encode(array, schema.encoding())?, extension)
        }
        OutputValue::Array(array) if content_type == mime::APPLICATION_OCTET_STREAM => {
            (NpzEncoder.encode(array)?, NPZ_EXTENSION.to_string())
        }
        OutputValue::Array(_) => return Err(unsupported(value, content_type)),
        OutputValue::Json(v) if content_type == mime::APPLICATION_JSON => (encode_json(v)?, extension),
        _ if content_type == mime::APPLICATION_OCTET_STREAM => {
            (opaque::encode(value), opaque::EXTENSION.to_string())
        }
        _ => return Err(unsupported(value, content_type)),
    };
    Ok(EncodedValue { bytes, extension })
}

fn unsupported(value: &OutputValue, content_type: &str) -> Error {
    Error::UnsupportedEncoding {
        type_name: value.type_name(),
        content_type: content_type.to_string(),
    }
}

pub fn encode_json(value: &Value) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Encoding(e.to_string()))
}

/* =========================
   WAV
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveFormat {
    UInt8,
    Int16,
    Int32,
    Float32,
}

impl WaveFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "uint8" => WaveFormat::UInt8,
            "int16" => WaveFormat::Int16,
            "int32" => WaveFormat::Int32,
            "float32" => WaveFormat::Float32,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            WaveFormat::UInt8 => "uint8",
            WaveFormat::Int16 => "int16",
            WaveFormat::Int32 => "int32",
            WaveFormat::Float32 => "float32",
        }
    }

    fn dtype(self) -> DType {
        match self {
            WaveFormat::UInt8 => DType::UInt8,
            WaveFormat::Int16 => DType::Int16,
            WaveFormat::Int32 => DType::Int32,
            WaveFormat::Float32 => DType::Float32,
        }
    }

    fn bits(self) -> u16 {
        (self.dtype().itemsize() * 8) as u16
    }

    fn sample_format(self) -> SampleFormat {
        match self {
            WaveFormat::Float32 => SampleFormat::Float,
            _ => SampleFormat::Int,
        }
    }
}

pub struct WaveEncoder;

impl WaveEncoder {
    pub const DEFAULT_RATE: u32 = 44100;
    pub const DEFAULT_FORMAT: WaveFormat = WaveFormat::Int16;

    /// Claves del encoding: `rate`, `format` y `range`. `range` es el tipo de
    /// los datos de entrada; si difiere de `format` habría que reescalar, lo
    /// cual no está soportado.
    pub fn encode(&self, value: &NdArray, encoding: Option<&Map<String, Value>>) -> Result<Vec<u8>> {
        let empty = Map::new();
        let encoding = encoding.unwrap_or(&empty);

        let rate = match encoding.get("rate") {
            None => Self::DEFAULT_RATE,
            Some(r) => r
                .as_u64()
                .and_then(|r| u32::try_from(r).ok())
                .filter(|r| *r > 0)
                .ok_or_else(|| Error::Validation(format!("Invalid wave rate: {r}")))?,
        };

        let format = match encoding.get("format") {
            Some(f) => {
                let name = f.as_str().unwrap_or_default();
                WaveFormat::from_name(name).ok_or_else(|| Error::InvalidFormat(f.to_string()))?
            }
            None => Self::infer_format(value).unwrap_or(Self::DEFAULT_FORMAT),
        };

        let range = match encoding.get("range") {
            None => value.dtype.name().to_string(),
            Some(Value::String(r)) => r.clone(),
            Some(_) => {
                return Err(Error::NotImplemented(
                    "Range can only take the value of the data type, such as float32.".into(),
                ))
            }
        };
        if range != format.name() {
            return Err(Error::NotImplemented(format!(
                "The data must be rescaled {range}->{}",
                format.name()
            )));
        }

        let (frames, channels) = match value.shape.as_slice() {
            [frames] => (*frames, 1),
            [frames, channels] if *channels > 0 => (*frames, *channels),
            shape => {
                return Err(Error::Validation(format!(
                    "Wave data must have shape (frames,) or (frames, channels), got {shape:?}"
                )))
            }
        };
        let channels = u16::try_from(channels)
            .map_err(|_| Error::Validation(format!("Too many wave channels: {channels}")))?;

        let spec = WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: format.bits(),
            sample_format: format.sample_format(),
        };
        let mut cursor = Cursor::new(Vec::with_capacity(44 + frames * usize::from(channels) * value.dtype.itemsize()));
        {
            let mut writer = WavWriter::new(&mut cursor, spec).map_err(wav_error)?;
            write_samples(&mut writer, value, format).map_err(wav_error)?;
            writer.finalize().map_err(wav_error)?;
        }
        Ok(cursor.into_inner())
    }

    /// Formato a partir del dtype. float64 (el tipo por defecto para
    /// calcular) no se toma como formato buscado.
    fn infer_format(value: &NdArray) -> Option<WaveFormat> {
        WaveFormat::from_name(value.dtype.name())
    }
}

fn wav_error(e: hound::Error) -> Error {
    Error::Encoding(format!("wave encoding failed: {e}"))
}

fn write_samples<W: std::io::Write + std::io::Seek>(
    writer: &mut WavWriter<W>,
    value: &NdArray,
    format: WaveFormat,
) -> hound::Result<()> {
    let same_type = value.dtype == format.dtype();
    if same_type {
        let size = value.dtype.itemsize();
        for c in value.data.chunks_exact(size) {
            match format {
                // hound escribe muestras de 8 bits como i8 y las desplaza a u8
                WaveFormat::UInt8 => writer.write_sample((i16::from(c[0]) - 128) as i8)?,
                WaveFormat::Int16 => writer.write_sample(i16::from_le_bytes([c[0], c[1]]))?,
                WaveFormat::Int32 => writer.write_sample(i32::from_le_bytes([c[0], c[1], c[2], c[3]]))?,
                WaveFormat::Float32 => writer.write_sample(f32::from_le_bytes([c[0], c[1], c[2], c[3]]))?,
            }
        }
        return Ok(());
    }

    // cast como `astype`, con saturación
    for v in value.to_f64_vec() {
        match format {
            WaveFormat::UInt8 => writer.write_sample(((v as u8) as i16 - 128) as i8)?,
            WaveFormat::Int16 => writer.write_sample(v as i16)?,
            WaveFormat::Int32 => writer.write_sample(v as i32)?,
            WaveFormat::Float32 => writer.write_sample(v as f32)?,
        }
    }
    Ok(())
}

/* =========================
   NPZ
   ========================= */

pub struct NpzEncoder;

impl NpzEncoder {
    /// Archivo `.npz` con un único miembro `value.npy`.
    pub fn encode(&self, value: &NdArray) -> Result<Vec<u8>> {
        let npy = npy_bytes(value);
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file(NPZ_MEMBER, options).map_err(zip_error)?;
        zip.write_all(&npy)?;
        let cursor = zip.finish().map_err(zip_error)?;
        Ok(cursor.into_inner())
    }
}

fn zip_error(e: zip::result::ZipError) -> Error {
    Error::Encoding(format!("npz encoding failed: {e}"))
}

/// Formato NPY v1.0: magic, versión, largo del header y el dict del header
/// alineado a 64 bytes.
pub fn npy_bytes(value: &NdArray) -> Vec<u8> {
    let shape = match value.shape.as_slice() {
        [] => "()".to_string(),
        [n] => format!("({n},)"),
        dims => format!(
            "({})",
            dims.iter().map(usize::to_string).collect::<Vec<_>>().join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        value.dtype.npy_descr(),
        shape
    );
    let prefix = 6 + 2 + 2;
    let total = prefix + header.len() + 1;
    let padding = (64 - total % 64) % 64;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(prefix + header.len() + value.data.len());
    out.extend_from_slice(b"\x93NUMPY");
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&value.data);
    out
}
