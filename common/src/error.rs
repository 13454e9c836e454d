use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errores del núcleo: compilación de transforms, armado de jobs y
/// codificación/transferencia de salidas.
#[derive(Debug, Error)]
pub enum Error {
    #[error("The source has cyclic dependencies: {}.", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("Syntax error in the source at line {line}: {message}")]
    ScriptSyntax { line: usize, message: String },

    #[error("Unsupported transform language: {0:?}.")]
    UnsupportedLanguage(String),

    #[error("{}", missing_entry_point_message(.0))]
    MissingEntryPoint(Option<String>),

    #[error("Invalid media type: {0:?}")]
    InvalidMediaType(String),

    #[error(
        "The requested media type {requested:?} is incompatible with the actual media type {declared}."
    )]
    IncompatibleMediaType { declared: String, requested: String },

    #[error("The job {kind}(s) {} are not specified in the transform.", quoted(.ids))]
    UnknownVariables { kind: &'static str, ids: Vec<String> },

    #[error("The required job input {0:?} has no value.")]
    MissingInput(String),

    #[error("Cannot encode values of type {type_name:?} into {content_type:?}.")]
    UnsupportedEncoding {
        type_name: String,
        content_type: String,
    },

    #[error("{0}")]
    NotImplemented(String),

    #[error("{0}")]
    Validation(String),

    #[error("Invalid wave format: {0}")]
    InvalidFormat(String),

    #[error("Output {output_id}: {source} (value: {value})")]
    Output {
        output_id: String,
        value: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Object store error: {0}")]
    Storage(#[from] object_store::Error),

    #[error("The object store is bound to bucket {bound:?}, not {requested:?}.")]
    UnknownBucket { requested: String, bound: String },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Código HTTP con el que la capa de API debería reportar el error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::CyclicDependency(_)
            | Error::ScriptSyntax { .. }
            | Error::UnsupportedLanguage(_)
            | Error::MissingEntryPoint(_)
            | Error::InvalidMediaType(_)
            | Error::IncompatibleMediaType { .. }
            | Error::UnknownVariables { .. }
            | Error::MissingInput(_) => 400,
            Error::UnsupportedEncoding { .. }
            | Error::NotImplemented(_)
            | Error::Validation(_)
            | Error::InvalidFormat(_) => 422,
            Error::Output { source, .. } => source.status_code(),
            Error::Execution(e) => e.status_code(),
            Error::Storage(_) | Error::UnknownBucket { .. } | Error::Encoding(_) | Error::Io(_) => 500,
        }
    }

    /// Adjunta el id de la salida y una representación del valor.
    pub fn for_output(self, output_id: &str, value: String) -> Error {
        Error::Output {
            output_id: output_id.to_string(),
            value,
            source: Box::new(self),
        }
    }
}

fn missing_entry_point_message(name: &Option<String>) -> String {
    match name {
        Some(name) => format!("The entry point {name:?} is not an exposed function of the source."),
        None => "The source exposes several functions but no entry point was specified.".to_string(),
    }
}

fn quoted(ids: &[String]) -> String {
    ids.iter()
        .map(|i| format!("{i:?}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Fallas del colaborador que ejecuta el script.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("The transform source could not be compiled: {0}")]
    Syntax(String),

    #[error("The transform raised an exception: {0}")]
    Runtime(String),

    #[error("The entry point does not return the expected number of outputs (expected {expected}, got {actual}).")]
    OutputArity { expected: usize, actual: usize },

    #[error("The transform did not finish within {0:?}.")]
    Timeout(Duration),

    #[error("The execution environment failed: {0}")]
    Environment(String),
}

impl ExecutionError {
    pub fn status_code(&self) -> u16 {
        match self {
            ExecutionError::Syntax(_) => 400,
            ExecutionError::Runtime(_)
            | ExecutionError::OutputArity { .. }
            | ExecutionError::Timeout(_) => 422,
            ExecutionError::Environment(_) => 500,
        }
    }
}
