// master/src/python.rs

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use common::{ExecutionError, Executor, RawResult};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

/// Driver que corre dentro del intérprete. Lee `{source, entry_point, inputs}`
/// de stdin y escribe una única respuesta JSON en stdout.
const DRIVER: &str = r#"
import base64, json, math, sys, traceback, types

def exposed(func=None, **_):
    return func if func is not None else (lambda f: f)

def media_type(kind, **encoding):
    return {"contentMediaType": kind, **encoding}

lib = types.ModuleType("streamunolib")
lib.exposed = exposed
lib.media_type = media_type
sys.modules.setdefault("streamunolib", lib)

class NotJson(Exception):
    pass

def opaque(value):
    try:
        state = json.loads(json.dumps(vars(value), default=repr, allow_nan=False))
    except (TypeError, ValueError):
        state = repr(value)
    return {"$object": {"type": type(value).__name__, "state": state}}

def encode(value):
    try:
        import numpy as np
    except ImportError:
        np = None
    if np is not None and isinstance(value, np.ndarray):
        arr = np.ascontiguousarray(value)
        arr = arr.astype(arr.dtype.newbyteorder("<"))
        return {"$ndarray": {
            "dtype": arr.dtype.name,
            "shape": list(arr.shape),
            "data": base64.b64encode(arr.tobytes()).decode(),
        }}
    if np is not None and isinstance(value, np.generic):
        return encode(value.item())
    if isinstance(value, float) and not math.isfinite(value):
        raise NotJson
    if isinstance(value, int) and not isinstance(value, bool) and not -2**63 <= value < 2**64:
        raise NotJson
    if value is None or isinstance(value, (bool, int, float, str)):
        return value
    if isinstance(value, (bytes, bytearray)):
        return {"$bytes": base64.b64encode(bytes(value)).decode()}
    if isinstance(value, (list, tuple, set)):
        return [encode(v) for v in value]
    if isinstance(value, dict) and all(isinstance(k, str) for k in value):
        return {k: encode(v) for k, v in value.items()}
    return opaque(value)

# Valor de una salida: sus etiquetas '$' son las únicas que se decodifican.
def encode_output(value, top=False):
    if isinstance(value, tuple) and top:
        return {"$tuple": [encode_output(v) for v in value]}
    try:
        encoded = encode(value)
    except NotJson:
        return opaque(value)
    if isinstance(value, dict) and any(k.startswith("$") for k in encoded):
        return {"$dict": encoded}
    return encoded

def main():
    out = sys.stdout
    sys.stdout = sys.stderr
    request = json.load(sys.stdin)
    try:
        code = compile(request["source"], "<transform>", "exec")
    except SyntaxError as e:
        reply = {"status": "syntax", "error": f"{e.msg} (line {e.lineno})"}
    else:
        namespace = {"__name__": "__transform__", "exposed": exposed, "media_type": media_type}
        try:
            exec(code, namespace)
            result = namespace[request["entry_point"]](**request["inputs"])
            reply = {"status": "ok", "result": encode_output(result, top=True)}
        except Exception as e:
            traceback.print_exc()
            reply = {"status": "runtime", "error": "".join(traceback.format_exception_only(type(e), e)).strip()}
    json.dump(reply, out, allow_nan=False)
    out.flush()

main()
"#;

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum DriverReply {
    Ok { result: Value },
    Syntax { error: String },
    Runtime { error: String },
}

/// Ejecuta los scripts en un subproceso de Python.
pub struct PythonExecutor {
    python_bin: String,
    timeout: Duration,
}

impl PythonExecutor {
    pub fn new(python_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            python_bin: python_bin.into(),
            timeout,
        }
    }
}

fn environment(e: impl std::fmt::Display) -> ExecutionError {
    ExecutionError::Environment(e.to_string())
}

#[async_trait]
impl Executor for PythonExecutor {
    async fn execute(
        &self,
        source: &str,
        entry_point: &str,
        inputs: &Map<String, Value>,
    ) -> Result<RawResult, ExecutionError> {
        let request = json!({"source": source, "entry_point": entry_point, "inputs": inputs});
        let body = serde_json::to_vec(&request).map_err(environment)?;

        let mut child = Command::new(&self.python_bin)
            .arg("-c")
            .arg(DRIVER)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| environment(format!("cannot start {}: {e}", self.python_bin)))?;
        debug!("intérprete {} lanzado para {}", self.python_bin, entry_point);

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| environment("the interpreter stdin is not available"))?;
        stdin.write_all(&body).await.map_err(environment)?;
        drop(stdin);

        // si vence el timeout el hijo se mata al soltarlo
        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(environment)?,
            Err(_) => {
                info!("{} superó el timeout de {:?}", entry_point, self.timeout);
                return Err(ExecutionError::Timeout(self.timeout));
            }
        };
        if !output.stderr.is_empty() {
            debug!("stderr del transform:\n{}", String::from_utf8_lossy(&output.stderr));
        }

        let reply: DriverReply = serde_json::from_slice(&output.stdout).map_err(|e| {
            environment(format!("invalid driver reply (exit status {}): {e}", output.status))
        })?;
        match reply {
            DriverReply::Ok { result } => RawResult::from_wire(result).map_err(environment),
            DriverReply::Syntax { error } => Err(ExecutionError::Syntax(error)),
            DriverReply::Runtime { error } => Err(ExecutionError::Runtime(error)),
        }
    }
}
