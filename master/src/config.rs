// master/src/config.rs

use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_SERVER_HOST: &str = "http://localhost:9000";
pub const DEFAULT_OBJECT_STORE_URL: &str = "memory://";
pub const DEFAULT_PYTHON_BIN: &str = "python3";
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuración del master, leída una vez de variables de entorno.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    /// `memory://`, `file:///ruta` o `s3://bucket`.
    pub object_store_url: String,
    /// Prefijo público de las URIs de salidas (`<url>/<bucket>/<key>`).
    pub public_url: String,
    pub jobs_bucket: String,
    pub python_bin: String,
    pub execution_timeout: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let server_host = var("SERVER_HOST").unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string());
        let execution_timeout = match var("EXECUTION_TIMEOUT_SECS") {
            Some(secs) => Duration::from_secs(
                secs.parse()
                    .with_context(|| format!("EXECUTION_TIMEOUT_SECS inválido: {secs:?}"))?,
            ),
            None => DEFAULT_EXECUTION_TIMEOUT,
        };

        Ok(Self {
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            object_store_url: var("OBJECT_STORE_URL").unwrap_or_else(|| DEFAULT_OBJECT_STORE_URL.to_string()),
            public_url: var("OBJECT_STORE_PUBLIC_URL").unwrap_or(server_host),
            jobs_bucket: var("JOBS_BUCKET").unwrap_or_else(|| common::DEFAULT_JOBS_BUCKET.to_string()),
            python_bin: var("PYTHON_BIN").unwrap_or_else(|| DEFAULT_PYTHON_BIN.to_string()),
            execution_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn valores_por_defecto() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.bind_addr, "0.0.0.0:8080");
        assert_eq!(s.object_store_url, "memory://");
        assert_eq!(s.public_url, "http://localhost:9000");
        assert_eq!(s.jobs_bucket, "jobs");
        assert_eq!(s.execution_timeout, Duration::from_secs(60));
    }

    #[test]
    fn public_url_cae_en_server_host() {
        let s = settings(&[("SERVER_HOST", "http://minio:9000")]).unwrap();
        assert_eq!(s.public_url, "http://minio:9000");

        let s = settings(&[("SERVER_HOST", "http://minio:9000"), ("OBJECT_STORE_PUBLIC_URL", "https://cdn")]).unwrap();
        assert_eq!(s.public_url, "https://cdn");
    }

    #[test]
    fn timeout_invalido_falla() {
        assert!(settings(&[("EXECUTION_TIMEOUT_SECS", "mucho")]).is_err());
        let s = settings(&[("EXECUTION_TIMEOUT_SECS", "5")]).unwrap();
        assert_eq!(s.execution_timeout, Duration::from_secs(5));
    }
}
