use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{EntryPointIn, InputIn, Job, JobIn, JsonSchema, OutputIn, Transfer, Transform, TransformIn};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::env;

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

fn user_id() -> String {
    env::var("USER_ID").unwrap_or_else(|_| "anonymous".to_string())
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI simple para hablar con el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transforms: crear, listar, ver y borrar
    #[command(subcommand)]
    Transform(TransformCommand),
    /// Jobs: correr un transform y consultar el resultado
    #[command(subcommand)]
    Job(JobCommand),
}

#[derive(Subcommand)]
enum TransformCommand {
    /// Sube un script y lo compila
    Create {
        #[arg(value_name = "ARCHIVO")]
        file: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        /// Función de entrada; se puede omitir si hay una sola expuesta
        #[arg(long, default_value = "")]
        entry_point: String,
        #[arg(long)]
        private: bool,
    },
    List,
    Show {
        #[arg(value_name = "TRANSFORM_ID")]
        id: String,
    },
    Delete {
        #[arg(value_name = "TRANSFORM_ID")]
        id: String,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    /// Ejecuta un transform
    Run {
        #[arg(value_name = "TRANSFORM_ID")]
        transform_id: String,
        /// `id=valor`; el valor se interpreta como JSON y si no, como texto
        #[arg(long = "input", value_parser = parse_input)]
        inputs: Vec<InputIn>,
        /// `id=json|uri|ignore`
        #[arg(long = "output", value_parser = parse_output)]
        outputs: Vec<OutputIn>,
    },
    Show {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
}

fn split_assignment(s: &str) -> Result<(&str, &str), String> {
    s.split_once('=')
        .filter(|(id, _)| !id.is_empty())
        .ok_or_else(|| format!("se esperaba id=valor, llegó {s:?}"))
}

fn parse_input(s: &str) -> Result<InputIn, String> {
    let (id, raw) = split_assignment(s)?;
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok(InputIn { id: id.to_string(), value })
}

fn parse_output(s: &str) -> Result<OutputIn, String> {
    let (id, raw) = split_assignment(s)?;
    let transfer: Transfer =
        serde_json::from_value(Value::String(raw.to_lowercase())).map_err(|_| format!("transfer inválido: {raw:?}"))?;
    Ok(OutputIn {
        id: id.to_string(),
        json_schema: JsonSchema::new(),
        transfer: Some(transfer),
    })
}

/// Envía el pedido y convierte `{"detail": ...}` en error.
async fn send(req: RequestBuilder) -> Result<Response> {
    let resp = req.header("x-user-id", user_id()).send().await?;
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    match body.get("detail").and_then(Value::as_str) {
        Some(detail) => bail!("{detail} (status {status})"),
        None => bail!("el master respondió {status}"),
    }
}

fn print_transform(t: &Transform) {
    println!("Transform {}", t.id);
    println!("  nombre     : {}", t.name);
    if !t.description.is_empty() {
        println!("  descripción: {}", t.description);
    }
    println!("  público    : {}", t.public);
    println!("  entry point: {}", t.entry_point.name);
    for f in t.walk_callees() {
        for input in &f.inputs {
            let flags = match (input.required, input.modifiable) {
                (true, _) => " (requerido)",
                (false, false) => " (fijo)",
                _ => "",
            };
            println!("    entrada {}{} = {}", input.id, flags, input.value);
        }
        for output in &f.outputs {
            println!("    salida  {} [{:?}]", output.id, output.transfer);
        }
    }
}

fn print_job(job: &Job) {
    println!("Job {}", job.id);
    println!("  transform: {}", job.transform_id);
    println!("  estado   : {:?}", job.status);
    println!("  creado   : {}", job.created_at);
    if let Some(done) = job.done_at {
        println!("  terminado: {}", done);
    }
    if let Some(ref error) = job.error {
        println!("  error    : {}", error);
    }
    for output in &job.outputs {
        println!("  {} = {}", output.output.id, output.value);
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Transform(TransformCommand::Create {
            file,
            name,
            description,
            entry_point,
            private,
        }) => {
            let source = std::fs::read_to_string(&file).with_context(|| format!("no se pudo leer {file}"))?;
            let req = TransformIn {
                name,
                description,
                public: !private,
                language: "python".to_string(),
                source,
                entry_point: EntryPointIn { name: entry_point },
            };
            let url = format!("{}/api/v1/transforms", base_url);
            let transform: Transform = send(client.post(&url).json(&req)).await?.json().await?;
            println!("Transform creado:");
            print_transform(&transform);
        }

        Commands::Transform(TransformCommand::List) => {
            let url = format!("{}/api/v1/transforms", base_url);
            let transforms: Vec<Transform> = send(client.get(&url)).await?.json().await?;
            if transforms.is_empty() {
                println!("No hay transforms.");
            }
            for t in transforms {
                println!("{}  {}  (entry point {})", t.id, t.name, t.entry_point.name);
            }
        }

        Commands::Transform(TransformCommand::Show { id }) => {
            let url = format!("{}/api/v1/transforms/{id}", base_url);
            let transform: Transform = send(client.get(&url)).await?.json().await?;
            print_transform(&transform);
        }

        Commands::Transform(TransformCommand::Delete { id }) => {
            let url = format!("{}/api/v1/transforms/{id}", base_url);
            send(client.delete(&url)).await?;
            println!("Transform {id} borrado.");
        }

        Commands::Job(JobCommand::Run {
            transform_id,
            inputs,
            outputs,
        }) => {
            let req = JobIn {
                transform_id,
                inputs,
                outputs,
            };
            let url = format!("{}/api/v1/jobs", base_url);
            let job: Job = send(client.post(&url).json(&req)).await?.json().await?;
            print_job(&job);
        }

        Commands::Job(JobCommand::Show { id }) => {
            let url = format!("{}/api/v1/jobs/{id}", base_url);
            let job: Job = send(client.get(&url)).await?.json().await?;
            print_job(&job);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_input_interpreta_json_o_texto() {
        let input = parse_input("pipeline.param2=42").unwrap();
        assert_eq!((input.id.as_str(), input.value), ("pipeline.param2", json!(42)));

        let input = parse_input("pipeline.param1=hola mundo").unwrap();
        assert_eq!(input.value, json!("hola mundo"));

        let input = parse_input("f.xs=[1, 2]").unwrap();
        assert_eq!(input.value, json!([1, 2]));

        assert!(parse_input("sin_igual").is_err());
        assert!(parse_input("=1").is_err());
    }

    #[test]
    fn parse_output_valida_el_transfer() {
        let output = parse_output("pipeline.0=URI").unwrap();
        assert_eq!(output.transfer, Some(Transfer::Uri));
        assert!(parse_output("pipeline.0=ftp").is_err());
    }

    #[test]
    fn cli_parsea_subcomandos() {
        let cli = Cli::try_parse_from([
            "client", "job", "run", "t-1", "--input", "p.a=1", "--input", "p.b=x", "--output", "p.0=json",
        ])
        .unwrap();
        match cli.command {
            Commands::Job(JobCommand::Run { transform_id, inputs, outputs }) => {
                assert_eq!(transform_id, "t-1");
                assert_eq!(inputs.len(), 2);
                assert_eq!(outputs[0].transfer, Some(Transfer::Json));
            }
            _ => panic!("subcomando inesperado"),
        }

        let cli = Cli::try_parse_from(["client", "transform", "create", "f.py", "--name", "n", "--private"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Transform(TransformCommand::Create { private: true, .. })
        ));
    }
}
