use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use pq_middleware::prelude::*;
use serde::Serialize;
use tracing::Level;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a named-parameter statement batch against Postgres")]
struct Args {
    #[arg(long, env = "PGHOST", default_value = "localhost")]
    host: String,
    #[arg(long, env = "PGPORT")]
    port: Option<u16>,
    #[arg(long, env = "PGUSER")]
    user: Option<String>,
    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    password: Option<String>,
    #[arg(long, env = "PGDATABASE")]
    dbname: Option<String>,
    #[arg(long, default_value = "pqm")]
    application_name: String,
    /// Statements to run, `;`-separated, with `:name` parameters.
    #[arg(short = 'c', long)]
    command: String,
    /// `name=value`; values are typed from their literal form.
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
    /// JSON file with pool settings.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,
    #[arg(short, long)]
    verbose: bool,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))
}

impl Args {
    fn pool_key(&self) -> Result<PoolKey, PqMiddlewareError> {
        let mut key = PoolKey::new()
            .with("host", &self.host)?
            .with("application_name", &self.application_name)?;
        if let Some(port) = self.port {
            key = key.with("port", port.to_string())?;
        }
        for (name, value) in [
            ("user", &self.user),
            ("password", &self.password),
            ("dbname", &self.dbname),
        ] {
            if let Some(value) = value {
                key = key.with(name, value)?;
            }
        }
        Ok(key)
    }
}

#[derive(Serialize)]
struct StatementOutput {
    statement: usize,
    columns: Vec<String>,
    rows: Vec<Vec<RowValues>>,
    rows_affected: Option<u64>,
}

async fn run(args: &Args) -> Result<Vec<StatementOutput>, PqMiddlewareError> {
    let settings = match &args.settings {
        Some(path) => {
            let raw = std::fs::read_to_string(path).map_err(|err| {
                PqMiddlewareError::ConfigError(format!("{}: {err}", path.display()))
            })?;
            PoolSettings::from_json(&raw)?
        }
        None => PoolSettings::default(),
    };
    let key = args.pool_key()?;
    tracing::debug!(key = %key, "connecting");

    let pool = ConnectionPool::start(PgDriver, settings)?;
    let mut conn = pool.get_connection(&key).await?;

    let mut cmd = Command::new(args.command.clone());
    for (name, value) in &args.params {
        cmd.parameters_mut().add(name, RowValues::from_literal(value))?;
    }

    let mut outputs = Vec::new();
    let outcome = async {
        let mut stream = conn.execute_reader(&mut cmd).await?;
        loop {
            let statement = stream.statement_index().unwrap_or_default();
            let result_set = stream.read_result_set().await?;
            outputs.push(StatementOutput {
                statement,
                columns: stream.columns().iter().map(|c| c.name.clone()).collect(),
                rows: result_set.results.iter().map(|row| row.rows.clone()).collect(),
                rows_affected: stream.records_affected(),
            });
            if !stream.next_statement().await? {
                break;
            }
        }
        stream.close().await;
        Ok::<_, PqMiddlewareError>(())
    }
    .await;

    conn.close().await;
    pool.shutdown().await;
    outcome.map(|()| outputs)
}

fn render_value(value: &RowValues) -> String {
    match value {
        RowValues::Null => "NULL".to_string(),
        RowValues::Text(s) => s.clone(),
        RowValues::Int(i) => i.to_string(),
        RowValues::Float(f) => f.to_string(),
        RowValues::Bool(b) => b.to_string(),
        RowValues::Timestamp(ts) => ts.to_string(),
        RowValues::JSON(json) => json.to_string(),
        RowValues::Blob(bytes) => format!("\\x{}", bytes.iter().map(|b| format!("{b:02x}")).collect::<String>()),
    }
}

fn print_table(outputs: &[StatementOutput]) {
    for output in outputs {
        if output.columns.is_empty() {
            println!(
                "statement {}: {} row(s) affected",
                output.statement,
                output.rows_affected.unwrap_or(0)
            );
            continue;
        }
        println!("{}", output.columns.join(" | "));
        for row in &output.rows {
            let cells: Vec<String> = row.iter().map(render_value).collect();
            println!("{}", cells.join(" | "));
        }
        println!("({} row(s))", output.rows.len());
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::WARN })
        .init();

    match run(&args).await {
        Ok(outputs) => {
            match args.format {
                OutputFormat::Table => print_table(&outputs),
                OutputFormat::Json => match serde_json::to_string_pretty(&outputs) {
                    Ok(json) => println!("{json}"),
                    Err(err) => {
                        eprintln!("failed to render output: {err}");
                        return ExitCode::FAILURE;
                    }
                },
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            if let Some(diagnostics) = err.diagnostics() {
                eprintln!("{diagnostics}");
            } else {
                eprintln!("{err}");
            }
            ExitCode::FAILURE
        }
    }
}
