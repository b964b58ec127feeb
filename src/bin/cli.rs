//! Binary entry point for the `parent-join` command-line tool.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use parent_join::{
    IndexRequest, JoinConfig, JoinEngine, JoinFieldMapping, JoinQuery, RelationSchema,
};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "parent_join=info";

#[derive(Parser, Debug)]
#[command(
    name = "parent-join",
    version,
    about = "Inspect join mappings, route documents and run join queries",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "PARENT_JOIN_CONFIG",
        value_name = "FILE",
        help = "TOML engine configuration"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a mapping and print its relation graph.
    Mapping {
        #[arg(value_name = "MAPPING")]
        mapping: PathBuf,
    },
    /// Index documents and print the partition each one lands on.
    Route {
        #[arg(long, value_name = "MAPPING")]
        mapping: PathBuf,
        #[arg(long, value_name = "JSONL", help = "One index request per line")]
        docs: PathBuf,
    },
    /// Index documents and run a JSON query over them.
    Search {
        #[arg(long, value_name = "MAPPING")]
        mapping: PathBuf,
        #[arg(long, value_name = "JSONL", help = "One index request per line")]
        docs: PathBuf,
        #[arg(long, value_name = "JSON", help = "Query in JSON form")]
        query: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct MappingReport {
    field: String,
    eager_global_ordinals: bool,
    generation: u64,
    roles: Vec<RoleReport>,
}

#[derive(Serialize)]
struct RoleReport {
    role: String,
    parent: Option<String>,
    children: Vec<String>,
    depth: usize,
}

#[derive(Serialize)]
struct RouteReport {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    partition: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    routing: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct HitReport {
    id: String,
    role: String,
    partition: u32,
}

fn main() {
    install_tracing_subscriber();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn install_tracing_subscriber() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<i32, Box<dyn Error>> {
    let cli = Cli::parse();
    match &cli.command {
        Command::Mapping { mapping } => {
            let mapping = read_mapping(mapping)?;
            let report = mapping_report(&mapping, &mapping.schema()?);
            emit(cli.format, &report, || print_mapping_text(&report))?;
            Ok(0)
        }
        Command::Route { mapping, docs } => {
            let engine = open_engine(cli.config.as_deref(), mapping)?;
            let requests = read_requests(docs)?;
            let reports: Vec<RouteReport> = engine
                .index_batch(&requests)
                .into_iter()
                .zip(&requests)
                .map(|(outcome, request)| match outcome {
                    Ok(outcome) => RouteReport {
                        id: outcome.id,
                        partition: Some(outcome.partition.0),
                        routing: Some(outcome.routing),
                        error: None,
                    },
                    Err(err) => RouteReport {
                        id: request.id.clone(),
                        partition: None,
                        routing: None,
                        error: Some(err.to_string()),
                    },
                })
                .collect();
            engine.close();
            emit(cli.format, &reports, || print_routes_text(&reports))?;
            let rejected = reports.iter().any(|report| report.error.is_some());
            Ok(if rejected { 2 } else { 0 })
        }
        Command::Search {
            mapping,
            docs,
            query,
        } => {
            let engine = open_engine(cli.config.as_deref(), mapping)?;
            let query = JoinQuery::from_json_str(query)?;
            let requests = read_requests(docs)?;
            for (request, outcome) in requests.iter().zip(engine.index_batch(&requests)) {
                if let Err(err) = outcome {
                    eprintln!("skipped document '{}': {err}", request.id);
                }
            }
            let hits: Vec<HitReport> = engine
                .search(&query)?
                .into_iter()
                .map(|hit| HitReport {
                    id: hit.id,
                    role: hit.role,
                    partition: hit.partition.0,
                })
                .collect();
            engine.close();
            emit(cli.format, &hits, || print_hits_text(&hits))?;
            Ok(0)
        }
    }
}

fn read_mapping(path: &Path) -> Result<JoinFieldMapping, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|err| format!("failed to read mapping {}: {err}", path.display()))?;
    Ok(JoinFieldMapping::from_json_str(&text)?)
}

fn read_requests(path: &Path) -> Result<Vec<IndexRequest>, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|err| format!("failed to read documents {}: {err}", path.display()))?;
    let mut requests = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: IndexRequest = serde_json::from_str(line)
            .map_err(|err| format!("{}:{}: {err}", path.display(), line_no + 1))?;
        requests.push(request);
    }
    Ok(requests)
}

fn open_engine(config: Option<&Path>, mapping: &Path) -> Result<JoinEngine, Box<dyn Error>> {
    let mapping = read_mapping(mapping)?;
    let config = match config {
        Some(path) => JoinConfig::load(path)?,
        None => JoinConfig {
            join_field: mapping.field.clone(),
            ..JoinConfig::default()
        },
    };
    Ok(JoinEngine::new(config, mapping)?)
}

fn mapping_report(mapping: &JoinFieldMapping, schema: &RelationSchema) -> MappingReport {
    MappingReport {
        field: mapping.field.clone(),
        eager_global_ordinals: mapping.eager_global_ordinals,
        generation: schema.generation().0,
        roles: schema
            .roles()
            .map(|role| RoleReport {
                role: role.to_string(),
                parent: schema.parent_role_of(role).map(|parent| parent.to_string()),
                children: schema
                    .child_roles_of(role)
                    .iter()
                    .map(|child| child.to_string())
                    .collect(),
                depth: schema.depth_of(role),
            })
            .collect(),
    }
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_mapping_text(report: &MappingReport) {
    println!(
        "Join field '{}' (eager_global_ordinals={})",
        report.field, report.eager_global_ordinals
    );
    for role in &report.roles {
        let indent = "  ".repeat(role.depth + 1);
        if role.children.is_empty() {
            println!("{indent}{}", role.role);
        } else {
            println!("{indent}{} -> {}", role.role, role.children.join(", "));
        }
    }
}

fn print_routes_text(reports: &[RouteReport]) {
    for report in reports {
        match (&report.partition, &report.routing, &report.error) {
            (Some(partition), Some(routing), _) => {
                println!("{} partition={partition} routing={routing}", report.id)
            }
            (_, _, Some(error)) => println!("{} rejected: {error}", report.id),
            _ => println!("{}", report.id),
        }
    }
}

fn print_hits_text(hits: &[HitReport]) {
    println!("{} hit(s)", hits.len());
    for hit in hits {
        println!("{} role={} partition={}", hit.id, hit.role, hit.partition);
    }
}
