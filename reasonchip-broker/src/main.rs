use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use reasonchip_broker::cli::{self, Cli, Command, ExitCode};
use reasonchip_broker::config::Config;
use reasonchip_broker::{broker, client, grpc, signals, worker};
use reasonchip_core::engine::Engine;
use reasonchip_core::pipeline::FileSystemLoader;
use reasonchip_core::value::Value;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

fn init_logging(flags: &[String]) {
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    for raw in flags {
        let (target, level) = cli::split_log_directive(raw);
        let directive = match target {
            Some(target) => format!("{target}={level}"),
            None => level.to_string(),
        };
        if let Ok(parsed) = directive.parse() {
            filter = filter.add_directive(parsed);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: &Option<String>) -> Config {
    match path {
        Some(path) => Config::from_file(&PathBuf::from(path)).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load config file, using defaults");
            Config::default()
        }),
        None => Config::default(),
    }
}

fn build_engine(collections: &[String]) -> anyhow::Result<Engine> {
    let mut engine = Engine::new();
    for entry in collections {
        let (_, path) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("--collection must be `name=path`, got `{entry}`"))?;
        let loader = FileSystemLoader::new(PathBuf::from(path));
        engine.load(&loader)?;
    }
    engine.validate()?;
    Ok(engine)
}

async fn run_broker(client_listen: String) -> anyhow::Result<ExitCode> {
    let broker = Arc::new(broker::Broker::new());
    let service = grpc::ReasonchipService { broker: broker.clone() };

    let shutdown = signals::ShutdownSignal::new();
    shutdown.install();

    tracing::info!(%client_listen, "broker listening");
    let addr = client_listen.parse()?;
    Server::builder()
        .add_service(grpc::proto::reasonchip_server::ReasonchipServer::new(service))
        .serve(addr)
        .await?;
    Ok(ExitCode::Ok)
}

async fn run_worker(broker_addr: String, collections: Vec<String>, workers: u32) -> anyhow::Result<ExitCode> {
    let engine = Arc::new(build_engine(&collections)?);
    let manager = worker::TaskManager::new(workers, engine);

    let shutdown = signals::ShutdownSignal::new();
    shutdown.install();

    let transport = grpc::GrpcClientTransport::connect(broker_addr).await?;
    manager.run(transport).await?;
    Ok(ExitCode::Ok)
}

async fn run_remote(broker_addr: String, pipeline: String, variables: String) -> anyhow::Result<ExitCode> {
    let transport = grpc::GrpcClientTransport::connect(broker_addr).await?;
    let mux = client::Multiplexor::spawn(transport);
    let vars: serde_json::Value = serde_json::from_str(&variables)?;
    let vars = Value::from(vars);

    match mux.run_pipeline(pipeline, vars).await {
        Ok(value) => {
            println!("{}", serde_json::to_string(&serde_json::json!({ "rc": "OK", "result": value }))?);
            Ok(ExitCode::Ok)
        }
        Err(e) => {
            println!("{}", serde_json::to_string(&serde_json::json!({ "rc": "ERROR", "error": e.to_string() }))?);
            Ok(ExitCode::RemoteError)
        }
    }
}

async fn run_local(collections: Vec<String>, pipeline: String, variables: String) -> anyhow::Result<ExitCode> {
    let engine = build_engine(&collections)?;
    let vars: serde_json::Value = serde_json::from_str(&variables)?;
    let vars = Value::from(vars);

    match engine.run(&pipeline, vars).await {
        Ok(value) => {
            println!("{}", serde_json::to_string(&serde_json::json!({ "rc": "OK", "result": value }))?);
            Ok(ExitCode::Ok)
        }
        Err(e) => {
            println!("{}", serde_json::to_string(&serde_json::json!({ "rc": "ERROR", "error": e.to_string() }))?);
            Ok(ExitCode::GeneralError)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    let _config = load_config(&cli.config);

    let outcome = match cli.command {
        Command::Broker { client_listen, .. } => run_broker(client_listen).await,
        Command::Worker { broker, collections, workers, .. } => run_worker(broker, collections, workers).await,
        Command::Run { broker, pipeline, variables, .. } => run_remote(broker, pipeline, variables).await,
        Command::RunLocal { collections, pipeline, variables } => run_local(collections, pipeline, variables).await,
    };

    let exit_code = match outcome {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            ExitCode::GeneralError
        }
    };
    std::process::exit(exit_code.code());
}
