use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use bakeflow::boxes::BoxRegistry;
use bakeflow::flow::{FlowBuilder, load_schema};
use bakeflow::message::MessageData;
use bakeflow::queue::InspectingDrain;
use bakeflow::services::ServiceProvider;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a flow file
    Run {
        /// Path to the flow YAML file
        file: PathBuf,
        /// Initial message fields as a JSON object
        #[arg(long)]
        input: Option<String>,
    },
}

fn parse_input(raw: Option<&str>) -> anyhow::Result<MessageData> {
    let Some(raw) = raw else {
        return Ok(MessageData::new());
    };
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("--input must be a JSON object, got {other}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { file, input } => {
            info!("Loading flow from: {:?}", file);
            let schema = load_schema(file)?;
            let registry = BoxRegistry::with_builtins();

            let drain = InspectingDrain::new(
                |fields| match serde_json::to_string(&fields) {
                    Ok(line) => println!("{line}"),
                    Err(_) => println!("{fields:?}"),
                },
                |reason| eprintln!("generation failed: {reason}"),
            );
            let flow = FlowBuilder::new(Arc::new(ServiceProvider::new()))
                .with_drain(drain)
                .build(&schema, &registry)?;

            let initial = parse_input(input.as_deref())?;
            let job = flow.submit(initial);
            info!("Submitted job: {}", job.job_id());
            job.finished().await;
            info!("Job drained.");
        }
    }

    Ok(())
}
