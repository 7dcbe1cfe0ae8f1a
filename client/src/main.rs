//! streamctl command line.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};

use streamctl::config::{Config, ConfigOverrides};
use streamctl::logging::init_logging;
use streamctl::pipeline::{build_elements, validate};
use streamctl::streams::StreamEvent;
use streamctl::ControlContext;
use streamctl_types::{
    launch_line, CreateStreamRequest, DestinationKind, SourceKind, StreamDestination,
    StreamPriority, StreamSource, StreamType,
};

/// streamctl - control GStreamer pipeline backends
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backend WebSocket URL, tried before the discovered candidates (repeatable)
    #[arg(long = "url", global = true, env = "STREAMCTL_URL")]
    urls: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the pipelines known to the backend
    List,
    /// Create and start a stream, then run it until Ctrl+C
    Run(StreamArgs),
    /// Print the pipeline a stream would use without connecting
    Plan(StreamArgs),
}

#[derive(Args, Debug)]
struct StreamArgs {
    /// Stream name
    #[arg(long, default_value = "stream")]
    name: String,

    /// Stream type (live, recording, transcode, relay)
    #[arg(long = "type", default_value = "live")]
    stream_type: StreamType,

    /// Source kind (test, rtsp, srt, udp, file, http)
    #[arg(long, default_value = "test")]
    source: SourceKind,

    /// Source URI, port or path
    #[arg(long)]
    source_uri: Option<String>,

    /// Destination kind (file, srt, rtmp, udp, null)
    #[arg(long)]
    destination: Option<DestinationKind>,

    /// Destination URI, host:port or path
    #[arg(long)]
    destination_uri: Option<String>,

    /// Priority (low, normal, high, critical)
    #[arg(long, default_value = "normal")]
    priority: StreamPriority,
}

impl StreamArgs {
    fn request(&self) -> CreateStreamRequest {
        let mut request = CreateStreamRequest::new(
            self.name.clone(),
            self.stream_type,
            StreamSource::new(self.source, self.source_uri.clone()),
        )
        .with_priority(self.priority);
        if let Some(kind) = self.destination {
            request = request.with_destination(StreamDestination::new(
                kind,
                self.destination_uri.clone(),
            ));
        }
        request
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_figment(ConfigOverrides {
        urls: cli.urls.clone(),
        log_level: cli.log_level.clone(),
        log_file: cli.log_file.clone(),
    })?;
    let _log_guard = init_logging(&config.logging)?;

    match cli.command {
        Command::Plan(args) => plan(&args),
        Command::List => {
            let ctx = ControlContext::new(&config)?;
            let result = list(&ctx).await;
            ctx.shutdown();
            result
        }
        Command::Run(args) => {
            let ctx = ControlContext::new(&config)?;
            let result = run(&ctx, &args).await;
            ctx.shutdown();
            result
        }
    }
}

fn plan(args: &StreamArgs) -> anyhow::Result<()> {
    let request = args.request();
    let elements = build_elements(
        request.stream_type,
        &request.source,
        request.destination.as_ref(),
    );
    println!("{}", launch_line(&elements));
    validate(&elements)?;
    Ok(())
}

async fn list(ctx: &ControlContext) -> anyhow::Result<()> {
    let endpoint = ctx.connection.connect().await?;
    info!("Connected to {}", endpoint);

    let pipelines = ctx.pipelines.fetch_pipelines().await?;
    if pipelines.is_empty() {
        println!("No pipelines");
    }
    for pipeline in pipelines {
        println!(
            "{}\t{}\t{}",
            pipeline.id,
            pipeline.state(),
            pipeline.description
        );
    }
    Ok(())
}

async fn run(ctx: &ControlContext, args: &StreamArgs) -> anyhow::Result<()> {
    let endpoint = ctx.start().await?;
    info!("Connected to {}", endpoint);

    let _events = ctx.streams.subscribe(|event| match event {
        StreamEvent::Changed(stream) => info!("Stream '{}' is {}", stream.name, stream.status),
        StreamEvent::HealthWarning { stream_id, report } => {
            warn!("Stream {} is {}: {}", stream_id, report.status, report.reason)
        }
        StreamEvent::Removed(_) => {}
    });

    let stream = ctx.streams.create_stream(args.request()).await?;
    let id = stream.id;
    if let Some(pipeline) = &stream.pipeline {
        info!("Pipeline: {}", launch_line(&pipeline.elements));
    }

    if let Err(e) = ctx.streams.start_stream(&id).await {
        error!("Failed to start stream: {}", e);
        ctx.streams.delete_stream(&id).await;
        return Err(e.into());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("Received Ctrl+C, shutting down...");

    ctx.streams.delete_stream(&id).await;
    Ok(())
}
