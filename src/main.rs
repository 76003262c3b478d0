use anyhow::Context;
use chat_stream_relay::{
    agent::{Agent, EchoAgent},
    config::{InvocationConfig, RelayConfig},
    handler::{AppState, app},
    metrics::STREAM_METRICS,
    relay::StreamRelay,
    transport::{ConnectionRouter, FrameSender},
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chat-stream-relay", version, about = "Stream LLM answers over WebSockets")]
struct Args {
    /// TOML config file; environment variables are used when omitted
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Delay between echoed words, in milliseconds
    #[arg(long, default_value_t = 50)]
    echo_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::from_env()?,
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    config.validate()?;

    info!(
        listen = %config.server.listen_addr,
        keep_alive_secs = config.streaming.keep_alive_interval.as_secs_f64(),
        processing_secs = config.streaming.processing_update_interval.as_secs_f64(),
        max_streaming_secs = config.streaming.max_streaming_duration.as_secs_f64(),
        "Starting chat stream relay"
    );

    let router = ConnectionRouter::new();
    let sender: Arc<dyn FrameSender> = Arc::new(router.clone());
    let relay = StreamRelay::with_metrics(sender, config.streaming.clone(), STREAM_METRICS.clone());
    let agent: Arc<dyn Agent> = Arc::new(EchoAgent::with_delay(Duration::from_millis(
        args.echo_delay_ms,
    )));

    let state = Arc::new(AppState {
        invocation: InvocationConfig::new(agent.name(), "echo"),
        agent,
        router,
        relay: relay.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!("Relay ready!");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    let stopped = relay.heartbeat().cleanup_all();
    info!(stopped = stopped, metrics = %STREAM_METRICS.snapshot(), "Relay stopped");
    Ok(())
}
