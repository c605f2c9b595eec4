//! Demo driver: runs the scheduler against the toy backend and streams one
//! request several times, showing the prompt cache replay on repeats.

use std::io::Write;
use std::sync::Arc;

use clap::Parser;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use kv_batch_serve::config::{Cli, Config};
use kv_batch_serve::inference::toy::ToyBackend;
use kv_batch_serve::scheduler::{GenRequest, Scheduler};
use kv_batch_serve::telemetry::PrometheusTelemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "kv_batch_serve=debug"
    } else {
        "kv_batch_serve=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("kv-batch-serve v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    info!(
        tick_ms = config.scheduler.tick_interval_ms,
        max_batch = config.scheduler.max_batch,
        num_blocks = config.kv.num_blocks,
        prompt_cache = config.prompt_cache.capacity,
        "Configuration loaded"
    );

    let telemetry = Arc::new(PrometheusTelemetry::new()?);
    let backend = Arc::new(ToyBackend::new(config.backend.clone()));
    let scheduler = Arc::new(Scheduler::new(&config, backend).with_telemetry(telemetry.clone()));

    let shutdown = CancellationToken::new();
    let runner = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let request = GenRequest::new(&cli.model, &cli.prompt, cli.max_tokens)
        .with_temperature(cli.temperature);

    for round in 1..=cli.repeat.max(1) {
        let (stream, trace) = scheduler
            .generate_stream(CancellationToken::new(), request.clone())
            .await?;
        tokio::pin!(stream);

        let mut stdout = std::io::stdout();
        write!(stdout, "[{round}] {}", request.prompt)?;
        while let Some(item) = stream.next().await {
            write!(stdout, "{}", item?.text)?;
            stdout.flush()?;
        }
        writeln!(stdout)?;

        let trace = trace.get();
        info!(
            round,
            ttft_ms = trace.ttft_ms,
            total_ms = trace.total_ms,
            finish = ?trace.finish,
            "Request finished"
        );
    }

    shutdown.cancel();
    runner.await?;

    let stats = scheduler.stats();
    info!(
        completed = stats.completed,
        replayed = stats.replayed,
        ticks = stats.ticks,
        "Scheduler stopped"
    );

    if cli.metrics {
        print!("{}", telemetry.render()?);
    }

    Ok(())
}
