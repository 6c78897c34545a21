use anyhow::Error;
use async_trait::async_trait;
use clap::Parser;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::{env, time::Duration};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use feedq::config::{BufferConfig, CacheConfig, QueueConfig, WorkerPoolConfig};
use feedq::generation::{GenerationClient, GenerationError};
use feedq::{telemetry, FeedScheduler, SchedulerConfig, SourceImage};

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'n',
        long = "workers",
        help = "Number of concurrent generation calls",
        default_value = "30"
    )]
    workers: usize,

    #[arg(long = "queue_capacity", help = "Hard ceiling on queued jobs", default_value = "200")]
    queue_capacity: usize,

    #[arg(long = "cache_size", help = "Cached images kept around the scroll position", default_value = "150")]
    cache_size: usize,

    #[arg(long = "buffer_target", help = "Images the background buffer aims to hold", default_value = "100")]
    buffer_target: usize,

    #[arg(
        short = 's',
        long = "source_image",
        help = "Source image every generation is conditioned on",
        default_value = "file://./source.jpg"
    )]
    source_image: String,

    #[arg(long = "latency_ms", help = "Simulated generation latency", default_value = "400")]
    latency_ms: u64,

    #[arg(long = "fail_every", help = "Simulate a failure on every Nth generation call", default_value = "7")]
    fail_every: u64,

    #[arg(long = "jaeger_endpoint", env = "JAEGER_ENDPOINT", help = "Jaeger collector endpoint")]
    jaeger_endpoint: Option<String>,
}

impl ConfigContext {
    fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: WorkerPoolConfig {
                size: self.workers,
                ..Default::default()
            },
            queue: QueueConfig {
                capacity: self.queue_capacity,
            },
            cache: CacheConfig {
                max_entries: self.cache_size,
            },
            buffer: BufferConfig {
                target_size: self.buffer_target,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Stand-in for the remote generation service.
struct SimulatedClient {
    latency: Duration,
    fail_every: u64,
    calls: AtomicU64,
}

#[async_trait]
impl GenerationClient for SimulatedClient {
    async fn generate(&self, prompt: &str, source: &SourceImage) -> Result<String, GenerationError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        sleep(self.latency).await;
        if self.fail_every > 0 && call % self.fail_every == 0 {
            return Err(GenerationError::Request("Simulating failure".into()));
        }
        debug!(call, source = source.uri(), prompt, "Simulated generation");
        Ok(format!("sim://generated/{call}"))
    }
}

/// Scrolls through the feed at a varying pace and reports scheduler stats.
#[instrument(skip_all)]
async fn simulate_scrolling(cancel_token: CancellationToken, scheduler: FeedScheduler) -> Result<(), Error> {
    let mut ticker = interval(Duration::from_millis(500));
    let mut index = 0u64;
    let mut tick = 0u64;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Scroller Cancelled");
                break;
            },
            _ = ticker.tick() => {
                tick += 1;
                let step = match tick % 20 {
                    0..=9 => 1,
                    10..=14 => 4,
                    _ => 0,
                };
                index += step;
                scheduler.update_scroll_position(index, step as f64)?;

                if tick % 10 == 0 {
                    let visible = scheduler.get_image(index).await?;
                    let cache = scheduler.cache_stats().await?;
                    let health = scheduler.system_health().await?;
                    info!(
                        index,
                        visible = ?visible.map(|image| image.url),
                        cached = cache.cached,
                        queue = cache.queue_length,
                        busy_workers = cache.busy_workers,
                        buffer_health = cache.buffer_health,
                        breaker = %health.circuit_breaker_state,
                        failure_rate = health.api_failure_rate,
                        "Feed status"
                    );
                }
            }
        }
    }

    Ok(())
}

async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let client = Arc::new(SimulatedClient {
        latency: Duration::from_millis(config.latency_ms),
        fail_every: config.fail_every,
        calls: AtomicU64::new(0),
    });

    let scheduler = FeedScheduler::start(config.scheduler_config(), client);
    let source = SourceImage::new(config.source_image.as_str());
    scheduler.enable_continuous_generation(source)?;

    simulate_scrolling(cancel_token, scheduler.clone()).await?;

    println!("Waiting for scheduler to shutdown...");
    scheduler.stop().await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "feedq=DEBUG");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let cloned_token = token.clone();
    let app = tokio::spawn(setup(cloned_token, config));

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {println!("Received SIGTERM"); token.cancel()},
            _ = sigint.recv() => {println!("Received SIGINT"); token.cancel()},
        }
    });
    app.await??;
    println!("Shutting down.");
    telemetry::shutdown();

    Ok(())
}
