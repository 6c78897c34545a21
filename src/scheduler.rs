use crate::generation::GenerationClient;
use crate::server::{self, Command};
use crate::stats::{CacheStats, SystemHealth, WorkerStats};
use crate::{GeneratedImage, JobSpec, SchedulerConfig, SourceImage};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, Instrument};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("feed scheduler is not running")]
    Stopped,
}

/// Cloneable handle to a running scheduler.
///
/// Mutating calls are fire-and-forget messages to the coordinator; reads
/// wait for the coordinator's reply and have no side effects. The scheduler
/// shuts down on [`FeedScheduler::stop`] or once every handle is dropped.
#[derive(Clone)]
pub struct FeedScheduler {
    send_to_server: mpsc::UnboundedSender<Command>,
    cancel_token: CancellationToken,
    server: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FeedScheduler {
    /// Spawns the coordinator and its worker pool on the current Tokio runtime.
    pub fn start(config: SchedulerConfig, client: Arc<dyn GenerationClient>) -> Self {
        let (send_to_server, recv_from_client) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        let server = {
            let cancel_token = cancel_token.clone();
            tokio::spawn(
                async move {
                    if let Err(err) =
                        server::serve(config, client, cancel_token, recv_from_client).await
                    {
                        error!("Error running feed scheduler: {}", err);
                    }
                }
                .instrument(info_span!("server")),
            )
        };

        Self {
            send_to_server,
            cancel_token,
            server: Arc::new(Mutex::new(Some(server))),
        }
    }

    /// Cancels the coordinator and workers and waits for them to exit.
    pub async fn stop(&self) {
        self.cancel_token.cancel();
        let server = self.server.lock().await.take();
        if let Some(server) = server {
            if let Err(err) = server.await {
                error!(error = %err, "Feed scheduler task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel_token.is_cancelled() && !self.send_to_server.is_closed()
    }

    /// Submits prioritized work. The source image also becomes the one used
    /// for scroll-driven jobs.
    pub fn enqueue_jobs(&self, jobs: Vec<JobSpec>, source: SourceImage) -> Result<(), SchedulerError> {
        self.send(Command::Enqueue { jobs, source })
    }

    pub fn update_scroll_position(&self, index: u64, velocity: f64) -> Result<(), SchedulerError> {
        self.send(Command::UpdateScroll { index, velocity })
    }

    pub fn enable_continuous_generation(&self, source: SourceImage) -> Result<(), SchedulerError> {
        self.send(Command::EnableContinuous(source))
    }

    pub fn disable_continuous_generation(&self) -> Result<(), SchedulerError> {
        self.send(Command::DisableContinuous)
    }

    /// Empties queue, cache and in-flight bookkeeping. Workers stay registered.
    pub fn clear_all_caches(&self) -> Result<(), SchedulerError> {
        self.send(Command::ClearAll)
    }

    pub async fn get_image(&self, position: u64) -> Result<Option<GeneratedImage>, SchedulerError> {
        self.request(|reply| Command::GetImage { position, reply }).await
    }

    pub async fn is_preloaded(&self, url: impl Into<String>) -> Result<bool, SchedulerError> {
        let url = url.into();
        self.request(|reply| Command::IsPreloaded { url, reply }).await
    }

    pub async fn worker_stats(&self) -> Result<Vec<WorkerStats>, SchedulerError> {
        self.request(|reply| Command::WorkerStats { reply }).await
    }

    pub async fn cache_stats(&self) -> Result<CacheStats, SchedulerError> {
        self.request(|reply| Command::CacheStats { reply }).await
    }

    pub async fn system_health(&self) -> Result<SystemHealth, SchedulerError> {
        self.request(|reply| Command::SystemHealth { reply }).await
    }

    fn send(&self, command: Command) -> Result<(), SchedulerError> {
        self.send_to_server
            .send(command)
            .map_err(|_| SchedulerError::Stopped)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response.await.map_err(|_| SchedulerError::Stopped)
    }
}
