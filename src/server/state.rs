use std::sync::Arc;
use std::time::Instant;

use crate::channels::create_channels;
use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::notification::NotificationDispatcher;
use crate::queue::{JobQueue, WorkerPool};
use crate::ratelimit::RateLimiter;
use crate::store::{create_store, NotificationStore};
use crate::template::Renderer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn NotificationStore>,
    pub renderer: Arc<Renderer>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub workers: Arc<WorkerPool>,
    pub rate_limiter: Arc<RateLimiter>,
    pub start_time: Instant,
}

impl AppState {
    /// Build every component from configuration.
    pub async fn new(settings: Settings) -> Result<Self> {
        let store = create_store(&settings.database).await?;
        let renderer = Renderer::new(&settings.templates)?;
        let channels = create_channels(&settings.channels)
            .map_err(|e| AppError::Internal(format!("failed to initialize channels: {}", e)))?;
        let dispatcher = NotificationDispatcher::new(channels);

        Ok(Self::from_parts(
            settings,
            store,
            Arc::new(renderer),
            Arc::new(dispatcher),
        ))
    }

    /// Assemble state around pre-built components.
    pub fn from_parts(
        settings: Settings,
        store: Arc<dyn NotificationStore>,
        renderer: Arc<Renderer>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        let workers = Arc::new(WorkerPool::new(
            &settings.queue,
            store.clone(),
            dispatcher.clone(),
            renderer.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(&settings.ratelimit));

        Self {
            settings: Arc::new(settings),
            store,
            renderer,
            dispatcher,
            workers,
            rate_limiter,
            start_time: Instant::now(),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        self.workers.queue()
    }
}
