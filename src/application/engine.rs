//! The engine value owning every shared component.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::entities::{RequestKey, RequestKind, RequestOptions, UriDescriptor};
use crate::domain::errors::{CancelCause, FailCause, FetchError};
use crate::domain::ports::{ImageCodec, RequestListener, SourceFetcher};
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::fetch::{CompositeFetcher, HttpFetcher, InlineFetcher, LocalFetcher};
use crate::infrastructure::image::{
    CacheStats, DEFAULT_BUCKET_CAPACITY, DEFAULT_MEMORY_CACHE_BYTES, DEFAULT_POOL_BYTES,
    DiskCache, ImageCrateCodec, MemoryCache, PoolStats, ResourcePool,
};

use super::free_ride::FreeRideStats;
use super::pipeline::{Job, Mode, Shared};
use super::request::{LoadOutcome, OutcomeSlot, RenderHook, RequestCore, RequestHandle};
use super::scheduler::{DeliveryQueue, RequestScheduler, SchedulerStats, StageLimits};
use super::target::DisplayTarget;

/// Errors raised while building an engine.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum EngineError {
    #[error("fetcher setup failed: {0}")]
    Fetch(#[from] FetchError),
}

/// Point-in-time engine counters.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Memory cache counters.
    pub memory: CacheStats,
    /// Buffer pool counters.
    pub pool: PoolStats,
    /// Coalescing counters.
    pub free_ride: FreeRideStats,
    /// Bytes held by the disk cache, if enabled.
    pub disk_bytes: Option<u64>,
    /// Stage queue counters.
    pub scheduler: SchedulerStats,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.memory)?;
        writeln!(f, "{}", self.pool)?;
        writeln!(f, "{}", self.free_ride)?;
        match self.disk_bytes {
            Some(bytes) => writeln!(f, "Disk cache: {bytes} bytes")?,
            None => writeln!(f, "Disk cache: disabled")?,
        }
        write!(f, "{}", self.scheduler)
    }
}

/// Builds an [`Engine`] from individual components.
pub struct EngineBuilder {
    memory_cache_bytes: usize,
    pool_bytes: usize,
    bucket_capacity: usize,
    disk: Option<DiskCache>,
    fetcher: Option<Arc<dyn SourceFetcher>>,
    codec: Option<Arc<dyn ImageCodec>>,
    limits: StageLimits,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            memory_cache_bytes: DEFAULT_MEMORY_CACHE_BYTES,
            pool_bytes: DEFAULT_POOL_BYTES,
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            disk: None,
            fetcher: None,
            codec: None,
            limits: StageLimits::default(),
        }
    }
}

impl EngineBuilder {
    /// Memory cache byte budget.
    #[must_use]
    pub const fn memory_cache_bytes(mut self, bytes: usize) -> Self {
        self.memory_cache_bytes = bytes;
        self
    }

    /// Buffer pool byte budget and per-class capacity.
    #[must_use]
    pub const fn pool(mut self, bytes: usize, bucket_capacity: usize) -> Self {
        self.pool_bytes = bytes;
        self.bucket_capacity = bucket_capacity;
        self
    }

    /// Disk cache for network sources. None disables it.
    #[must_use]
    pub fn disk_cache(mut self, disk: Option<DiskCache>) -> Self {
        self.disk = disk;
        self
    }

    /// Replaces the default fetcher.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Replaces the default codec.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn ImageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Stage worker counts and queue capacities.
    #[must_use]
    pub const fn stage_limits(mut self, limits: StageLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Builds the engine. Must run inside a tokio runtime.
    ///
    /// # Errors
    /// Returns error if the default HTTP client cannot be created.
    pub fn build(self) -> Result<Engine, EngineError> {
        let fetcher: Arc<dyn SourceFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(default_fetcher(
                Duration::from_secs(crate::infrastructure::fetch::DEFAULT_TIMEOUT_SECS),
                &format!("{}/{}", crate::NAME, crate::VERSION),
                LocalFetcher::new(),
            )?),
        };
        let codec: Arc<dyn ImageCodec> = match self.codec {
            Some(codec) => codec,
            None => Arc::new(ImageCrateCodec::default()),
        };

        let shared = Shared::new(
            MemoryCache::new(self.memory_cache_bytes),
            self.disk,
            Arc::new(ResourcePool::new(self.pool_bytes, self.bucket_capacity)),
            fetcher,
            codec,
            RequestScheduler::new(self.limits),
            DeliveryQueue::spawn(),
        );
        debug!(?shared, "Engine built");
        Ok(Engine {
            shared: Arc::new(shared),
        })
    }
}

fn default_fetcher(
    timeout: Duration,
    user_agent: &str,
    local: LocalFetcher,
) -> Result<CompositeFetcher, FetchError> {
    Ok(CompositeFetcher::new()
        .with(Arc::new(HttpFetcher::new(timeout, user_agent)?))
        .with(Arc::new(local))
        .with(Arc::new(InlineFetcher)))
}

/// Loads images through the memory cache, disk cache and network, sharing
/// work between identical requests.
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Starts building an engine.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Builds an engine from configuration. A disk cache that fails to open
    /// is logged and left out.
    ///
    /// # Errors
    /// Returns error if the HTTP client or the resource table cannot be set
    /// up.
    pub async fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        let mut local = LocalFetcher::new();
        if let Some(root) = &config.assets.asset_root {
            local = local.with_asset_root(root);
        }
        if let Some(root) = &config.assets.content_root {
            local = local.with_content_root(root);
        }
        if let Some(table) = &config.assets.resource_table {
            local = local.load_resource_table(table)?;
        }
        let fetcher = default_fetcher(
            Duration::from_secs(config.network.timeout_secs),
            &config.network.user_agent,
            local,
        )?;

        let disk = if config.disk_cache.enabled {
            let dir = config.effective_cache_dir();
            match DiskCache::new(dir.clone(), config.disk_cache.max_bytes).await {
                Ok(disk) => Some(disk),
                Err(e) => {
                    warn!(path = %dir.display(), error = %e, "Disk cache unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        info!(
            memory_bytes = config.memory_cache.max_bytes,
            disk = disk.is_some(),
            network_workers = config.scheduler.network_workers,
            decode_workers = config.scheduler.decode_workers,
            "Starting engine"
        );

        Self::builder()
            .memory_cache_bytes(config.memory_cache.max_bytes)
            .pool(config.pool.max_bytes, config.pool.bucket_capacity)
            .disk_cache(disk)
            .fetcher(Arc::new(fetcher))
            .stage_limits(StageLimits::from(&config.scheduler))
            .build()
    }

    /// Loads `identifier` into a decoded resource.
    pub fn load(
        &self,
        identifier: &str,
        options: RequestOptions,
        listener: Arc<dyn RequestListener>,
    ) -> RequestHandle {
        self.submit(identifier, RequestKind::Load, options, listener, None)
    }

    /// Loads `identifier` and shows it on `target`, superseding whatever
    /// the target was loading.
    pub fn display(
        &self,
        identifier: &str,
        options: RequestOptions,
        target: &DisplayTarget,
        listener: Arc<dyn RequestListener>,
    ) -> RequestHandle {
        let render = target.render_hook();
        let prepared = self.prepare(identifier, RequestKind::Display, options, listener, Some(render));
        match prepared {
            Ok((handle, job)) => {
                target.attach(&handle);
                self.shared.submit(job);
                handle
            }
            Err(handle) => handle,
        }
    }

    /// Fetches `identifier` into the disk cache without decoding.
    pub fn download(
        &self,
        identifier: &str,
        options: RequestOptions,
        listener: Arc<dyn RequestListener>,
    ) -> RequestHandle {
        self.submit(identifier, RequestKind::Download, options, listener, None)
    }

    /// Loads `identifier` on the calling task and returns the outcome.
    ///
    /// Skips the stage queues and never coalesces with other requests.
    pub async fn load_now(&self, identifier: &str, options: RequestOptions) -> LoadOutcome {
        let slot = Arc::new(OutcomeSlot::default());
        let listener: Arc<dyn RequestListener> = Arc::clone(&slot) as Arc<dyn RequestListener>;
        let id = self.shared.next_id();

        let core = match UriDescriptor::parse(identifier) {
            Some(uri) => {
                let key = RequestKey::new(&uri, &options);
                let core = RequestCore::new(id, RequestKind::Load, key.clone(), listener, DeliveryQueue::inline());
                if self.shared.scheduler.is_shutting_down() {
                    core.cancel(CancelCause::Normal);
                } else {
                    let job = Job::new(Arc::clone(&core), uri, key, options, None, Mode::Inline);
                    self.shared.run_inline(job).await;
                }
                core
            }
            None => {
                let core = RequestCore::new(id, RequestKind::Load, RequestKey::from(identifier), listener, DeliveryQueue::inline());
                core.fail(invalid_identifier(identifier));
                core
            }
        };

        slot.take().unwrap_or_else(|| {
            warn!(id = core.id(), state = %core.state(), "Inline load ended without an outcome");
            LoadOutcome::Failed(FailCause::decode("request ended without an outcome"))
        })
    }

    /// Evicts every evictable cached resource and empties the pool.
    pub fn trim_memory(&self) {
        self.shared.trim_memory();
    }

    /// Stops accepting work and cancels queued tasks.
    pub fn shutdown(&self) {
        if !self.shared.scheduler.is_shutting_down() {
            info!("Shutting down engine");
        }
        self.shared.scheduler.shutdown();
    }

    /// Returns true after [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.scheduler.is_shutting_down()
    }

    /// The memory cache.
    #[must_use]
    pub fn memory_cache(&self) -> &MemoryCache {
        &self.shared.memory
    }

    /// The disk cache, if enabled.
    #[must_use]
    pub fn disk_cache(&self) -> Option<&DiskCache> {
        self.shared.disk.as_ref()
    }

    /// Returns engine counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            memory: self.shared.memory.stats(),
            pool: self.shared.pool.stats(),
            free_ride: self.shared.free_ride.stats(),
            disk_bytes: self.shared.disk.as_ref().map(DiskCache::current_size),
            scheduler: self.shared.scheduler.stats(),
        }
    }

    fn submit(
        &self,
        identifier: &str,
        kind: RequestKind,
        options: RequestOptions,
        listener: Arc<dyn RequestListener>,
        render: Option<RenderHook>,
    ) -> RequestHandle {
        match self.prepare(identifier, kind, options, listener, render) {
            Ok((handle, job)) => {
                self.shared.submit(job);
                handle
            }
            Err(handle) => handle,
        }
    }

    /// Builds the job for a request, or a failed handle if the identifier
    /// cannot be classified.
    fn prepare(
        &self,
        identifier: &str,
        kind: RequestKind,
        options: RequestOptions,
        listener: Arc<dyn RequestListener>,
        render: Option<RenderHook>,
    ) -> Result<(RequestHandle, Arc<Job>), RequestHandle> {
        let id = self.shared.next_id();
        let delivery = self.shared.delivery.clone();

        let Some(uri) = UriDescriptor::parse(identifier) else {
            let core = RequestCore::new(id, kind, RequestKey::from(identifier), listener, delivery);
            debug!(id, identifier, "Rejected identifier");
            core.fail(invalid_identifier(identifier));
            return Err(RequestHandle::new(core));
        };

        let key = match kind {
            RequestKind::Download => RequestKey::source(&uri),
            RequestKind::Load | RequestKind::Display => RequestKey::new(&uri, &options),
        };
        let core = RequestCore::new(id, kind, key.clone(), listener, delivery);
        let handle = RequestHandle::new(Arc::clone(&core));
        Ok((handle, Job::new(core, uri, key, options, render, Mode::Scheduled)))
    }
}

fn invalid_identifier(identifier: &str) -> FailCause {
    if identifier.trim().is_empty() {
        FailCause::InvalidIdentifier
    } else {
        FailCause::UnsupportedScheme {
            identifier: identifier.to_string(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("shared", &self.shared)
            .finish()
    }
}
