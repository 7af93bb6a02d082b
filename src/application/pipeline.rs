//! Stage bodies.
//!
//! A job walks through dispatch, network and decode steps. Scheduled jobs
//! hop between stage queues after every step; inline jobs run every step on
//! the calling task. Each step starts by checking whether the request is
//! still live.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::domain::entities::{
    BufferRecycler, DecodedPayload, ManagedResource, Origin, RequestKey, RequestKind,
    RequestOptions, RequestState, ResourceHandle, UriDescriptor,
};
use crate::domain::errors::{CancelCause, CodecError, FailCause, FetchError};
use crate::domain::ports::{Delivered, DownloadResult, FetchObserver, ImageCodec, SourceFetcher};
use crate::infrastructure::image::{DiskCache, DiskEntry, MemoryCache, ResourcePool};

use super::free_ride::{FreeRideCoordinator, Role};
use super::locks::KeyedLockRegistry;
use super::request::{RenderHook, RequestCore, RequestId};
use super::scheduler::{DeliveryQueue, RequestScheduler, Stage, StageTask};

/// How a job is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Through the stage queues.
    Scheduled,
    /// On the caller's task.
    Inline,
}

/// One submitted request plus everything its steps need.
pub(crate) struct Job {
    pub(crate) core: Arc<RequestCore>,
    pub(crate) uri: UriDescriptor,
    pub(crate) key: RequestKey,
    pub(crate) source_key: RequestKey,
    pub(crate) options: RequestOptions,
    pub(crate) render: Option<RenderHook>,
    pub(crate) mode: Mode,
    provider: AtomicBool,
    // Set once this job went to the network for its bytes.
    network_used: AtomicBool,
}

impl Job {
    pub(crate) fn new(
        core: Arc<RequestCore>,
        uri: UriDescriptor,
        key: RequestKey,
        options: RequestOptions,
        render: Option<RenderHook>,
        mode: Mode,
    ) -> Arc<Self> {
        let source_key = RequestKey::source(&uri);
        Arc::new(Self {
            core,
            uri,
            key,
            source_key,
            options,
            render,
            mode,
            provider: AtomicBool::new(false),
            network_used: AtomicBool::new(false),
        })
    }

    fn id(&self) -> RequestId {
        self.core.id()
    }

    fn kind(&self) -> RequestKind {
        self.core.kind()
    }

    fn is_provider(&self) -> bool {
        self.provider.load(Ordering::SeqCst)
    }

    /// Whether a rider with this job's level may take a result that
    /// `provider` produced.
    fn may_ride_on(&self, provider: &Self) -> bool {
        !provider.network_used.load(Ordering::SeqCst) || self.options.level().allows_network()
    }

    fn uses_memory_cache(&self) -> bool {
        self.kind() != RequestKind::Download && self.options.allows_memory_cache()
    }

    fn deliver(&self, delivered: Delivered, origin: Origin) {
        self.core.deliver(delivered, origin, self.render.clone());
    }
}

/// Reports fetch progress to the listener and stops the fetch once the
/// request ended.
struct JobObserver<'a> {
    core: &'a Arc<RequestCore>,
}

impl FetchObserver for JobObserver<'_> {
    fn on_progress(&self, total: u64, completed: u64) {
        self.core.notify_progress(total, completed);
    }

    fn is_canceled(&self) -> bool {
        self.core.is_finished()
    }
}

enum Step {
    Dispatch,
    Network,
    Decode(Option<(Bytes, Origin)>),
}

impl Step {
    const fn stage(&self) -> Stage {
        match self {
            Self::Dispatch => Stage::Dispatch,
            Self::Network => Stage::Network,
            Self::Decode(_) => Stage::Decode,
        }
    }
}

/// Components every job shares.
pub(crate) struct Shared {
    pub(crate) memory: MemoryCache,
    pub(crate) disk: Option<DiskCache>,
    pub(crate) pool: Arc<ResourcePool>,
    pub(crate) fetcher: Arc<dyn SourceFetcher>,
    pub(crate) codec: Arc<dyn ImageCodec>,
    pub(crate) download_locks: KeyedLockRegistry,
    pub(crate) decode_locks: KeyedLockRegistry,
    pub(crate) free_ride: FreeRideCoordinator<Arc<Job>>,
    pub(crate) scheduler: RequestScheduler,
    pub(crate) delivery: DeliveryQueue,
    next_id: AtomicU64,
}

impl Shared {
    pub(crate) fn new(
        memory: MemoryCache,
        disk: Option<DiskCache>,
        pool: Arc<ResourcePool>,
        fetcher: Arc<dyn SourceFetcher>,
        codec: Arc<dyn ImageCodec>,
        scheduler: RequestScheduler,
        delivery: DeliveryQueue,
    ) -> Self {
        Self {
            memory,
            disk,
            pool,
            fetcher,
            codec,
            download_locks: KeyedLockRegistry::new("download"),
            decode_locks: KeyedLockRegistry::new("decode"),
            free_ride: FreeRideCoordinator::new(),
            scheduler,
            delivery,
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Evicts every evictable cached resource and empties the pool.
    pub(crate) fn trim_memory(&self) {
        let evicted = self.memory.trim_all();
        self.pool.clear();
        debug!(evicted, "Trimmed memory cache and pool");
    }

    /// Runs the synchronous part of submission. Returns true when the job
    /// still needs the pipeline.
    fn begin(self: &Arc<Self>, job: &Arc<Job>) -> bool {
        if !job.core.advance(RequestState::Dispatching) {
            return false;
        }

        if job.kind() == RequestKind::Download {
            if !job.options.level().allows_decode() {
                job.core.cancel(CancelCause::LevelRestricted);
                return false;
            }
            job.core.notify_started();
            return true;
        }

        if job.options.allows_memory_cache()
            && let Some(handle) = self.memory.get(&job.key)
        {
            trace!(id = job.id(), key = %job.key, "Memory cache hit at submit");
            job.deliver(Delivered::Resource(handle), Origin::MemoryCache);
            return false;
        }

        if !job.options.level().allows_decode() {
            debug!(id = job.id(), key = %job.key, "Memory miss on a memory-only request");
            job.core.cancel(CancelCause::LevelRestricted);
            return false;
        }

        job.core.notify_started();

        if job.mode == Mode::Scheduled && job.uses_memory_cache() {
            return self.join_free_ride(job);
        }
        true
    }

    /// Returns true if `job` became the provider for its key.
    fn join_free_ride(self: &Arc<Self>, job: &Arc<Job>) -> bool {
        match self.free_ride.join(&job.key, job.id(), Arc::clone(job)) {
            Role::Provider => {
                job.provider.store(true, Ordering::SeqCst);
                job.core.clear_detach();
                true
            }
            Role::Rider => {
                let shared: Weak<Self> = Arc::downgrade(self);
                let key = job.key.clone();
                let id = job.id();
                job.core.set_detach(Box::new(move || {
                    if let Some(shared) = shared.upgrade() {
                        shared.free_ride.leave(&key, id);
                    }
                }));
                false
            }
        }
    }

    /// Submits `job` to the stage queues.
    pub(crate) fn submit(self: &Arc<Self>, job: Arc<Job>) {
        if self.scheduler.is_shutting_down() {
            job.core.cancel(CancelCause::Normal);
            return;
        }
        if self.begin(&job) {
            self.schedule(job, Step::Dispatch);
        }
    }

    /// Runs `job` to completion on the current task.
    pub(crate) async fn run_inline(self: &Arc<Self>, job: Arc<Job>) {
        if !self.begin(&job) {
            return;
        }
        let mut step = Some(Step::Dispatch);
        while let Some(current) = step {
            step = self.run_step(&job, current).await;
        }
    }

    fn schedule(self: &Arc<Self>, job: Arc<Job>, step: Step) {
        let stage = step.stage();
        let id = job.id();
        let shared = Arc::clone(self);
        let running = Arc::clone(&job);
        let run = Box::pin(async move {
            if let Some(next) = shared.run_step(&running, step).await {
                shared.schedule(running, next);
            }
        });
        let discarding = Arc::clone(self);
        let discard = Box::new(move |cause| discarding.abandon(&job, cause));
        self.scheduler.submit(stage, StageTask { id, run, discard });
    }

    async fn run_step(self: &Arc<Self>, job: &Arc<Job>, step: Step) -> Option<Step> {
        if job.core.is_finished() {
            self.stop(job);
            return None;
        }
        match step {
            Step::Dispatch => self.dispatch(job),
            Step::Network => self.network(job).await,
            Step::Decode(bytes) => self.decode(job, bytes).await,
        }
    }

    fn disk_for(&self, job: &Job) -> Option<&DiskCache> {
        if job.uri.scheme().uses_disk_cache() && job.options.allows_disk_cache() {
            self.disk.as_ref()
        } else {
            None
        }
    }

    fn dispatch(self: &Arc<Self>, job: &Arc<Job>) -> Option<Step> {
        let network = job.uri.scheme().is_network();

        if let Some(disk) = self.disk_for(job)
            && disk.exists(job.source_key.as_str())
        {
            if !job.core.advance(RequestState::CheckingDiskCache) {
                self.stop(job);
                return None;
            }
            if job.kind() == RequestKind::Download {
                if let Some(entry) = disk.get(job.source_key.as_str()) {
                    self.deliver_download(job, &entry, Origin::DiskCache);
                    return None;
                }
            } else {
                trace!(id = job.id(), key = %job.source_key, "Disk cache hit");
                return Some(Step::Decode(None));
            }
        }

        if network && !job.options.level().allows_network() {
            debug!(id = job.id(), key = %job.key, "Network needed but request is local-only");
            self.cancel(job, CancelCause::LevelRestricted);
            return None;
        }

        if network || job.kind() == RequestKind::Download {
            Some(Step::Network)
        } else {
            Some(Step::Decode(None))
        }
    }

    async fn network(self: &Arc<Self>, job: &Arc<Job>) -> Option<Step> {
        let _guard = self.download_locks.lock(job.source_key.as_str()).await;
        if !job.core.advance(RequestState::Downloading) {
            self.stop(job);
            return None;
        }

        if let Some(disk) = self.disk_for(job)
            && let Some(entry) = disk.get(job.source_key.as_str())
        {
            trace!(id = job.id(), key = %job.source_key, "Another request already downloaded this source");
            if job.kind() == RequestKind::Download {
                self.deliver_download(job, &entry, Origin::DiskCache);
                return None;
            }
            return Some(Step::Decode(None));
        }

        let origin = if job.uri.scheme().is_network() {
            Origin::Network
        } else {
            Origin::Local
        };
        let bytes = self.fetch(job).await?;

        let mut path = None;
        if let Some(disk) = self.disk_for(job) {
            match disk.put(job.source_key.as_str(), &bytes).await {
                Ok(entry) => path = Some(entry.path().to_path_buf()),
                Err(e) => warn!(key = %job.source_key, error = %e, "Failed to store download"),
            }
        }

        if job.kind() == RequestKind::Download {
            job.deliver(
                Delivered::Download(DownloadResult {
                    key: job.source_key.clone(),
                    byte_len: bytes.len() as u64,
                    path,
                }),
                origin,
            );
            return None;
        }
        Some(Step::Decode(Some((bytes, origin))))
    }

    async fn decode(
        self: &Arc<Self>,
        job: &Arc<Job>,
        carried: Option<(Bytes, Origin)>,
    ) -> Option<Step> {
        let (bytes, origin) = match carried {
            Some(carried) => carried,
            None if job.uri.scheme().is_network() => {
                let cached = match self.disk_for(job) {
                    Some(disk) => disk.get_bytes(job.source_key.as_str()).await,
                    None => None,
                };
                match cached {
                    Some(bytes) => (bytes, Origin::DiskCache),
                    None if job.options.level().allows_network() => {
                        debug!(id = job.id(), key = %job.source_key, "Disk entry vanished, going to network");
                        return Some(Step::Network);
                    }
                    None => {
                        self.cancel(job, CancelCause::LevelRestricted);
                        return None;
                    }
                }
            }
            None => (self.fetch(job).await?, Origin::Local),
        };

        let _guard = self.decode_locks.lock(job.key.as_str()).await;
        if !job.core.advance(RequestState::Decoding) {
            self.stop(job);
            return None;
        }

        if job.options.allows_memory_cache()
            && let Some(handle) = self.memory.get(&job.key)
        {
            trace!(id = job.id(), key = %job.key, "Decoded by another request meanwhile");
            self.complete(job, handle, Origin::MemoryCache);
            return None;
        }

        let codec = Arc::clone(&self.codec);
        let pool = Arc::clone(&self.pool);
        let options = job.options.clone();
        let core = Arc::clone(&job.core);
        let decoded = tokio::task::spawn_blocking(move || -> Result<Option<DecodedPayload>, CodecError> {
            let payload = codec.decode(&bytes, &options, pool.as_ref())?;
            let Some(transform) = options.transformer() else {
                return Ok(Some(payload));
            };
            if core.is_finished() {
                pool.release(payload.into_buffer());
                return Ok(None);
            }
            transform.apply(payload, &options, pool.as_ref()).map(Some)
        })
        .await;

        let payload = match decoded {
            Ok(Ok(Some(payload))) => payload,
            Ok(Ok(None)) => {
                trace!(id = job.id(), "Request ended before transform, dropping decode");
                self.stop(job);
                return None;
            }
            Ok(Err(e)) if e.is_out_of_memory() => {
                warn!(id = job.id(), key = %job.key, error = %e, "Decode ran out of memory");
                self.trim_memory();
                self.fail(job, FailCause::OutOfMemory);
                return None;
            }
            Ok(Err(e)) => {
                debug!(id = job.id(), key = %job.key, error = %e, "Decode failed");
                self.fail(job, FailCause::decode(e.to_string()));
                return None;
            }
            Err(e) => {
                self.fail(job, FailCause::decode(format!("decode task failed: {e}")));
                return None;
            }
        };

        if job.core.is_finished() {
            trace!(id = job.id(), "Discarding decode of finished request");
            self.pool.release(payload.into_buffer());
            self.stop(job);
            return None;
        }

        let recycler: Arc<dyn BufferRecycler> = self.pool.clone();
        let resource = ManagedResource::new(job.key.clone(), payload, Some(Arc::downgrade(&recycler)));
        let handle = resource.acquire();
        if job.options.allows_memory_cache() {
            self.memory.put(job.key.clone(), resource);
        }
        self.complete(job, handle, origin);
        None
    }

    async fn fetch(self: &Arc<Self>, job: &Arc<Job>) -> Option<Bytes> {
        if job.uri.scheme().is_network() {
            job.network_used.store(true, Ordering::SeqCst);
        }
        let observer = JobObserver { core: &job.core };
        match self.fetcher.fetch(&job.uri, &observer).await {
            Ok(bytes) => Some(bytes),
            Err(FetchError::Canceled) => {
                self.cancel(job, CancelCause::Normal);
                None
            }
            Err(FetchError::UnsupportedScheme { scheme }) => {
                debug!(id = job.id(), uri = %job.uri, %scheme, "No fetcher for scheme");
                self.fail(
                    job,
                    FailCause::UnsupportedScheme {
                        identifier: job.uri.as_str().to_string(),
                    },
                );
                None
            }
            Err(e) => {
                debug!(id = job.id(), uri = %job.uri, error = %e, "Fetch failed");
                self.fail(job, FailCause::fetch(e.to_string()));
                None
            }
        }
    }

    fn deliver_download(&self, job: &Job, entry: &DiskEntry, origin: Origin) {
        job.deliver(
            Delivered::Download(DownloadResult {
                key: job.source_key.clone(),
                byte_len: entry.byte_length(),
                path: Some(entry.path().to_path_buf()),
            }),
            origin,
        );
    }

    /// Delivers `handle` to `job` and to every rider waiting on it.
    ///
    /// Riders whose level forbids the network are canceled instead when the
    /// provider had to download.
    fn complete(
        &self,
        job: &Arc<Job>,
        handle: ResourceHandle,
        origin: Origin,
    ) {
        if job.is_provider() {
            for rider in self.free_ride.finish(&job.key, job.id()) {
                if !rider.may_ride_on(job) {
                    debug!(id = rider.id(), provider = job.id(), "Rider may not use a network result");
                    rider.core.cancel(CancelCause::LevelRestricted);
                    continue;
                }
                trace!(id = rider.id(), provider = job.id(), "Rider served");
                rider.deliver(Delivered::Resource(handle.clone()), origin);
            }
        }
        job.deliver(Delivered::Resource(handle), origin);
    }

    /// Fails `job` and every rider waiting on it.
    fn fail(&self, job: &Arc<Job>, cause: FailCause) {
        job.core.fail(cause.clone());
        if job.is_provider() {
            for rider in self.free_ride.finish(&job.key, job.id()) {
                if rider.may_ride_on(job) {
                    rider.core.fail(cause.clone());
                } else {
                    rider.core.cancel(CancelCause::LevelRestricted);
                }
            }
        }
    }

    /// Cancels `job` and hands its riders to a new provider.
    fn cancel(self: &Arc<Self>, job: &Arc<Job>, cause: CancelCause) {
        job.core.cancel(cause);
        self.stop(job);
    }

    /// Called when a queued task is dropped unrun.
    fn abandon(self: &Arc<Self>, job: &Arc<Job>, cause: CancelCause) {
        self.cancel(job, cause);
    }

    /// Cleans up after a job that will not run further steps.
    fn stop(self: &Arc<Self>, job: &Arc<Job>) {
        if !job.is_provider() {
            return;
        }
        let riders = self.free_ride.finish(&job.key, job.id());
        if riders.is_empty() {
            return;
        }
        debug!(provider = job.id(), riders = riders.len(), "Provider stopped, redispatching riders");
        for rider in riders {
            if rider.core.is_finished() {
                continue;
            }
            if self.join_free_ride(&rider) {
                self.schedule(rider, Step::Dispatch);
            }
        }
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("memory", &self.memory.stats())
            .field("disk", &self.disk.as_ref().map(DiskCache::dir))
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::scheduler::StageLimits;
    use crate::domain::entities::{PixelFormat, PooledBuffer, Size, SizeClass};
    use crate::domain::ports::mocks::{MockFetcher, Recorded, RecordingListener};
    use crate::domain::ports::{MockImageCodec, MockImageTransform, RequestListener};
    use crate::infrastructure::fetch::CompositeFetcher;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    fn payload() -> DecodedPayload {
        let class = SizeClass::new(Size::new(4, 4), PixelFormat::Rgba8888);
        DecodedPayload::new(PooledBuffer::allocate(class), Size::new(4, 4))
    }

    fn shared(fetcher: MockFetcher, codec: MockImageCodec, disk: Option<DiskCache>) -> Arc<Shared> {
        shared_with(Arc::new(fetcher), codec, disk)
    }

    fn shared_with(
        fetcher: Arc<dyn SourceFetcher>,
        codec: MockImageCodec,
        disk: Option<DiskCache>,
    ) -> Arc<Shared> {
        Arc::new(Shared::new(
            MemoryCache::new(1024 * 1024),
            disk,
            Arc::new(ResourcePool::new(1024 * 1024, 4)),
            fetcher,
            Arc::new(codec),
            RequestScheduler::new(StageLimits::default()),
            DeliveryQueue::spawn(),
        ))
    }

    fn job(
        shared: &Shared,
        identifier: &str,
        kind: RequestKind,
        options: RequestOptions,
        listener: Arc<dyn RequestListener>,
        mode: Mode,
    ) -> Arc<Job> {
        let uri = UriDescriptor::parse(identifier).unwrap();
        let key = RequestKey::new(&uri, &options);
        let delivery = match mode {
            Mode::Scheduled => shared.delivery.clone(),
            Mode::Inline => DeliveryQueue::inline(),
        };
        let core = RequestCore::new(shared.next_id(), kind, key.clone(), listener, delivery);
        Job::new(core, uri, key, options, None, mode)
    }

    async fn wait(listener: &RecordingListener) {
        tokio::time::timeout(Duration::from_secs(5), listener.wait())
            .await
            .unwrap();
    }

    async fn until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn shrunk() -> DecodedPayload {
        let class = SizeClass::new(Size::new(2, 2), PixelFormat::Rgba8888);
        DecodedPayload::new(PooledBuffer::allocate(class), Size::new(2, 2))
    }

    fn transform(build: impl FnOnce(&mut MockImageTransform)) -> RequestOptions {
        let mut transform = MockImageTransform::new();
        transform.expect_identity().return_const("shrink".to_string());
        build(&mut transform);
        RequestOptions::new().transform(Arc::new(transform))
    }

    /// Records listener names in terminal order.
    struct OrderedListener {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl RequestListener for OrderedListener {
        fn on_completed(&self, _delivered: Delivered, _origin: Origin) {
            self.log.lock().push(self.name);
        }

        fn on_failed(&self, _cause: FailCause) {}

        fn on_canceled(&self, _cause: CancelCause) {}
    }

    #[tokio::test]
    async fn test_network_load_decodes_and_caches() {
        let fetcher = MockFetcher::new().with_response("https://x/a.png", vec![1, 2, 3]);
        let calls = fetcher.calls();
        let mut codec = MockImageCodec::new();
        codec.expect_decode().times(1).returning(|_, _, _| Ok(payload()));
        let shared = shared(fetcher, codec, None);
        let listener = Arc::new(RecordingListener::default());

        let j = job(&shared, "https://x/a.png", RequestKind::Load, RequestOptions::new(), listener.clone(), Mode::Scheduled);
        shared.submit(Arc::clone(&j));
        wait(&listener).await;

        assert!(matches!(
            listener.terminal.lock()[0],
            Recorded::Completed(_, Origin::Network)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(shared.memory.contains(&j.key));
        assert_eq!(j.core.state(), RequestState::Completed);
    }

    #[tokio::test]
    async fn test_disk_hit_skips_network() {
        let dir = TempDir::new().unwrap();
        let disk = DiskCache::new(dir.path().to_path_buf(), 1024 * 1024).await.unwrap();
        disk.put("https://x/a.png", b"cached").await.unwrap();
        let fetcher = MockFetcher::new();
        let calls = fetcher.calls();
        let mut codec = MockImageCodec::new();
        codec
            .expect_decode()
            .withf(|bytes, _, _| bytes.to_vec() == b"cached".to_vec())
            .times(1)
            .returning(|_, _, _| Ok(payload()));
        let shared = shared(fetcher, codec, Some(disk));
        let listener = Arc::new(RecordingListener::default());

        let j = job(&shared, "https://x/a.png", RequestKind::Load, RequestOptions::new(), listener.clone(), Mode::Scheduled);
        shared.submit(j);
        wait(&listener).await;

        assert!(matches!(
            listener.terminal.lock()[0],
            Recorded::Completed(_, Origin::DiskCache)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_download_stores_without_decoding() {
        let dir = TempDir::new().unwrap();
        let disk = DiskCache::new(dir.path().to_path_buf(), 1024 * 1024).await.unwrap();
        let fetcher = MockFetcher::new().with_response("https://x/a.png", vec![9; 10]);
        let mut codec = MockImageCodec::new();
        codec.expect_decode().never();
        let shared = shared(fetcher, codec, Some(disk.clone()));
        let listener = Arc::new(RecordingListener::default());

        let j = job(&shared, "https://x/a.png", RequestKind::Download, RequestOptions::new(), listener.clone(), Mode::Scheduled);
        shared.submit(j);
        wait(&listener).await;

        match &listener.terminal.lock()[0] {
            Recorded::Completed(Delivered::Download(result), Origin::Network) => {
                assert_eq!(result.byte_len, 10);
                assert!(result.path.as_ref().is_some_and(|p| p.exists()));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(disk.exists("https://x/a.png"));
    }

    #[tokio::test]
    async fn test_decode_failure_is_reported() {
        let fetcher = MockFetcher::new().with_response("https://x/a.png", vec![0]);
        let mut codec = MockImageCodec::new();
        codec
            .expect_decode()
            .returning(|_, _, _| Err(CodecError::UnknownFormat));
        let shared = shared(fetcher, codec, None);
        let listener = Arc::new(RecordingListener::default());

        let j = job(&shared, "https://x/a.png", RequestKind::Load, RequestOptions::new(), listener.clone(), Mode::Scheduled);
        shared.submit(j);
        wait(&listener).await;

        assert!(matches!(
            listener.terminal.lock()[0],
            Recorded::Failed(FailCause::DecodeFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_out_of_memory_trims_and_fails() {
        let fetcher = MockFetcher::new().with_response("https://x/a.png", vec![0]);
        let mut codec = MockImageCodec::new();
        codec
            .expect_decode()
            .returning(|_, _, _| Err(CodecError::OutOfMemory { bytes: 1 << 40 }));
        let shared = shared(fetcher, codec, None);
        let listener = Arc::new(RecordingListener::default());

        let j = job(&shared, "https://x/a.png", RequestKind::Load, RequestOptions::new(), listener.clone(), Mode::Scheduled);
        shared.submit(j);
        wait(&listener).await;

        assert!(matches!(
            listener.terminal.lock()[0],
            Recorded::Failed(FailCause::OutOfMemory)
        ));
    }

    #[tokio::test]
    async fn test_riders_share_one_decode() {
        let fetcher = MockFetcher::new()
            .with_response("https://x/a.png", vec![1])
            .with_delay(Duration::from_millis(50));
        let calls = fetcher.calls();
        let mut codec = MockImageCodec::new();
        codec.expect_decode().times(1).returning(|_, _, _| Ok(payload()));
        let shared = shared(fetcher, codec, None);

        let listeners: Vec<_> = (0..4).map(|_| Arc::new(RecordingListener::default())).collect();
        for listener in &listeners {
            let j = job(&shared, "https://x/a.png", RequestKind::Load, RequestOptions::new(), listener.clone(), Mode::Scheduled);
            shared.submit(j);
        }
        for listener in &listeners {
            wait(listener).await;
            assert!(matches!(
                listener.terminal.lock()[0],
                Recorded::Completed(_, Origin::Network)
            ));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(shared.free_ride.stats().total_riders, 3);
    }

    #[tokio::test]
    async fn test_canceled_provider_hands_over_to_rider() {
        let fetcher = MockFetcher::new()
            .with_response("https://x/a.png", vec![1])
            .with_delay(Duration::from_millis(50));
        let mut codec = MockImageCodec::new();
        codec.expect_decode().times(1).returning(|_, _, _| Ok(payload()));
        let shared = shared(fetcher, codec, None);

        let provider_listener = Arc::new(RecordingListener::default());
        let rider_listener = Arc::new(RecordingListener::default());
        let provider = job(&shared, "https://x/a.png", RequestKind::Load, RequestOptions::new(), provider_listener.clone(), Mode::Scheduled);
        let rider = job(&shared, "https://x/a.png", RequestKind::Load, RequestOptions::new(), rider_listener.clone(), Mode::Scheduled);
        shared.submit(Arc::clone(&provider));
        shared.submit(rider);
        provider.core.cancel(CancelCause::Normal);

        wait(&provider_listener).await;
        wait(&rider_listener).await;

        assert!(matches!(
            provider_listener.terminal.lock()[0],
            Recorded::Canceled(CancelCause::Normal)
        ));
        assert!(matches!(
            rider_listener.terminal.lock()[0],
            Recorded::Completed(_, Origin::Network)
        ));
    }

    #[tokio::test]
    async fn test_inline_local_load() {
        let fetcher = MockFetcher::new().with_response("file:///img/a.png", vec![1]);
        let mut codec = MockImageCodec::new();
        codec.expect_decode().times(1).returning(|_, _, _| Ok(payload()));
        let shared = shared(fetcher, codec, None);
        let listener = Arc::new(RecordingListener::default());

        let j = job(&shared, "file:///img/a.png", RequestKind::Load, RequestOptions::new(), listener.clone(), Mode::Inline);
        shared.run_inline(j).await;

        assert!(matches!(
            listener.terminal.lock()[0],
            Recorded::Completed(_, Origin::Local)
        ));
    }

    #[tokio::test]
    async fn test_transform_runs_once_after_decode() {
        let fetcher = MockFetcher::new().with_response("https://x/a.png", vec![1]);
        let mut codec = MockImageCodec::new();
        codec.expect_decode().times(1).returning(|_, _, _| Ok(payload()));
        let shared = shared(fetcher, codec, None);
        let listener = Arc::new(RecordingListener::default());
        let options = transform(|t| {
            t.expect_apply().times(1).returning(|payload, _, buffers| {
                buffers.give_back(payload.into_buffer());
                Ok(shrunk())
            });
        });

        let j = job(&shared, "https://x/a.png", RequestKind::Load, options, listener.clone(), Mode::Scheduled);
        shared.submit(Arc::clone(&j));
        wait(&listener).await;

        match &listener.terminal.lock()[0] {
            Recorded::Completed(Delivered::Resource(handle), Origin::Network) => {
                assert_eq!(handle.size(), Size::new(2, 2));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(shared.memory.contains(&j.key));
    }

    #[tokio::test]
    async fn test_transform_failure_is_decode_failure() {
        let fetcher = MockFetcher::new().with_response("https://x/a.png", vec![1]);
        let mut codec = MockImageCodec::new();
        codec.expect_decode().times(1).returning(|_, _, _| Ok(payload()));
        let shared = shared(fetcher, codec, None);
        let listener = Arc::new(RecordingListener::default());
        let options = transform(|t| {
            t.expect_apply()
                .times(1)
                .returning(|_, _, _| Err(CodecError::UnknownFormat));
        });

        let j = job(&shared, "https://x/a.png", RequestKind::Load, options, listener.clone(), Mode::Scheduled);
        shared.submit(Arc::clone(&j));
        wait(&listener).await;

        assert!(matches!(
            listener.terminal.lock()[0],
            Recorded::Failed(FailCause::DecodeFailed { .. })
        ));
        assert!(!shared.memory.contains(&j.key));
    }

    #[tokio::test]
    async fn test_request_canceled_during_decode_skips_transform() {
        let fetcher = MockFetcher::new().with_response("https://x/a.png", vec![1]);
        let slot: Arc<Mutex<Option<Arc<RequestCore>>>> = Arc::new(Mutex::new(None));
        let mut codec = MockImageCodec::new();
        let decoding = Arc::clone(&slot);
        codec.expect_decode().times(1).returning(move |_, _, _| {
            if let Some(core) = decoding.lock().as_ref() {
                core.cancel(CancelCause::Normal);
            }
            Ok(payload())
        });
        let shared = shared(fetcher, codec, None);
        let listener = Arc::new(RecordingListener::default());
        let options = transform(|t| {
            t.expect_apply().never();
        });

        let j = job(&shared, "https://x/a.png", RequestKind::Load, options, listener.clone(), Mode::Scheduled);
        *slot.lock() = Some(Arc::clone(&j.core));
        shared.submit(Arc::clone(&j));
        wait(&listener).await;

        assert!(matches!(
            listener.terminal.lock()[0],
            Recorded::Canceled(CancelCause::Normal)
        ));
        // The decoded buffer goes back to the pool.
        until(|| shared.pool.stats().idle_buffers == 1).await;
        assert!(!shared.memory.contains(&j.key));
    }

    #[tokio::test]
    async fn test_riders_complete_in_join_order() {
        let fetcher = MockFetcher::new()
            .with_response("https://x/a.png", vec![1])
            .with_delay(Duration::from_millis(200));
        let mut codec = MockImageCodec::new();
        codec.expect_decode().times(1).returning(|_, _, _| Ok(payload()));
        let shared = shared(fetcher, codec, None);
        let log = Arc::new(Mutex::new(Vec::new()));
        let listener = |name| -> Arc<dyn RequestListener> {
            Arc::new(OrderedListener {
                name,
                log: Arc::clone(&log),
            })
        };

        let provider = job(&shared, "https://x/a.png", RequestKind::Load, RequestOptions::new(), listener("provider"), Mode::Scheduled);
        shared.submit(Arc::clone(&provider));
        until(|| provider.is_provider()).await;

        for (name, waiting) in [("first", 1), ("second", 2)] {
            let rider = job(&shared, "https://x/a.png", RequestKind::Load, RequestOptions::new(), listener(name), Mode::Scheduled);
            shared.submit(rider);
            until(|| shared.free_ride.stats().waiting_riders == waiting).await;
        }

        until(|| log.lock().len() == 3).await;
        assert_eq!(*log.lock(), vec!["first", "second", "provider"]);
    }

    #[tokio::test]
    async fn test_unrouted_scheme_fails_as_unsupported() {
        let mut codec = MockImageCodec::new();
        codec.expect_decode().never();
        let shared = shared_with(Arc::new(CompositeFetcher::new()), codec, None);
        let listener = Arc::new(RecordingListener::default());

        let j = job(&shared, "https://x/a.png", RequestKind::Load, RequestOptions::new(), listener.clone(), Mode::Scheduled);
        shared.submit(j);
        wait(&listener).await;

        assert!(matches!(
            &listener.terminal.lock()[0],
            Recorded::Failed(FailCause::UnsupportedScheme { identifier }) if identifier == "https://x/a.png"
        ));
    }
}
