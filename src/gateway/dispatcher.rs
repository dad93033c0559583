//! Dispatcher: owns every shared map, the worker pool, and the
//! request-front-end entry points that route handlers call into.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::affinity::AffinityMap;
use super::config::Config;
use super::error::GatewayError;
use super::packet::{self, FrameKind};
use super::processing::ProcessingSet;
use super::queue::{Job, PriorityQueue};
use super::registry::Registry;
use super::upstream_client;
use super::users::UserStore;

/// Outcome of polling for an idle upstream while a key packet waits.
enum IdleOutcome {
    Idle(usize),
    /// Another caller's job resolved the drone's key while we were polling.
    KeyResolved(serde_json::Value),
}

/// Outcome of a finished key-generation job.
#[derive(Debug, Clone)]
enum TaskSlot {
    Processing { started_at: Instant },
    Completed { body: serde_json::Value },
    Failed { error: String },
}

struct ResultStore {
    slots: Mutex<HashMap<String, (TaskSlot, Instant)>>,
}

impl ResultStore {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn set_processing(&self, task_id: &str) {
        self.slots.lock().insert(
            task_id.to_string(),
            (
                TaskSlot::Processing {
                    started_at: Instant::now(),
                },
                Instant::now(),
            ),
        );
    }

    fn set_completed(&self, task_id: &str, body: serde_json::Value, ttl: Duration) {
        self.slots.lock().insert(
            task_id.to_string(),
            (TaskSlot::Completed { body }, Instant::now() + ttl),
        );
    }

    fn set_failed(&self, task_id: &str, error: String, ttl: Duration) {
        self.slots.lock().insert(
            task_id.to_string(),
            (TaskSlot::Failed { error }, Instant::now() + ttl),
        );
    }

    /// Returns `None` if the slot is absent or its TTL elapsed (expired
    /// slots are treated the same as absent — a 503).
    fn peek(&self, task_id: &str) -> Option<TaskSlot> {
        let slots = self.slots.lock();
        let (slot, expires_at) = slots.get(task_id)?;
        if matches!(slot, TaskSlot::Processing { .. }) || Instant::now() < *expires_at {
            Some(slot.clone())
        } else {
            None
        }
    }
}

/// The single object that owns every piece of shared gateway state.
pub struct Dispatcher {
    config: Arc<Config>,
    registry: Arc<Registry>,
    affinity: AffinityMap,
    processing: ProcessingSet,
    queue: Arc<PriorityQueue>,
    results: Arc<ResultStore>,
    concurrency: Arc<Semaphore>,
    rate_limiter: Arc<super::rate_limiter::RateLimiter>,
    users: Arc<dyn UserStore>,
    upstream_request_counts: Vec<AtomicU64>,
}

impl Dispatcher {
    pub fn new(config: Config, users: Arc<dyn UserStore>) -> Arc<Self> {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new(config.upstreams.clone()));
        let worker_count = registry.len().max(2);
        let upstream_request_counts = (0..registry.len()).map(|_| AtomicU64::new(0)).collect();

        let dispatcher = Arc::new(Self {
            rate_limiter: Arc::new(super::rate_limiter::RateLimiter::new(
                config.upstream_rate_per_sec,
            )),
            concurrency: Arc::new(Semaphore::new(config.max_concurrency)),
            queue: Arc::new(PriorityQueue::with_capacity(config.max_queue_size)),
            results: Arc::new(ResultStore::new()),
            affinity: AffinityMap::new(),
            processing: ProcessingSet::new(),
            registry,
            config,
            users,
            upstream_request_counts,
        });

        for _ in 0..worker_count {
            let worker = dispatcher.clone();
            tokio::spawn(async move { worker.worker_loop().await });
        }

        dispatcher
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn affinity(&self) -> &AffinityMap {
        &self.affinity
    }

    pub fn processing(&self) -> &ProcessingSet {
        &self.processing
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    pub fn users(&self) -> &dyn UserStore {
        self.users.as_ref()
    }

    /// Best-effort counter bump; never observable as a failure to callers.
    pub fn bump_upstream_counter(&self, upstream_index: usize) {
        if let Some(counter) = self.upstream_request_counts.get(upstream_index) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn upstream_request_count(&self, upstream_index: usize) -> u64 {
        self.upstream_request_counts
            .get(upstream_index)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Request front-end
    // ------------------------------------------------------------------

    /// Data-packet fast path: served synchronously, never touches the queue.
    pub async fn handle_data_packet(
        &self,
        drone_id: &str,
        raw_hex: &str,
    ) -> Result<serde_json::Value, GatewayError> {
        if let Some(record) = self.affinity.lookup(drone_id) {
            let upstream = self
                .registry
                .get(record.upstream_index)
                .ok_or_else(|| GatewayError::Internal(anyhow::anyhow!("stale affinity index")))?;

            self.rate_limiter.acquire().await;
            let _permit = self
                .concurrency
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;

            let result = upstream_client::call_decrypt(
                upstream,
                raw_hex,
                self.config.token_refresh_after,
            )
            .await;

            self.bump_upstream_counter(record.upstream_index);

            return result.map_err(|e| GatewayError::UpstreamFail(anyhow::anyhow!(e)));
        }

        if self.processing.lookup(drone_id).is_some() {
            return Ok(serde_json::json!({ "msg": "key_gen_busy" }));
        }

        Ok(serde_json::json!({ "msg": "no_key" }))
    }

    /// Key-packet path: affinity/processing short-circuits, otherwise
    /// enqueues a job and awaits its result.
    pub async fn handle_key_packet(
        &self,
        task_id: String,
        username: String,
        priority: i64,
        caller_update_time_epoch: i64,
        drone_id: String,
        raw_hex: String,
    ) -> Result<serde_json::Value, GatewayError> {
        if let Some(record) = self.affinity.lookup(&drone_id) {
            self.processing.remove(&drone_id);
            return Ok(serde_json::json!({
                "msg": "key_exist",
                "sn": record.serial_number,
            }));
        }

        if self.processing.lookup(&drone_id).is_some() {
            return Ok(serde_json::json!({ "msg": "key_gen_busy" }));
        }

        let upstream_index = match self.acquire_idle_upstream(&drone_id).await? {
            IdleOutcome::Idle(idx) => idx,
            IdleOutcome::KeyResolved(body) => return Ok(body),
        };

        if !self.processing.try_add(drone_id.clone(), upstream_index) {
            // Lost a race to another caller for the same drone between
            // the check above and here; tell the caller to retry.
            return Ok(serde_json::json!({ "msg": "key_gen_busy" }));
        }

        self.results.set_processing(&task_id);

        let job = Job {
            task_id: task_id.clone(),
            username,
            priority,
            caller_update_time_epoch,
            raw_hex,
            drone_id: drone_id.clone(),
            upstream_index,
        };

        if let Err(_queue_full) = self.queue.enqueue(job) {
            self.processing.remove(&drone_id);
            return Err(GatewayError::QueueFull);
        }
        self.await_task_result(&task_id).await
    }

    /// Polls the upstream registry for an idle server, up to 36 ticks at
    /// 1Hz, rechecking affinity on every tick in case another caller's
    /// job resolved the key while we were waiting.
    async fn acquire_idle_upstream(&self, drone_id: &str) -> Result<IdleOutcome, GatewayError> {
        const MAX_TICKS: u32 = 36;

        if let Some(idx) = self.registry.pick_idle_round_robin() {
            return Ok(IdleOutcome::Idle(idx));
        }

        for _ in 0..MAX_TICKS {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Some(record) = self.affinity.lookup(drone_id) {
                return Ok(IdleOutcome::KeyResolved(serde_json::json!({
                    "msg": "key_exist",
                    "sn": record.serial_number,
                })));
            }
            if let Some(idx) = self.registry.pick_idle_round_robin() {
                return Ok(IdleOutcome::Idle(idx));
            }
        }

        Err(GatewayError::AllServersBusy)
    }

    async fn await_task_result(&self, task_id: &str) -> Result<serde_json::Value, GatewayError> {
        let deadline = Instant::now() + self.config.queue_wait_timeout;

        loop {
            match self.results.peek(task_id) {
                None => return Err(GatewayError::WaitTimeout),
                Some(TaskSlot::Processing { .. }) => {}
                Some(TaskSlot::Completed { body }) => return Ok(body),
                Some(TaskSlot::Failed { error }) => {
                    return Err(GatewayError::UpstreamFail(anyhow::anyhow!(error)));
                }
            }

            if Instant::now() >= deadline {
                return Err(GatewayError::WaitTimeout);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    // ------------------------------------------------------------------
    // Worker loop
    // ------------------------------------------------------------------

    async fn worker_loop(self: Arc<Self>) {
        loop {
            let job = match self.queue.dequeue() {
                Some(job) => job,
                None => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            self.process_job(job).await;
        }
    }

    async fn process_job(&self, job: Job) {
        let Job {
            task_id,
            drone_id,
            raw_hex,
            upstream_index,
            ..
        } = job;

        // Step 7 (most important invariant): whatever happens below, the
        // drone must leave the Processing Set and the concurrency permit
        // must be released before this function returns.
        let outcome = self.run_job(&task_id, &drone_id, &raw_hex, upstream_index).await;

        match outcome {
            Ok(body) => {
                self.apply_keygen_outcome(&drone_id, upstream_index, &body);
                self.results.set_completed(&task_id, body, self.config.queue_wait_timeout);
            }
            Err(err) => {
                tracing::warn!(task_id = %task_id, error = %err, "key generation job failed");
                self.results.set_failed(&task_id, err.to_string(), self.config.queue_wait_timeout);
            }
        }

        self.processing.remove(&drone_id);
    }

    async fn run_job(
        &self,
        _task_id: &str,
        _drone_id: &str,
        raw_hex: &str,
        upstream_index: usize,
    ) -> anyhow::Result<serde_json::Value> {
        let upstream = self
            .registry
            .get(upstream_index)
            .ok_or_else(|| anyhow::anyhow!("upstream index out of range"))?;

        self.rate_limiter.acquire().await;
        let _permit = self.concurrency.acquire().await?;

        let body =
            upstream_client::call_decrypt(upstream, raw_hex, self.config.token_refresh_after)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;

        self.bump_upstream_counter(upstream_index);
        Ok(body)
    }

    fn apply_keygen_outcome(&self, drone_id: &str, upstream_index: usize, body: &serde_json::Value) {
        let msg = body.get("msg").and_then(|m| m.as_str()).unwrap_or("");
        match msg {
            "keygen_succ" => {
                let sn = body
                    .get("sn")
                    .and_then(|s| s.as_str())
                    .unwrap_or("")
                    .to_string();
                self.affinity.insert(drone_id.to_string(), upstream_index, sn);
            }
            "keygen_busy" => {
                if let Some(upstream) = self.registry.get(upstream_index) {
                    upstream.set_busy(self.config.upstream_busy_timeout);
                }
                self.affinity
                    .insert(drone_id.to_string(), upstream_index, String::new());
            }
            "key_exist" => {
                let sn = body
                    .get("sn")
                    .and_then(|s| s.as_str())
                    .unwrap_or("")
                    .to_string();
                self.affinity.insert(drone_id.to_string(), upstream_index, sn);
            }
            _ => {}
        }
    }

    /// Classifies a hex frame, returning the parsed drone id/kind or a
    /// `BadPacket` error for anything that fails to decode or is useless.
    pub fn classify(&self, raw_hex: &str) -> Result<(FrameKind, String), GatewayError> {
        let frame = packet::parse(raw_hex).map_err(|e| GatewayError::BadPacket(e.to_string()))?;
        if !frame.is_valid() {
            return Err(GatewayError::BadPacket("useless packet".to_string()));
        }
        Ok((frame.kind, frame.drone_id()))
    }
}
