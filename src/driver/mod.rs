//! Client-side batch driver: walks the price batch endpoint one batch at a
//! time, persisting a checkpoint after each step so an interrupted run can
//! pick up where it stopped.

pub mod checkpoint;
pub mod endpoint;
pub mod state;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use checkpoint::{
    BatchCheckpoint, CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore,
};
pub use endpoint::{
    BatchEndpoint, BatchProgress, BatchReply, EndpointError, HttpBatchEndpoint, InProcessEndpoint,
};
pub use state::{progress_label, JobState, StopReason, Totals};

use crate::jobs::price_update::DEFAULT_BATCH_SIZE;

pub const PRICE_UPDATE_JOB: &str = "price-update";
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(500);

/// Append-only destination for per-batch log lines (a terminal panel, a
/// file, a test buffer).
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub job: String,
    pub batch_size: u32,
    pub delay: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            job: PRICE_UPDATE_JOB.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            delay: DEFAULT_BATCH_DELAY,
        }
    }
}

pub struct Orchestrator {
    endpoint: Arc<dyn BatchEndpoint>,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Option<Arc<dyn LogSink>>,
    options: DriverOptions,
    state: JobState,
}

impl Orchestrator {
    pub fn new(
        endpoint: Arc<dyn BatchEndpoint>,
        checkpoints: Arc<dyn CheckpointStore>,
        options: DriverOptions,
    ) -> Self {
        Self {
            endpoint,
            checkpoints,
            sink: None,
            options,
            state: JobState::Idle,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Look for an interrupted run. A usable checkpoint leaves the driver
    /// `Stopped` (resumable); anything else leaves it `Idle`.
    pub async fn recover(&mut self) -> &JobState {
        self.state = match self.checkpoints.load(&self.options.job).await {
            Some(checkpoint) => {
                info!(
                    job = %self.options.job,
                    batch = checkpoint.batch,
                    saved_at = %checkpoint.saved_at,
                    "found resumable checkpoint"
                );
                JobState::Stopped {
                    checkpoint,
                    reason: StopReason::Recovered,
                }
            }
            None => JobState::Idle,
        };
        &self.state
    }

    /// Fresh run from batch 0; any existing checkpoint is dropped first.
    pub async fn start(&mut self, cancel: &CancellationToken) -> &JobState {
        self.clear_checkpoint().await;
        self.run_from(0, 0, None, Totals::default(), cancel).await;
        &self.state
    }

    /// Continue from the known checkpoint, or the stored one. Without a
    /// checkpoint this is a fresh start.
    pub async fn resume(&mut self, cancel: &CancellationToken) -> &JobState {
        let checkpoint = match &self.state {
            JobState::Stopped { checkpoint, .. } => Some(checkpoint.clone()),
            _ => self.checkpoints.load(&self.options.job).await,
        };
        match checkpoint {
            Some(cp) => {
                info!(job = %cp.job, batch = cp.batch, item_offset = cp.item_offset, "resuming");
                self.run_from(cp.batch, cp.item_offset, cp.total_batches, cp.totals(), cancel)
                    .await;
            }
            None => {
                info!(job = %self.options.job, "nothing to resume; starting fresh");
                self.run_from(0, 0, None, Totals::default(), cancel).await;
            }
        }
        &self.state
    }

    pub async fn discard(&mut self) -> &JobState {
        self.clear_checkpoint().await;
        self.state = JobState::Idle;
        &self.state
    }

    /// Drive batches from `batch_index`, skipping `skip` items of the first
    /// one. A partial reply re-runs the same batch from where it stopped.
    async fn run_from(
        &mut self,
        mut batch_index: u32,
        mut skip: u32,
        mut total_batches: Option<u32>,
        mut totals: Totals,
        cancel: &CancellationToken,
    ) {
        let batch_size = self.options.batch_size;
        loop {
            if cancel.is_cancelled() {
                let checkpoint = self.persist(batch_index, skip, total_batches, totals).await;
                info!(batch = batch_index, item_offset = skip, "stop requested");
                self.state = JobState::Stopped {
                    checkpoint,
                    reason: StopReason::Requested,
                };
                return;
            }
            self.state = JobState::Running {
                batch_index,
                total_batches,
                totals,
            };
            let progress = progress_label(batch_index, total_batches);
            debug!(batch = batch_index, skip, "{progress}: requesting");

            match self.endpoint.run_batch(batch_index, batch_size, skip).await {
                Ok(BatchReply::Done) => {
                    self.finish(totals).await;
                    return;
                }
                Ok(BatchReply::Progress(p)) => {
                    totals.add(p.saved, p.updated);
                    if total_batches.is_none() {
                        total_batches = p
                            .total_items
                            .map(|n| n.div_ceil(u64::from(batch_size.max(1))))
                            .and_then(|n| u32::try_from(n).ok());
                    }
                    let progress = progress_label(batch_index, total_batches);
                    for line in &p.log {
                        debug!(batch = batch_index, "{line}");
                        self.emit(line);
                    }
                    info!(
                        batch = batch_index,
                        saved = p.saved,
                        updated = p.updated,
                        total_saved = totals.saved,
                        "{progress} complete"
                    );
                    self.emit(&format!(
                        "{progress}: {} prices saved, {} sets updated",
                        p.saved, p.updated
                    ));
                    if p.partial {
                        if p.processed_through <= skip {
                            let reason = format!(
                                "no progress past item {skip} of batch {batch_index}"
                            );
                            error!(batch = batch_index, skip, "{reason}; stopping");
                            self.emit(&format!("{progress}: {reason}"));
                            let checkpoint =
                                self.persist(batch_index, skip, total_batches, totals).await;
                            self.state = JobState::Stopped {
                                checkpoint,
                                reason: StopReason::Error(reason),
                            };
                            return;
                        }
                        info!(
                            batch = batch_index,
                            processed_through = p.processed_through,
                            "batch cut short by time budget; continuing it"
                        );
                        skip = p.processed_through;
                    } else {
                        if p.is_last_batch {
                            self.finish(totals).await;
                            return;
                        }
                        batch_index += 1;
                        skip = 0;
                    }
                    self.persist(batch_index, skip, total_batches, totals).await;
                }
                Err(e) => {
                    error!(batch = batch_index, error = %e, "batch failed; stopping");
                    self.emit(&format!("{progress}: {e}"));
                    let checkpoint = self.persist(batch_index, skip, total_batches, totals).await;
                    self.state = JobState::Stopped {
                        checkpoint,
                        reason: StopReason::Error(e.to_string()),
                    };
                    return;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.options.delay) => {}
            }
        }
    }

    async fn finish(&mut self, totals: Totals) {
        self.clear_checkpoint().await;
        info!(
            job = %self.options.job,
            saved = totals.saved,
            updated = totals.updated,
            "run complete"
        );
        self.emit(&format!(
            "done: {} prices saved, {} sets updated",
            totals.saved, totals.updated
        ));
        self.state = JobState::Completed { totals };
    }

    /// Save progress. A failed write is logged; the run carries on with the
    /// in-memory state.
    async fn persist(
        &self,
        batch_index: u32,
        item_offset: u32,
        total_batches: Option<u32>,
        totals: Totals,
    ) -> BatchCheckpoint {
        let checkpoint = BatchCheckpoint::new(
            &self.options.job,
            batch_index,
            total_batches,
            totals,
            Utc::now(),
        )
        .with_item_offset(item_offset);
        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            warn!(job = %self.options.job, batch = batch_index, error = %e, "checkpoint save failed");
        }
        checkpoint
    }

    async fn clear_checkpoint(&self) {
        if let Err(e) = self.checkpoints.clear(&self.options.job).await {
            warn!(job = %self.options.job, error = %e, "checkpoint clear failed");
        }
    }

    fn emit(&self, line: &str) {
        if let Some(sink) = &self.sink {
            sink.append(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;

    /// Serves `total` items in batches; can fail once, cancel, run out of
    /// time partway through, or stall on a given batch.
    struct FakeEndpoint {
        total: u64,
        fail_once_at: Mutex<Option<u32>>,
        cancel_on: Option<(u32, CancellationToken)>,
        cut_short_at: Option<(u32, u32)>,
        stall_at: Option<u32>,
        calls: Mutex<Vec<u32>>,
        skips: Mutex<Vec<u32>>,
    }

    impl FakeEndpoint {
        fn new(total: u64) -> Self {
            Self {
                total,
                fail_once_at: Mutex::new(None),
                cancel_on: None,
                cut_short_at: None,
                stall_at: None,
                calls: Mutex::new(Vec::new()),
                skips: Mutex::new(Vec::new()),
            }
        }

        /// The first call for `batch` handles only `through` items.
        fn cut_short_at(mut self, batch: u32, through: u32) -> Self {
            self.cut_short_at = Some((batch, through));
            self
        }

        fn stalling_at(mut self, batch: u32) -> Self {
            self.stall_at = Some(batch);
            self
        }

        fn skips(&self) -> Vec<u32> {
            self.skips.lock().unwrap().clone()
        }

        fn failing_once_at(self, batch: u32) -> Self {
            *self.fail_once_at.lock().unwrap() = Some(batch);
            self
        }

        fn cancelling_on(mut self, batch: u32, token: CancellationToken) -> Self {
            self.cancel_on = Some((batch, token));
            self
        }

        fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchEndpoint for FakeEndpoint {
        async fn run_batch(
            &self,
            batch: u32,
            batch_size: u32,
            skip: u32,
        ) -> Result<BatchReply, EndpointError> {
            self.calls.lock().unwrap().push(batch);
            self.skips.lock().unwrap().push(skip);
            {
                let mut fail = self.fail_once_at.lock().unwrap();
                if *fail == Some(batch) {
                    *fail = None;
                    return Err(EndpointError::Status {
                        status: 503,
                        message: "store unavailable".into(),
                    });
                }
            }
            if let Some((at, token)) = &self.cancel_on {
                if *at == batch {
                    token.cancel();
                }
            }
            let offset = u64::from(batch) * u64::from(batch_size);
            if offset >= self.total {
                return Ok(BatchReply::Done);
            }
            if self.stall_at == Some(batch) {
                return Ok(BatchReply::Progress(BatchProgress {
                    total_items: Some(self.total),
                    partial: true,
                    processed_through: skip,
                    ..Default::default()
                }));
            }
            // A batch is worth 2 saved and 1 updated however it is split.
            let (saved, updated, partial, processed_through) = match self.cut_short_at {
                Some((at, through)) if at == batch && skip == 0 => (1, 0, true, through),
                Some((at, _)) if at == batch => (1, 1, false, batch_size),
                _ => (2, 1, false, batch_size),
            };
            Ok(BatchReply::Progress(BatchProgress {
                saved,
                updated,
                total_items: Some(self.total),
                is_last_batch: !partial && offset + u64::from(batch_size) >= self.total,
                partial,
                processed_through,
                log: vec![format!("batch {batch} line")],
            }))
        }
    }

    #[derive(Default)]
    struct VecSink(Mutex<Vec<String>>);

    impl LogSink for VecSink {
        fn append(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    fn options() -> DriverOptions {
        DriverOptions {
            job: PRICE_UPDATE_JOB.into(),
            batch_size: 10,
            delay: Duration::ZERO,
        }
    }

    fn driver(
        endpoint: Arc<FakeEndpoint>,
        store: Arc<MemoryCheckpointStore>,
    ) -> Orchestrator {
        Orchestrator::new(endpoint, store, options())
    }

    #[tokio::test]
    async fn completion_clears_checkpoint() {
        let endpoint = Arc::new(FakeEndpoint::new(25));
        let store = Arc::new(MemoryCheckpointStore::new());
        let sink = Arc::new(VecSink::default());
        let mut orch = driver(endpoint.clone(), store.clone()).with_sink(sink.clone());

        let state = orch.start(&CancellationToken::new()).await.clone();
        assert_eq!(
            state,
            JobState::Completed {
                totals: Totals { saved: 6, updated: 3 }
            }
        );
        assert_eq!(endpoint.calls(), vec![0, 1, 2]);
        assert_eq!(store.peek(PRICE_UPDATE_JOB), None);
        let lines = sink.0.lock().unwrap();
        assert!(lines.contains(&"batch 2/3: 2 prices saved, 1 sets updated".to_string()));
        assert!(lines.contains(&"batch 0 line".to_string()));
    }

    #[tokio::test]
    async fn done_reply_completes_empty_run() {
        let endpoint = Arc::new(FakeEndpoint::new(0));
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut orch = driver(endpoint.clone(), store.clone());
        let state = orch.start(&CancellationToken::new()).await.clone();
        assert_eq!(
            state,
            JobState::Completed {
                totals: Totals::default()
            }
        );
        assert_eq!(endpoint.calls(), vec![0]);
    }

    #[tokio::test]
    async fn error_persists_current_index_and_resume_continues() {
        let endpoint = Arc::new(FakeEndpoint::new(25).failing_once_at(1));
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut orch = driver(endpoint.clone(), store.clone());
        let cancel = CancellationToken::new();

        let state = orch.start(&cancel).await.clone();
        let JobState::Stopped { checkpoint, reason } = state else {
            panic!("expected stopped, got {state:?}");
        };
        assert!(matches!(reason, StopReason::Error(_)));
        assert_eq!(checkpoint.batch, 1);
        assert_eq!(checkpoint.total_saved, 2);
        assert_eq!(checkpoint.total_batches, Some(3));
        assert_eq!(store.peek(PRICE_UPDATE_JOB).map(|c| c.batch), Some(1));

        // A new driver picks the run up from the stored checkpoint.
        let mut orch = driver(endpoint.clone(), store.clone());
        assert!(orch.recover().await.is_resumable());
        let state = orch.resume(&cancel).await.clone();
        assert_eq!(
            state,
            JobState::Completed {
                totals: Totals { saved: 6, updated: 3 }
            }
        );
        assert_eq!(endpoint.calls(), vec![0, 1, 1, 2]);
        assert_eq!(store.peek(PRICE_UPDATE_JOB), None);
    }

    #[tokio::test]
    async fn stop_takes_effect_after_current_batch() {
        let cancel = CancellationToken::new();
        let endpoint = Arc::new(FakeEndpoint::new(50).cancelling_on(0, cancel.clone()));
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut orch = driver(endpoint.clone(), store.clone());

        let state = orch.start(&cancel).await.clone();
        assert_eq!(endpoint.calls(), vec![0]);
        let JobState::Stopped { checkpoint, reason } = state else {
            panic!("expected stopped");
        };
        assert_eq!(reason, StopReason::Requested);
        assert_eq!(checkpoint.batch, 1);
        assert_eq!(checkpoint.totals(), Totals { saved: 2, updated: 1 });
        assert_eq!(store.peek(PRICE_UPDATE_JOB).map(|c| c.batch), Some(1));
    }

    #[tokio::test]
    async fn partial_batch_is_rerun_from_where_it_stopped() {
        let endpoint = Arc::new(FakeEndpoint::new(25).cut_short_at(1, 4));
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut orch = driver(endpoint.clone(), store.clone());

        let state = orch.start(&CancellationToken::new()).await.clone();
        assert_eq!(
            state,
            JobState::Completed {
                totals: Totals { saved: 6, updated: 3 }
            }
        );
        assert_eq!(endpoint.calls(), vec![0, 1, 1, 2]);
        assert_eq!(endpoint.skips(), vec![0, 0, 4, 0]);
        assert_eq!(store.peek(PRICE_UPDATE_JOB), None);
    }

    #[tokio::test]
    async fn partial_last_batch_does_not_complete_the_run() {
        let endpoint = Arc::new(FakeEndpoint::new(25).cut_short_at(2, 3));
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut orch = driver(endpoint.clone(), store.clone());
        orch.start(&CancellationToken::new()).await;
        assert_eq!(endpoint.calls(), vec![0, 1, 2, 2]);
        assert_eq!(endpoint.skips(), vec![0, 0, 0, 3]);
        assert!(matches!(orch.state(), JobState::Completed { .. }));
    }

    #[tokio::test]
    async fn stop_inside_a_batch_resumes_at_the_item_offset() {
        let cancel = CancellationToken::new();
        let endpoint = Arc::new(
            FakeEndpoint::new(25)
                .cut_short_at(1, 4)
                .cancelling_on(1, cancel.clone()),
        );
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut orch = driver(endpoint.clone(), store.clone());

        let state = orch.start(&cancel).await.clone();
        let JobState::Stopped { checkpoint, reason } = state else {
            panic!("expected stopped, got {state:?}");
        };
        assert_eq!(reason, StopReason::Requested);
        assert_eq!((checkpoint.batch, checkpoint.item_offset), (1, 4));
        assert_eq!(store.peek(PRICE_UPDATE_JOB).map(|c| c.item_offset), Some(4));

        let mut orch = driver(endpoint.clone(), store.clone());
        orch.recover().await;
        let state = orch.resume(&CancellationToken::new()).await.clone();
        assert_eq!(
            state,
            JobState::Completed {
                totals: Totals { saved: 6, updated: 3 }
            }
        );
        assert_eq!(endpoint.skips(), vec![0, 0, 4, 0]);
    }

    #[tokio::test]
    async fn stalled_batch_stops_with_error() {
        let endpoint = Arc::new(FakeEndpoint::new(25).stalling_at(1));
        let store = Arc::new(MemoryCheckpointStore::new());
        let mut orch = driver(endpoint.clone(), store.clone());

        let state = orch.start(&CancellationToken::new()).await.clone();
        let JobState::Stopped { checkpoint, reason } = state else {
            panic!("expected stopped, got {state:?}");
        };
        assert!(matches!(reason, StopReason::Error(_)));
        assert_eq!(checkpoint.batch, 1);
        assert_eq!(endpoint.calls(), vec![0, 1]);
    }

    #[tokio::test]
    async fn in_process_run_prices_every_item_under_a_zero_budget() {
        use crate::jobs::fixtures::{context, ScriptedAdapter};
        use crate::model::{CatalogItem, Category};
        use crate::sources::{ListingRecord, RawExternalRecord};
        use crate::store::MemoryStore;

        let sale = |id: &str, title: &str, price: f64| {
            RawExternalRecord::Listing(ListingRecord {
                listing_id: id.into(),
                title: title.into(),
                price,
                currency: "USD".into(),
                sold_at: Some(Utc::now() - ChronoDuration::days(2)),
                condition_hint: None,
            })
        };
        let store = Arc::new(MemoryStore::with_items(vec![
            CatalogItem::new(1, Some("75192"), "Millennium Falcon", Category::Lego),
            CatalogItem::new(2, Some("10179"), "UCS Falcon", Category::Lego),
            CatalogItem::new(3, Some("21318"), "Tree House", Category::Lego),
        ]));
        let mut ctx = context(store.clone());
        ctx.listings = Arc::new(
            ScriptedAdapter::default()
                .with("set lego:75192", vec![sale("a", "LEGO 75192 Millennium Falcon sealed", 800.0)])
                .with("set lego:10179", vec![sale("b", "LEGO 10179 UCS Falcon new sealed", 2500.0)])
                .with("set lego:21318", vec![sale("c", "LEGO 21318 Tree House new", 300.0)]),
        );
        ctx.time_budget = Duration::ZERO;

        let endpoint = Arc::new(InProcessEndpoint::new(ctx));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let mut orch = Orchestrator::new(endpoint, checkpoints.clone(), options());
        let state = orch.start(&CancellationToken::new()).await.clone();

        assert!(matches!(state, JobState::Completed { .. }), "{state:?}");
        for id in 1..=3 {
            assert!(store.item(id).unwrap().new_avg_price.is_some(), "item {id} not priced");
        }
        assert_eq!(store.sales().len(), 3);
        assert_eq!(checkpoints.peek(PRICE_UPDATE_JOB), None);
    }

    #[tokio::test]
    async fn stale_checkpoint_recovers_to_idle() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let stale = BatchCheckpoint::new(
            PRICE_UPDATE_JOB,
            3,
            Some(5),
            Totals::default(),
            Utc::now() - ChronoDuration::hours(30),
        );
        store.save(&stale).await.unwrap();
        let mut orch = driver(Arc::new(FakeEndpoint::new(50)), store.clone());
        assert_eq!(orch.recover().await, &JobState::Idle);
        assert_eq!(store.peek(PRICE_UPDATE_JOB), None);
    }

    #[tokio::test]
    async fn start_ignores_existing_checkpoint() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let cp = BatchCheckpoint::new(PRICE_UPDATE_JOB, 2, Some(3), Totals::default(), Utc::now());
        store.save(&cp).await.unwrap();
        let endpoint = Arc::new(FakeEndpoint::new(25));
        let mut orch = driver(endpoint.clone(), store.clone());
        orch.start(&CancellationToken::new()).await;
        assert_eq!(endpoint.calls(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn discard_drops_checkpoint() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let cp = BatchCheckpoint::new(PRICE_UPDATE_JOB, 2, None, Totals::default(), Utc::now());
        store.save(&cp).await.unwrap();
        let mut orch = driver(Arc::new(FakeEndpoint::new(25)), store.clone());
        orch.recover().await;
        assert_eq!(orch.discard().await, &JobState::Idle);
        assert_eq!(store.peek(PRICE_UPDATE_JOB), None);
    }
}
