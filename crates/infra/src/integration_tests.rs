//! Integration tests for the full job pipeline.
//!
//! Tests: Producer → TaskQueue → AnalysisWorker → JobRecordStore → bus → ProgressHub
//!
//! Verifies:
//! - Submissions create exactly one pending record and one queue entry
//! - Lifecycles only move forward and `result_ref` is set iff completed
//! - Transient failures retry under backoff; permanent ones short-circuit
//! - Racing workers never complete a job twice
//! - A live worker keeps its lease for as long as the pipeline runs
//! - Progress reaches only the owning tenant and never blocks the pipeline

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use complyflow_analysis::simulated::{
        SimulatedEvaluation, SimulatedExtraction, SimulatedIndexing, SimulatedReporting, SimulatedRetrieval,
        standard_pipeline,
    };
    use complyflow_analysis::{
        AnalysisParameters, AnalysisStage, InMemoryInputLocator, InputRef, Pipeline, StageArtifacts, StageContext,
        StageError,
    };
    use complyflow_auth::InMemoryEntitlements;
    use complyflow_core::{JobId, TenantId};
    use complyflow_events::{EventBus, InMemoryBusError, InMemoryEventBus, ProgressEvent, Subscription};

    use crate::broadcast::{ProgressHub, TenantSubscription};
    use crate::jobs::types::messages;
    use crate::jobs::{
        AnalysisWorker, FailureReason, InMemoryJobRecordStore, InMemoryTaskQueue, JobRecordStore, JobStatus,
        Producer, RetryPolicy, RunOutcome, TaskOutcome, TaskQueue, WorkerConfig,
    };

    type Bus = Arc<InMemoryEventBus<ProgressEvent>>;

    /// Fails transiently `failures` times, then succeeds.
    struct Flaky {
        failures: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicU32::new(failures),
            })
        }
    }

    #[async_trait]
    impl AnalysisStage for Flaky {
        async fn run(&self, ctx: &StageContext<'_>, artifacts: &mut StageArtifacts) -> Result<(), StageError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StageError::transient("embedding service returned 503"));
            }
            SimulatedIndexing::default().run(ctx, artifacts).await
        }
    }

    struct Hangs;

    #[async_trait]
    impl AnalysisStage for Hangs {
        async fn run(&self, _ctx: &StageContext<'_>, _artifacts: &mut StageArtifacts) -> Result<(), StageError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    /// A bus whose transport is always down.
    #[derive(Clone)]
    struct BrokenBus;

    impl EventBus<ProgressEvent> for BrokenBus {
        type Error = InMemoryBusError;

        fn publish(&self, _message: ProgressEvent) -> Result<(), Self::Error> {
            Err(InMemoryBusError::Poisoned)
        }

        fn subscribe(&self) -> Subscription<ProgressEvent> {
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            Subscription::new(rx)
        }
    }

    fn pipeline_with_indexing(indexing: Arc<dyn AnalysisStage>) -> Pipeline {
        Pipeline::standard(
            Arc::new(SimulatedExtraction::default()),
            indexing,
            Arc::new(SimulatedRetrieval::default()),
            Arc::new(SimulatedEvaluation::default()),
            Arc::new(SimulatedReporting::default()),
        )
    }

    struct Harness {
        records: Arc<InMemoryJobRecordStore>,
        queue: Arc<InMemoryTaskQueue>,
        bus: Bus,
        hub: ProgressHub,
        producer: Producer,
    }

    impl Harness {
        fn new() -> Self {
            let records = Arc::new(InMemoryJobRecordStore::new());
            let queue = Arc::new(InMemoryTaskQueue::new());
            let bus: Bus = Arc::new(InMemoryEventBus::new());
            let hub = ProgressHub::new();
            hub.attach(&bus);
            let producer = Producer::new(
                records.clone(),
                queue.clone(),
                Arc::new(InMemoryInputLocator::accept_any()),
                Arc::new(InMemoryEntitlements::permissive()),
                3,
            );
            Self {
                records,
                queue,
                bus,
                hub,
                producer,
            }
        }

        fn worker(&self, name: &str, pipeline: Pipeline) -> AnalysisWorker<Bus> {
            self.worker_on(name, pipeline, self.bus.clone())
        }

        fn worker_on<B>(&self, name: &str, pipeline: Pipeline, bus: B) -> AnalysisWorker<B>
        where
            B: EventBus<ProgressEvent> + Clone + 'static,
        {
            AnalysisWorker::new(
                self.records.clone(),
                self.queue.clone(),
                bus,
                Arc::new(pipeline),
                WorkerConfig::default()
                    .with_name(name)
                    .with_retry(RetryPolicy::immediate()),
            )
        }

        async fn submit(&self, tenant: TenantId, input: &str) -> JobId {
            self.producer
                .submit(
                    tenant,
                    InputRef::new(input).unwrap(),
                    AnalysisParameters::new(["GDPR", "SOC2"]).unwrap(),
                )
                .await
                .unwrap()
        }
    }

    /// Everything the hub has delivered so far, after letting the pump run.
    async fn drain(sub: &mut TenantSubscription) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(Some(ev)) = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn submitted_job_runs_to_completion_with_ordered_progress() {
        let h = Harness::new();
        let tenant = TenantId::new();
        let mut sub = h.hub.subscribe(tenant);

        let job = h.submit(tenant, "uploads/policy.pdf").await;
        let record = h.records.get(job).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(h.queue.len(), 1);

        let worker = h.worker("w1", standard_pipeline(Duration::ZERO));
        assert_eq!(worker.run_once().await.unwrap(), RunOutcome::Completed(job));

        let frames: Vec<i16> = drain(&mut sub).await.iter().map(|e| e.progress).collect();
        assert_eq!(frames, vec![0, 20, 40, 60, 90, 95, 100]);

        let record = h.records.get(job).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.result_ref.is_some());
        assert_eq!(
            h.records.status_history(job),
            vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Completed]
        );

        let entry = h.queue.get(job).await.unwrap().unwrap();
        assert_eq!(entry.outcome(), Some(TaskOutcome::Completed));
        assert_eq!(entry.attempt, 1);
        assert_eq!(worker.run_once().await.unwrap(), RunOutcome::Idle);
    }

    #[tokio::test]
    async fn transient_twice_then_success_completes_on_third_attempt() {
        let h = Harness::new();
        let tenant = TenantId::new();
        let job = h.submit(tenant, "uploads/policy.pdf").await;
        let worker = h.worker("w1", pipeline_with_indexing(Flaky::new(2)));

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(worker.run_once().await.unwrap());
        }

        assert!(matches!(outcomes[0], RunOutcome::Retried { attempt: 1, .. }));
        assert!(matches!(outcomes[1], RunOutcome::Retried { attempt: 2, .. }));
        assert_eq!(outcomes[2], RunOutcome::Completed(job));

        let entry = h.queue.get(job).await.unwrap().unwrap();
        assert_eq!(entry.attempt, 3);
        assert_eq!(entry.outcome(), Some(TaskOutcome::Completed));

        let record = h.records.get(job).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(
            h.records.status_history(job),
            vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Completed]
        );
        assert_eq!(worker.stats().retried, 2);
        assert_eq!(worker.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn always_transient_fails_after_exactly_three_attempts() {
        let h = Harness::new();
        let tenant = TenantId::new();
        let mut sub = h.hub.subscribe(tenant);
        let job = h.submit(tenant, "uploads/policy.pdf").await;
        let worker = h.worker("w1", pipeline_with_indexing(Flaky::new(u32::MAX)));

        let mut outcomes = Vec::new();
        loop {
            let outcome = worker.run_once().await.unwrap();
            if outcome == RunOutcome::Idle {
                break;
            }
            outcomes.push(outcome);
        }
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[2], RunOutcome::Failed(job));

        let entry = h.queue.get(job).await.unwrap().unwrap();
        assert_eq!(entry.attempt, 3);
        assert_eq!(entry.outcome(), Some(TaskOutcome::Failed));

        let record = h.records.get(job).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.result_ref.is_none());
        assert_eq!(record.failure.unwrap().reason, FailureReason::AttemptsExhausted);

        let frames = drain(&mut sub).await;
        let last = frames.last().unwrap();
        assert_eq!(last.progress, ProgressEvent::FAILED);
        assert_eq!(frames.iter().filter(|e| e.is_failure()).count(), 1);
    }

    #[tokio::test]
    async fn retried_attempts_never_report_lower_progress() {
        let h = Harness::new();
        let tenant = TenantId::new();
        let mut sub = h.hub.subscribe(tenant);
        h.submit(tenant, "uploads/policy.pdf").await;

        // Fails on the retrieval stage once, after extraction and indexing succeeded.
        let pipeline = Pipeline::standard(
            Arc::new(SimulatedExtraction::default()),
            Arc::new(SimulatedIndexing::default()),
            Flaky::new(1),
            Arc::new(SimulatedEvaluation::default()),
            Arc::new(SimulatedReporting::default()),
        );
        let worker = h.worker("w1", pipeline);
        while worker.run_once().await.unwrap() != RunOutcome::Idle {}

        let frames: Vec<i16> = drain(&mut sub).await.iter().map(|e| e.progress).collect();
        assert!(frames.windows(2).all(|w| w[0] <= w[1]), "frames went backwards: {frames:?}");
        assert_eq!(frames.last(), Some(&100));
    }

    #[tokio::test]
    async fn permanent_error_fails_without_spending_attempts() {
        let h = Harness::new();
        let tenant = TenantId::new();
        let job = h.submit(tenant, "uploads/scan.png").await;
        let worker = h.worker("w1", standard_pipeline(Duration::ZERO));

        assert_eq!(worker.run_once().await.unwrap(), RunOutcome::Failed(job));
        assert_eq!(worker.run_once().await.unwrap(), RunOutcome::Idle);

        let entry = h.queue.get(job).await.unwrap().unwrap();
        assert_eq!(entry.attempt, 1);
        assert_eq!(entry.outcome(), Some(TaskOutcome::Failed));

        let record = h.records.get(job).await.unwrap().unwrap();
        assert_eq!(record.snapshot().progress, ProgressEvent::FAILED);
        assert_eq!(record.failure.unwrap().reason, FailureReason::PermanentStageError);
    }

    #[tokio::test]
    async fn stage_timeout_is_retryable() {
        let h = Harness::new();
        let job = h.submit(TenantId::new(), "uploads/policy.pdf").await;
        let worker = AnalysisWorker::new(
            h.records.clone(),
            h.queue.clone(),
            h.bus.clone(),
            Arc::new(pipeline_with_indexing(Arc::new(Hangs))),
            WorkerConfig::default()
                .with_retry(RetryPolicy::immediate())
                .with_stage_timeout(Duration::from_millis(20)),
        );

        assert!(matches!(worker.run_once().await.unwrap(), RunOutcome::Retried { attempt: 1, .. }));
        let record = h.records.get(job).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn two_workers_racing_on_one_entry_complete_it_once() {
        let h = Harness::new();
        let job = h.submit(TenantId::new(), "uploads/policy.pdf").await;
        let a = h.worker("a", standard_pipeline(Duration::ZERO));
        let b = h.worker("b", standard_pipeline(Duration::ZERO));

        let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
        let outcomes = [ra.unwrap(), rb.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| **o == RunOutcome::Completed(job)).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == RunOutcome::Idle).count(), 1);
    }

    #[tokio::test]
    async fn reclaimed_lease_does_not_double_complete() {
        let h = Harness::new();
        let job = h.submit(TenantId::new(), "uploads/policy.pdf").await;

        // `a` loses its lease immediately, so `b` reclaims the entry while `a`
        // is still mid-pipeline.
        let a = AnalysisWorker::new(
            h.records.clone(),
            h.queue.clone(),
            h.bus.clone(),
            Arc::new(standard_pipeline(Duration::from_millis(20))),
            WorkerConfig::default()
                .with_name("a")
                .with_lease_duration(Duration::ZERO),
        );
        let b = h.worker("b", standard_pipeline(Duration::from_millis(20)));

        let first = tokio::spawn(async move { a.run_once().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = b.run_once().await.unwrap();
        let first = first.await.unwrap().unwrap();

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|o| **o == RunOutcome::Completed(job)).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| **o == RunOutcome::Superseded(job)).count(), 1);

        let record = h.records.get(job).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.failure.is_none());
        assert_eq!(
            h.records.status_history(job),
            vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Completed]
        );
        assert_eq!(
            h.queue.get(job).await.unwrap().unwrap().outcome(),
            Some(TaskOutcome::Completed)
        );
    }

    #[tokio::test]
    async fn healthy_job_outlives_a_short_lease() {
        let h = Harness::new();
        let job = h.submit(TenantId::new(), "uploads/policy.pdf").await;

        // Every stage alone runs longer than the lease.
        let lease = Duration::from_millis(60);
        let worker = |name: &str| {
            AnalysisWorker::new(
                h.records.clone(),
                h.queue.clone(),
                h.bus.clone(),
                Arc::new(standard_pipeline(Duration::from_millis(80))),
                WorkerConfig::default()
                    .with_name(name)
                    .with_lease_duration(lease)
                    .with_retry(RetryPolicy::immediate()),
            )
        };

        let mut runs = Vec::new();
        for n in 0..4 {
            let w = worker(&format!("w{n}"));
            runs.push(tokio::spawn(async move { w.run_once().await }));
            tokio::time::sleep(Duration::from_millis(70)).await;
        }

        let mut outcomes = Vec::new();
        for run in runs {
            outcomes.push(run.await.unwrap().unwrap());
        }

        assert_eq!(outcomes[0], RunOutcome::Completed(job));
        assert!(outcomes[1..].iter().all(|o| *o == RunOutcome::Idle), "{outcomes:?}");

        let record = h.records.get(job).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.failure.is_none());

        let entry = h.queue.get(job).await.unwrap().unwrap();
        assert_eq!(entry.attempt, 1);
        assert_eq!(entry.outcome(), Some(TaskOutcome::Completed));
    }

    #[tokio::test]
    async fn redelivery_reports_stored_progress_with_its_message() {
        let h = Harness::new();
        let tenant = TenantId::new();
        let job = h.submit(tenant, "uploads/policy.pdf").await;

        // First worker got through indexing, then died.
        h.queue.lease("crashed", Duration::ZERO).await.unwrap().unwrap();
        h.records.mark_processing(job).await.unwrap();
        h.records
            .record_progress(job, 40, "Indexing document sections...")
            .await
            .unwrap();

        let mut sub = h.hub.subscribe(tenant);
        let worker = h.worker("w1", standard_pipeline(Duration::ZERO));
        assert_eq!(worker.run_once().await.unwrap(), RunOutcome::Completed(job));

        let frames = drain(&mut sub).await;
        assert_eq!(frames[0].progress, 40);
        assert_eq!(frames[0].message, "Indexing document sections...");
        assert!(frames.iter().all(|e| e.message != messages::STARTING));
        assert_eq!(frames.last().map(|e| e.progress), Some(100));
        assert_eq!(h.queue.get(job).await.unwrap().unwrap().attempt, 2);
    }

    #[tokio::test]
    async fn redelivery_past_the_ceiling_fails_the_job() {
        let h = Harness::new();
        let tenant = TenantId::new();
        let mut sub = h.hub.subscribe(tenant);
        let job = h.submit(tenant, "uploads/policy.pdf").await;

        // Three workers crash in a row without settling.
        for _ in 0..3 {
            let lease = h.queue.lease("crashing", Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(lease.job_id, job);
        }

        let worker = h.worker("w1", standard_pipeline(Duration::ZERO));
        assert_eq!(worker.run_once().await.unwrap(), RunOutcome::Failed(job));

        let record = h.records.get(job).await.unwrap().unwrap();
        assert_eq!(record.failure.unwrap().reason, FailureReason::AttemptsExhausted);
        assert_eq!(
            h.records.status_history(job),
            vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Failed]
        );
        let frames = drain(&mut sub).await;
        assert_eq!(frames.last().map(|e| e.progress), Some(ProgressEvent::FAILED));
    }

    #[tokio::test]
    async fn broken_bus_does_not_stall_the_pipeline() {
        let h = Harness::new();
        let job = h.submit(TenantId::new(), "uploads/policy.pdf").await;
        let worker = h.worker_on("w1", standard_pipeline(Duration::ZERO), BrokenBus);

        assert_eq!(worker.run_once().await.unwrap(), RunOutcome::Completed(job));
        let snapshot = h.records.get(job).await.unwrap().unwrap().snapshot();
        assert_eq!(snapshot.progress, 100);
    }

    #[tokio::test]
    async fn progress_is_tenant_scoped_and_agrees_with_polling() {
        let h = Harness::new();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let mut sub_a = h.hub.subscribe(tenant_a);
        let mut sub_b = h.hub.subscribe(tenant_b);

        let job = h.submit(tenant_a, "uploads/policy.pdf").await;
        let worker = h.worker("w1", standard_pipeline(Duration::ZERO));
        worker.run_once().await.unwrap();

        let frames_a = drain(&mut sub_a).await;
        assert!(frames_a.iter().all(|e| e.tenant_id == tenant_a && e.job_id == job));
        assert!(drain(&mut sub_b).await.is_empty());

        let latest = h.records.latest_for_tenant(tenant_a).await.unwrap().unwrap().snapshot();
        assert_eq!(Some(latest.progress), frames_a.last().map(|e| e.progress));
        assert!(h.records.latest_for_tenant(tenant_b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spawned_pool_drains_the_queue() {
        let h = Harness::new();
        let tenant = TenantId::new();
        let mut jobs = Vec::new();
        for n in 0..4 {
            jobs.push(h.submit(tenant, &format!("uploads/doc-{n}.pdf")).await);
        }

        let pool = h.worker("pool", standard_pipeline(Duration::ZERO)).spawn_pool(2);
        assert_eq!(pool.len(), 2);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.records.stats(tenant).await.unwrap().completed < jobs.len() {
            assert!(tokio::time::Instant::now() < deadline, "pool did not finish in time");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(pool.stats().succeeded, jobs.len() as u64);
        pool.shutdown().await;
        assert_eq!(h.queue.outstanding(), 0);
    }
}
