//! Task admission and execution.
//!
//! Two semaphores gate execution: a global cap shared by everyone and a
//! per-user cap that keeps one uploader from starving the rest. Each task
//! takes its user permit before contending for a global one, so a user's
//! queued backlog never pins global permits it cannot use. Permits are
//! acquired in submission order (the semaphores are fair), so admission is
//! first-in first-out within each capacity class.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use uuid::Uuid;

use super::events::{ProgressEvent, ProgressSink, TaskStage, TaskStatus};
use super::{FileStorage, StorageError};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::extraction::{DocumentBlob, ExtractionEngine};
use crate::graph::{GraphError, GraphStore};
use crate::model::{DocumentBatch, DocumentReference, ObservationGroup, PatientScope};
use crate::reconcile::ReconciliationEngine;

/// One document upload handed to the scheduler.
#[derive(Debug, Clone)]
pub struct DocumentSubmission {
    /// Key under which the raw upload sits in the blob store.
    pub storage_key: String,
    pub document_name: String,
    pub declared_mime: String,
    pub scope: PatientScope,
}

/// Handle returned at submission time.
#[derive(Debug, Clone, Copy)]
pub struct SubmittedTask {
    pub task_id: Uuid,
}

struct TaskEntry {
    status: TaskStatus,
    cancel: watch::Sender<bool>,
    /// Set when the task reaches a terminal state; drives eviction.
    finished_at: Option<Instant>,
}

struct Inner {
    config: PipelineConfig,
    global: Arc<Semaphore>,
    per_user: Mutex<HashMap<String, Arc<Semaphore>>>,
    tasks: RwLock<HashMap<Uuid, TaskEntry>>,
    storage: Arc<dyn FileStorage>,
    extractor: ExtractionEngine,
    reconciler: ReconciliationEngine,
    store: Arc<dyn GraphStore>,
    sink: Arc<dyn ProgressSink>,
}

#[derive(Clone)]
pub struct ProcessingScheduler {
    inner: Arc<Inner>,
}

impl ProcessingScheduler {
    pub fn new(
        config: PipelineConfig,
        storage: Arc<dyn FileStorage>,
        extractor: ExtractionEngine,
        reconciler: ReconciliationEngine,
        store: Arc<dyn GraphStore>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                global: Arc::new(Semaphore::new(config.max_concurrent_documents)),
                config,
                per_user: Mutex::new(HashMap::new()),
                tasks: RwLock::new(HashMap::new()),
                storage,
                extractor,
                reconciler,
                store,
                sink,
            }),
        }
    }

    /// Admit one document. Returns immediately; processing runs in the
    /// background under the concurrency caps.
    pub fn submit(&self, submission: DocumentSubmission) -> SubmittedTask {
        self.inner.prune();
        let task_id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.inner.tasks.write().insert(
            task_id,
            TaskEntry {
                status: TaskStatus::Pending,
                cancel: cancel_tx,
                finished_at: None,
            },
        );
        self.inner.sink.emit(ProgressEvent::Queued { task_id });
        tracing::info!(task = %task_id, document = %submission.document_name,
            user = %submission.scope.user_id, "document queued");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::run_task(inner, task_id, submission, cancel_rx).await;
        });
        SubmittedTask { task_id }
    }

    /// Current status, or `None` for an unknown id. Terminal statuses stay
    /// queryable for the configured retention window, then get evicted.
    pub fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.inner
            .tasks
            .read()
            .get(&task_id)
            .map(|entry| entry.status.clone())
    }

    /// Request cancellation. Returns false when the task is unknown or
    /// already terminal. A task that already persisted stays persisted.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let tasks = self.inner.tasks.read();
        match tasks.get(&task_id) {
            Some(entry) if !entry.status.is_terminal() => {
                let _ = entry.cancel.send(true);
                true
            }
            _ => false,
        }
    }
}

impl Inner {
    fn user_semaphore(&self, user_id: &str) -> Arc<Semaphore> {
        Arc::clone(
            self.per_user
                .lock()
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrent_per_user))),
        )
    }

    fn set_status(&self, task_id: Uuid, status: TaskStatus) {
        if let Some(entry) = self.tasks.write().get_mut(&task_id) {
            if status.is_terminal() && entry.finished_at.is_none() {
                entry.finished_at = Some(Instant::now());
            }
            entry.status = status;
        }
    }

    /// Evict terminal tasks past the retention window and user semaphores
    /// nobody holds or waits on anymore.
    fn prune(&self) {
        let retention = self.config.finished_task_retention();
        self.tasks.write().retain(|_, entry| match entry.finished_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        self.per_user
            .lock()
            .retain(|_, sem| Arc::strong_count(sem) > 1);
    }

    fn enter_stage(&self, task_id: Uuid, stage: TaskStage) {
        self.set_status(task_id, TaskStatus::Running { stage });
        self.sink.emit(ProgressEvent::StageStarted { task_id, stage });
    }

    fn finish_stage(&self, task_id: Uuid, stage: TaskStage) {
        self.sink
            .emit(ProgressEvent::StageCompleted { task_id, stage });
    }

    fn fail(&self, task_id: Uuid, stage: TaskStage, error: &PipelineError) {
        tracing::warn!(task = %task_id, stage = %stage, error = %error, "task failed");
        self.set_status(
            task_id,
            TaskStatus::Failed {
                stage,
                error: error.to_string(),
            },
        );
        self.sink.emit(ProgressEvent::Failed {
            task_id,
            stage,
            error: error.to_string(),
        });
    }

    fn cancelled(&self, task_id: Uuid) {
        tracing::info!(task = %task_id, "task cancelled");
        self.set_status(task_id, TaskStatus::Cancelled);
        self.sink.emit(ProgressEvent::Cancelled { task_id });
    }

    async fn run_task(
        inner: Arc<Self>,
        task_id: Uuid,
        submission: DocumentSubmission,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        // Admission: this user's permit first, then a global permit. A task
        // waiting on its user cap must not hold a global permit, or one
        // user's backlog would starve everyone else's admissions. A cancel
        // that lands while the task is still queued releases it right away.
        let user_sem = inner.user_semaphore(&submission.scope.user_id);
        let _user = tokio::select! {
            _ = cancel_rx.changed() => {
                inner.cancelled(task_id);
                return;
            }
            permit = user_sem.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        let _global = tokio::select! {
            _ = cancel_rx.changed() => {
                inner.cancelled(task_id);
                return;
            }
            permit = Arc::clone(&inner.global).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        if *cancel_rx.borrow() {
            inner.cancelled(task_id);
            return;
        }

        match inner
            .execute(task_id, &submission, &mut cancel_rx)
            .await
        {
            Ok(summary) => {
                tracing::info!(task = %task_id,
                    values_created = summary.values_created, "task complete");
                inner.set_status(
                    task_id,
                    TaskStatus::Succeeded {
                        summary: summary.clone(),
                    },
                );
                inner.sink.emit(ProgressEvent::Completed { task_id, summary });
            }
            Err((stage, error)) => {
                if error.is_cancellation() {
                    inner.cancelled(task_id);
                } else {
                    inner.fail(task_id, stage, &error);
                }
            }
        }
    }

    async fn execute(
        &self,
        task_id: Uuid,
        submission: &DocumentSubmission,
        cancel_rx: &mut watch::Receiver<bool>,
    ) -> Result<crate::model::CommitSummary, (TaskStage, PipelineError)> {
        use TaskStage::*;

        // Rendering: fetch the upload, validate it, rasterize pages.
        self.enter_stage(task_id, Rendering);
        let bytes = self
            .storage
            .fetch(&submission.storage_key)
            .await
            .map_err(|e: StorageError| (Rendering, PipelineError::from(e)))?;
        let source_hash = format!("{:x}", Sha256::digest(&bytes));
        let blob = DocumentBlob::new(
            submission.document_name.clone(),
            submission.declared_mime.clone(),
            bytes,
        );
        let pages = self
            .extractor
            .prepare_pages(&blob)
            .await
            .map_err(|e| (Rendering, PipelineError::from(e)))?;
        self.finish_stage(task_id, Rendering);
        if *cancel_rx.borrow() {
            return Err((Rendering, PipelineError::Cancelled));
        }

        // Extracting: one cross-page vision call.
        self.enter_stage(task_id, Extracting);
        let extracted = self
            .extractor
            .extract_biomarkers(&pages, cancel_rx)
            .await
            .map_err(|e| (Extracting, PipelineError::from(e)))?;
        self.finish_stage(task_id, Extracting);
        if *cancel_rx.borrow() {
            return Err((Extracting, PipelineError::Cancelled));
        }

        // Reconciling: catalog matching and grouping. Infallible.
        self.enter_stage(task_id, Reconciling);
        let reconciled = self.reconciler.reconcile(&extracted).await;
        self.finish_stage(task_id, Reconciling);
        if *cancel_rx.borrow() {
            return Err((Reconciling, PipelineError::Cancelled));
        }

        // Persisting: one atomic commit. Past this point cancellation no
        // longer applies; the data is durable.
        self.enter_stage(task_id, Persisting);
        let document = DocumentReference {
            uuid: task_id,
            patient_id: submission.scope.patient_id.clone(),
            user_id: submission.scope.user_id.clone(),
            document_name: extracted
                .metadata
                .document_name
                .clone()
                .unwrap_or_else(|| submission.document_name.clone()),
            source_hash,
            report_date: extracted.metadata.report_date,
            created_at: Utc::now(),
            deleted: false,
        };
        let batch = DocumentBatch {
            document,
            groups: reconciled
                .groups
                .into_iter()
                .map(|g| ObservationGroup {
                    type_attrs: g.type_attrs,
                    values: g.values,
                })
                .collect(),
        };
        let seconds = self.config.call_timeout_secs;
        let summary = timeout(self.config.call_timeout(), self.store.commit_document(&batch))
            .await
            .map_err(|_| {
                (
                    Persisting,
                    PipelineError::from(GraphError::Timeout { seconds }),
                )
            })?
            .map_err(|e| (Persisting, PipelineError::from(e)))?;
        self.finish_stage(task_id, Persisting);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::renderer::PageImage;
    use crate::extraction::{ExtractionError, VisionModel};
    use crate::graph::{MemoryGraphStore, ObservationFilter};
    use crate::reconcile::StaticCatalog;
    use crate::scheduler::events::ChannelSink;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00];

    struct PngStorage;
    #[async_trait]
    impl FileStorage for PngStorage {
        async fn fetch(&self, _key: &str) -> Result<Vec<u8>, StorageError> {
            Ok(PNG_MAGIC.to_vec())
        }
    }

    struct MissingStorage;
    #[async_trait]
    impl FileStorage for MissingStorage {
        async fn fetch(&self, key: &str) -> Result<Vec<u8>, StorageError> {
            Err(StorageError::NotFound(key.to_string()))
        }
    }

    /// Vision model that holds each call open for a moment and records the
    /// peak number of concurrent calls.
    struct GaugedModel {
        current: AtomicUsize,
        peak: AtomicUsize,
        hold: Duration,
    }

    impl GaugedModel {
        fn new(hold: Duration) -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                hold,
            }
        }
    }

    #[async_trait]
    impl VisionModel for GaugedModel {
        async fn extract(
            &self,
            _pages: &[PageImage],
            _instruction: &str,
        ) -> Result<String, ExtractionError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(r#"{"biomarkers": [{"name": "Glucose", "confidence": 0.9,
                "values": [{"value": 95.0, "unit": "mg/dL", "page": 0}]}]}"#
                .to_string())
        }
    }

    fn scheduler_with(
        config: PipelineConfig,
        storage: Arc<dyn FileStorage>,
        model: Arc<dyn VisionModel>,
        store: Arc<dyn GraphStore>,
        sink: Arc<dyn ProgressSink>,
    ) -> ProcessingScheduler {
        let render = Arc::new(Semaphore::new(config.max_concurrent_renders));
        let extractor = ExtractionEngine::new(model, render, config.clone());
        let reconciler =
            ReconciliationEngine::new(Arc::new(StaticCatalog::default()), config.clone());
        ProcessingScheduler::new(config, storage, extractor, reconciler, store, sink)
    }

    fn submission(user: &str, patient: &str) -> DocumentSubmission {
        DocumentSubmission {
            storage_key: "blob-1".into(),
            document_name: "scan.png".into(),
            declared_mime: "image/png".into(),
            scope: PatientScope::new(patient, user),
        }
    }

    async fn wait_terminal(scheduler: &ProcessingScheduler, task_id: Uuid) -> TaskStatus {
        for _ in 0..200 {
            if let Some(status) = scheduler.status(task_id) {
                if status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn global_cap_bounds_concurrent_documents() {
        let config = PipelineConfig {
            max_concurrent_documents: 3,
            max_concurrent_per_user: 3,
            ..Default::default()
        };
        let model = Arc::new(GaugedModel::new(Duration::from_millis(50)));
        let scheduler = scheduler_with(
            config,
            Arc::new(PngStorage),
            Arc::clone(&model) as Arc<dyn VisionModel>,
            Arc::new(MemoryGraphStore::new()),
            Arc::new(super::super::NullSink),
        );

        let tasks: Vec<_> = (0..8)
            .map(|i| scheduler.submit(submission(&format!("user-{i}"), "p-1")))
            .collect();
        for task in tasks {
            let status = wait_terminal(&scheduler, task.task_id).await;
            assert!(matches!(status, TaskStatus::Succeeded { .. }), "{status:?}");
        }
        assert!(
            model.peak.load(Ordering::SeqCst) <= 3,
            "peak concurrency {} exceeded the global cap",
            model.peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn per_user_cap_bounds_one_uploader() {
        let config = PipelineConfig {
            max_concurrent_documents: 10,
            max_concurrent_per_user: 1,
            ..Default::default()
        };
        let model = Arc::new(GaugedModel::new(Duration::from_millis(30)));
        let scheduler = scheduler_with(
            config,
            Arc::new(PngStorage),
            Arc::clone(&model) as Arc<dyn VisionModel>,
            Arc::new(MemoryGraphStore::new()),
            Arc::new(super::super::NullSink),
        );

        let tasks: Vec<_> = (0..4)
            .map(|_| scheduler.submit(submission("one-user", "p-1")))
            .collect();
        for task in tasks {
            wait_terminal(&scheduler, task.task_id).await;
        }
        assert_eq!(model.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bulk_uploader_backlog_leaves_global_permits_free() {
        // Global cap 2, per-user cap 1. One user submits three slow
        // documents, then another user submits one. The bulk user's queued
        // backlog must not hold global permits, so the second user runs
        // alongside the bulk user's first document instead of waiting out
        // the whole backlog.
        let config = PipelineConfig {
            max_concurrent_documents: 2,
            max_concurrent_per_user: 1,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = scheduler_with(
            config,
            Arc::new(PngStorage),
            Arc::new(GaugedModel::new(Duration::from_millis(150))),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(ChannelSink::new(tx)),
        );
        let bulk: Vec<_> = (0..3)
            .map(|_| scheduler.submit(submission("bulk-user", "p-1")))
            .collect();
        let other = scheduler.submit(submission("other-user", "p-2"));
        for task in bulk.iter().chain(std::iter::once(&other)) {
            let status = wait_terminal(&scheduler, task.task_id).await;
            assert!(matches!(status, TaskStatus::Succeeded { .. }), "{status:?}");
        }

        let mut completed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ProgressEvent::Completed { task_id, .. } = event {
                completed.push(task_id);
            }
        }
        let other_pos = completed
            .iter()
            .position(|id| *id == other.task_id)
            .expect("other user's task completed");
        let bulk_second_pos = completed
            .iter()
            .enumerate()
            .filter(|(_, id)| bulk.iter().any(|t| t.task_id == **id))
            .map(|(i, _)| i)
            .nth(1)
            .expect("bulk user completed at least two tasks");
        assert!(
            other_pos < bulk_second_pos,
            "other user finished at {other_pos}, after the bulk user's \
             second task at {bulk_second_pos}: the backlog pinned a global permit"
        );
    }

    #[tokio::test]
    async fn finished_tasks_are_evicted_after_the_retention_window() {
        let config = PipelineConfig {
            finished_task_retention_secs: 0,
            ..Default::default()
        };
        let scheduler = scheduler_with(
            config,
            Arc::new(PngStorage),
            Arc::new(GaugedModel::new(Duration::ZERO)),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(super::super::NullSink),
        );
        let first = scheduler.submit(submission("u-1", "p-1"));
        let status = wait_terminal(&scheduler, first.task_id).await;
        assert!(matches!(status, TaskStatus::Succeeded { .. }));

        // The next submission triggers the prune pass.
        let second = scheduler.submit(submission("u-1", "p-1"));
        assert_eq!(scheduler.status(first.task_id), None, "terminal entry evicted");
        wait_terminal(&scheduler, second.task_id).await;
    }

    #[tokio::test]
    async fn events_arrive_in_stage_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = scheduler_with(
            PipelineConfig::default(),
            Arc::new(PngStorage),
            Arc::new(GaugedModel::new(Duration::ZERO)),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(ChannelSink::new(tx)),
        );
        let task = scheduler.submit(submission("u-1", "p-1"));
        let status = wait_terminal(&scheduler, task.task_id).await;
        assert!(matches!(status, TaskStatus::Succeeded { .. }));

        let mut stages_started = Vec::new();
        let mut completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ProgressEvent::StageStarted { stage, .. } => stages_started.push(stage),
                ProgressEvent::Completed { .. } => completed = true,
                _ => {}
            }
        }
        assert_eq!(
            stages_started,
            vec![
                TaskStage::Rendering,
                TaskStage::Extracting,
                TaskStage::Reconciling,
                TaskStage::Persisting
            ]
        );
        assert!(completed);
    }

    #[tokio::test]
    async fn successful_task_lands_in_the_graph() {
        let store = Arc::new(MemoryGraphStore::new());
        let scheduler = scheduler_with(
            PipelineConfig::default(),
            Arc::new(PngStorage),
            Arc::new(GaugedModel::new(Duration::ZERO)),
            Arc::clone(&store) as Arc<dyn GraphStore>,
            Arc::new(super::super::NullSink),
        );
        let task = scheduler.submit(submission("u-1", "p-7"));
        let status = wait_terminal(&scheduler, task.task_id).await;
        let TaskStatus::Succeeded { summary } = status else {
            panic!("expected success");
        };
        assert_eq!(summary.values_created, 1);

        let records = store
            .observations(&PatientScope::new("p-7", "u-1"), &ObservationFilter::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].type_name, "Glucose");
        assert!(!records[0].validated, "empty catalog leaves it unvalidated");
    }

    #[tokio::test]
    async fn missing_upload_fails_in_the_rendering_stage() {
        let scheduler = scheduler_with(
            PipelineConfig::default(),
            Arc::new(MissingStorage),
            Arc::new(GaugedModel::new(Duration::ZERO)),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(super::super::NullSink),
        );
        let task = scheduler.submit(submission("u-1", "p-1"));
        let status = wait_terminal(&scheduler, task.task_id).await;
        let TaskStatus::Failed { stage, error } = status else {
            panic!("expected failure, got {status:?}");
        };
        assert_eq!(stage, TaskStage::Rendering);
        assert!(error.contains("not found"), "{error}");
    }

    #[tokio::test]
    async fn cancelling_a_queued_task_stops_it() {
        // One permit, held by a slow task; the second task is still queued
        // when we cancel it.
        let config = PipelineConfig {
            max_concurrent_documents: 1,
            ..Default::default()
        };
        let scheduler = scheduler_with(
            config,
            Arc::new(PngStorage),
            Arc::new(GaugedModel::new(Duration::from_millis(200))),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(super::super::NullSink),
        );
        let first = scheduler.submit(submission("u-1", "p-1"));
        let second = scheduler.submit(submission("u-2", "p-2"));
        assert!(scheduler.cancel(second.task_id));

        assert_eq!(
            wait_terminal(&scheduler, second.task_id).await,
            TaskStatus::Cancelled
        );
        assert!(matches!(
            wait_terminal(&scheduler, first.task_id).await,
            TaskStatus::Succeeded { .. }
        ));
        assert!(
            !scheduler.cancel(second.task_id),
            "terminal tasks cannot be cancelled again"
        );
    }

    #[tokio::test]
    async fn unknown_task_has_no_status() {
        let scheduler = scheduler_with(
            PipelineConfig::default(),
            Arc::new(PngStorage),
            Arc::new(GaugedModel::new(Duration::ZERO)),
            Arc::new(MemoryGraphStore::new()),
            Arc::new(super::super::NullSink),
        );
        assert_eq!(scheduler.status(Uuid::new_v4()), None);
        assert!(!scheduler.cancel(Uuid::new_v4()));
    }
}
