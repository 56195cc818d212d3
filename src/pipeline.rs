//! Top-level facade wiring the pipeline together.

use std::sync::Arc;

use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::extraction::{ExtractionEngine, VisionModel};
use crate::graph::{GraphDriver, GraphError, GraphStore, ObservationFilter};
use crate::model::{DocumentReference, ObservationRecord, PatientScope};
use crate::query::{
    DynamicGenerator, QueryDryRun, QueryEngine, QueryError, QueryModel, QueryOutcome, QueryRequest,
};
use crate::reconcile::{CatalogClient, ReconciliationEngine};
use crate::scheduler::{
    DocumentSubmission, FileStorage, ProcessingScheduler, ProgressSink, SubmittedTask, TaskStatus,
};

/// Everything the pipeline needs from its environment.
pub struct PipelineDeps {
    pub storage: Arc<dyn FileStorage>,
    pub vision: Arc<dyn VisionModel>,
    pub catalog: Arc<dyn CatalogClient>,
    pub store: Arc<dyn GraphStore>,
    pub driver: Arc<dyn GraphDriver>,
    pub sink: Arc<dyn ProgressSink>,
    /// Optional Cypher-writing model; without it, only template questions
    /// are answered.
    pub query_model: Option<Arc<dyn QueryModel>>,
    pub dry_run: Option<Arc<dyn QueryDryRun>>,
}

/// One assembled pipeline instance.
pub struct Pipeline {
    scheduler: ProcessingScheduler,
    queries: QueryEngine,
    store: Arc<dyn GraphStore>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> Self {
        let render_permits = Arc::new(Semaphore::new(config.max_concurrent_renders));
        let extractor = ExtractionEngine::new(deps.vision, render_permits, config.clone());
        let reconciler = ReconciliationEngine::new(deps.catalog, config.clone());
        let scheduler = ProcessingScheduler::new(
            config.clone(),
            deps.storage,
            extractor,
            reconciler,
            Arc::clone(&deps.store),
            deps.sink,
        );
        let generator = deps
            .query_model
            .map(|model| DynamicGenerator::new(model, deps.dry_run));
        let queries = QueryEngine::new(deps.driver, generator, config);
        Self {
            scheduler,
            queries,
            store: deps.store,
        }
    }

    /// Admit one uploaded document for processing.
    pub fn submit(&self, submission: DocumentSubmission) -> SubmittedTask {
        self.scheduler.submit(submission)
    }

    pub fn task_status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.scheduler.status(task_id)
    }

    pub fn cancel_task(&self, task_id: Uuid) -> bool {
        self.scheduler.cancel(task_id)
    }

    /// Answer a natural-language question for one patient.
    pub async fn answer(
        &self,
        request: &QueryRequest,
        scope: &PatientScope,
    ) -> Result<QueryOutcome, QueryError> {
        self.queries.answer(request, scope).await
    }

    /// Structured observation read, bypassing the query layer.
    pub async fn observations(
        &self,
        scope: &PatientScope,
        filter: &ObservationFilter,
    ) -> Result<Vec<ObservationRecord>, GraphError> {
        self.store.observations(scope, filter).await
    }

    pub async fn documents(&self, scope: &PatientScope) -> Result<Vec<DocumentReference>, GraphError> {
        self.store.documents(scope).await
    }

    /// Soft-delete one of the patient's documents.
    pub async fn delete_document(
        &self,
        scope: &PatientScope,
        document_uuid: Uuid,
    ) -> Result<bool, GraphError> {
        self.store.soft_delete_document(scope, document_uuid).await
    }
}
