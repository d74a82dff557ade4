use std::sync::Arc;

use typed_builder::TypedBuilder;

use quire_common::PipelineSettings;
use quire_store::IssueStore;

use crate::infra::notify::NoopNotifier;
use crate::traits::{CandidateSource, ContentEvaluator, ContentWriter, Notifier, TextEmbedder};

/// Shared dependency container for pipeline runs.
///
/// Everything here is long-lived and cheap to clone. Steps borrow what they
/// need; no step holds state between runs.
#[derive(Clone, TypedBuilder)]
pub struct PipelineDeps {
    pub store: Arc<dyn IssueStore>,
    #[builder(default)]
    pub sources: Vec<Arc<dyn CandidateSource>>,
    pub evaluator: Arc<dyn ContentEvaluator>,
    pub writer: Arc<dyn ContentWriter>,
    pub embedder: Arc<dyn TextEmbedder>,
    #[builder(default = Arc::new(NoopNotifier))]
    pub notifier: Arc<dyn Notifier>,
    #[builder(default)]
    pub settings: PipelineSettings,
}
