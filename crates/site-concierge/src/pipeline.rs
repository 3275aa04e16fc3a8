/// The classification cascade: FAQ keywords, then navigation keywords, then the
/// model-backed navigation classifier.
///
/// Stages run strictly in order and the first one that decides wins; later stages are
/// never started. Failures of the model-backed stage count as "no decision".
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::classifier::NavigationClassifier;
use crate::config::MatchingConfig;
use crate::matcher::best_match;
use crate::model::{ClassificationDecision, NavigationSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Faq,
    NavigationKeywords,
    AssistantFallback,
}

/// Order used by `/classify`.
pub const FULL_CASCADE: &[Stage] = &[
    Stage::Faq,
    Stage::NavigationKeywords,
    Stage::AssistantFallback,
];

/// Order used by `/navigate`, which never answers from the FAQ.
pub const NAVIGATION_CASCADE: &[Stage] = &[Stage::NavigationKeywords, Stage::AssistantFallback];

enum StageOutcome {
    Decided(ClassificationDecision),
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub decision: ClassificationDecision,
    /// Stage that produced the decision; `None` when every stage passed.
    pub decided_by: Option<Stage>,
}

pub struct ClassificationPipeline {
    catalog: Arc<Catalog>,
    classifier: Arc<dyn NavigationClassifier>,
    matching: MatchingConfig,
}

impl ClassificationPipeline {
    pub fn new(
        catalog: Arc<Catalog>,
        classifier: Arc<dyn NavigationClassifier>,
        matching: MatchingConfig,
    ) -> Self {
        Self {
            catalog,
            classifier,
            matching,
        }
    }

    pub async fn classify(&self, query: &str) -> Classification {
        self.run(FULL_CASCADE, query).await
    }

    pub async fn run(&self, stages: &[Stage], query: &str) -> Classification {
        for &stage in stages {
            if let StageOutcome::Decided(decision) = self.run_stage(stage, query).await {
                info!(?stage, decision = decision.kind(), "query classified");
                return Classification {
                    decision,
                    decided_by: Some(stage),
                };
            }
            debug!(?stage, "no match, continuing");
        }
        info!(decision = "NOT_FOUND", "query classified");
        Classification {
            decision: ClassificationDecision::NotFound,
            decided_by: None,
        }
    }

    async fn run_stage(&self, stage: Stage, query: &str) -> StageOutcome {
        match stage {
            Stage::Faq => match best_match(query, &self.catalog.faqs, self.matching.faq_min_score) {
                Some(m) => {
                    debug!(
                        faq = %m.item.id,
                        score = m.score,
                        keywords = ?m.matched_keywords,
                        "faq matched"
                    );
                    StageOutcome::Decided(ClassificationDecision::Faq {
                        entry: m.item.clone(),
                        score: m.score,
                    })
                }
                None => StageOutcome::Continue,
            },
            Stage::NavigationKeywords => {
                match best_match(
                    query,
                    &self.catalog.navigation,
                    self.matching.navigation_min_score,
                ) {
                    Some(m) => {
                        debug!(
                            url = %m.item.url,
                            score = m.score,
                            keywords = ?m.matched_keywords,
                            "navigation matched"
                        );
                        StageOutcome::Decided(ClassificationDecision::Navigation {
                            url: m.item.url.clone(),
                            intent: m.item.intent.clone(),
                            source: NavigationSource::Keywords,
                        })
                    }
                    None => StageOutcome::Continue,
                }
            }
            Stage::AssistantFallback => self.assistant_fallback(query).await,
        }
    }

    async fn assistant_fallback(&self, query: &str) -> StageOutcome {
        if self.catalog.navigation.is_empty() {
            return StageOutcome::Continue;
        }

        let url = match self.classifier.classify(query, &self.catalog.navigation).await {
            Ok(Some(url)) => url,
            Ok(None) => return StageOutcome::Continue,
            Err(e) => {
                warn!(error = %e, "navigation classifier failed, treating as not found");
                return StageOutcome::Continue;
            }
        };

        match self.catalog.navigation_by_url(&url) {
            Some(entry) => StageOutcome::Decided(ClassificationDecision::Navigation {
                url: entry.url.clone(),
                intent: entry.intent.clone(),
                source: NavigationSource::Assistant,
            }),
            None => {
                warn!(url, "navigation classifier returned an unknown url, ignoring");
                StageOutcome::Continue
            }
        }
    }
}
