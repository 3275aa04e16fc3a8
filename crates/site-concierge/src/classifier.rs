/// Last-resort navigation classifier backed by a hosted language model.
///
/// The model sees every navigation entry (url, intent and a short keyword preview) and
/// must answer with one url or the `NOT_FOUND` sentinel. Membership of the returned url is
/// checked by the pipeline, not here.
use std::sync::Arc;

use async_trait::async_trait;

use concierge_common::openai::{ChatCompletionRequest, Message, OpenAiClient, OpenAiClientError};

use crate::model::NavigationEntry;

pub const NOT_FOUND_SENTINEL: &str = "NOT_FOUND";

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier transport failed: {0}")]
    Transport(#[from] OpenAiClientError),
}

#[async_trait]
pub trait NavigationClassifier: Send + Sync {
    /// Pick a url for `query` from `items`. `Ok(None)` means the classifier found nothing.
    async fn classify(
        &self,
        query: &str,
        items: &[NavigationEntry],
    ) -> Result<Option<String>, ClassifierError>;
}

pub struct LlmNavigationClassifier {
    client: Arc<OpenAiClient>,
    model: String,
    keyword_preview: usize,
}

impl LlmNavigationClassifier {
    pub fn new(client: Arc<OpenAiClient>, model: impl Into<String>, keyword_preview: usize) -> Self {
        Self {
            client,
            model: model.into(),
            keyword_preview,
        }
    }
}

#[async_trait]
impl NavigationClassifier for LlmNavigationClassifier {
    async fn classify(
        &self,
        query: &str,
        items: &[NavigationEntry],
    ) -> Result<Option<String>, ClassifierError> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message::system(system_prompt(items, self.keyword_preview)),
                Message::user(query),
            ],
            temperature: Some(0.0),
            max_tokens: Some(60),
        };
        let reply = self.client.complete_text(request).await?;
        Ok(parse_reply(&reply))
    }
}

pub fn system_prompt(items: &[NavigationEntry], keyword_preview: usize) -> String {
    let mut catalog = String::new();
    for item in items {
        let keywords: Vec<&str> = item
            .keywords
            .iter()
            .take(keyword_preview)
            .map(String::as_str)
            .collect();
        catalog.push_str(&format!(
            "- {} | {} | {}\n",
            item.url,
            item.intent,
            keywords.join(", ")
        ));
    }

    format!(
        "You route visitors of a company website to the right page.\n\
Pages (url | purpose | keywords):\n{catalog}\n\
Read the visitor's message and reply with exactly one url from the list above, \
copied verbatim, and nothing else. If no page fits, reply with {NOT_FOUND_SENTINEL}."
    )
}

/// Normalize a model reply to a candidate url, or `None` for the sentinel / empty reply.
pub fn parse_reply(reply: &str) -> Option<String> {
    let cleaned = reply
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())?
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '`' | '.' | ' '));
    if cleaned.is_empty() || cleaned.eq_ignore_ascii_case(NOT_FOUND_SENTINEL) {
        return None;
    }
    Some(cleaned.to_string())
}
