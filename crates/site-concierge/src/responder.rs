/// Reply generation, informed by the classification decision.
///
/// The LLM is asked to phrase the reply; when it fails, a deterministic localized
/// fallback is returned so classification never turns into a failed request.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use concierge_common::openai::{ChatCompletionRequest, Message, OpenAiClient, OpenAiClientError};

use crate::model::ClassificationDecision;

#[async_trait]
pub trait Responder: Send + Sync {
    async fn generate(
        &self,
        query: &str,
        decision: &ClassificationDecision,
    ) -> Result<String, OpenAiClientError>;
}

/// Ask `responder` for a reply, degrading to [`fallback_message`] on failure.
pub async fn reply_or_fallback(
    responder: &dyn Responder,
    query: &str,
    decision: &ClassificationDecision,
) -> String {
    match responder.generate(query, decision).await {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        Ok(_) => {
            warn!(decision = decision.kind(), "responder returned empty text, using fallback");
            fallback_message(decision)
        }
        Err(e) => {
            warn!(error = %e, decision = decision.kind(), "responder failed, using fallback");
            fallback_message(decision)
        }
    }
}

pub fn fallback_message(decision: &ClassificationDecision) -> String {
    match decision {
        ClassificationDecision::Faq { entry, .. } => entry.answer.clone(),
        ClassificationDecision::Navigation { intent, .. } => {
            format!("Sizga kerakli ma'lumot \"{intent}\" bo'limida. Hozir o'sha sahifaga yo'naltiraman.")
        }
        ClassificationDecision::NotFound => "Kechirasiz, savolingizni tushunmadim. Iltimos, uni boshqacha \
tarzda yozib ko'ring yoki biz bilan bog'laning."
            .to_string(),
    }
}

const PERSONA: &str = "You are the assistant on a company website. Reply in the visitor's language \
(Uzbek unless they clearly write in another language), politely and in at most three sentences.";

pub fn instructions(decision: &ClassificationDecision) -> String {
    match decision {
        ClassificationDecision::Faq { entry, .. } => format!(
            "{PERSONA}\nThe visitor's question matches this FAQ entry. Answer using only its content.\n\
Question: {}\nAnswer: {}",
            entry.question, entry.answer
        ),
        ClassificationDecision::Navigation { url, intent, .. } => format!(
            "{PERSONA}\nThe visitor is being redirected to the page {url} ({intent}). \
Tell them briefly what they will find there. Do not invent other pages."
        ),
        ClassificationDecision::NotFound => format!(
            "{PERSONA}\nNo FAQ entry or page matched. Have a helpful conversation; \
if you do not know a company-specific fact, say so instead of guessing."
        ),
    }
}

pub struct LlmResponder {
    client: Arc<OpenAiClient>,
    model: String,
}

impl LlmResponder {
    pub fn new(client: Arc<OpenAiClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Responder for LlmResponder {
    async fn generate(
        &self,
        query: &str,
        decision: &ClassificationDecision,
    ) -> Result<String, OpenAiClientError> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![Message::system(instructions(decision)), Message::user(query)],
            temperature: Some(0.4),
            max_tokens: Some(400),
        };
        self.client.complete_text(request).await
    }
}
