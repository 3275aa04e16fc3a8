use serde::Deserialize;

/// A pre-authored question/answer pair.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FaqEntry {
    /// Stable identifier, unique within the FAQ set
    pub id: String,
    pub question: String,
    pub answer: String,
    pub category: String,
    /// Match keywords, in authoring order
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// A known section of the website the user can be sent to.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct NavigationEntry {
    /// Site-relative path, unique within the navigation set (e.g. "/contact")
    pub url: String,
    /// Short description of what the section is for
    pub intent: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Anything the lexical matcher can score against a query.
pub trait Matchable {
    fn keywords(&self) -> &[String];
}

impl Matchable for FaqEntry {
    fn keywords(&self) -> &[String] {
        &self.keywords
    }
}

impl Matchable for NavigationEntry {
    fn keywords(&self) -> &[String] {
        &self.keywords
    }
}

/// The best-scoring item for one query. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult<'a, T> {
    pub item: &'a T,
    pub score: u32,
    pub matched_keywords: Vec<String>,
    pub matched: bool,
}

/// Which stage of the cascade produced a navigation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationSource {
    Keywords,
    Assistant,
}

/// Outcome of classifying one query.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationDecision {
    Faq {
        entry: FaqEntry,
        score: u32,
    },
    Navigation {
        url: String,
        intent: String,
        source: NavigationSource,
    },
    NotFound,
}

impl ClassificationDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Faq { .. } => "FAQ",
            Self::Navigation { .. } => "NAVIGATION",
            Self::NotFound => "NOT_FOUND",
        }
    }
}
