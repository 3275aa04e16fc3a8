/// Read-only FAQ and navigation datasets, loaded once at startup.
use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

use concierge_common::store::JsonFile;

use crate::error::AppError;
use crate::model::{FaqEntry, NavigationEntry};

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub faqs: Vec<FaqEntry>,
    pub navigation: Vec<NavigationEntry>,
}

impl Catalog {
    /// Build a catalog from in-memory entries, enforcing unique FAQ ids and navigation urls.
    pub fn new(
        mut faqs: Vec<FaqEntry>,
        mut navigation: Vec<NavigationEntry>,
    ) -> Result<Self, Vec<String>> {
        let mut problems = Vec::new();

        let mut ids = HashSet::new();
        for faq in &mut faqs {
            if !ids.insert(faq.id.clone()) {
                problems.push(format!("duplicate FAQ id {:?}", faq.id));
            }
            clean_keywords(&mut faq.keywords);
        }

        let mut urls = HashSet::new();
        for entry in &mut navigation {
            if !urls.insert(entry.url.clone()) {
                problems.push(format!("duplicate navigation url {:?}", entry.url));
            }
            clean_keywords(&mut entry.keywords);
        }

        if problems.is_empty() {
            Ok(Self { faqs, navigation })
        } else {
            Err(problems)
        }
    }

    pub async fn load(faq_path: &Path, navigation_path: &Path) -> Result<Self, AppError> {
        let faqs: Vec<FaqEntry> = read_dataset(faq_path).await?;
        let navigation: Vec<NavigationEntry> = read_dataset(navigation_path).await?;

        let catalog = Self::new(faqs, navigation).map_err(|problems| AppError::Dataset {
            file: format!("{} / {}", faq_path.display(), navigation_path.display()),
            message: problems.join("; "),
        })?;

        info!(
            faqs = catalog.faqs.len(),
            navigation = catalog.navigation.len(),
            "datasets loaded"
        );
        Ok(catalog)
    }

    pub fn navigation_by_url(&self, url: &str) -> Option<&NavigationEntry> {
        self.navigation.iter().find(|n| n.url == url)
    }
}

async fn read_dataset<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, AppError> {
    JsonFile::new(path)
        .load::<Vec<T>>()
        .await?
        .ok_or_else(|| AppError::Dataset {
            file: path.display().to_string(),
            message: "file not found".to_string(),
        })
}

/// Blank keywords would match every query through substring containment.
fn clean_keywords(keywords: &mut Vec<String>) {
    let before = keywords.len();
    keywords.retain(|k| !k.trim().is_empty());
    if keywords.len() != before {
        warn!(dropped = before - keywords.len(), "ignoring blank keywords");
    }
}
