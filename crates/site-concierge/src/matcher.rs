/// Tiered lexical matching of a free-text query against keyword-labelled items.
///
/// Each keyword of an item is tested against the query with four rules, strongest first:
///
/// | rule | condition | score |
/// |------|-----------|-------|
/// | exact | trimmed, lower-cased query equals the keyword | 100 |
/// | contains | query contains the keyword or the keyword contains the query | 50 |
/// | phrase | multi-word keyword, every word fuzzy-matches a content word | 30 per word |
/// | word | single-word keyword fuzzy-matches a content word | 10 |
///
/// A keyword contributes through the first rule that fires and an item's score is the
/// sum over its keywords. "Fuzzy" means substring containment in either direction.
use crate::model::{Matchable, MatchResult};

pub const EXACT_SCORE: u32 = 100;
pub const CONTAINS_SCORE: u32 = 50;
pub const PHRASE_WORD_SCORE: u32 = 30;
pub const WORD_SCORE: u32 = 10;

/// Content words must be longer than this many characters.
const MIN_CONTENT_WORD_CHARS: usize = 2;

/// Grammatical particles that never count as content words.
const STOP_WORDS: &[&str] = &[
    // Uzbek, Latin script
    "va", "yoki", "ham", "bu", "shu", "ushbu", "u", "men", "sen", "biz", "siz", "ular",
    "menga", "sizga", "bizga", "mening", "sizning", "uchun", "bilan", "emas", "edi",
    "kerak", "iltimos", "qilib", "mi", "chi", "da", "ga", "dan", "ni", "ning",
    // Uzbek, Cyrillic script
    "ва", "ёки", "ҳам", "бу", "шу", "учун", "билан", "эмас", "керак", "илтимос",
];

/// Lower-cased whitespace tokens longer than two characters that are not stop words.
pub fn content_words(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > MIN_CONTENT_WORD_CHARS)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

fn fuzzy_eq(a: &str, b: &str) -> bool {
    a.contains(b) || b.contains(a)
}

/// A query prepared once and then scored against many items.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    normalized: String,
    content: Vec<String>,
}

impl PreparedQuery {
    pub fn new(query: &str) -> Self {
        let normalized = query.trim().to_lowercase();
        let content = content_words(&normalized);
        Self {
            normalized,
            content,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }

    /// Score a single keyword, or `None` when no rule applies.
    pub fn score_keyword(&self, keyword: &str) -> Option<u32> {
        let keyword = keyword.trim().to_lowercase();
        if keyword.is_empty() || self.normalized.is_empty() {
            return None;
        }

        if self.normalized == keyword {
            return Some(EXACT_SCORE);
        }
        if fuzzy_eq(&self.normalized, &keyword) {
            return Some(CONTAINS_SCORE);
        }

        let words: Vec<&str> = keyword.split_whitespace().collect();
        let hits = |word: &str| self.content.iter().any(|c| fuzzy_eq(c, word));
        if words.len() > 1 {
            if words.iter().all(|w| hits(w)) {
                return Some(PHRASE_WORD_SCORE * words.len() as u32);
            }
            return None;
        }
        hits(&keyword).then_some(WORD_SCORE)
    }

    /// Total score of an item plus the keywords that contributed to it.
    pub fn score_item<T: Matchable>(&self, item: &T) -> (u32, Vec<String>) {
        let mut total = 0;
        let mut matched = Vec::new();
        for keyword in item.keywords() {
            if let Some(score) = self.score_keyword(keyword) {
                total += score;
                matched.push(keyword.clone());
            }
        }
        (total, matched)
    }
}

/// Return the highest-scoring item if it reaches `min_score`.
///
/// Ties go to the item seen first. Items scoring zero are never returned, even with a
/// zero threshold.
pub fn best_match<'a, T: Matchable>(
    query: &str,
    items: &'a [T],
    min_score: u32,
) -> Option<MatchResult<'a, T>> {
    let prepared = PreparedQuery::new(query);
    if prepared.is_empty() {
        return None;
    }

    let mut best: Option<MatchResult<'a, T>> = None;
    for item in items {
        let (score, matched_keywords) = prepared.score_item(item);
        if score == 0 {
            continue;
        }
        if best.as_ref().map_or(true, |b| score > b.score) {
            best = Some(MatchResult {
                item,
                score,
                matched_keywords,
                matched: score >= min_score,
            });
        }
    }

    best.filter(|m| m.matched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FaqEntry, NavigationEntry};

    fn faq(id: &str, keywords: &[&str]) -> FaqEntry {
        FaqEntry {
            id: id.to_string(),
            question: format!("question {id}"),
            answer: format!("answer {id}"),
            category: "general".to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn nav(url: &str, keywords: &[&str]) -> NavigationEntry {
        NavigationEntry {
            url: url.to_string(),
            intent: format!("intent {url}"),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn test_content_words_filter_short_tokens_and_stop_words() {
        assert_eq!(
            content_words("Menga  ish uchun Vakansiya va ariza kerak"),
            vec!["ish".to_string(), "vakansiya".to_string(), "ariza".to_string()]
        );
        assert!(content_words("va u bu").is_empty());
    }

    #[test]
    fn test_rule_scores() {
        let q = PreparedQuery::new("  Narx Qancha ");
        assert_eq!(q.score_keyword("narx qancha"), Some(EXACT_SCORE));
        assert_eq!(q.score_keyword("NARX"), Some(CONTAINS_SCORE));
        assert_eq!(q.score_keyword("mahsulot narx qancha turadi"), Some(CONTAINS_SCORE));
        assert_eq!(q.score_keyword("  "), None);

        let q = PreparedQuery::new("xizmatlar narxlari haqida");
        assert_eq!(q.score_keyword("narx xizmat"), Some(2 * PHRASE_WORD_SCORE));
        assert_eq!(q.score_keyword("narx manzil"), None);
        assert_eq!(q.score_keyword("narxlari bo'yicha"), None);

        let q = PreparedQuery::new("ofis qayerda");
        assert_eq!(q.score_keyword("ofisimiz"), Some(WORD_SCORE));
        assert_eq!(q.score_keyword("telefon"), None);
    }

    #[test]
    fn test_keyword_contributes_through_highest_rule_only() {
        // "aloqa markazi" is contained in the query and also phrase-matches it;
        // containment wins even though the phrase rule would pay more.
        let q = PreparedQuery::new("aloqa markazi telefoni");
        assert_eq!(q.score_keyword("aloqa markazi"), Some(CONTAINS_SCORE));
    }

    #[test]
    fn test_rule_priority_for_otherwise_equal_items() {
        let items = vec![faq("word", &["manzilimiz"]), faq("exact", &["manzil"])];

        assert_eq!(PreparedQuery::new("manzil").score_item(&items[1]).0, EXACT_SCORE);

        let q = PreparedQuery::new("manzil qayerda");
        assert_eq!(q.score_item(&items[1]).0, CONTAINS_SCORE);
        assert_eq!(q.score_item(&items[0]).0, WORD_SCORE);

        let best = best_match("manzil qayerda", &items, 10).unwrap();
        assert_eq!(best.item.id, "exact");
    }

    #[test]
    fn test_scores_sum_over_keywords() {
        let item = nav("/careers", &["vakansiya", "ish", "ariza topshirish"]);
        let q = PreparedQuery::new("vakansiyalar bormi ish joyi");
        let (score, matched) = q.score_item(&item);
        // "vakansiya" and "ish" are contained in the query; the phrase misses on "ariza"
        assert_eq!(score, 2 * CONTAINS_SCORE);
        assert_eq!(matched, vec!["vakansiya".to_string(), "ish".to_string()]);
    }

    #[test]
    fn test_exact_keyword_entry_beats_substring_entry() {
        let items = vec![faq("price-word", &["narx"]), faq("price-phrase", &["narx qancha"])];
        let best = best_match("narx qancha", &items, 50).unwrap();
        assert_eq!(best.item.id, "price-phrase");
        assert_eq!(best.score, EXACT_SCORE);
        assert_eq!(best.matched_keywords, vec!["narx qancha".to_string()]);
        assert!(best.matched);
    }

    #[test]
    fn test_ties_keep_first_seen_item() {
        let items = vec![nav("/a", &["kontakt"]), nav("/b", &["kontakt"])];
        let best = best_match("kontakt", &items, 1).unwrap();
        assert_eq!(best.item.url, "/a");
    }

    #[test]
    fn test_threshold_and_empty_inputs() {
        let items = vec![faq("f1", &["yetkazib berish"])];
        assert!(best_match("yetkazib", &items, 100).is_none());
        assert_eq!(best_match("yetkazib", &items, 50).unwrap().score, CONTAINS_SCORE);

        let none: Vec<FaqEntry> = Vec::new();
        assert!(best_match("yetkazib", &none, 0).is_none());
        assert!(best_match("   ", &items, 0).is_none());
        assert!(best_match("boshqa narsa", &items, 0).is_none());
    }

    #[test]
    fn test_matching_is_deterministic() {
        let items = vec![
            nav("/about", &["kompaniya haqida", "biz haqimizda"]),
            nav("/services", &["xizmatlar", "kompaniya xizmatlari"]),
            nav("/contact", &["aloqa", "telefon"]),
        ];
        let first = best_match("kompaniya xizmatlari haqida", &items, 10).map(|m| (m.item.url.clone(), m.score));
        for _ in 0..10 {
            let again = best_match("kompaniya xizmatlari haqida", &items, 10).map(|m| (m.item.url.clone(), m.score));
            assert_eq!(first, again);
        }
    }
}
