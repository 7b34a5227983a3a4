//! Tokenization and BM25 keyword ranking.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use butler_domain::knowledge::KnowledgeItem;

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "in",
    "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "were", "will",
    "with",
];

/// Lowercase alphanumeric tokens, stopwords removed, single chars dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// The most frequent tokens of a document, for the stored keyword form.
pub fn extract_keywords(text: &str, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for token in tokenize(text) {
        *counts.entry(token).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(t, _)| t).collect()
}

/// BM25 over the snapshot's stored keyword forms. Returns the top `limit`
/// items with positive scores, best first (stable by id on ties).
pub fn rank_keyword(query: &str, items: &[KnowledgeItem], limit: usize) -> Vec<(Uuid, f32)> {
    let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
    if query_terms.is_empty() || items.is_empty() {
        return Vec::new();
    }

    let n = items.len() as f32;
    let avg_len: f32 =
        items.iter().map(|i| i.keywords.len() as f32).sum::<f32>() / n;
    let avg_len = avg_len.max(1.0);

    // Document frequency per query term.
    let mut df: HashMap<&str, f32> = HashMap::new();
    for term in &query_terms {
        let count = items
            .iter()
            .filter(|i| i.keywords.iter().any(|k| k == term))
            .count() as f32;
        df.insert(term.as_str(), count);
    }

    let mut scored: Vec<(Uuid, f32)> = items
        .iter()
        .filter_map(|item| {
            let doc_len = item.keywords.len() as f32;
            let mut score = 0.0f32;
            for term in &query_terms {
                let tf = item.keywords.iter().filter(|k| *k == term).count() as f32;
                if tf == 0.0 {
                    continue;
                }
                let dfi = df[term.as_str()];
                let idf = ((n - dfi + 0.5) / (dfi + 0.5) + 1.0).ln();
                let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len);
                score += idf * tf * (BM25_K1 + 1.0) / denom;
            }
            (score > 0.0).then_some((item.id, score))
        })
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use butler_domain::knowledge::{Bucket, SourceType};
    use chrono::Utc;

    fn item(keywords: &[&str]) -> KnowledgeItem {
        KnowledgeItem {
            id: Uuid::new_v4(),
            source_type: SourceType::Note,
            bucket: Bucket::Other,
            title: "t".into(),
            content: String::new(),
            embedding: vec![],
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            metadata: serde_json::json!({}),
            content_hash: String::new(),
            created_at: Utc::now(),
            seq: 0,
        }
    }

    #[test]
    fn tokenize_lowercases_and_strips() {
        assert_eq!(
            tokenize("The Quick-Brown Fox, and the dog!"),
            vec!["quick", "brown", "fox", "dog"]
        );
    }

    #[test]
    fn tokenize_drops_single_chars() {
        assert_eq!(tokenize("a b c rust"), vec!["rust"]);
    }

    #[test]
    fn extract_keywords_ranks_by_frequency() {
        let keywords = extract_keywords("rust rust rust tokio tokio serde", 2);
        assert_eq!(keywords, vec!["rust", "tokio"]);
    }

    #[test]
    fn rank_prefers_matching_documents() {
        let budget = item(&["budget", "travel", "plans"]);
        let recipe = item(&["pasta", "recipe", "dinner"]);
        let items = vec![budget.clone(), recipe.clone()];

        let ranked = rank_keyword("travel budget", &items, 10);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].0, budget.id);
        assert!(ranked[0].1 > 0.0);
    }

    #[test]
    fn rank_orders_by_relevance() {
        let both = item(&["rust", "async", "tokio"]);
        let one = item(&["rust", "gardening", "soil"]);
        let items = vec![one.clone(), both.clone()];

        let ranked = rank_keyword("rust async", &items, 10);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0, both.id);
    }

    #[test]
    fn rank_respects_limit() {
        let items: Vec<KnowledgeItem> = (0..5).map(|_| item(&["common"])).collect();
        let ranked = rank_keyword("common", &items, 3);
        assert_eq!(ranked.len(), 3);
    }

    #[test]
    fn empty_query_ranks_nothing() {
        let items = vec![item(&["rust"])];
        assert!(rank_keyword("the a of", &items, 10).is_empty());
    }
}
