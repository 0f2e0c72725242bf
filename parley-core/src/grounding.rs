//! Incremental, order-preserving deduplication of citation records
//!
//! Grounding metadata arrives piecemeal while a reply streams. Records are
//! keyed by `uri`; the first title seen for a uri wins and the order of first
//! appearance is kept.

use crate::session::Citation;
use std::collections::HashSet;

/// Ordered set of citations with a uri index for O(1) membership checks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroundingSet {
    citations: Vec<Citation>,
    seen: HashSet<String>,
}

impl GroundingSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge new records in place, returning how many were added
    pub fn accumulate<I>(&mut self, records: I) -> usize
    where
        I: IntoIterator<Item = Citation>,
    {
        let before = self.citations.len();
        for record in records {
            if self.seen.contains(&record.uri) {
                continue;
            }
            self.seen.insert(record.uri.clone());
            self.citations.push(record);
        }
        self.citations.len() - before
    }

    /// Whether a uri is already present
    pub fn contains(&self, uri: &str) -> bool {
        self.seen.contains(uri)
    }

    pub fn len(&self) -> usize {
        self.citations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }

    /// Citations in first-appearance order
    pub fn as_slice(&self) -> &[Citation] {
        &self.citations
    }

    pub fn into_vec(self) -> Vec<Citation> {
        self.citations
    }
}

impl From<Vec<Citation>> for GroundingSet {
    fn from(citations: Vec<Citation>) -> Self {
        let mut set = Self::new();
        set.accumulate(citations);
        set
    }
}

/// Merge `new_records` into `existing` and return the merged set
pub fn accumulate<I>(mut existing: GroundingSet, new_records: I) -> GroundingSet
where
    I: IntoIterator<Item = Citation>,
{
    existing.accumulate(new_records);
    existing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_title_wins() {
        let mut set = GroundingSet::new();
        set.accumulate(vec![Citation::new("First", "https://a")]);
        set.accumulate(vec![Citation::new("Second", "https://a")]);

        assert_eq!(set.len(), 1);
        assert_eq!(set.as_slice()[0].title, "First");
    }

    #[test]
    fn test_order_of_first_appearance() {
        let merged = accumulate(
            GroundingSet::new(),
            vec![
                Citation::new("B", "https://b"),
                Citation::new("A", "https://a"),
                Citation::new("B again", "https://b"),
                Citation::new("C", "https://c"),
            ],
        );
        let merged = accumulate(
            merged,
            vec![Citation::new("A again", "https://a"), Citation::new("D", "https://d")],
        );

        let uris: Vec<&str> = merged.as_slice().iter().map(|c| c.uri.as_str()).collect();
        assert_eq!(uris, vec!["https://b", "https://a", "https://c", "https://d"]);
        assert_eq!(merged.as_slice()[0].title, "B");
        assert_eq!(merged.as_slice()[1].title, "A");
    }

    #[test]
    fn test_accumulate_reports_added() {
        let mut set = GroundingSet::new();
        assert_eq!(set.accumulate(vec![Citation::new("A", "https://a")]), 1);
        assert_eq!(
            set.accumulate(vec![
                Citation::new("A", "https://a"),
                Citation::new("B", "https://b"),
            ]),
            1
        );
        assert_eq!(set.accumulate(Vec::new()), 0);
        assert!(set.contains("https://b"));
    }

    #[test]
    fn test_each_uri_exactly_once() {
        let records: Vec<Citation> = (0..200)
            .map(|i| Citation::new(format!("title {}", i), format!("https://site/{}", i % 17)))
            .collect();

        let mut set = GroundingSet::new();
        for chunk in records.chunks(7) {
            set.accumulate(chunk.to_vec());
        }

        assert_eq!(set.len(), 17);
        for (i, citation) in set.as_slice().iter().enumerate() {
            assert_eq!(citation.uri, format!("https://site/{}", i));
            assert_eq!(citation.title, format!("title {}", i));
        }
    }

    #[test]
    fn test_rebuild_from_persisted() {
        let set = GroundingSet::from(vec![
            Citation::new("A", "https://a"),
            Citation::new("A duplicate", "https://a"),
        ]);
        assert_eq!(set.len(), 1);
        assert!(set.contains("https://a"));
    }
}
