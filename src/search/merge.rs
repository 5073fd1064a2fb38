//! Merging of ordered lean hit lists

use super::hit::{GlobalId, LeanHit};
use std::collections::HashSet;

/// Two-way merge of an ordered partial list into the ordered `current` list,
/// keeping at most `needed` hits.
///
/// Hits in `partial` whose gid is already present in `current`, or repeated
/// within `partial`, are dropped so the earlier copy wins. On equal ranking
/// the hit from `current` goes first.
pub fn merge_lean_hits(current: Vec<LeanHit>, partial: Vec<LeanHit>, needed: usize) -> Vec<LeanHit> {
    if partial.is_empty() {
        return truncated(current, needed);
    }

    let mut seen: HashSet<GlobalId> = current.iter().map(|h| h.gid).collect();
    let partial: Vec<LeanHit> = partial.into_iter().filter(|h| seen.insert(h.gid)).collect();

    if current.is_empty() {
        return truncated(partial, needed);
    }

    let mut merged = Vec::with_capacity(needed.min(current.len() + partial.len()));
    let mut left = current.into_iter().peekable();
    let mut right = partial.into_iter().peekable();

    while merged.len() < needed {
        let take_left = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => l <= r,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_left { left.next() } else { right.next() };
        match next {
            Some(hit) => merged.push(hit),
            None => break,
        }
    }
    merged
}

/// Cut a merged list down to the caller's window `[offset, offset + limit)`.
pub fn trim_window(hits: Vec<LeanHit>, offset: usize, limit: usize) -> Vec<LeanHit> {
    hits.into_iter().skip(offset).take(limit).collect()
}

fn truncated(mut hits: Vec<LeanHit>, needed: usize) -> Vec<LeanHit> {
    hits.truncate(needed);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn hit(name: &str, score: f64, key: u32) -> LeanHit {
        LeanHit::with_relevance(GlobalId::from_slice(name.as_bytes()), score, 0, key)
    }

    fn names(hits: &[LeanHit]) -> Vec<String> {
        hits.iter()
            .map(|h| {
                String::from_utf8_lossy(h.gid.as_bytes())
                    .trim_end_matches('\0')
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn test_merge_orders_and_caps() {
        let a = vec![hit("doc1", 10.0, 0), hit("doc3", 5.0, 0)];
        let b = vec![hit("doc2", 8.0, 1)];
        let merged = merge_lean_hits(merge_lean_hits(Vec::new(), a, 2), b, 2);
        assert_eq!(names(&merged), vec!["doc1", "doc2"]);
    }

    #[test]
    fn test_duplicates_keep_earlier_copy() {
        let a = vec![hit("doc1", 3.0, 0)];
        let b = vec![hit("doc1", 9.0, 1), hit("doc2", 2.0, 1), hit("doc2", 1.0, 1)];
        let merged = merge_lean_hits(a, b, 10);

        assert_eq!(names(&merged), vec!["doc1", "doc2"]);
        assert_eq!(merged[0].distribution_key, 0);
        assert_eq!(merged[1].relevance(), Some(2.0));
    }

    #[test]
    fn test_ties_prefer_current() {
        let a = vec![hit("same", 1.0, 0)];
        let b = vec![hit("same", 1.0, 1)];
        let merged = merge_lean_hits(a, b, 10);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].distribution_key, 0);
    }

    #[test]
    fn test_random_lists_merge_like_sort() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..50 {
            let mut all = Vec::new();
            let mut merged = Vec::new();
            for node in 0..rng.gen_range(1..6u32) {
                let mut part: Vec<LeanHit> = (0..rng.gen_range(0..20))
                    .map(|i| hit(&format!("n{node}d{i}"), rng.gen_range(0..50) as f64, node))
                    .collect();
                part.sort();
                all.extend(part.iter().cloned());
                merged = merge_lean_hits(merged, part, usize::MAX);
            }
            all.sort();
            assert_eq!(merged, all);
        }
    }

    #[test]
    fn test_trim_window() {
        let hits: Vec<LeanHit> = (0..5).map(|i| hit(&format!("d{i}"), 10.0 - i as f64, 0)).collect();
        assert_eq!(names(&trim_window(hits.clone(), 1, 2)), vec!["d1", "d2"]);
        assert_eq!(trim_window(hits.clone(), 4, 3).len(), 1);
        assert!(trim_window(hits, 7, 3).is_empty());
    }
}
