//! Hierarchical call identifiers.
//!
//! A call id is a dot-separated version string such as `"1.2.0"`. The prefix
//! identifies the calling lineage; the last segment counts sibling calls made
//! from the same layer. Ids only grow: a segment is appended when a call is
//! received and the last segment is incremented when a call is made.

use std::sync::{Mutex, PoisonError};

const SEPARATOR: char = '.';

/// Id of the next sibling call.
///
/// `""` becomes `"1"`, `"1"` becomes `"2"` and `"1.1"` becomes `"1.2"`.
/// If the last segment is not a number the id is returned unchanged.
#[must_use]
pub fn next_sibling(id: &str) -> String {
    if id.is_empty() {
        return "1".to_string();
    }

    let (prefix, last) = match id.rfind(SEPARATOR) {
        Some(index) => id.split_at(index + 1),
        None => ("", id),
    };

    match last.parse::<i64>().ok().and_then(|v| v.checked_add(1)) {
        Some(next) => format!("{prefix}{next}"),
        None => id.to_string(),
    }
}

/// Id for the first call made from inside a newly received layer.
///
/// `"1.2"` becomes `"1.2.0"`; an empty id becomes `"0"`.
#[must_use]
pub fn inbound_layer(received: &str) -> String {
    if received.is_empty() {
        "0".to_string()
    } else {
        format!("{received}{SEPARATOR}0")
    }
}

/// Lock-guarded call id shared by everything running under one request.
///
/// Concurrent sibling calls from the same request (fan-out) each observe a
/// distinct id.
#[derive(Debug, Default)]
pub struct CallId {
    current: Mutex<String>,
}

impl CallId {
    /// Create a call id holding `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            current: Mutex::new(id.into()),
        }
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> String {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Advance to the next sibling and return the new value.
    pub fn advance_sibling(&self) -> String {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = next_sibling(&current);
        current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_sibling_from_empty() {
        assert_eq!(next_sibling(""), "1");
        assert_eq!(next_sibling("1"), "2");
        assert_eq!(next_sibling("9"), "10");
    }

    #[test]
    fn test_sibling_keeps_prefix() {
        assert_eq!(next_sibling("1.1"), "1.2");
        assert_eq!(next_sibling("1.2.0"), "1.2.1");
        assert_eq!(next_sibling("3.19"), "3.20");
    }

    #[test]
    fn test_sibling_unparseable_unchanged() {
        assert_eq!(next_sibling("abc"), "abc");
        assert_eq!(next_sibling("1.x"), "1.x");
        assert_eq!(next_sibling("1."), "1.");
    }

    #[test]
    fn test_inbound_layer() {
        assert_eq!(inbound_layer("1.2"), "1.2.0");
        assert_eq!(inbound_layer(""), "0");
        assert_eq!(inbound_layer("0"), "0.0");
    }

    #[test]
    fn test_advance_sibling_sequence() {
        let id = CallId::new("");
        assert_eq!(id.advance_sibling(), "1");
        assert_eq!(id.advance_sibling(), "2");
        assert_eq!(id.get(), "2");

        let id = CallId::new("1.1");
        assert_eq!(id.advance_sibling(), "1.2");
        assert_eq!(id.advance_sibling(), "1.3");
    }

    #[test]
    fn test_concurrent_siblings_are_distinct() {
        let id = Arc::new(CallId::new("1.0"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let id = Arc::clone(&id);
                std::thread::spawn(move || (0..50).map(|_| id.advance_sibling()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "duplicate sibling id");
            }
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(id.get(), "1.400");
    }

    proptest! {
        #[test]
        fn prop_siblings_increase_last_segment(
            prefix in proptest::collection::vec(0u32..1000, 0..4),
            start in 0u32..100_000,
            steps in 1usize..20,
        ) {
            let mut id = prefix
                .iter()
                .map(u32::to_string)
                .chain(std::iter::once(start.to_string()))
                .collect::<Vec<_>>()
                .join(".");
            let lineage: String = match id.rfind('.') {
                Some(i) => id[..=i].to_string(),
                None => String::new(),
            };

            let mut last = u64::from(start);
            for _ in 0..steps {
                id = next_sibling(&id);
                prop_assert!(id.starts_with(&lineage));
                let segment: u64 = id[lineage.len()..].parse().unwrap();
                prop_assert_eq!(segment, last + 1);
                last = segment;
            }
        }

        #[test]
        fn prop_inbound_layer_appends_zero(segments in proptest::collection::vec(0u32..1000, 1..5)) {
            let received = segments.iter().map(u32::to_string).collect::<Vec<_>>().join(".");
            let layered = inbound_layer(&received);
            prop_assert_eq!(layered, format!("{received}.0"));
        }

        #[test]
        fn prop_ids_never_shrink(segments in proptest::collection::vec(0u32..1000, 0..5)) {
            let id = segments.iter().map(u32::to_string).collect::<Vec<_>>().join(".");
            let next = next_sibling(&id);
            prop_assert!(next.split('.').count() >= id.split('.').filter(|s| !s.is_empty()).count());
            prop_assert!(inbound_layer(&id).len() > id.len());
        }
    }
}
