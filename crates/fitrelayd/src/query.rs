//! Query Engine: turns a set of filters into stored events by picking the
//! most selective index each filter admits, then unions, dedups, orders,
//! and limits the combined result.
//!
//! Selectivity order per filter: `ids` (direct point lookups) > a `#tag`
//! constraint > `authors` > `kinds` > time-only (falls back to a full scan
//! of the primary tree, ordered after the fact).

use std::collections::HashSet;

use fitrelay_core::{event::order_events, Event, Filter};

use crate::storage::{Storage, StorageError};

type Result<T> = std::result::Result<T, StorageError>;

pub struct QueryEngine<'a> {
    storage: &'a Storage,
    implementation_max: usize,
}

impl<'a> QueryEngine<'a> {
    pub fn new(storage: &'a Storage, implementation_max: usize) -> Self {
        Self {
            storage,
            implementation_max,
        }
    }

    /// Resolve one filter against the store, honoring its own `since`/`until`
    /// and effective limit. Does not apply cross-filter predicates that the
    /// chosen index can't express (e.g. an `ids` lookup still needs `kinds`
    /// re-checked) — `Filter::matches` is the final arbiter for every
    /// candidate before it's returned.
    fn resolve_one(&self, filter: &Filter) -> Result<Vec<Event>> {
        let limit = filter.effective_limit(self.implementation_max);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let candidates = if let Some(ids) = &filter.ids {
            let mut events = Vec::new();
            for id in ids {
                if let Some(event) = self.storage.get_event(id)? {
                    events.push(event);
                }
            }
            events
        } else if let Some((name, values)) = filter.tags.iter().next() {
            let name_char = name.trim_start_matches('#').chars().next();
            match name_char {
                Some(name_char) => {
                    let mut events = Vec::new();
                    for value in values {
                        let (matched, _) = self.storage.range_by_tag(
                            name_char,
                            value,
                            filter.since,
                            filter.until,
                            limit,
                            None,
                        )?;
                        events.extend(matched);
                    }
                    events
                }
                None => Vec::new(),
            }
        } else if let Some(authors) = &filter.authors {
            let mut events = Vec::new();
            for author in authors {
                let (matched, _) = self.storage.range_by_author(
                    author,
                    filter.since,
                    filter.until,
                    limit,
                    None,
                )?;
                events.extend(matched);
            }
            events
        } else if let Some(kinds) = &filter.kinds {
            let mut events = Vec::new();
            for kind in kinds {
                let (matched, _) =
                    self.storage
                        .range_by_kind(*kind, filter.since, filter.until, limit, None)?;
                events.extend(matched);
            }
            events
        } else {
            self.full_scan(filter.since, filter.until, limit)?
        };

        let mut matched: Vec<Event> = candidates
            .into_iter()
            .filter(|event| filter.matches(event))
            .collect();
        order_events(&mut matched);
        matched.truncate(limit);
        Ok(matched)
    }

    fn full_scan(&self, since: Option<i64>, until: Option<i64>, limit: usize) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for kind in fitrelay_core::event::ALLOWED_KINDS
            .iter()
            .copied()
            .chain(fitrelay_core::event::ALLOWED_KIND_RANGE)
        {
            let (matched, _) = self.storage.range_by_kind(kind, since, until, limit, None)?;
            events.extend(matched);
        }
        Ok(events)
    }

    /// Resolve every filter, then union-dedup-order-limit across the whole
    /// set. A single event matching several filters is returned once.
    pub fn resolve(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        let mut seen = HashSet::new();
        let mut combined = Vec::new();

        for filter in filters {
            for event in self.resolve_one(filter)? {
                if seen.insert(event.id.clone()) {
                    combined.push(event);
                }
            }
        }

        order_events(&mut combined);

        let overall_limit = filters
            .iter()
            .map(|f| f.effective_limit(self.implementation_max))
            .max()
            .unwrap_or(0);
        combined.truncate(overall_limit);
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use fitrelay_core::event::{sign_event, UnsignedEvent};
    use rand::rngs::OsRng;
    use tempfile::tempdir;

    fn make_event(kind: u32, created_at: i64, tags: Vec<Vec<String>>) -> Event {
        let key = SigningKey::generate(&mut OsRng);
        let unsigned = UnsignedEvent {
            pubkey: hex::encode(key.verifying_key().to_bytes()),
            created_at,
            kind,
            tags,
            content: String::new(),
        };
        sign_event(&unsigned, &key).unwrap()
    }

    #[test]
    fn resolves_by_kind_newest_first() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let older = make_event(33401, 1_700_000_000, vec![]);
        let newer = make_event(33401, 1_700_000_100, vec![]);
        storage.put_event(&older).unwrap();
        storage.put_event(&newer).unwrap();

        let engine = QueryEngine::new(&storage, 100);
        let filter = Filter {
            kinds: Some(vec![33401]),
            ..Filter::new()
        };
        let results = engine.resolve(&[filter]).unwrap();
        assert_eq!(results[0].id, newer.id);
        assert_eq!(results[1].id, older.id);
    }

    #[test]
    fn resolves_wire_deserialized_kinds_filter_without_tag_keys() {
        // A filter parsed off the wire (no `#x` key present) must still
        // take the `kinds` branch rather than the tag-index branch, since
        // its flattened `tags` map deserializes to an empty map, not `None`.
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let event = make_event(33401, 1_700_000_000, vec![]);
        storage.put_event(&event).unwrap();

        let engine = QueryEngine::new(&storage, 100);
        let filter: Filter = serde_json::from_str(r#"{"kinds":[33401]}"#).unwrap();
        let results = engine.resolve(&[filter]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, event.id);
    }

    #[test]
    fn resolves_wire_deserialized_authors_filter_without_tag_keys() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let event = make_event(33401, 1_700_000_000, vec![]);
        storage.put_event(&event).unwrap();

        let engine = QueryEngine::new(&storage, 100);
        let filter: Filter =
            serde_json::from_str(&format!(r#"{{"authors":["{}"]}}"#, event.pubkey)).unwrap();
        let results = engine.resolve(&[filter]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, event.id);
    }

    #[test]
    fn resolves_by_ids_directly() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let event = make_event(33401, 1_700_000_000, vec![]);
        storage.put_event(&event).unwrap();

        let engine = QueryEngine::new(&storage, 100);
        let filter = Filter {
            ids: Some(vec![event.id.clone()]),
            ..Filter::new()
        };
        let results = engine.resolve(&[filter]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, event.id);
    }

    #[test]
    fn union_across_filters_dedups_overlapping_matches() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let event = make_event(
            33401,
            1_700_000_000,
            vec![vec!["t".to_string(), "chest".to_string()]],
        );
        storage.put_event(&event).unwrap();

        let engine = QueryEngine::new(&storage, 100);
        let by_kind = Filter {
            kinds: Some(vec![33401]),
            ..Filter::new()
        };
        let by_id = Filter {
            ids: Some(vec![event.id.clone()]),
            ..Filter::new()
        };
        let results = engine.resolve(&[by_kind, by_id]).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn zero_limit_yields_no_results() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let event = make_event(33401, 1_700_000_000, vec![]);
        storage.put_event(&event).unwrap();

        let engine = QueryEngine::new(&storage, 100);
        let filter = Filter {
            kinds: Some(vec![33401]),
            limit: Some(0),
            ..Filter::new()
        };
        let results = engine.resolve(&[filter]).unwrap();
        assert!(results.is_empty());
    }
}
