//! Privacy classification: maps an event's (kind, tags) to a PrivacyLevel.

use serde::{Deserialize, Serialize};

use crate::event::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrivacyLevel {
    Public,
    Limited,
    Private,
}

impl PrivacyLevel {
    fn from_tag_value(value: &str) -> Option<Self> {
        match value {
            "public" => Some(PrivacyLevel::Public),
            "limited" | "friends" => Some(PrivacyLevel::Limited),
            "private" => Some(PrivacyLevel::Private),
            _ => None,
        }
    }
}

/// Kind-based default, applied when no explicit `privacy`/`privacy_level`
/// tag is present or recognized.
fn default_for_kind(kind: u32) -> PrivacyLevel {
    match kind {
        33401 | 33402 => PrivacyLevel::Public,
        1301 => PrivacyLevel::Limited,
        32040..=32048 => PrivacyLevel::Public,
        32030..=32039 => PrivacyLevel::Limited,
        32018..=32029 => PrivacyLevel::Private,
        _ => PrivacyLevel::Public,
    }
}

/// Classify an event. Scans tags once, in order; the first recognized
/// `privacy` or `privacy_level` tag wins over any later conflicting tag.
pub fn classify(event: &Event) -> PrivacyLevel {
    let explicit = event.tags.iter().find_map(|tag| {
        let name = tag.first()?.as_str();
        if name != "privacy" && name != "privacy_level" {
            return None;
        }
        tag.get(1).and_then(|v| PrivacyLevel::from_tag_value(v))
    });

    explicit.unwrap_or_else(|| default_for_kind(event.kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{sign_event, UnsignedEvent};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn event_with_tags(kind: u32, tags: Vec<Vec<String>>) -> Event {
        let key = SigningKey::generate(&mut OsRng);
        let unsigned = UnsignedEvent {
            pubkey: hex::encode(key.verifying_key().to_bytes()),
            created_at: 1_700_000_000,
            kind,
            tags,
            content: String::new(),
        };
        sign_event(&unsigned, &key).unwrap()
    }

    #[test]
    fn explicit_privacy_tag_wins() {
        let event = event_with_tags(33401, vec![vec!["privacy".into(), "private".into()]]);
        assert_eq!(classify(&event), PrivacyLevel::Private);
    }

    #[test]
    fn legacy_alias_is_recognized() {
        let event = event_with_tags(33401, vec![vec!["privacy_level".into(), "limited".into()]]);
        assert_eq!(classify(&event), PrivacyLevel::Limited);
    }

    #[test]
    fn first_conflicting_tag_wins() {
        let event = event_with_tags(
            33401,
            vec![
                vec!["privacy".into(), "private".into()],
                vec!["privacy".into(), "public".into()],
            ],
        );
        assert_eq!(classify(&event), PrivacyLevel::Private);
    }

    #[test]
    fn falls_back_to_kind_default() {
        let event = event_with_tags(1301, vec![]);
        assert_eq!(classify(&event), PrivacyLevel::Limited);

        let event = event_with_tags(32020, vec![]);
        assert_eq!(classify(&event), PrivacyLevel::Private);

        let event = event_with_tags(32045, vec![]);
        assert_eq!(classify(&event), PrivacyLevel::Public);
    }

    #[test]
    fn unrecognized_tag_value_falls_through_to_default() {
        let event = event_with_tags(1301, vec![vec!["privacy".into(), "nonsense".into()]]);
        assert_eq!(classify(&event), PrivacyLevel::Limited);
    }
}
