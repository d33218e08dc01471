//! Reference-Event Synthesizer (C8): when a PRIVATE event is routed to a
//! satellite, mint a PUBLIC pointer event in its place so the rest of the
//! network can still discover that *something* was published, without
//! leaking the private content itself.

use fitrelay_core::event::{sign_event, UnsignedEvent};
use fitrelay_core::Event;
use fitrelay_net::KeyPair;

/// Tag names from the original event that are safe to echo onto the public
/// pointer — anything else stays inside the private payload.
const SAFE_ECHO_TAGS: &[&str] = &["d", "t", "subject"];

pub fn synthesize_reference(
    original: &Event,
    satellite_pubkey: &str,
    satellite_url: &str,
    identity: &KeyPair,
    now: i64,
) -> Result<Event, fitrelay_core::Error> {
    let mut tags = vec![
        vec!["e".to_string(), original.id.clone()],
        vec!["p".to_string(), original.pubkey.clone()],
        vec!["kind".to_string(), original.kind.to_string()],
        vec!["satellite".to_string(), satellite_pubkey.to_string()],
        vec!["url".to_string(), satellite_url.to_string()],
    ];

    for tag in &original.tags {
        if let Some(name) = tag.first() {
            if SAFE_ECHO_TAGS.contains(&name.as_str()) {
                tags.push(tag.clone());
            }
        }
    }

    let unsigned = UnsignedEvent {
        pubkey: identity.public_key_hex(),
        created_at: now,
        kind: original.kind,
        tags,
        content: String::new(),
    };

    sign_event(&unsigned, identity.signing_key())
}
