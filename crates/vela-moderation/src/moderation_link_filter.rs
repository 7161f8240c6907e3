//! Pure link-detection predicate.
//!
//! Runs before any external call so non-violating messages cost zero API
//! traffic. A message carries a link when a structured entity marks a URL or
//! aliased-link span, or when the lowercased text/caption contains one of a
//! fixed set of link markers.

use vela_telegram::Message;

const LINK_MARKERS: [&str; 3] = ["http://", "https://", "t.me/"];

/// Stateless, side-effect-free link check over text, caption, and entities.
pub fn detect_link(message: &Message) -> bool {
    if message.all_entities().any(|entity| entity.kind.is_link()) {
        return true;
    }
    let text = match message.text_or_caption() {
        Some(text) => text.to_lowercase(),
        None => return false,
    };
    LINK_MARKERS.iter().any(|marker| text.contains(marker))
}
