//! Self identity: the human-readable handle published to the signaling service.

use rand::seq::SliceRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "eager", "fuzzy", "gentle", "happy", "jolly", "kind", "lucky",
    "merry", "nimble", "proud", "quiet", "rapid", "shiny", "silly", "swift", "tidy", "witty",
];

const ANIMALS: &[&str] = &[
    "badger", "beaver", "bison", "crane", "eagle", "ferret", "gecko", "heron", "koala", "lemur",
    "lynx", "marten", "newt", "otter", "panda", "quail", "raven", "seal", "tapir", "walrus",
];

/// Restrict an id to `[a-z0-9-]`: lowercase, runs of other characters become one `-`,
/// no leading or trailing dash. May return an empty string.
pub fn sanitize_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Generate a fresh human-readable id like `swift-otter-42`.
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("otter");
    let n: u8 = rng.gen_range(10..100);
    format!("{adjective}-{animal}-{n}")
}
