use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosestMatch {
    pub name: String,
    pub similarity: f64,
}

/// Best "did you mean" candidate for a misspelled metric or backend name.
pub fn closest_name<'a>(needle: &str, hay: impl Iterator<Item = &'a String>) -> Option<ClosestMatch> {
    const THRESHOLD: f64 = 0.55;

    let mut best: Option<ClosestMatch> = None;
    for candidate in hay {
        let sim = strsim::normalized_levenshtein(needle, candidate);
        if sim >= THRESHOLD && best.as_ref().map_or(true, |b| sim > b.similarity) {
            best = Some(ClosestMatch {
                name: candidate.clone(),
                similarity: sim,
            });
        }
    }
    best
}

/// Appends a suggestion to `message` when one is close enough.
pub fn with_suggestion<'a>(message: String, needle: &str, hay: impl Iterator<Item = &'a String>) -> String {
    match closest_name(needle, hay) {
        Some(hit) => format!("{} (did you mean '{}'?)", message, hit.name),
        None => message,
    }
}
