//! Pattern helpers for prompt and progress-marker detection.

use regex::bytes::Regex;

/// Compile a prompt pattern string into a multi-line regex.
///
/// Handles common prompt pattern conveniences:
/// - Enables multi-line mode so `^`/`$` match at line boundaries
/// - Anchors to end of line by default if no anchor specified
pub fn compile_prompt_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let pattern = if pattern.ends_with('$') {
        pattern.to_string()
    } else {
        format!("{}\\s?$", pattern)
    };

    if pattern.starts_with("(?") {
        Regex::new(&pattern)
    } else {
        Regex::new(&format!("(?m){}", pattern))
    }
}

/// An ordered set of labelled patterns used to classify device output.
///
/// Reading stops at the earliest match of *any* pattern (see
/// [`combined`](Self::combined)); the text read is then classified by
/// label priority, so a failure marker wins over a success marker that
/// appears in the same chunk.
#[derive(Debug, Clone)]
pub struct MarkerSet<T> {
    markers: Vec<(T, Regex)>,
    combined: Regex,
}

impl<T: Copy> MarkerSet<T> {
    /// Build a marker set. Earlier entries have higher priority.
    pub fn new(markers: &[(T, &str)]) -> Result<Self, regex::Error> {
        let compiled = markers
            .iter()
            .map(|(label, pattern)| Ok((*label, Regex::new(pattern)?)))
            .collect::<Result<Vec<_>, regex::Error>>()?;

        let combined = markers
            .iter()
            .map(|(_, pattern)| format!("(?:{})", pattern))
            .collect::<Vec<_>>()
            .join("|");

        Ok(Self {
            markers: compiled,
            combined: Regex::new(&combined)?,
        })
    }

    /// Regex matching any marker in the set.
    pub fn combined(&self) -> &Regex {
        &self.combined
    }

    /// Return the highest-priority label whose pattern occurs in `text`.
    pub fn classify(&self, text: &str) -> Option<T> {
        self.markers
            .iter()
            .find(|(_, pattern)| pattern.is_match(text.as_bytes()))
            .map(|(label, _)| *label)
    }
}
