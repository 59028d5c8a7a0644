//! Response-boundary detection for unframed interactive CLIs.
//!
//! The wrapped CLI has no message framing; the only evidence that a reply
//! is complete is what the CLI prints. All markers and thresholds here are
//! tied to the CLI version in use and therefore come from configuration.

use serde::{Deserialize, Serialize};

/// Markers and thresholds for [`BoundaryDetector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoundaryConfig {
    /// Idle prompt the CLI prints when waiting for input. Matches when the
    /// last line of output, trimmed, equals one of these.
    pub idle_prompt_markers: Vec<String>,
    /// Substrings that conventionally end a turn.
    pub end_sentinels: Vec<String>,
    /// Phrases that end a turn only once at least `min_length` bytes have
    /// been seen and the output rests at a line end.
    pub completion_markers: Vec<String>,
    pub min_length: usize,
    /// Quiet period after a substantive handshake reply, in milliseconds.
    pub handshake_settle_ms: u64,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            idle_prompt_markers: vec![">".to_string(), "❯".to_string()],
            end_sentinels: vec!["<<END_OF_TURN>>".to_string()],
            completion_markers: vec![
                "Task completed".to_string(),
                "All changes applied".to_string(),
            ],
            min_length: 200,
            handshake_settle_ms: 500,
        }
    }
}

/// Where a detected reply ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    /// Bytes before this offset belong to the reply; the rest is the
    /// marker or sentinel and is not forwarded.
    pub content_end: usize,
    pub signal: BoundarySignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundarySignal {
    IdlePrompt,
    Sentinel,
    LengthAndMarker,
}

/// Decides from accumulated output whether the current reply is complete.
#[derive(Debug, Clone, Default)]
pub struct BoundaryDetector {
    config: BoundaryConfig,
}

impl BoundaryDetector {
    pub fn new(config: BoundaryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BoundaryConfig {
        &self.config
    }

    /// Evaluate the whole buffer accumulated for one reply.
    pub fn detect(&self, buffer: &[u8]) -> Option<Boundary> {
        if let Some(boundary) = self.idle_prompt(buffer) {
            return Some(boundary);
        }

        if let Some(pos) = self
            .config
            .end_sentinels
            .iter()
            .filter(|s| !s.is_empty())
            .filter_map(|s| find_bytes(buffer, s.as_bytes()))
            .min()
        {
            return Some(Boundary {
                content_end: pos,
                signal: BoundarySignal::Sentinel,
            });
        }

        if buffer.len() >= self.config.min_length
            && buffer.ends_with(b"\n")
            && self
                .config
                .completion_markers
                .iter()
                .filter(|m| !m.is_empty())
                .any(|m| find_bytes(buffer, m.as_bytes()).is_some())
        {
            return Some(Boundary {
                content_end: buffer.len(),
                signal: BoundarySignal::LengthAndMarker,
            });
        }

        None
    }

    /// True once the buffer holds something other than whitespace and
    /// idle prompts.
    pub fn is_substantive(&self, buffer: &[u8]) -> bool {
        String::from_utf8_lossy(buffer).lines().any(|line| {
            let line = line.trim();
            !line.is_empty() && !self.is_idle_marker(line)
        })
    }

    fn idle_prompt(&self, buffer: &[u8]) -> Option<Boundary> {
        let trimmed_len = buffer
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map(|p| p + 1)?;
        let line_start = buffer[..trimmed_len]
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|p| p + 1)
            .unwrap_or(0);
        let last_line = String::from_utf8_lossy(&buffer[line_start..trimmed_len]);

        // A bare prompt at the very start is the tail of the previous turn,
        // not an answer.
        if line_start == 0 {
            return None;
        }

        if self.is_idle_marker(last_line.trim()) {
            return Some(Boundary {
                content_end: line_start,
                signal: BoundarySignal::IdlePrompt,
            });
        }
        None
    }

    fn is_idle_marker(&self, line: &str) -> bool {
        self.config
            .idle_prompt_markers
            .iter()
            .any(|m| !m.is_empty() && line == m.trim())
    }
}

pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> BoundaryDetector {
        BoundaryDetector::default()
    }

    #[test]
    fn test_idle_prompt_ends_reply() {
        let out = b"Here is the fix.\nDone.\n> ";
        let boundary = detector().detect(out).unwrap();
        assert_eq!(boundary.signal, BoundarySignal::IdlePrompt);
        assert_eq!(&out[..boundary.content_end], b"Here is the fix.\nDone.\n");
    }

    #[test]
    fn test_prompt_inside_text_does_not_end_reply() {
        assert!(detector().detect(b"use the > operator\nmore").is_none());
        assert!(detector().detect(b"> quoted line\nstill going").is_none());
    }

    #[test]
    fn test_leading_prompt_is_ignored() {
        assert!(detector().detect(b"> ").is_none());
        assert!(detector().detect(b"\n> ").is_some());
    }

    #[test]
    fn test_sentinel_ends_reply() {
        let out = b"line one\nline two <<END_OF_TURN>> trailing";
        let boundary = detector().detect(out).unwrap();
        assert_eq!(boundary.signal, BoundarySignal::Sentinel);
        assert_eq!(&out[..boundary.content_end], b"line one\nline two ");
    }

    #[test]
    fn test_completion_marker_needs_min_length() {
        let short = b"Task completed\n";
        assert!(detector().detect(short).is_none());

        let mut long = "x".repeat(250);
        long.push_str("\nTask completed\n");
        let boundary = detector().detect(long.as_bytes()).unwrap();
        assert_eq!(boundary.signal, BoundarySignal::LengthAndMarker);
        assert_eq!(boundary.content_end, long.len());

        // Not at a line end yet: the reader may be mid-line.
        long.push_str("partial");
        assert!(detector().detect(long.as_bytes()).is_none());
    }

    #[test]
    fn test_configured_markers() {
        let config = BoundaryConfig {
            idle_prompt_markers: vec!["claude>".to_string()],
            end_sentinels: vec![],
            completion_markers: vec![],
            min_length: 0,
            handshake_settle_ms: 0,
        };
        let detector = BoundaryDetector::new(config);
        assert!(detector.detect(b"answer\nclaude> ").is_some());
        assert!(detector.detect(b"answer\n> ").is_none());
    }

    #[test]
    fn test_substantive() {
        assert!(!detector().is_substantive(b"  \n> \n"));
        assert!(detector().is_substantive(b"ready\n> "));
    }
}
