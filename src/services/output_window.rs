//! Bounds the script output carried in a result.

use regex::Regex;
use std::sync::LazyLock;

use crate::domain::models::config::ExecutionConfig;

static FAILURE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error|exception|traceback|failed").expect("failure marker regex must compile")
});

/// Output shaping limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputWindow {
    /// Lines kept when output has no failure marker.
    pub max_lines: usize,
    /// Lines kept before the first failure marker.
    pub context_before: usize,
    /// Lines kept after it.
    pub context_after: usize,
}

impl Default for OutputWindow {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

impl From<&ExecutionConfig> for OutputWindow {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            max_lines: config.max_output_lines,
            context_before: config.failure_context_before,
            context_after: config.failure_context_after,
        }
    }
}

impl OutputWindow {
    /// Keep the part of `text` worth reporting.
    ///
    /// Successful output keeps its last `max_lines` lines. Failed output is
    /// centred on the first line that looks like an error, keeping
    /// `context_before` lines ahead of it and `context_after` lines from it
    /// on; without such a line it falls back to the tail.
    pub fn shape(&self, text: &str, success: bool) -> String {
        let lines: Vec<&str> = text.lines().collect();

        if !success {
            if let Some(marker) = lines.iter().position(|l| FAILURE_MARKER.is_match(l)) {
                let start = marker.saturating_sub(self.context_before);
                let end = marker.saturating_add(self.context_after.max(1)).min(lines.len());
                if start == 0 && end == lines.len() {
                    return text.to_string();
                }
                return lines[start..end].join("\n");
            }
        }

        self.tail(text, &lines)
    }

    fn tail(&self, text: &str, lines: &[&str]) -> String {
        if lines.len() <= self.max_lines {
            return text.to_string();
        }
        lines[lines.len() - self.max_lines..].join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> OutputWindow {
        OutputWindow {
            max_lines: 3,
            context_before: 1,
            context_after: 2,
        }
    }

    #[test]
    fn test_short_output_is_untouched() {
        assert_eq!(window().shape("a\nb\n", true), "a\nb\n");
    }

    #[test]
    fn test_success_keeps_tail() {
        assert_eq!(window().shape("1\n2\n3\n4\n5", true), "3\n4\n5");
    }

    #[test]
    fn test_failure_centres_on_first_marker() {
        let text = "setup\nstep one\nstep two\nTraceback (most recent call last):\n  File x\nValueError\nmore\nmore";
        assert_eq!(
            window().shape(text, false),
            "step two\nTraceback (most recent call last):\n  File x"
        );
    }

    #[test]
    fn test_failure_without_marker_keeps_tail() {
        assert_eq!(window().shape("a\nb\nc\nd", false), "b\nc\nd");
    }

    #[test]
    fn test_marker_matching_is_case_insensitive() {
        let text = "x\ny\nz\nInstall FAILED here\nw\nv\nu";
        assert!(window().shape(text, false).contains("Install FAILED here"));
    }
}
