//! Scalar score extraction from judge output text

use regex::Regex;
use tracing::warn;

/// Which judge produced the text being parsed.
///
/// The two variants parse almost identically but fail differently: a local
/// judge falls back to partial credit on unparseable output, while the remote
/// judge treats it as a failed evaluation and scores zero. Bare integer
/// answers ("1") are accepted only from the local judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JudgeKind {
    Local,
    Remote,
}

impl JudgeKind {
    /// Score returned when no numeric answer can be found in the text
    pub fn parse_failure_score(&self) -> f32 {
        match self {
            JudgeKind::Local => 0.5,
            JudgeKind::Remote => 0.0,
        }
    }
}

/// Parses judge responses into a score in `[0, 1]`.
///
/// Match order: the last `\boxed{...}` literal, then the last standalone
/// decimal of the form `0.x` or `1.0`, then (local judge only) the last bare
/// `0` or `1`. Parsed values are clamped to `[0, 1]`; text with no usable
/// match yields the kind's parse-failure score.
#[derive(Debug)]
pub struct ScoreExtractor {
    boxed: Regex,
    decimal: Regex,
    bare_int: Regex,
}

impl Default for ScoreExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScoreExtractor {
    pub fn new() -> Self {
        Self {
            boxed: Regex::new(r"\\boxed\{([^}]+)\}").unwrap(),
            decimal: Regex::new(r"\b(0\.\d+|1\.0)\b").unwrap(),
            bare_int: Regex::new(r"\b(0|1)\b").unwrap(),
        }
    }

    /// Extract a score from `text`, falling back to the kind's default.
    pub fn extract(&self, text: &str, kind: JudgeKind) -> f32 {
        match self.parse(text, kind) {
            Some(score) => score.clamp(0.0, 1.0),
            None => {
                warn!(
                    kind = ?kind,
                    text_len = text.len(),
                    "no score found in judge response, using parse-failure default"
                );
                kind.parse_failure_score()
            }
        }
    }

    fn parse(&self, text: &str, kind: JudgeKind) -> Option<f32> {
        if let Some(value) = self.last_capture(&self.boxed, text) {
            return Some(value);
        }
        if let Some(value) = self.last_capture(&self.decimal, text) {
            return Some(value);
        }
        if kind == JudgeKind::Local {
            if let Some(value) = self.last_capture(&self.bare_int, text) {
                return Some(value);
            }
        }
        None
    }

    fn last_capture(&self, pattern: &Regex, text: &str) -> Option<f32> {
        pattern
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .filter_map(|m| m.as_str().trim().parse::<f32>().ok())
            .last()
    }
}
