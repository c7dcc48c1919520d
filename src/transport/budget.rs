//! Approximate context size budget.

use super::Payload;
use tracing::warn;

const TRUNCATION_SUFFIX: &str = "\n[truncated]";

/// Cheap size proxy: one unit per `chars_per_unit` bytes of text or attachment data.
///
/// Oversized payloads are truncated rather than rejected. Only the prompt is cut;
/// attachments are opaque and always sent whole.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBudget {
    pub max_units: usize,
    pub chars_per_unit: f64,
}

impl ContextBudget {
    pub fn new(max_units: usize) -> Self {
        Self {
            max_units,
            chars_per_unit: 4.0,
        }
    }

    pub fn with_chars_per_unit(mut self, ratio: f64) -> Self {
        self.chars_per_unit = ratio;
        self
    }

    pub fn estimate(&self, byte_len: usize) -> usize {
        (byte_len as f64 / self.chars_per_unit).ceil() as usize
    }

    pub fn payload_units(&self, payload: &Payload) -> usize {
        let attachments: usize = payload
            .attachments
            .iter()
            .map(|a| self.estimate(a.len()))
            .sum();
        self.estimate(payload.prompt.len()) + attachments
    }

    /// Returns the payload to send and whether the prompt was cut.
    pub fn fit(&self, payload: &Payload) -> (Payload, bool) {
        let total = self.payload_units(payload);
        if total <= self.max_units {
            return (payload.clone(), false);
        }

        let attachment_units = total - self.estimate(payload.prompt.len());
        let prompt_units = self
            .max_units
            .saturating_sub(attachment_units)
            .saturating_sub(self.estimate(TRUNCATION_SUFFIX.len()));
        let max_bytes = (prompt_units as f64 * self.chars_per_unit).floor() as usize;

        let prompt = &payload.prompt;
        let mut cut = max_bytes.min(prompt.len());
        while !prompt.is_char_boundary(cut) {
            cut -= 1;
        }

        warn!(
            request_id = payload.request_id.as_str(),
            estimated_units = total,
            max_units = self.max_units,
            kept_bytes = cut,
            original_bytes = prompt.len(),
            "payload exceeds context budget, truncating prompt"
        );

        let mut fitted = payload.clone();
        fitted.prompt = format!("{}{}", &prompt[..cut], TRUNCATION_SUFFIX);
        (fitted, true)
    }
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self::new(100_000)
    }
}
