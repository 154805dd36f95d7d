use tiller_config::ConfidenceWeights;
use tiller_core::{RoutingRequest, TierResponse};

/// Phrases that signal the model hedging or refusing. Heuristic, not an
/// oracle — a hedged-but-correct answer still escalates, which is the
/// cheap failure mode.
const HEDGE_PHRASES: &[&str] = &[
    "i'm not sure",
    "i am not sure",
    "i don't know",
    "i do not know",
    "i cannot",
    "i can't",
    "as an ai",
    "it's unclear",
    "it is unclear",
    "i'm unable",
    "i am unable",
    "might be",
    "possibly",
    "i think",
    "i believe",
    "not certain",
];

/// Composite confidence scorer.
///
/// Combines completeness, linguistic certainty, tool-usage effectiveness,
/// generic quality heuristics, and backend metadata into one [0,1] score.
/// Weights come from config; the defaults are tunable, not a contract.
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    weights: ConfidenceWeights,
}

impl ConfidenceScorer {
    pub fn new(weights: ConfidenceWeights) -> Self {
        Self { weights }
    }

    /// Score a tier response. Empty output is always 0 — an errored or
    /// timed-out tier is scored through here with an empty response.
    pub fn score(&self, response: &TierResponse, request: &RoutingRequest) -> f64 {
        let text = response.text.trim();
        if text.is_empty() {
            return 0.0;
        }

        let w = &self.weights;
        let weighted = w.completeness * self.completeness(text, request)
            + w.certainty * self.certainty(text)
            + w.tool_effectiveness * self.tool_effectiveness(response)
            + w.quality * self.quality(text)
            + w.metadata * self.metadata_signal(response);

        // Rescale in case configured weights don't sum to 1
        let sum = w.sum();
        if sum > 0.0 {
            (weighted / sum).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Did the answer actually finish, and is it sized for the ask?
    fn completeness(&self, text: &str, request: &RoutingRequest) -> f64 {
        let mut score: f64 = 1.0;

        // Truncated mid-sentence reads as incomplete
        let last = text.chars().last().unwrap_or(' ');
        if !matches!(last, '.' | '!' | '?' | ')' | '`' | '"' | '\'' | ':' ) {
            score -= 0.3;
        }

        // Verbosity 1 wants a sentence; verbosity 5 wants substance
        let words = text.split_whitespace().count();
        let expected_min = match request.verbosity {
            0 | 1 => 1,
            2 => 5,
            3 => 15,
            4 => 40,
            _ => 80,
        };
        if words < expected_min {
            score -= 0.4;
        }

        score.max(0.0)
    }

    /// Penalize hedging and refusal language.
    fn certainty(&self, text: &str) -> f64 {
        let lower = text.to_lowercase();
        let hedges = HEDGE_PHRASES.iter().filter(|p| lower.contains(**p)).count();
        match hedges {
            0 => 1.0,
            1 => 0.6,
            2 => 0.35,
            _ => 0.1,
        }
    }

    /// If the backend reported tool calls, how many succeeded. Neutral
    /// when no tools were involved.
    fn tool_effectiveness(&self, response: &TierResponse) -> f64 {
        let attempted = response
            .metadata
            .get("tool_calls_attempted")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        if attempted == 0 {
            return 0.75;
        }
        let succeeded = response
            .metadata
            .get("tool_calls_succeeded")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        succeeded as f64 / attempted as f64
    }

    /// Generic junk detection: repetition loops, non-text noise.
    fn quality(&self, text: &str) -> f64 {
        let words: Vec<&str> = text.split_whitespace().collect();
        if words.is_empty() {
            return 0.0;
        }

        let mut score: f64 = 1.0;

        // Degenerate repetition (the classic local-model failure loop)
        let unique: std::collections::HashSet<&str> = words.iter().copied().collect();
        let unique_ratio = unique.len() as f64 / words.len() as f64;
        if words.len() > 20 && unique_ratio < 0.3 {
            score -= 0.6;
        }

        // Mostly non-alphanumeric output is noise
        let alnum = text.chars().filter(|c| c.is_alphanumeric() || c.is_whitespace()).count();
        if (alnum as f64 / text.chars().count() as f64) < 0.6 {
            score -= 0.4;
        }

        score.max(0.0)
    }

    /// Backend-reported signals: self-confidence and finish reason.
    fn metadata_signal(&self, response: &TierResponse) -> f64 {
        if let Some(c) = response.metadata.get("confidence").and_then(|v| v.as_f64()) {
            return c.clamp(0.0, 1.0);
        }
        match response.metadata.get("finish_reason").and_then(|v| v.as_str()) {
            Some("stop") | Some("end_turn") => 0.8,
            Some("length") => 0.3,
            _ => 0.6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiller_core::{RoutingRequest, TokenUsage};
    use uuid::Uuid;

    fn request() -> RoutingRequest {
        RoutingRequest::new(Uuid::new_v4(), "test prompt")
    }

    fn response(text: &str) -> TierResponse {
        TierResponse {
            text: text.into(),
            usage: TokenUsage::default(),
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_empty_scores_zero() {
        let scorer = ConfidenceScorer::new(ConfidenceWeights::default());
        assert_eq!(scorer.score(&response(""), &request()), 0.0);
        assert_eq!(scorer.score(&response("   "), &request()), 0.0);
    }

    #[test]
    fn test_solid_answer_scores_high() {
        let scorer = ConfidenceScorer::new(ConfidenceWeights::default());
        let r = response(
            "PLA typically melts between 170 and 180 degrees Celsius. For printing, \
             a nozzle temperature of 190 to 220 degrees works well depending on the blend.",
        );
        assert!(scorer.score(&r, &request()) > 0.8);
    }

    #[test]
    fn test_hedging_drops_score() {
        let scorer = ConfidenceScorer::new(ConfidenceWeights::default());
        let confident = response("The answer is 42. This is well established in the documentation.");
        let hedged = response("I'm not sure, but I think it might be 42. I don't know for certain.");
        assert!(scorer.score(&hedged, &request()) < scorer.score(&confident, &request()));
    }

    #[test]
    fn test_repetition_loop_penalized() {
        let scorer = ConfidenceScorer::new(ConfidenceWeights::default());
        let looped = response(&"the door the door the door ".repeat(20));
        let normal = response(
            "The garage door is currently closed. It was last opened yesterday at 6pm \
             and the sensor reports no obstruction.",
        );
        assert!(scorer.score(&looped, &request()) < scorer.score(&normal, &request()));
    }

    #[test]
    fn test_backend_confidence_respected() {
        let scorer = ConfidenceScorer::new(ConfidenceWeights::default());
        let mut low = response("A complete and well formed answer about the printer status.");
        low.metadata
            .insert("confidence".into(), serde_json::json!(0.1));
        let mut high = low.clone();
        high.metadata
            .insert("confidence".into(), serde_json::json!(0.95));
        assert!(scorer.score(&high, &request()) > scorer.score(&low, &request()));
    }
}
