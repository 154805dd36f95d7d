use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use tiller_core::{
    InferenceTier, Result, Tier, TierConstraints, TierResponse, TillerError, TokenUsage,
};

/// A scripted outcome for one [`MockTier`] call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Succeed with this text; optionally self-report a confidence value
    /// in the response metadata.
    Reply {
        text: String,
        confidence: Option<f64>,
        usage: TokenUsage,
    },
    /// Fail the call outright.
    Fail(String),
    /// Never return, so the caller's timeout fires.
    Hang,
}

impl MockOutcome {
    pub fn reply(text: &str) -> Self {
        MockOutcome::Reply {
            text: text.into(),
            confidence: None,
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 200,
            },
        }
    }

    pub fn confident(text: &str, confidence: f64) -> Self {
        MockOutcome::Reply {
            text: text.into(),
            confidence: Some(confidence),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 200,
            },
        }
    }

    pub fn with_usage(text: &str, confidence: f64, input: u32, output: u32) -> Self {
        MockOutcome::Reply {
            text: text.into(),
            confidence: Some(confidence),
            usage: TokenUsage {
                input_tokens: input,
                output_tokens: output,
            },
        }
    }
}

/// In-process inference backend with a scripted outcome queue, for tests
/// and the offline demo path. Outcomes are consumed in order; when the
/// script runs dry the tier fails, which keeps accidental extra calls
/// visible in tests.
pub struct MockTier {
    name: String,
    tier: Tier,
    script: Mutex<VecDeque<MockOutcome>>,
    calls: AtomicUsize,
}

impl MockTier {
    pub fn new(name: &str, tier: Tier) -> Self {
        Self {
            name: name.into(),
            tier,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, outcome: MockOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn scripted(name: &str, tier: Tier, outcomes: Vec<MockOutcome>) -> Self {
        let mock = Self::new(name, tier);
        mock.script.lock().extend(outcomes);
        mock
    }

    /// How many times `generate` has been invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceTier for MockTier {
    fn name(&self) -> &str {
        &self.name
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    async fn generate(&self, _prompt: &str, _constraints: &TierConstraints) -> Result<TierResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().pop_front();
        match outcome {
            Some(MockOutcome::Reply {
                text,
                confidence,
                usage,
            }) => {
                let mut metadata = serde_json::Map::new();
                if let Some(c) = confidence {
                    metadata.insert("confidence".into(), serde_json::json!(c));
                }
                metadata.insert("finish_reason".into(), serde_json::json!("stop"));
                Ok(TierResponse {
                    text,
                    usage,
                    metadata,
                })
            }
            Some(MockOutcome::Fail(reason)) => Err(TillerError::TierCall {
                tier: self.tier.as_str().to_string(),
                reason,
            }),
            // Hung calls rely on the caller's timeout to cancel them.
            Some(MockOutcome::Hang) => std::future::pending().await,
            None => Err(TillerError::TierCall {
                tier: self.tier.as_str().to_string(),
                reason: format!("mock '{}' script exhausted", self.name),
            }),
        }
    }
}
