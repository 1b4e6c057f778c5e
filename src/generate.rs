//! Answer generation.
//!
//! A [`GenerationProvider`] turns a [`Prompt`] into answer text plus token
//! usage. [`generate_answer`] wraps a provider with the bounded retry
//! policy and maps exhaustion to [`RagError::Generation`].
//!
//! | Config Value | Provider |
//! |-------------|----------|
//! | `"openai"` | [`OpenAIChatProvider`] (any OpenAI-compatible chat endpoint) |
//! | `"extractive"` | [`ExtractiveProvider`] (offline) |
//! | `"disabled"` | [`DisabledGenerator`] |

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::chunk::{estimate_tokens, sentence_spans};
use crate::config::GenerationConfig;
use crate::error::{ProviderError, RagError};
use crate::http;
use crate::models::TokenUsage;
use crate::prompt::{Prompt, NOT_ENOUGH_INFORMATION};
use crate::rerank::terms;

/// Raw model output.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn model_name(&self) -> &str;
    /// Whether tokens are charged by a hosted service.
    fn billable(&self) -> bool {
        true
    }
    async fn complete(&self, prompt: &Prompt) -> Result<Generation, ProviderError>;
}

/// Retry budget for generation calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_ms),
        }
    }
}

/// Generate an answer, retrying transient provider failures.
///
/// Empty content is a non-retried failure.
pub async fn generate_answer(
    provider: &dyn GenerationProvider,
    prompt: &Prompt,
    policy: RetryPolicy,
) -> Result<Generation, RagError> {
    let result = http::with_retry(
        "generation",
        policy.max_retries,
        policy.base_delay,
        || async {
            let generation = provider.complete(prompt).await?;
            if generation.text.trim().is_empty() {
                return Err(ProviderError::fatal("empty_content"));
            }
            Ok::<_, ProviderError>(generation)
        },
    )
    .await;

    match result {
        Ok((generation, attempts)) => {
            tracing::debug!(
                model = provider.model_name(),
                attempts,
                prompt_tokens = generation.usage.prompt_tokens,
                completion_tokens = generation.usage.completion_tokens,
                "generation complete"
            );
            Ok(generation)
        }
        Err(exhausted) => {
            tracing::warn!(
                model = provider.model_name(),
                attempts = exhausted.attempts,
                code = exhausted.error.code(),
                "generation failed"
            );
            Err(RagError::Generation {
                attempts: exhausted.attempts,
                code: exhausted.error.code().to_string(),
            })
        }
    }
}

// ============ Disabled Provider ============

pub struct DisabledGenerator;

#[async_trait]
impl GenerationProvider for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn billable(&self) -> bool {
        false
    }
    async fn complete(&self, _prompt: &Prompt) -> Result<Generation, ProviderError> {
        Err(ProviderError::unavailable("generation_disabled"))
    }
}

// ============ Extractive Provider ============

/// Offline generator that quotes passages instead of writing prose.
///
/// From each of the first three passages it takes the sentence sharing the
/// most content words with the question and appends the passage's `[n]`
/// marker. Passages with no shared word are skipped; if none remain the
/// answer is [`NOT_ENOUGH_INFORMATION`].
pub struct ExtractiveProvider;

const EXTRACTIVE_MAX_PASSAGES: usize = 3;

#[async_trait]
impl GenerationProvider for ExtractiveProvider {
    fn model_name(&self) -> &str {
        "extractive"
    }
    fn billable(&self) -> bool {
        false
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Generation, ProviderError> {
        let question_terms = terms(&prompt.question);

        let mut parts = Vec::new();
        for passage in prompt.passages.iter().take(EXTRACTIVE_MAX_PASSAGES) {
            let best = sentence_spans(&passage.text)
                .into_iter()
                .map(|(s, e)| passage.text[s..e].trim())
                .filter(|s| !s.is_empty())
                .map(|s| {
                    let hits = terms(s).intersection(&question_terms).count();
                    (hits, s)
                })
                .fold(None, |best: Option<(usize, &str)>, (hits, s)| match best {
                    Some((h, _)) if h >= hits => best,
                    _ => Some((hits, s)),
                });
            if let Some((hits, sentence)) = best {
                if hits > 0 {
                    parts.push(format!("{} [{}]", sentence, passage.number));
                }
            }
        }

        let text = if parts.is_empty() {
            NOT_ENOUGH_INFORMATION.to_string()
        } else {
            parts.join(" ")
        };

        let prompt_tokens = (estimate_tokens(&prompt.system) + estimate_tokens(&prompt.user)) as u64;
        let completion_tokens = estimate_tokens(&text) as u64;
        Ok(Generation {
            text,
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
        })
    }
}

// ============ OpenAI-compatible Chat Provider ============

/// Chat completions over any OpenAI-compatible API (Groq by default).
pub struct OpenAIChatProvider {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAIChatProvider {
    pub fn new(config: &GenerationConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            model: config.model.clone(),
            url: format!("{}/chat/completions", config.url.trim_end_matches('/')),
            api_key: http::api_key(&config.api_key_env)?,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl GenerationProvider for OpenAIChatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Generation, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.system },
                { "role": "user", "content": prompt.user },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        let json =
            http::post_json(&self.client, "chat", &self.url, Some(&self.api_key), &body).await?;
        parse_chat_response(&json)
    }
}

fn parse_chat_response(json: &Value) -> Result<Generation, ProviderError> {
    let choice = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| ProviderError::fatal("bad_response"))?;
    let text = choice
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();

    let usage = json
        .get("usage")
        .map(|u| {
            let field = |name: &str| u.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
            let prompt_tokens = field("prompt_tokens");
            let completion_tokens = field("completion_tokens");
            let total = field("total_tokens");
            TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: if total > 0 {
                    total
                } else {
                    prompt_tokens + completion_tokens
                },
            }
        })
        .unwrap_or_default();

    Ok(Generation { text, usage })
}

/// Create the generator named in `[generation] provider`.
pub fn create_generator(
    config: &GenerationConfig,
) -> Result<Box<dyn GenerationProvider>, ProviderError> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledGenerator)),
        "extractive" => Ok(Box::new(ExtractiveProvider)),
        "openai" => Ok(Box::new(OpenAIChatProvider::new(config)?)),
        _ => Err(ProviderError::unavailable("unknown_provider")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::PromptPassage;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        error: ProviderError,
        text: &'static str,
    }

    #[async_trait]
    impl GenerationProvider for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }
        async fn complete(&self, _prompt: &Prompt) -> Result<Generation, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(Generation {
                    text: self.text.to_string(),
                    usage: TokenUsage::default(),
                })
            }
        }
    }

    fn prompt(question: &str, passages: &[&str]) -> Prompt {
        Prompt {
            system: "system".into(),
            user: "user".into(),
            question: question.into(),
            passages: passages
                .iter()
                .enumerate()
                .map(|(i, t)| PromptPassage {
                    number: i + 1,
                    title: "T".into(),
                    text: t.to_string(),
                })
                .collect(),
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let provider = Flaky {
            calls: AtomicU32::new(0),
            failures: 2,
            error: ProviderError::transient("http_503"),
            text: "The sky is blue [1].",
        };
        let generation = generate_answer(&provider, &prompt("q", &[]), policy(2))
            .await
            .unwrap();
        assert_eq!(generation.text, "The sky is blue [1].");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_capped() {
        let provider = Flaky {
            calls: AtomicU32::new(0),
            failures: 10,
            error: ProviderError::transient("http_429"),
            text: "",
        };
        let err = generate_answer(&provider, &prompt("q", &[]), policy(2))
            .await
            .unwrap_err();
        match err {
            RagError::Generation { attempts, code } => {
                assert_eq!(attempts, 3);
                assert_eq!(code, "http_429");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_content_is_not_retried() {
        let provider = Flaky {
            calls: AtomicU32::new(0),
            failures: 0,
            error: ProviderError::transient("unused"),
            text: "   ",
        };
        let err = generate_answer(&provider, &prompt("q", &[]), policy(5))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "generation_error");
        assert!(err.to_string().contains("empty_content"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_fails_once() {
        let err = generate_answer(&DisabledGenerator, &prompt("q", &[]), policy(3))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Generation { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_extractive_quotes_matching_sentence() {
        let p = prompt(
            "What color is the sky?",
            &["Water boils at 100°C. The sky is blue.", "Grass is green."],
        );
        let generation = ExtractiveProvider.complete(&p).await.unwrap();
        assert_eq!(generation.text, "The sky is blue. [1]");
        assert!(generation.usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn test_extractive_without_overlap_declines() {
        let p = prompt("Who won the championship?", &["The sky is blue."]);
        let generation = ExtractiveProvider.complete(&p).await.unwrap();
        assert_eq!(generation.text, NOT_ENOUGH_INFORMATION);
    }

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{ "message": { "content": "Blue [1]." } }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 8, "total_tokens": 128 }
        });
        let generation = parse_chat_response(&json).unwrap();
        assert_eq!(generation.text, "Blue [1].");
        assert_eq!(generation.usage.total_tokens, 128);

        assert!(parse_chat_response(&serde_json::json!({ "choices": [] })).is_err());
    }
}
