use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, trace, warn};
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::conversation::{Message, Role, SamplingParams};

/// Reply and usage for one relayed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub message: Message,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Clone)]
pub struct CompletionClient {
    inner: ClientMode,
}

#[derive(Clone)]
enum ClientMode {
    Remote(RemoteClient),
    Offline,
}

#[derive(Clone)]
struct RemoteClient {
    http: Client,
    api_url: String,
}

impl CompletionClient {
    pub fn new(config: &AppConfig) -> Result<Self> {
        info!("Creating CompletionClient");
        if config.offline_mode {
            warn!("Running in offline mode - completions will be mocked");
            return Ok(Self::offline());
        }

        trace!("Building HTTP client with API key");
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", config.api_key))
                .context("invalid API key header")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        info!("CompletionClient created: api_url={}", config.api_url);
        Ok(Self {
            inner: ClientMode::Remote(RemoteClient {
                http,
                api_url: config.api_url.clone(),
            }),
        })
    }

    pub fn offline() -> Self {
        Self {
            inner: ClientMode::Offline,
        }
    }

    /// Sends `messages` to `model` and returns the first choice. Failures are
    /// not retried.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        sampling: &SamplingParams,
    ) -> Result<Completion> {
        info!(
            "Requesting completion from {} ({} messages)",
            model,
            messages.len()
        );
        match &self.inner {
            ClientMode::Remote(remote) => remote.complete(model, messages, sampling).await,
            ClientMode::Offline => {
                warn!("Using offline mock completion");
                Ok(mock_completion(messages))
            }
        }
    }
}

impl RemoteClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        sampling: &SamplingParams,
    ) -> Result<Completion> {
        let request = ChatRequest {
            model,
            messages,
            n: 1,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            frequency_penalty: sampling.freq_penalty,
            presence_penalty: sampling.pres_penalty,
        };
        debug!(
            "Sampling: temperature={}, top_p={}, frequency_penalty={}, presence_penalty={}",
            request.temperature, request.top_p, request.frequency_penalty, request.presence_penalty
        );

        info!("Sending POST request to {}", self.api_url);
        let resp = self
            .http
            .post(&self.api_url)
            .json(&request)
            .send()
            .await
            .context("failed sending completion request")?;

        let status = resp.status();
        info!("Received response: status={}", status.as_u16());

        let raw_body = resp
            .text()
            .await
            .context("failed to read completion response body")?;
        debug!("Response body length: {} bytes", raw_body.len());

        if !status.is_success() {
            let snippet: String = raw_body.chars().take(500).collect();
            error!("Error response snippet: {}", snippet);
            return Err(anyhow!("completion API {}: {}", status.as_u16(), snippet));
        }

        trace!("Parsing JSON response");
        let body: ChatResponse =
            serde_json::from_str(&raw_body).context("failed to decode completion response body")?;

        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("completion response contained no choices"))?;
        let content = choice.message.content.unwrap_or_default().trim().to_string();
        let usage = body.usage.unwrap_or_default();

        info!(
            "Completion received ({} chars, {} prompt / {} completion tokens)",
            content.len(),
            usage.prompt_tokens,
            usage.completion_tokens
        );
        Ok(Completion {
            message: Message::assistant(content),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

fn mock_completion(messages: &[Message]) -> Completion {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.chars().take(100).collect::<String>())
        .unwrap_or_default();
    Completion {
        message: Message::assistant(format!("Offline mock reply to: {last_user}")),
        prompt_tokens: 0,
        completion_tokens: 0,
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    n: u32,
    temperature: f64,
    top_p: f64,
    frequency_penalty: f64,
    presence_penalty: f64,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote(server: &MockServer) -> CompletionClient {
        let config = AppConfig {
            api_key: "sk-test".into(),
            api_url: format!("{}/v1/chat/completions", server.uri()),
            ..AppConfig::default()
        };
        CompletionClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn forwards_decimal_sampling_params_and_reads_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4",
                "n": 1,
                "temperature": 0.7,
                "top_p": 0.9,
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "  hello there \n"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let sampling = SamplingParams {
            temperature: 0.7,
            top_p: 0.9,
            ..SamplingParams::default()
        };
        let completion = remote(&server)
            .complete("gpt-4", &[Message::user("hi")], &sampling)
            .await
            .unwrap();

        assert_eq!(completion.message, Message::assistant("hello there"));
        assert_eq!(completion.prompt_tokens, 12);
        assert_eq!(completion.completion_tokens, 3);
    }

    #[tokio::test]
    async fn error_status_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .expect(1)
            .mount(&server)
            .await;

        let err = remote(&server)
            .complete("gpt-4", &[Message::user("hi")], &SamplingParams::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": []
            })))
            .mount(&server)
            .await;

        let result = remote(&server)
            .complete("gpt-4", &[Message::user("hi")], &SamplingParams::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn offline_mode_echoes_last_user_message() {
        let completion = CompletionClient::offline()
            .complete(
                "gpt-4",
                &[Message::system("sys"), Message::user("ping")],
                &SamplingParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(completion.message.role, Role::Assistant);
        assert!(completion.message.content.contains("ping"));
    }
}
