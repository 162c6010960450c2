//! Answer engine backed by an OpenAI-compatible chat-completions endpoint.
//!
//! Each request carries a system message (the role prompt plus the passages
//! retrieved for the question), the engine's memory, and the question.
//! Streaming responses arrive as server-sent events whose `data:` payloads
//! hold `choices[0].delta.content`, terminated by `data: [DONE]`.

use crate::error::EngineError;
use crate::knowledge::KnowledgeIndex;
use crate::memory::{remember_on_completion, ConversationMemory};
use crate::{AnswerEngine, EngineBinder, FragmentStream, DEFAULT_ROLE_PROMPT};
use async_trait::async_trait;
use converse_types::{Role, Turn};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

fn default_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}

fn default_model() -> String {
    "qwen-plus".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_retrieval_k() -> usize {
    3
}

/// Connection settings for the chat-completions endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Upper bound on one request, including the whole streamed body.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Number of knowledge passages added to the system message.
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            retrieval_k: default_retrieval_k(),
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .field("retrieval_k", &self.retrieval_k)
            .finish()
    }
}

/// Binds [`ChatCompletionsEngine`]s that share one HTTP client.
#[derive(Debug, Clone)]
pub struct ChatCompletionsBinder {
    client: reqwest::Client,
    config: Arc<LlmConfig>,
}

impl ChatCompletionsBinder {
    pub fn new(config: LlmConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Binding(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl EngineBinder for ChatCompletionsBinder {
    async fn bind(
        &self,
        role_prompt: &str,
        knowledge: Arc<KnowledgeIndex>,
        prior_turns: &[Turn],
    ) -> Result<Arc<dyn AnswerEngine>, EngineError> {
        if self.config.model.trim().is_empty() {
            return Err(EngineError::Binding("no model configured".to_string()));
        }
        let role_prompt = match role_prompt.trim() {
            "" => DEFAULT_ROLE_PROMPT.to_string(),
            prompt => prompt.to_string(),
        };
        Ok(Arc::new(ChatCompletionsEngine {
            client: self.client.clone(),
            config: Arc::clone(&self.config),
            role_prompt,
            knowledge,
            memory: ConversationMemory::seeded(prior_turns),
        }))
    }
}

/// Stateful engine for one conversation.
pub struct ChatCompletionsEngine {
    client: reqwest::Client,
    config: Arc<LlmConfig>,
    role_prompt: String,
    knowledge: Arc<KnowledgeIndex>,
    memory: ConversationMemory,
}

#[derive(Debug, Serialize, PartialEq)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChoiceMessage>,
    #[serde(default)]
    delta: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionsEngine {
    fn system_prompt(&self, question: &str) -> String {
        let passages = self.knowledge.search(question, self.config.retrieval_k);
        if passages.is_empty() {
            return self.role_prompt.clone();
        }
        let mut prompt = format!("{}\n\n以下是可供参考的资料：", self.role_prompt);
        for passage in passages {
            prompt.push_str("\n---\n");
            prompt.push_str(&passage.text);
        }
        prompt
    }

    fn build_messages(&self, question: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: self.system_prompt(question),
        }];
        messages.extend(self.memory.snapshot().into_iter().map(|m| ChatMessage {
            role: match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content,
        }));
        messages.push(ChatMessage {
            role: "user",
            content: question.to_string(),
        });
        messages
    }

    async fn send(&self, question: &str, stream: bool) -> Result<reqwest::Response, EngineError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.config.model,
            messages: self.build_messages(question),
            temperature: self.config.temperature,
            stream,
        };

        let mut request = self.client.post(&url).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }
        let response = request.send().await.map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EngineError::Answer(format!(
                "completion endpoint returned {}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }
        Ok(response)
    }

    fn request_error(&self, e: reqwest::Error) -> EngineError {
        if e.is_timeout() {
            EngineError::Timeout(self.config.timeout_secs)
        } else {
            EngineError::Answer(e.to_string())
        }
    }
}

#[async_trait]
impl AnswerEngine for ChatCompletionsEngine {
    async fn answer(&self, question: &str) -> Result<String, EngineError> {
        let response = self.send(question, false).await?;
        let parsed: ChatResponse = response.json().await.map_err(|e| self.request_error(e))?;
        let answer = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| EngineError::Answer("completion contained no message".to_string()))?;
        self.memory.record_exchange(question, &answer);
        Ok(answer)
    }

    async fn answer_streaming(&self, question: &str) -> Result<FragmentStream, EngineError> {
        let response = self.send(question, true).await?;
        let timeout_secs = self.config.timeout_secs;
        let body = response
            .bytes_stream()
            .map(move |chunk| {
                chunk.map(|bytes| bytes.to_vec()).map_err(|e| {
                    if e.is_timeout() {
                        EngineError::Timeout(timeout_secs)
                    } else {
                        EngineError::Answer(e.to_string())
                    }
                })
            })
            .boxed();
        Ok(remember_on_completion(
            sse_fragments(body),
            self.memory.clone(),
            question,
        ))
    }

    fn memory_len(&self) -> usize {
        self.memory.len()
    }
}

/// Incremental splitter for `data:` lines of an event stream. Bytes are
/// buffered until a full line is available so multi-byte characters split
/// across network chunks decode correctly.
#[derive(Debug, Default)]
struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches(['\r', '\n']);
    line.strip_prefix("data:").map(|p| p.trim_start().to_string())
}

/// Extracts the delta text of one streamed completion payload.
fn delta_content(payload: &str) -> Result<Option<String>, EngineError> {
    let parsed: ChatResponse = serde_json::from_str(payload)
        .map_err(|e| EngineError::Answer(format!("malformed stream payload: {}", e)))?;
    Ok(parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|text| !text.is_empty()))
}

struct SseState {
    body: BoxStream<'static, Result<Vec<u8>, EngineError>>,
    decoder: SseLineDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

impl SseState {
    /// Queues the text of each payload. Returns an error for a malformed
    /// payload and marks the stream finished at `[DONE]`.
    fn accept(&mut self, payloads: Vec<String>) -> Result<(), EngineError> {
        for payload in payloads {
            if payload == "[DONE]" {
                self.finished = true;
                return Ok(());
            }
            if let Some(text) = delta_content(&payload)? {
                self.pending.push_back(text);
            }
        }
        Ok(())
    }
}

fn sse_fragments(body: BoxStream<'static, Result<Vec<u8>, EngineError>>) -> FragmentStream {
    let state = SseState {
        body,
        decoder: SseLineDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(fragment) = state.pending.pop_front() {
                return Some((Ok(fragment), state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let payloads = state.decoder.push(&bytes);
                    if let Err(e) = state.accept(payloads) {
                        state.finished = true;
                        state.pending.clear();
                        return Some((Err(e), state));
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.pending.clear();
                    return Some((Err(e), state));
                }
                None => {
                    let rest = state.decoder.finish().into_iter().collect();
                    state.finished = true;
                    if let Err(e) = state.accept(rest) {
                        return Some((Err(e), state));
                    }
                }
            }
        }
    })
    .boxed()
}
