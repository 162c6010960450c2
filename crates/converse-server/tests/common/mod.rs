#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use converse_chat::{ChatService, ChatSettings, Collaborators};
use converse_engine::memory::remember_on_completion;
use converse_engine::{
    AnswerEngine, ConversationMemory, EngineBinder, EngineError, FragmentStream, KnowledgeIndex,
};
use converse_server::{app, AppState};
use converse_store::MemoryStore;
use converse_types::{Turn, VoiceOptions};
use converse_voice::{SpeechSynthesizer, Transcriber, VoiceError};
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

pub const STREAM_FRAGMENTS: &[&str] = &["床前", "明月光，", "疑是地上霜。", "举头望明月"];

struct EchoEngine {
    memory: ConversationMemory,
}

#[async_trait]
impl AnswerEngine for EchoEngine {
    async fn answer(&self, question: &str) -> Result<String, EngineError> {
        if question.contains("fail") {
            return Err(EngineError::Answer("scripted failure".into()));
        }
        let answer = format!("回答：{}", question);
        self.memory.record_exchange(question, &answer);
        Ok(answer)
    }

    async fn answer_streaming(&self, question: &str) -> Result<FragmentStream, EngineError> {
        let items: Vec<Result<String, EngineError>> = if question.contains("fail") {
            vec![Err(EngineError::Answer("scripted failure".into()))]
        } else {
            STREAM_FRAGMENTS.iter().map(|f| Ok(f.to_string())).collect()
        };
        Ok(remember_on_completion(
            stream::iter(items).boxed(),
            self.memory.clone(),
            question,
        ))
    }

    fn memory_len(&self) -> usize {
        self.memory.len()
    }
}

struct EchoBinder;

#[async_trait]
impl EngineBinder for EchoBinder {
    async fn bind(
        &self,
        _role_prompt: &str,
        _knowledge: Arc<KnowledgeIndex>,
        prior_turns: &[Turn],
    ) -> Result<Arc<dyn AnswerEngine>, EngineError> {
        Ok(Arc::new(EchoEngine {
            memory: ConversationMemory::seeded(prior_turns),
        }))
    }
}

struct FakeSynthesizer;

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn synthesize(&self, text: &str, options: &VoiceOptions) -> Result<Vec<u8>, VoiceError> {
        if text.trim().is_empty() {
            return Err(VoiceError::Synthesis("text is empty".into()));
        }
        Ok(format!("mp3[{}]:{}", options.voice, text).into_bytes())
    }
}

struct Utf8Transcriber;

#[async_trait]
impl Transcriber for Utf8Transcriber {
    async fn transcribe(&self, audio: &[u8], _language: &str) -> Result<String, VoiceError> {
        if audio == b"garbage" {
            return Err(VoiceError::Transcription("unreadable audio".into()));
        }
        Ok(String::from_utf8_lossy(audio).into_owned())
    }
}

pub struct TestApp {
    pub router: Router,
    pub chat: Arc<ChatService>,
    pub data_dir: TempDir,
}

pub fn test_app() -> TestApp {
    let data_dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MemoryStore::new());
    let mut settings = ChatSettings::new(data_dir.path());
    settings.collaborator_timeout = Duration::from_secs(5);
    let chat = Arc::new(ChatService::new(
        Collaborators {
            conversations: repo.clone(),
            agents: repo,
            binder: Arc::new(EchoBinder),
            synthesizer: Arc::new(FakeSynthesizer),
            transcriber: Arc::new(Utf8Transcriber),
        },
        settings,
    ));
    let router = app(AppState {
        chat: Arc::clone(&chat),
        static_dir: data_dir.path().join("static"),
    });
    TestApp {
        router,
        chat,
        data_dir,
    }
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Sends `request` and parses the JSON body.
    pub async fn json(&self, request: Request<Body>) -> (u16, Value) {
        let response = self.send(request).await;
        let status = response.status().as_u16();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    /// Creates an agent of `agent_type` through the API. Returns the agent
    /// id and its first conversation id.
    pub async fn create_agent(&self, name: &str, agent_type: &str) -> (String, String) {
        let (status, body) = self
            .json(multipart_request(
                "/api/agents",
                &[("name", name), ("role", "你是一个助手"), ("agent_type", agent_type)],
                &[],
            ))
            .await;
        assert_eq!(status, 200, "{}", body);
        (
            body["agent"]["id"].as_str().unwrap().to_string(),
            body["conversation_id"].as_str().unwrap().to_string(),
        )
    }

    /// Serves the router on an ephemeral port.
    pub async fn serve(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = self.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

const BOUNDARY: &str = "converse-test-boundary";

/// Builds a `multipart/form-data` request from text fields and
/// `(field, file name, bytes)` files.
pub fn multipart_request(
    uri: &str,
    fields: &[(&str, &str)],
    files: &[(&str, &str, &[u8])],
) -> Request<Body> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    }
    for (name, file_name, bytes) in files {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                BOUNDARY, name, file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}
