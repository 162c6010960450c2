#![allow(dead_code)]

use async_trait::async_trait;
use converse_chat::{ChatService, ChatSettings, Collaborators, LiveSink, NewAgent};
use converse_engine::memory::remember_on_completion;
use converse_engine::{
    AnswerEngine, ConversationMemory, EngineBinder, EngineError, FragmentStream, KnowledgeIndex,
};
use converse_store::{ConversationRepository, MemoryStore, StoreError};
use converse_types::{Agent, AgentType, ConversationRecord, LiveEvent, Turn, VoiceOptions};
use converse_voice::{SpeechSynthesizer, Transcriber, VoiceError};
use futures_util::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Notify};

/// Fragments every scripted streaming answer is made of.
pub const STREAM_FRAGMENTS: &[&str] = &["床前", "明月光，", "疑是地上霜。", "举头望明月"];

/// Questions containing this marker make the scripted engine fail.
pub const FAIL: &str = "fail";

pub fn scripted_answer(question: &str) -> String {
    format!("回答：{}", question)
}

pub struct ScriptedEngine {
    memory: ConversationMemory,
}

#[async_trait]
impl AnswerEngine for ScriptedEngine {
    async fn answer(&self, question: &str) -> Result<String, EngineError> {
        if question.contains(FAIL) {
            return Err(EngineError::Answer("scripted failure".into()));
        }
        let answer = scripted_answer(question);
        self.memory.record_exchange(question, &answer);
        Ok(answer)
    }

    async fn answer_streaming(&self, question: &str) -> Result<FragmentStream, EngineError> {
        let items: Vec<Result<String, EngineError>> = if question.contains(FAIL) {
            vec![
                Ok("部分".to_string()),
                Err(EngineError::Answer("scripted failure".into())),
            ]
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

#[derive(Default)]
pub struct ScriptedBinder {
    binds: AtomicUsize,
    failing: AtomicBool,
    seeds: Mutex<Vec<usize>>,
    roles: Mutex<Vec<String>>,
}

impl ScriptedBinder {
    pub fn binds(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of prior turns handed to each bind, in order.
    pub fn seeds(&self) -> Vec<usize> {
        self.seeds.lock().unwrap().clone()
    }

    pub fn roles(&self) -> Vec<String> {
        self.roles.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineBinder for ScriptedBinder {
    async fn bind(
        &self,
        role_prompt: &str,
        _knowledge: Arc<KnowledgeIndex>,
        prior_turns: &[Turn],
    ) -> Result<Arc<dyn AnswerEngine>, EngineError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Binding("scripted bind failure".into()));
        }
        self.binds.fetch_add(1, Ordering::SeqCst);
        self.seeds.lock().unwrap().push(prior_turns.len());
        self.roles.lock().unwrap().push(role_prompt.to_string());
        Ok(Arc::new(ScriptedEngine {
            memory: ConversationMemory::seeded(prior_turns),
        }))
    }
}

/// Returns `mp3:<text>` as audio and remembers every request.
#[derive(Default)]
pub struct RecordingSynthesizer {
    texts: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingSynthesizer {
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynthesizer {
    async fn synthesize(&self, text: &str, _options: &VoiceOptions) -> Result<Vec<u8>, VoiceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(VoiceError::Synthesis("scripted synthesis failure".into()));
        }
        self.texts.lock().unwrap().push(text.to_string());
        Ok(format!("mp3:{}", text).into_bytes())
    }
}

/// Transcribes audio as its UTF-8 text. Audio starting with `slow` waits
/// for [`release`](Self::release) first.
#[derive(Default)]
pub struct ScriptedTranscriber {
    calls: Mutex<Vec<String>>,
    gate: Notify,
}

impl ScriptedTranscriber {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, audio: &[u8], _language: &str) -> Result<String, VoiceError> {
        let text = String::from_utf8_lossy(audio).into_owned();
        if text.starts_with("slow") {
            self.gate.notified().await;
        }
        self.calls.lock().unwrap().push(text.clone());
        Ok(text)
    }
}

/// Conversation repository over [`MemoryStore`] whose writes can be made
/// to fail.
pub struct FlakyConversations {
    inner: Arc<MemoryStore>,
    failing: AtomicBool,
}

impl FlakyConversations {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ConversationRepository for FlakyConversations {
    fn list_conversations(&self) -> Result<Vec<ConversationRecord>, StoreError> {
        self.inner.list_conversations()
    }

    fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>, StoreError> {
        self.inner.get_conversation(id)
    }

    fn put_conversation(&self, record: &ConversationRecord) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("scripted write failure")));
        }
        self.inner.put_conversation(record)
    }

    fn delete_conversation(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete_conversation(id)
    }
}

pub struct Harness {
    pub service: Arc<ChatService>,
    pub repo: Arc<MemoryStore>,
    pub conversations: Arc<FlakyConversations>,
    pub binder: Arc<ScriptedBinder>,
    pub synthesizer: Arc<RecordingSynthesizer>,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub data_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(configure: impl FnOnce(&mut ChatSettings)) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let mut settings = ChatSettings::new(data_dir.path());
        settings.collaborator_timeout = Duration::from_secs(5);
        configure(&mut settings);

        let repo = Arc::new(MemoryStore::new());
        let conversations = Arc::new(FlakyConversations {
            inner: repo.clone(),
            failing: AtomicBool::new(false),
        });
        let binder = Arc::new(ScriptedBinder::default());
        let synthesizer = Arc::new(RecordingSynthesizer::default());
        let transcriber = Arc::new(ScriptedTranscriber::default());
        let service = ChatService::new(
            Collaborators {
                conversations: conversations.clone(),
                agents: repo.clone(),
                binder: binder.clone(),
                synthesizer: synthesizer.clone(),
                transcriber: transcriber.clone(),
            },
            settings,
        );
        Self {
            service: Arc::new(service),
            repo,
            conversations,
            binder,
            synthesizer,
            transcriber,
            data_dir,
        }
    }

    /// Creates an agent without documents. Returns it with its first
    /// conversation.
    pub async fn agent(&self, name: &str, agent_type: AgentType) -> (Agent, ConversationRecord) {
        self.service
            .create_agent(
                NewAgent {
                    name: name.to_string(),
                    role: format!("你是{}", name),
                    agent_type,
                },
                Vec::new(),
            )
            .await
            .unwrap()
    }

    pub fn turn_count(&self, conversation_id: &str) -> usize {
        self.service.store().get(conversation_id).unwrap().turns.len()
    }

    /// Waits until no background task holds a permit.
    pub async fn settle(&self) {
        let max = self.service.settings().max_background_tasks;
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..200 {
            if self.service.tasks().available() == max {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("background tasks did not settle");
    }
}

/// Collects events from `rx` until `done` holds for everything collected.
pub async fn collect_until(
    rx: &mut mpsc::Receiver<LiveEvent>,
    done: impl Fn(&[LiveEvent]) -> bool,
) -> Vec<LiveEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done(&events) {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) => break,
            Err(_) => panic!("timed out waiting for live events; got {:?}", events),
        }
    }
    events
}

/// A live sink backed by a channel, plus its receiving end.
pub fn live_sink() -> (Arc<dyn LiveSink>, mpsc::Receiver<LiveEvent>) {
    let (tx, rx) = mpsc::channel(256);
    (Arc::new(tx), rx)
}

pub fn drain(rx: &mut mpsc::Receiver<LiveEvent>) -> Vec<LiveEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn encode(bytes: impl AsRef<[u8]>) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
