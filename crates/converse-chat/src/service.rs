//! The conversation pipeline.
//!
//! Every answer, whichever channel asked for it, runs the same steps while
//! holding the conversation's lock:
//!
//! 1. refresh the engine if the turn count is due;
//! 2. obtain the bound engine (a failure here is reported before any output);
//! 3. append and persist the user turn;
//! 4. generate the answer and deliver it on the channel;
//! 5. append and persist the assistant turn.
//!
//! A failure after step 3 rolls the user turn back, so a failed exchange
//! leaves the conversation as it was.

use crate::agents::{AgentRegistry, NewAgent, Upload};
use crate::assembler::{ChunkPolicy, StreamAssembler};
use crate::error::ChatError;
use crate::routing::{detect_intent, forwarded_answer};
use crate::sink::LiveSink;
use crate::store::{ConversationGuard, ConversationStore, DEFAULT_REFRESH_INTERVAL};
use crate::tasks::{BackgroundTasks, DEFAULT_MAX_BACKGROUND_TASKS};
use crate::voice_session::{FragmentOutcome, VoiceSessions, DEFAULT_PARTIAL_THRESHOLD};
use converse_engine::{AnswerEngine, EngineBinder, FragmentStream, KnowledgeLibrary};
use converse_store::{AgentRepository, ConversationRepository};
use converse_types::{
    Agent, AgentType, ConversationRecord, LiveEvent, Role, StreamEvent, Turn, VoiceOptions,
};
use converse_voice::{mp3_data_url, SpeechSynthesizer, Transcriber};
use futures_util::StreamExt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Capacity of the event channel behind one streamed response.
const STREAM_BUFFER: usize = 64;

/// Characters that end a sentence on the live channel.
const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', '。', '！', '？'];

/// Tunables of the pipeline.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub uploads_dir: PathBuf,
    pub vector_store_dir: PathBuf,
    pub refresh_interval: usize,
    pub partial_transcript_threshold: usize,
    /// Bound on each wait for the engine: the first response and every
    /// subsequent fragment.
    pub collaborator_timeout: Duration,
    pub max_background_tasks: usize,
    /// Transcription language code.
    pub language: String,
    pub voice: VoiceOptions,
    pub chunk_policy: ChunkPolicy,
}

impl ChatSettings {
    /// Settings with upload and index directories under `data_dir`.
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            uploads_dir: data_dir.join("uploads"),
            vector_store_dir: data_dir.join("vector_stores"),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            partial_transcript_threshold: DEFAULT_PARTIAL_THRESHOLD,
            collaborator_timeout: Duration::from_secs(120),
            max_background_tasks: DEFAULT_MAX_BACKGROUND_TASKS,
            language: "zh".to_string(),
            voice: VoiceOptions::default(),
            chunk_policy: ChunkPolicy::default(),
        }
    }
}

/// Who answers a request-response message.
enum Responder {
    Routed(AgentType),
    Bound(Arc<dyn AnswerEngine>),
}

/// External dependencies of the pipeline.
pub struct Collaborators {
    pub conversations: Arc<dyn ConversationRepository>,
    pub agents: Arc<dyn AgentRepository>,
    pub binder: Arc<dyn EngineBinder>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub transcriber: Arc<dyn Transcriber>,
}

pub struct ChatService {
    store: ConversationStore,
    agents: AgentRegistry,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transcriber: Arc<dyn Transcriber>,
    voice_sessions: VoiceSessions,
    tasks: BackgroundTasks,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(collaborators: Collaborators, settings: ChatSettings) -> Self {
        let knowledge = KnowledgeLibrary::new(&settings.vector_store_dir);
        let tasks = BackgroundTasks::new(settings.max_background_tasks);
        Self {
            store: ConversationStore::new(
                collaborators.conversations,
                Arc::clone(&collaborators.agents),
                collaborators.binder,
                knowledge.clone(),
                settings.refresh_interval,
            ),
            agents: AgentRegistry::new(collaborators.agents, &settings.uploads_dir, knowledge),
            synthesizer: collaborators.synthesizer,
            transcriber: Arc::clone(&collaborators.transcriber),
            voice_sessions: VoiceSessions::new(
                collaborators.transcriber,
                tasks.clone(),
                settings.partial_transcript_threshold,
                settings.language.clone(),
            ),
            tasks,
            settings,
        }
    }

    /// Loads persisted conversations. Returns how many are held.
    pub async fn load(&self) -> Result<usize, ChatError> {
        self.store.load_all().await
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn voice_sessions(&self) -> &VoiceSessions {
        &self.voice_sessions
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    // -- agents and conversations ------------------------------------------

    /// Creates an agent and its first conversation.
    pub async fn create_agent(
        &self,
        new: NewAgent,
        uploads: Vec<Upload>,
    ) -> Result<(Agent, ConversationRecord), ChatError> {
        let agent = self.agents.create(new, uploads).await?;
        let conversation = self.store.create(&agent).await?;
        Ok((agent, conversation))
    }

    pub async fn get_agent(&self, id: &str) -> Result<Agent, ChatError> {
        self.agents
            .get(id)
            .await?
            .ok_or_else(|| ChatError::AgentNotFound(id.to_string()))
    }

    /// Deletes an agent with all of its conversations, uploads and index.
    /// Returns the agent and the number of conversations removed.
    pub async fn delete_agent(&self, id: &str) -> Result<(Agent, usize), ChatError> {
        let agent = self.get_agent(id).await?;
        let deleted_conversations = self.store.delete_for_agent(id).await?;
        self.agents.delete(id).await?;
        tracing::info!(agent_id = %id, deleted_conversations, "agent and conversations deleted");
        Ok((agent, deleted_conversations))
    }

    pub async fn create_conversation(&self, agent_id: &str) -> Result<ConversationRecord, ChatError> {
        let agent = self
            .agents
            .get(agent_id)
            .await?
            .ok_or_else(|| ChatError::InvalidInput("无效的智能体ID".to_string()))?;
        self.store.create(&agent).await
    }

    /// Rebuilds the conversation's engine from its persisted turns. Returns
    /// the number of turns it was rebuilt from.
    pub async fn refresh_context(&self, id: &str) -> Result<usize, ChatError> {
        let mut guard = self.store.lock(id).await?;
        if !self.store.refresh(&mut guard).await {
            return Err(ChatError::Binding("刷新上下文失败".to_string()));
        }
        Ok(guard.turn_count())
    }

    // -- answering ---------------------------------------------------------

    /// Answers `message` in one piece. A Chinese teacher hands math
    /// questions to the first math teacher; the stored answer is marked as
    /// forwarded.
    pub async fn send_message(&self, id: &str, message: &str) -> Result<Turn, ChatError> {
        let message = validate_message(message)?;
        let mut guard = self.store.lock(id).await?;
        let agent_id = guard.agent_id();
        let agent = self
            .agents
            .get(&agent_id)
            .await?
            .ok_or(ChatError::AgentNotFound(agent_id))?;

        self.store.refresh_if_due(&mut guard).await;
        let responder = match detect_intent(agent.agent_type, &message) {
            Some(target) => Responder::Routed(target),
            None => Responder::Bound(self.bound_engine(&mut guard).await?),
        };
        self.store.push_turn(&mut guard, Turn::user(&message)).await?;

        let answered = match responder {
            Responder::Routed(target) => self.answer_routed(target, &message).await,
            Responder::Bound(engine) => self
                .with_timeout(engine.answer(&message))
                .await
                .map(|answer| Turn::assistant(answer, false)),
        };

        let turn = match answered {
            Ok(turn) => turn,
            Err(e) => {
                tracing::warn!(conversation_id = %id, "answer failed: {}", e);
                self.rollback(&mut guard).await;
                return Err(e);
            }
        };
        if turn.forwarded == Some(true) {
            // The bound engine never saw this exchange.
            self.store.invalidate(&mut guard);
        }
        if let Err(e) = self.store.push_turn(&mut guard, turn.clone()).await {
            self.rollback(&mut guard).await;
            return Err(e);
        }
        Ok(turn)
    }

    async fn answer_routed(&self, target: AgentType, message: &str) -> Result<Turn, ChatError> {
        let agent = self.agents.find_by_type(target).await?.ok_or_else(|| {
            ChatError::Routing(format!("没有可以回答该问题的{}", target.type_name()))
        })?;
        tracing::info!(target_agent = %agent.id, agent_type = %target, "routing message");
        let engine = self.store.bind_for_agent(&agent.id, &[]).await?;
        let answer = self.with_timeout(engine.answer(message)).await?;
        Ok(Turn::assistant(forwarded_answer(&agent.name, &answer), true))
    }

    /// Starts a streamed answer. Errors before the first event (unknown
    /// conversation, empty message, no engine) are returned directly;
    /// later failures arrive as an `error` event.
    pub async fn stream_message(
        self: &Arc<Self>,
        id: &str,
        message: &str,
    ) -> Result<mpsc::Receiver<StreamEvent>, ChatError> {
        let message = validate_message(message)?;
        let (mut guard, engine) = self.begin_reply(id, &message).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let service = Arc::clone(self);
        tokio::spawn(async move {
            match service.stream_answer(&mut guard, engine, &message, &tx).await {
                Ok(()) => {
                    let _ = tx.send(StreamEvent::Done).await;
                }
                Err(e) => {
                    tracing::warn!(conversation_id = %guard.id(), "streamed answer failed: {}", e);
                    service.rollback(&mut guard).await;
                    let _ = tx
                        .send(StreamEvent::Error {
                            error: e.to_string(),
                        })
                        .await;
                }
            }
        });
        Ok(rx)
    }

    async fn stream_answer(
        &self,
        guard: &mut ConversationGuard,
        engine: Arc<dyn AnswerEngine>,
        message: &str,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), ChatError> {
        let fragments = self.start_stream(engine.as_ref(), message).await?;
        let assembler = StreamAssembler::new(
            Arc::clone(&self.synthesizer),
            self.settings.voice.clone(),
            self.settings.chunk_policy,
            self.settings.collaborator_timeout,
        );
        let answer = assembler.run(fragments, sink).await?;
        self.store
            .push_turn(guard, Turn::assistant(answer, false))
            .await
    }

    /// Answers `message` on the live channel: each fragment is pushed as it
    /// arrives and each completed sentence is synthesized in the
    /// background. Errors are pushed to `sink` as well as returned.
    pub async fn live_reply(
        &self,
        id: &str,
        message: &str,
        sink: Arc<dyn LiveSink>,
    ) -> Result<(), ChatError> {
        let (mut guard, engine) = match self.begin_reply(id, message).await {
            Ok(ready) => ready,
            Err(e) => {
                sink.push(LiveEvent::error(e.to_string()));
                return Err(e);
            }
        };

        match self.live_answer(&mut guard, engine, message, &sink).await {
            Ok(()) => {
                sink.push(LiveEvent::ResponseComplete {
                    message_id: Uuid::new_v4().to_string(),
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(conversation_id = %id, "live reply failed: {}", e);
                self.rollback(&mut guard).await;
                sink.push(LiveEvent::error(format!("处理消息时出错: {}", e)));
                Err(e)
            }
        }
    }

    async fn live_answer(
        &self,
        guard: &mut ConversationGuard,
        engine: Arc<dyn AnswerEngine>,
        message: &str,
        sink: &Arc<dyn LiveSink>,
    ) -> Result<(), ChatError> {
        let mut fragments = self.start_stream(engine.as_ref(), message).await?;
        let mut answer = String::new();
        let mut sentence = String::new();

        let limit = self.settings.collaborator_timeout;
        loop {
            let next = tokio::time::timeout(limit, fragments.next())
                .await
                .map_err(|_| {
                    ChatError::Answer(format!(
                        "no reply fragment within {} seconds",
                        limit.as_secs()
                    ))
                })?;
            let Some(fragment) = next else {
                break;
            };
            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }
            answer.push_str(&fragment);
            sentence.push_str(&fragment);
            sink.push(LiveEvent::PartialResponse {
                text: fragment.clone(),
            });
            if ends_sentence(&fragment) {
                self.speak_in_background(std::mem::take(&mut sentence), sink);
            }
        }
        self.speak_in_background(sentence, sink);

        self.store
            .push_turn(guard, Turn::assistant(answer, false))
            .await
    }

    fn speak_in_background(&self, text: String, sink: &Arc<dyn LiveSink>) {
        if text.trim().is_empty() {
            return;
        }
        let synthesizer = Arc::clone(&self.synthesizer);
        let voice = self.settings.voice.clone();
        let sink = Arc::clone(sink);
        self.tasks.spawn("live_synthesis", async move {
            let audio = synthesizer.synthesize(&text, &voice).await?;
            sink.push(LiveEvent::AudioChunk {
                audio_data: mp3_data_url(&audio),
            });
            Ok(())
        });
    }

    /// Steps 1 to 3 of the pipeline.
    async fn begin_reply(
        &self,
        id: &str,
        message: &str,
    ) -> Result<(ConversationGuard, Arc<dyn AnswerEngine>), ChatError> {
        let mut guard = self.store.lock(id).await?;
        self.store.refresh_if_due(&mut guard).await;
        let engine = self.bound_engine(&mut guard).await?;
        self.store.push_turn(&mut guard, Turn::user(message)).await?;
        Ok((guard, engine))
    }

    async fn bound_engine(
        &self,
        guard: &mut ConversationGuard,
    ) -> Result<Arc<dyn AnswerEngine>, ChatError> {
        self.store
            .engine_for(guard)
            .await
            .ok_or_else(|| ChatError::Binding("无法加载对话".to_string()))
    }

    async fn start_stream(
        &self,
        engine: &dyn AnswerEngine,
        message: &str,
    ) -> Result<FragmentStream, ChatError> {
        self.with_timeout(engine.answer_streaming(message)).await
    }

    async fn with_timeout<T, E>(&self, fut: impl Future<Output = Result<T, E>>) -> Result<T, ChatError>
    where
        ChatError: From<E>,
    {
        let limit = self.settings.collaborator_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ChatError::Answer(format!(
                "no response from the answer engine within {} seconds",
                limit.as_secs()
            ))),
        }
    }

    async fn rollback(&self, guard: &mut ConversationGuard) {
        if let Err(e) = self.store.rollback_user_turn(guard).await {
            tracing::error!(conversation_id = %guard.id(), "failed to roll back user turn: {}", e);
        }
    }

    // -- speech ------------------------------------------------------------

    /// Synthesizes the most recent assistant turn.
    pub async fn speak_last(&self, id: &str) -> Result<Vec<u8>, ChatError> {
        let record = self
            .store
            .get(id)
            .ok_or_else(|| ChatError::ConversationNotFound(id.to_string()))?;
        let text = record
            .turns
            .iter()
            .rev()
            .find(|turn| turn.role == Role::Assistant)
            .map(|turn| turn.content.clone())
            .ok_or_else(|| ChatError::InvalidInput("没有找到AI消息".to_string()))?;
        Ok(self.synthesizer.synthesize(&text, &self.settings.voice).await?)
    }

    pub async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<Vec<u8>, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::InvalidInput("文本不能为空".to_string()));
        }
        let options = match voice.map(str::trim).filter(|v| !v.is_empty()) {
            Some(voice) => VoiceOptions::with_voice(voice),
            None => self.settings.voice.clone(),
        };
        Ok(self.synthesizer.synthesize(text, &options).await?)
    }

    /// Transcribes an uploaded recording. Failures degrade to empty text.
    pub async fn transcribe(&self, audio: &[u8]) -> String {
        match self.transcriber.transcribe(audio, &self.settings.language).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("transcription failed: {}", e);
                String::new()
            }
        }
    }

    // -- live voice --------------------------------------------------------

    pub fn start_voice(
        &self,
        conn: Uuid,
        conversation_id: &str,
        sink: &dyn LiveSink,
    ) -> Result<(), ChatError> {
        if !self.store.contains(conversation_id) {
            sink.push(LiveEvent::error("对话ID无效"));
            return Err(ChatError::ConversationNotFound(conversation_id.to_string()));
        }
        self.voice_sessions.start(conn, conversation_id, sink);
        Ok(())
    }

    pub fn voice_fragment(
        &self,
        conn: Uuid,
        encoded: &str,
        sink: &Arc<dyn LiveSink>,
    ) -> Result<FragmentOutcome, ChatError> {
        self.voice_sessions.fragment(conn, encoded, sink)
    }

    /// Ends the voice session. The session is closed before this returns;
    /// the final transcription and, when something was said, the live reply
    /// run on the returned task.
    pub fn end_voice(
        self: &Arc<Self>,
        conn: Uuid,
        sink: Arc<dyn LiveSink>,
    ) -> Result<JoinHandle<()>, ChatError> {
        let closed = self.voice_sessions.close(conn, sink.as_ref())?;
        let service = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let ended = service.voice_sessions.finish(closed, sink.as_ref()).await;
            let Some(text) = ended.transcript.filter(|t| !t.trim().is_empty()) else {
                return;
            };
            // Errors were already pushed to the connection.
            let _ = service
                .live_reply(&ended.conversation_id, &text, sink)
                .await;
        }))
    }

    pub fn disconnect_voice(&self, conn: Uuid) {
        self.voice_sessions.disconnect(conn);
    }
}

fn validate_message(message: &str) -> Result<String, ChatError> {
    let message = message.trim();
    if message.is_empty() {
        return Err(ChatError::InvalidInput("消息不能为空".to_string()));
    }
    Ok(message.to_string())
}

fn ends_sentence(fragment: &str) -> bool {
    fragment
        .trim_end()
        .chars()
        .last()
        .is_some_and(|c| SENTENCE_ENDINGS.contains(&c))
}
