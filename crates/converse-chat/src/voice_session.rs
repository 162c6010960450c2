//! Per-connection voice ingestion.
//!
//! A session buffers decoded audio fragments for one live connection. Every
//! `threshold` fragments the buffer is swapped for an empty one and the
//! captured audio is transcribed in the background; the partial transcript
//! goes back to the same connection unless the session has ended by then.
//! Ending the session transcribes whatever is still buffered and delivers
//! the final transcript, which is always the last transcript the
//! connection sees.

use crate::error::ChatError;
use crate::sink::LiveSink;
use crate::tasks::BackgroundTasks;
use converse_types::LiveEvent;
use converse_voice::{decode_fragment, Transcriber};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

pub const DEFAULT_PARTIAL_THRESHOLD: usize = 3;

const NO_SESSION_MESSAGE: &str = "未找到有效的语音流会话";

/// What happened to an accepted fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    /// Buffered; the session now holds this many fragments.
    Buffered(usize),
    /// The threshold was reached and a partial transcription was started.
    PartialDispatched,
}

/// A session removed from its connection, with the audio it still held.
#[derive(Debug)]
pub struct ClosedSession {
    conn: Uuid,
    conversation_id: String,
    /// `None` when nothing was buffered.
    audio: Option<Vec<u8>>,
}

/// Result of ending a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndedSession {
    pub conversation_id: String,
    /// `None` when nothing was buffered.
    pub transcript: Option<String>,
}

struct Session {
    conversation_id: String,
    fragments: Vec<Vec<u8>>,
    // Guards partial delivery against the end of the session.
    ended: Arc<Mutex<bool>>,
}

pub struct VoiceSessions {
    sessions: Mutex<HashMap<Uuid, Session>>,
    transcriber: Arc<dyn Transcriber>,
    tasks: BackgroundTasks,
    threshold: usize,
    language: String,
}

impl VoiceSessions {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        tasks: BackgroundTasks,
        threshold: usize,
        language: impl Into<String>,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            transcriber,
            tasks,
            threshold: threshold.max(1),
            language: language.into(),
        }
    }

    /// Opens a session for `conn`, replacing any session it already had.
    pub fn start(&self, conn: Uuid, conversation_id: &str, sink: &dyn LiveSink) {
        let previous = self.sessions().insert(
            conn,
            Session {
                conversation_id: conversation_id.to_string(),
                fragments: Vec::new(),
                ended: Arc::new(Mutex::new(false)),
            },
        );
        if let Some(previous) = previous {
            *lock(&previous.ended) = true;
            tracing::debug!(connection = %conn, "replaced active voice session");
        }
        tracing::info!(connection = %conn, conversation_id, "voice stream started");
        sink.push(LiveEvent::VoiceStreamStarted {
            status: "ready".to_string(),
        });
    }

    /// Accepts one encoded fragment. Never waits on transcription.
    pub fn fragment(
        &self,
        conn: Uuid,
        encoded: &str,
        sink: &Arc<dyn LiveSink>,
    ) -> Result<FragmentOutcome, ChatError> {
        let mut sessions = self.sessions();
        let Some(session) = sessions.get_mut(&conn) else {
            sink.push(LiveEvent::error(NO_SESSION_MESSAGE));
            return Err(ChatError::SessionNotFound);
        };
        if encoded.is_empty() {
            return Ok(FragmentOutcome::Buffered(session.fragments.len()));
        }
        let audio = match decode_fragment(encoded) {
            Ok(audio) => audio,
            Err(e) => {
                sink.push(LiveEvent::error("无效的音频数据"));
                return Err(ChatError::InvalidInput(format!("undecodable audio fragment: {}", e)));
            }
        };

        session.fragments.push(audio);
        if session.fragments.len() < self.threshold {
            return Ok(FragmentOutcome::Buffered(session.fragments.len()));
        }

        let captured = std::mem::take(&mut session.fragments);
        let ended = Arc::clone(&session.ended);
        drop(sessions);

        let transcriber = Arc::clone(&self.transcriber);
        let language = self.language.clone();
        let sink = Arc::clone(sink);
        self.tasks.spawn("partial_transcription", async move {
            let text = match transcriber.transcribe(&captured.concat(), &language).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(connection = %conn, "partial transcription failed: {}", e);
                    return Ok(());
                }
            };
            let ended = lock(&ended);
            if *ended {
                tracing::debug!(connection = %conn, "dropping partial transcript after stream end");
            } else if !text.is_empty() {
                sink.push(LiveEvent::PartialTranscript { text });
            }
            Ok(())
        });
        Ok(FragmentOutcome::PartialDispatched)
    }

    /// Closes the session at once so the connection can start another.
    /// Pushes `voice_stream_ended` when nothing was buffered.
    pub fn close(&self, conn: Uuid, sink: &dyn LiveSink) -> Result<ClosedSession, ChatError> {
        let Some(session) = self.sessions().remove(&conn) else {
            sink.push(LiveEvent::error(NO_SESSION_MESSAGE));
            return Err(ChatError::SessionNotFound);
        };
        // Waits out a partial delivery in progress; later ones are dropped.
        *lock(&session.ended) = true;

        let audio = if session.fragments.is_empty() {
            sink.push(LiveEvent::VoiceStreamEnded {
                status: "empty".to_string(),
            });
            None
        } else {
            Some(session.fragments.concat())
        };
        Ok(ClosedSession {
            conn,
            conversation_id: session.conversation_id,
            audio,
        })
    }

    /// Transcribes what a closed session still held and delivers the final
    /// transcript. Transcription failures degrade to empty text.
    pub async fn finish(&self, closed: ClosedSession, sink: &dyn LiveSink) -> EndedSession {
        let ClosedSession {
            conn,
            conversation_id,
            audio,
        } = closed;
        let Some(audio) = audio else {
            return EndedSession {
                conversation_id,
                transcript: None,
            };
        };

        let text = match self.transcriber.transcribe(&audio, &self.language).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(connection = %conn, "final transcription failed: {}", e);
                String::new()
            }
        };
        sink.push(LiveEvent::FinalTranscript { text: text.clone() });
        EndedSession {
            conversation_id,
            transcript: Some(text),
        }
    }

    /// Drops the session of a closed connection along with its buffered
    /// audio. Returns whether a session existed.
    pub fn disconnect(&self, conn: Uuid) -> bool {
        match self.sessions().remove(&conn) {
            Some(session) => {
                *lock(&session.ended) = true;
                tracing::debug!(connection = %conn, "voice session discarded on disconnect");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, conn: Uuid) -> bool {
        self.sessions().contains_key(&conn)
    }

    /// Number of fragments buffered and not yet handed to transcription.
    pub fn pending_fragments(&self, conn: Uuid) -> Option<usize> {
        self.sessions().get(&conn).map(|s| s.fragments.len())
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(PoisonError::into_inner)
}
