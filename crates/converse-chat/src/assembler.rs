//! Turns a stream of answer fragments into speakable chunks.
//!
//! Fragments accumulate in a buffer until one of the flush triggers fires;
//! the whole buffer is then synthesized and emitted as one `content` event.
//! Fragments that do not complete a chunk are forwarded as `partial`
//! events so the client can render text before its audio is ready.
//!
//! Synthesis of a chunk runs on its own task while later fragments keep
//! being read from the engine. Events still leave in fragment order: a
//! chunk's `content` event, and everything queued after it, waits until
//! that chunk's audio is ready. A chunk whose audio completes while the
//! engine is idle is emitted without waiting for the next fragment.

use crate::error::ChatError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use converse_engine::FragmentStream;
use converse_types::{StreamEvent, VoiceOptions};
use converse_voice::{SpeechSynthesizer, VoiceError};
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

/// Flush triggers, measured in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// A buffer longer than this flushes once it holds a full stop.
    pub sentence_min_chars: usize,
    /// A buffer longer than this always flushes.
    pub max_chars: usize,
    /// A buffer longer than `idle_min_chars` flushes once this much time
    /// has passed since the previous flush.
    pub idle_flush: Duration,
    pub idle_min_chars: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            sentence_min_chars: 10,
            max_chars: 20,
            idle_flush: Duration::from_secs(2),
            idle_min_chars: 5,
        }
    }
}

/// Buffering state for one response.
#[derive(Debug)]
pub struct SpeechChunker {
    policy: ChunkPolicy,
    buffer: String,
    chars: usize,
    last_flush: Instant,
}

impl SpeechChunker {
    /// `started` is the instant the response began; the idle trigger
    /// measures from it until the first flush.
    pub fn new(policy: ChunkPolicy, started: Instant) -> Self {
        Self {
            policy,
            buffer: String::new(),
            chars: 0,
            last_flush: started,
        }
    }

    /// Adds a fragment. Returns the buffered chunk, fragment included, when
    /// a trigger fires.
    pub fn push(&mut self, fragment: &str, now: Instant) -> Option<String> {
        self.buffer.push_str(fragment);
        self.chars += fragment.chars().count();

        let sentence = self.chars > self.policy.sentence_min_chars
            && (self.buffer.contains('。') || self.buffer.contains('.'));
        let long = self.chars > self.policy.max_chars;
        let idle = now.saturating_duration_since(self.last_flush) > self.policy.idle_flush
            && self.chars > self.policy.idle_min_chars;

        if sentence || long || idle {
            self.last_flush = now;
            self.chars = 0;
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    /// Returns whatever is still buffered, if anything.
    pub fn finish(&mut self) -> Option<String> {
        self.chars = 0;
        let rest = std::mem::take(&mut self.buffer);
        (!rest.is_empty()).then_some(rest)
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }
}

type Synthesis = JoinHandle<Result<Vec<u8>, VoiceError>>;

enum Audio {
    Silent,
    Synthesizing(Synthesis),
    Ready(Result<Vec<u8>, ChatError>),
}

enum Pending {
    Partial(String),
    Content { text: String, audio: Audio },
}

fn joined(result: Result<Result<Vec<u8>, VoiceError>, JoinError>) -> Result<Vec<u8>, ChatError> {
    let audio = result.map_err(|e| ChatError::Synthesis(format!("synthesis task failed: {}", e)))??;
    Ok(audio)
}

/// Queue of events awaiting emission, in fragment order.
struct OrderedEmitter<'a> {
    sink: &'a mpsc::Sender<StreamEvent>,
    queue: VecDeque<Pending>,
}

impl OrderedEmitter<'_> {
    /// Resolves once the chunk at the head of the queue has finished
    /// synthesizing, storing the result in place. Never resolves while the
    /// head is not synthesizing. Cancel-safe.
    async fn head_synthesized(&mut self) {
        if let Some(Pending::Content { audio, .. }) = self.queue.front_mut() {
            if let Audio::Synthesizing(handle) = audio {
                let result = joined(handle.await);
                *audio = Audio::Ready(result);
                return;
            }
        }
        std::future::pending::<()>().await
    }

    /// Emits queued events up to the first chunk whose audio is not ready.
    /// With `wait`, blocks until the whole queue is emitted.
    async fn drain(&mut self, wait: bool) -> Result<(), ChatError> {
        while let Some(front) = self.queue.front() {
            if let Pending::Content {
                audio: Audio::Synthesizing(handle),
                ..
            } = front
            {
                if !wait && !handle.is_finished() {
                    break;
                }
            }
            let Some(pending) = self.queue.pop_front() else {
                break;
            };
            let event = match pending {
                Pending::Partial(text) => StreamEvent::Partial { text },
                Pending::Content { text, audio } => {
                    let audio = match audio {
                        Audio::Silent => None,
                        Audio::Synthesizing(handle) => Some(joined(handle.await)?),
                        Audio::Ready(result) => Some(result?),
                    };
                    StreamEvent::Content {
                        text,
                        audio: audio.map(|bytes| STANDARD.encode(bytes)),
                    }
                }
            };
            // A closed sink means the client went away; keep generating so
            // the answer is still persisted.
            let _ = self.sink.send(event).await;
        }
        Ok(())
    }
}

impl Drop for OrderedEmitter<'_> {
    fn drop(&mut self) {
        for pending in self.queue.drain(..) {
            if let Pending::Content {
                audio: Audio::Synthesizing(handle),
                ..
            } = pending
            {
                handle.abort();
            }
        }
    }
}

/// Drives one streamed response through the chunker and the synthesizer.
pub struct StreamAssembler {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    voice: VoiceOptions,
    policy: ChunkPolicy,
    fragment_timeout: Duration,
}

impl StreamAssembler {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        voice: VoiceOptions,
        policy: ChunkPolicy,
        fragment_timeout: Duration,
    ) -> Self {
        Self {
            synthesizer,
            voice,
            policy,
            fragment_timeout,
        }
    }

    /// Consumes `fragments`, emitting `partial` and `content` events into
    /// `sink`. Returns the full answer text, which equals the concatenation
    /// of every emitted `content` text. Does not emit `done` or `error`.
    pub async fn run(
        &self,
        mut fragments: FragmentStream,
        sink: &mpsc::Sender<StreamEvent>,
    ) -> Result<String, ChatError> {
        let mut chunker = SpeechChunker::new(self.policy, Instant::now());
        let mut emitter = OrderedEmitter {
            sink,
            queue: VecDeque::new(),
        };
        let mut answer = String::new();

        loop {
            // Chunks whose audio finishes between fragments go out at once.
            let deadline = tokio::time::Instant::now() + self.fragment_timeout;
            let next = loop {
                tokio::select! {
                    next = tokio::time::timeout_at(deadline, fragments.next()) => break next,
                    () = emitter.head_synthesized() => emitter.drain(false).await?,
                }
            };
            let next = next.map_err(|_| {
                ChatError::Answer(format!(
                    "no reply fragment within {} seconds",
                    self.fragment_timeout.as_secs()
                ))
            })?;
            let Some(fragment) = next else {
                break;
            };
            let fragment = fragment?;
            if fragment.is_empty() {
                continue;
            }

            match chunker.push(&fragment, Instant::now()) {
                Some(chunk) => {
                    answer.push_str(&chunk);
                    emitter.queue.push_back(self.content(chunk));
                }
                None => emitter.queue.push_back(Pending::Partial(fragment)),
            }
            emitter.drain(false).await?;
        }

        if let Some(rest) = chunker.finish() {
            answer.push_str(&rest);
            emitter.queue.push_back(self.content(rest));
        }
        emitter.drain(true).await?;
        Ok(answer)
    }

    fn content(&self, text: String) -> Pending {
        // Nothing to say; synthesizing would fail and abort a valid answer.
        if text.trim().is_empty() {
            return Pending::Content {
                text,
                audio: Audio::Silent,
            };
        }
        let synthesizer = Arc::clone(&self.synthesizer);
        let voice = self.voice.clone();
        let input = text.clone();
        let handle = tokio::spawn(async move { synthesizer.synthesize(&input, &voice).await });
        Pending::Content {
            text,
            audio: Audio::Synthesizing(handle),
        }
    }
}
