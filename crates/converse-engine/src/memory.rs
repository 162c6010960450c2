//! Conversational memory held by an answer engine.

use crate::FragmentStream;
use converse_types::{Role, Turn};
use futures_util::stream::{self, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};

/// One remembered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMessage {
    pub role: Role,
    pub content: String,
}

/// Shared, append-only message log. Cloning shares the log.
#[derive(Debug, Clone, Default)]
pub struct ConversationMemory {
    messages: Arc<Mutex<Vec<MemoryMessage>>>,
}

impl ConversationMemory {
    /// Memory seeded with the given conversation turns, in order.
    pub fn seeded(turns: &[Turn]) -> Self {
        let messages = turns
            .iter()
            .map(|t| MemoryMessage {
                role: t.role,
                content: t.content.clone(),
            })
            .collect();
        Self {
            messages: Arc::new(Mutex::new(messages)),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<MemoryMessage> {
        self.lock().clone()
    }

    pub fn record_exchange(&self, question: &str, answer: &str) {
        let mut messages = self.lock();
        messages.push(MemoryMessage {
            role: Role::User,
            content: question.to_string(),
        });
        messages.push(MemoryMessage {
            role: Role::Assistant,
            content: answer.to_string(),
        });
    }

    // A panic while holding the lock cannot leave the Vec half-written,
    // so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Vec<MemoryMessage>> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Remembering {
    inner: FragmentStream,
    memory: ConversationMemory,
    question: String,
    answer: String,
    failed: bool,
}

/// Wraps `inner` so that the exchange is recorded in `memory` once the
/// stream ends cleanly. A stream that fails, or is dropped early, records
/// nothing. The stream ends after the first error.
pub fn remember_on_completion(
    inner: FragmentStream,
    memory: ConversationMemory,
    question: &str,
) -> FragmentStream {
    let state = Remembering {
        inner,
        memory,
        question: question.to_string(),
        answer: String::new(),
        failed: false,
    };
    stream::unfold(state, |mut state| async move {
        if state.failed {
            return None;
        }
        match state.inner.next().await {
            Some(Ok(fragment)) => {
                state.answer.push_str(&fragment);
                Some((Ok(fragment), state))
            }
            Some(Err(e)) => {
                state.failed = true;
                Some((Err(e), state))
            }
            None => {
                state.memory.record_exchange(&state.question, &state.answer);
                None
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    fn fragments(items: Vec<Result<&'static str, EngineError>>) -> FragmentStream {
        stream::iter(items.into_iter().map(|r| r.map(str::to_string))).boxed()
    }

    #[test]
    fn seeded_memory_mirrors_turns() {
        let memory =
            ConversationMemory::seeded(&[Turn::user("你好"), Turn::assistant("你好！", false)]);
        assert_eq!(memory.len(), 2);
        assert_eq!(memory.snapshot()[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn exchange_is_recorded_after_full_consumption() {
        let memory = ConversationMemory::default();
        let mut stream =
            remember_on_completion(fragments(vec![Ok("一"), Ok("二")]), memory.clone(), "数数");

        assert_eq!(stream.next().await.unwrap().unwrap(), "一");
        assert_eq!(stream.next().await.unwrap().unwrap(), "二");
        assert!(memory.is_empty(), "nothing is recorded before the end");
        assert!(stream.next().await.is_none());

        let messages = memory.snapshot();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "数数");
        assert_eq!(messages[1].content, "一二");
    }

    #[tokio::test]
    async fn failed_stream_records_nothing() {
        let memory = ConversationMemory::default();
        let stream = remember_on_completion(
            fragments(vec![
                Ok("一"),
                Err(EngineError::Answer("dropped".into())),
                Ok("never"),
            ]),
            memory.clone(),
            "q",
        );

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
        assert!(memory.is_empty());
    }
}
