mod common;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use common::{collect_until, live_sink, Harness, FAIL, STREAM_FRAGMENTS};
use converse_chat::{ChatError, ChunkPolicy, StreamAssembler};
use converse_engine::{EngineError, FragmentStream};
use converse_types::{AgentType, LiveEvent, Role, StreamEvent, VoiceOptions};
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn streamed_content_matches_the_persisted_answer() {
    let h = Harness::new();
    let (_, conversation) = h.agent("小助手", AgentType::Default).await;

    let rx = h
        .service
        .stream_message(&conversation.id, "背一首诗")
        .await
        .unwrap();
    let events = collect(rx).await;

    assert_eq!(
        events,
        vec![
            StreamEvent::Partial {
                text: "床前".into()
            },
            StreamEvent::Partial {
                text: "明月光，".into()
            },
            StreamEvent::Content {
                text: "床前明月光，疑是地上霜。".into(),
                audio: Some(STANDARD.encode("mp3:床前明月光，疑是地上霜。")),
            },
            StreamEvent::Partial {
                text: "举头望明月".into()
            },
            StreamEvent::Content {
                text: "举头望明月".into(),
                audio: Some(STANDARD.encode("mp3:举头望明月")),
            },
            StreamEvent::Done,
        ]
    );

    let record = h.service.store().get(&conversation.id).unwrap();
    assert_eq!(record.turns.len(), 2);
    assert_eq!(record.turns[1].role, Role::Assistant);
    assert_eq!(record.turns[1].content, STREAM_FRAGMENTS.concat());

    let contents: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Content { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(contents, record.turns[1].content);

    // The engine remembered the completed exchange.
    let status = h.service.store().memory_status(&conversation.id).await.unwrap();
    assert_eq!(status.memory_messages_count, Some(2));
}

#[tokio::test]
async fn engine_failure_mid_stream_rolls_back() {
    let h = Harness::new();
    let (_, conversation) = h.agent("小助手", AgentType::Default).await;

    let events = collect(
        h.service
            .stream_message(&conversation.id, FAIL)
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(events.first(), Some(&StreamEvent::Partial { text: "部分".into() }));
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
    assert!(!events.contains(&StreamEvent::Done));
    assert_eq!(h.turn_count(&conversation.id), 0);
}

#[tokio::test]
async fn synthesis_failure_aborts_the_stream() {
    let h = Harness::new();
    let (_, conversation) = h.agent("小助手", AgentType::Default).await;
    h.synthesizer.set_failing(true);

    let events = collect(
        h.service
            .stream_message(&conversation.id, "背一首诗")
            .await
            .unwrap(),
    )
    .await;

    match events.last() {
        Some(StreamEvent::Error { error }) => assert!(error.contains("synthesis")),
        other => panic!("expected an error event, got {:?}", other),
    }
    assert_eq!(h.turn_count(&conversation.id), 0);
}

#[tokio::test]
async fn binding_failure_is_reported_before_the_stream() {
    let h = Harness::new();
    let (_, conversation) = h.agent("小助手", AgentType::Default).await;
    h.binder.set_failing(true);

    let err = h
        .service
        .stream_message(&conversation.id, "你好")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Binding(_)));
    assert_eq!(h.turn_count(&conversation.id), 0);
}

#[tokio::test]
async fn stream_refreshes_on_the_same_schedule() {
    let h = Harness::with_settings(|s| s.refresh_interval = 4);
    let (_, conversation) = h.agent("小助手", AgentType::Default).await;

    for _ in 0..3 {
        let rx = h
            .service
            .stream_message(&conversation.id, "背一首诗")
            .await
            .unwrap();
        collect(rx).await;
    }
    assert_eq!(h.binder.seeds(), vec![0, 4]);
}

#[tokio::test]
async fn live_reply_pushes_fragments_then_audio() {
    let h = Harness::new();
    let (_, conversation) = h.agent("小助手", AgentType::Default).await;
    let (sink, mut rx) = live_sink();

    h.service
        .live_reply(&conversation.id, "背一首诗", sink)
        .await
        .unwrap();
    let events = collect_until(&mut rx, |events| {
        events
            .iter()
            .filter(|e| matches!(e, LiveEvent::AudioChunk { .. }))
            .count()
            == 2
    })
    .await;

    let partials: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            LiveEvent::PartialResponse { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(partials, STREAM_FRAGMENTS);
    assert!(events
        .iter()
        .any(|e| matches!(e, LiveEvent::ResponseComplete { .. })));

    let mut spoken = h.synthesizer.texts();
    spoken.sort();
    let mut expected = vec!["床前明月光，疑是地上霜。".to_string(), "举头望明月".to_string()];
    expected.sort();
    assert_eq!(spoken, expected);

    let record = h.service.store().get(&conversation.id).unwrap();
    assert_eq!(record.turns[1].content, STREAM_FRAGMENTS.concat());
}

#[tokio::test]
async fn live_synthesis_failure_does_not_fail_the_reply() {
    let h = Harness::new();
    let (_, conversation) = h.agent("小助手", AgentType::Default).await;
    h.synthesizer.set_failing(true);
    let (sink, mut rx) = live_sink();

    h.service
        .live_reply(&conversation.id, "背一首诗", sink)
        .await
        .unwrap();
    h.settle().await;

    let events = common::drain(&mut rx);
    assert!(!events.iter().any(|e| matches!(e, LiveEvent::AudioChunk { .. })));
    assert!(!events.iter().any(|e| matches!(e, LiveEvent::Error { .. })));
    assert_eq!(h.turn_count(&conversation.id), 2);
}

#[tokio::test]
async fn live_reply_failure_pushes_an_error_and_rolls_back() {
    let h = Harness::new();
    let (_, conversation) = h.agent("小助手", AgentType::Default).await;
    let (sink, mut rx) = live_sink();

    assert!(h
        .service
        .live_reply(&conversation.id, FAIL, sink)
        .await
        .is_err());
    let events = common::drain(&mut rx);
    assert!(matches!(events.last(), Some(LiveEvent::Error { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, LiveEvent::ResponseComplete { .. })));
    assert_eq!(h.turn_count(&conversation.id), 0);
}

#[tokio::test]
async fn ready_chunk_is_emitted_while_the_engine_is_idle() {
    let (resume, paused) = oneshot::channel::<()>();
    let first: Result<String, EngineError> = Ok("床前明月光，疑是地上霜。".to_string());
    let fragments: FragmentStream = stream::iter(vec![first])
        .chain(stream::once(async move {
            let _ = paused.await;
            Ok("举".to_string())
        }))
        .boxed();

    let assembler = StreamAssembler::new(
        Arc::new(common::RecordingSynthesizer::default()),
        VoiceOptions::default(),
        ChunkPolicy::default(),
        Duration::from_secs(30),
    );
    let (tx, mut rx) = mpsc::channel(16);
    let run = tokio::spawn(async move { assembler.run(fragments, &tx).await });

    // The engine has not produced the next fragment yet.
    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("content held back until the next fragment")
        .unwrap();
    assert_eq!(
        event,
        StreamEvent::Content {
            text: "床前明月光，疑是地上霜。".into(),
            audio: Some(STANDARD.encode("mp3:床前明月光，疑是地上霜。")),
        }
    );

    resume.send(()).unwrap();
    assert_eq!(run.await.unwrap().unwrap(), "床前明月光，疑是地上霜。举");
    assert_eq!(
        rx.recv().await,
        Some(StreamEvent::Partial { text: "举".into() })
    );
}
