mod common;

use common::{scripted_answer, Harness};
use converse_chat::ChatError;
use converse_types::AgentType;

#[tokio::test]
async fn chinese_teacher_forwards_math_questions() {
    let h = Harness::new();
    h.agent("王老师", AgentType::MathTeacher).await;
    let (_, conversation) = h.agent("李老师", AgentType::ChineseTeacher).await;

    let turn = h
        .service
        .send_message(&conversation.id, "3+5等于几")
        .await
        .unwrap();
    assert_eq!(turn.forwarded, Some(true));
    assert_eq!(
        turn.content,
        format!("[王老师回答] {}", scripted_answer("3+5等于几"))
    );
    // Answered by an engine bound for the math teacher.
    assert_eq!(h.binder.roles(), vec!["你是王老师".to_string()]);

    let record = h.service.store().get(&conversation.id).unwrap();
    assert_eq!(record.turns.len(), 2);
    assert_eq!(record.turns[1], turn);

    // A non-math follow-up goes to the conversation's own engine, seeded
    // with the forwarded exchange.
    let turn = h
        .service
        .send_message(&conversation.id, "静夜思是谁写的")
        .await
        .unwrap();
    assert_eq!(turn.forwarded, Some(false));
    assert_eq!(h.binder.seeds(), vec![0, 2]);
    assert_eq!(h.binder.roles()[1], "你是李老师");
}

#[tokio::test]
async fn missing_math_teacher_is_a_routing_error() {
    let h = Harness::new();
    let (_, conversation) = h.agent("李老师", AgentType::ChineseTeacher).await;

    let err = h
        .service
        .send_message(&conversation.id, "解方程 x*2=4")
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Routing(_)));
    assert_eq!(h.turn_count(&conversation.id), 0);
}

#[tokio::test]
async fn other_agents_answer_math_themselves() {
    let h = Harness::new();
    h.agent("王老师", AgentType::MathTeacher).await;
    let (_, conversation) = h.agent("小助手", AgentType::Default).await;

    let turn = h
        .service
        .send_message(&conversation.id, "1+1=?")
        .await
        .unwrap();
    assert_eq!(turn.forwarded, Some(false));
    assert_eq!(turn.content, scripted_answer("1+1=?"));
    assert_eq!(h.binder.roles(), vec!["你是小助手".to_string()]);
}
