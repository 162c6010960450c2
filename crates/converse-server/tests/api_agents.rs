mod common;

use common::{empty_request, multipart_request, test_app};

#[tokio::test]
async fn health_reports_version() {
    let app = test_app();
    let (status, body) = app.json(empty_request("GET", "/health")).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn create_agent_with_documents() {
    let app = test_app();
    let poem = "床前明月光，疑是地上霜。举头望明月，低头思故乡。".as_bytes();

    let (status, body) = app
        .json(multipart_request(
            "/api/agents",
            &[
                ("name", "李老师"),
                ("role", "你是一位语文老师"),
                ("agent_type", "CHINESE_TEACHER"),
            ],
            &[("files", "静夜思.txt", poem), ("files", "slides.pptx", b"PK")],
        ))
        .await;

    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["success"], true);
    assert_eq!(body["agent"]["name"], "李老师");
    assert_eq!(body["agent"]["agent_type"], "CHINESE_TEACHER");
    assert_eq!(body["agent"]["type_name"], "语文老师");
    assert_eq!(body["agent"]["has_knowledge_base"], true);

    let conversation_id = body["conversation_id"].as_str().unwrap();
    assert!(app.chat.store().contains(conversation_id));

    let agent_id = body["agent"]["id"].as_str().unwrap();
    let uploads = app.data_dir.path().join("uploads").join(agent_id);
    assert!(uploads.join("静夜思.txt").exists());
    assert!(!uploads.join("slides.pptx").exists());
}

#[tokio::test]
async fn agent_without_files_has_no_knowledge_base() {
    let app = test_app();
    let (status, body) = app
        .json(multipart_request(
            "/api/agents",
            &[("name", "小助手"), ("role", "")],
            &[],
        ))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["agent"]["agent_type"], "DEFAULT");
    assert_eq!(body["agent"]["has_knowledge_base"], false);
}

#[tokio::test]
async fn invalid_agent_fields_are_rejected() {
    let app = test_app();

    let (status, body) = app
        .json(multipart_request("/api/agents", &[("role", "无名")], &[]))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "智能体名称不能为空");

    let (status, _) = app
        .json(multipart_request(
            "/api/agents",
            &[("name", "x"), ("agent_type", "PHYSICS_TEACHER")],
            &[],
        ))
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn get_list_and_delete_agents() {
    let app = test_app();
    let (first, conversation) = app.create_agent("小助手", "DEFAULT").await;
    // Creation timestamps have millisecond resolution.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let (second, _) = app.create_agent("王老师", "MATH_TEACHER").await;

    let (status, body) = app.json(empty_request("GET", "/api/agents")).await;
    assert_eq!(status, 200);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![first.as_str(), second.as_str()]);

    let (status, body) = app
        .json(empty_request("GET", &format!("/api/agents/{}", second)))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["type_name"], "数学老师");

    let (status, body) = app
        .json(empty_request("DELETE", &format!("/api/agents/{}", first)))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["deleted_conversations"], 1);
    assert!(!app.chat.store().contains(&conversation));

    let (status, body) = app
        .json(empty_request("GET", &format!("/api/agents/{}", first)))
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["error"], "智能体不存在");
}
