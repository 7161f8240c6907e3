//! Broadcast command → confirm → fan-out, driven through the event
//! dispatch path the way a live session would run it.

mod common;

use std::time::Duration;

use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::json;

use common::{build_engine, update_from, OWNER_ID};
use vela_runtime::EngineEvent;

async fn wait_for_hits(mock: &httpmock::Mock<'_>, hits: usize) {
    for _ in 0..100 {
        if mock.calls_async().await >= hits {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("mock did not reach {hits} hits in time");
}

#[tokio::test]
async fn integration_broadcast_runs_to_completion_and_prunes_dead_recipients() {
    let server = MockServer::start_async().await;
    let engine = build_engine(&server);
    for user_id in [1_i64, 2, 3] {
        engine.store.upsert_user(user_id).await.expect("user");
    }
    engine.store.set_chat_admin(-5, true).await.expect("chat");

    let prompt = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/bottt/sendMessage")
                .json_body_includes(format!(r#"{{"chat_id": {OWNER_ID}}}"#));
            then.status(200).json_body(json!({
                "ok": true,
                "result": {"message_id": 50, "chat": {"id": OWNER_ID, "type": "private"}}
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/answerCallbackQuery");
            then.status(200).json_body(json!({"ok": true, "result": true}));
        })
        .await;
    let edits = server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/editMessageText");
            then.status(200).json_body(json!({
                "ok": true,
                "result": {"message_id": 50, "chat": {"id": OWNER_ID, "type": "private"}}
            }));
        })
        .await;
    // recipient 2 blocked the bot; everyone else is deliverable
    let blocked = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/bottt/sendMessage")
                .json_body_includes(r#"{"chat_id": 2}"#);
            then.status(403).json_body(json!({
                "ok": false,
                "error_code": 403,
                "description": "Forbidden: bot was blocked by the user"
            }));
        })
        .await;
    let mut delivered = Vec::new();
    for chat_id in [1_i64, 3, -5] {
        let partial = format!(r#"{{"chat_id": {chat_id}}}"#);
        delivered.push(
            server
                .mock_async(move |when, then| {
                    when.method(POST)
                        .path("/bottt/sendMessage")
                        .json_body_includes(partial);
                    then.status(200).json_body(json!({
                        "ok": true,
                        "result": {"message_id": 9, "chat": {"id": 1, "type": "private"}}
                    }));
                })
                .await,
        );
    }

    let command = update_from(json!({
        "update_id": 1,
        "message": {
            "message_id": 40,
            "chat": {"id": OWNER_ID, "type": "private"},
            "from": {"id": OWNER_ID, "is_bot": false, "first_name": "Owner"},
            "text": "/broadcast hello subscribers"
        }
    }));
    engine
        .runtime
        .dispatch(EngineEvent::Update(Box::new(command)))
        .await;
    prompt.assert_calls_async(1).await;

    let confirm = update_from(json!({
        "update_id": 2,
        "callback_query": {
            "id": "cb-confirm",
            "from": {"id": OWNER_ID, "is_bot": false, "first_name": "Owner"},
            "data": "broadcast_confirm:all",
            "message": {
                "message_id": 50,
                "chat": {"id": OWNER_ID, "type": "private"}
            }
        }
    }));
    engine
        .runtime
        .dispatch(EngineEvent::Update(Box::new(confirm)))
        .await;

    // kickoff edit happens inline; the completion edit arrives once the
    // spawned dispatch finishes
    wait_for_hits(&edits, 2).await;
    for mock in &delivered {
        mock.assert_calls_async(1).await;
    }
    blocked.assert_calls_async(1).await;

    engine.writer.flush().await;
    let users = engine.store.scan_users(i64::MIN, 10).await.expect("users");
    assert_eq!(users, vec![1, 3]);
}

#[tokio::test]
async fn integration_broadcast_cancel_clears_the_draft() {
    let server = MockServer::start_async().await;
    let engine = build_engine(&server);
    engine.store.upsert_user(1).await.expect("user");

    let prompt = server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/sendMessage");
            then.status(200).json_body(json!({
                "ok": true,
                "result": {"message_id": 50, "chat": {"id": OWNER_ID, "type": "private"}}
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/answerCallbackQuery");
            then.status(200).json_body(json!({"ok": true, "result": true}));
        })
        .await;
    let edits = server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/editMessageText");
            then.status(200).json_body(json!({
                "ok": true,
                "result": {"message_id": 50, "chat": {"id": OWNER_ID, "type": "private"}}
            }));
        })
        .await;

    let command = update_from(json!({
        "update_id": 1,
        "message": {
            "message_id": 40,
            "chat": {"id": OWNER_ID, "type": "private"},
            "from": {"id": OWNER_ID, "is_bot": false, "first_name": "Owner"},
            "text": "/broadcast soon to be cancelled"
        }
    }));
    engine
        .runtime
        .dispatch(EngineEvent::Update(Box::new(command)))
        .await;
    let cancel = update_from(json!({
        "update_id": 2,
        "callback_query": {
            "id": "cb-cancel",
            "from": {"id": OWNER_ID, "is_bot": false, "first_name": "Owner"},
            "data": "broadcast_cancel",
            "message": {
                "message_id": 50,
                "chat": {"id": OWNER_ID, "type": "private"}
            }
        }
    }));
    engine
        .runtime
        .dispatch(EngineEvent::Update(Box::new(cancel)))
        .await;

    prompt.assert_calls_async(1).await;
    edits.assert_calls_async(1).await;

    // confirming after a cancel has nothing to dispatch: no recipient
    // sends, no further edits
    let confirm = update_from(json!({
        "update_id": 3,
        "callback_query": {
            "id": "cb-late",
            "from": {"id": OWNER_ID, "is_bot": false, "first_name": "Owner"},
            "data": "broadcast_confirm:all",
            "message": {
                "message_id": 50,
                "chat": {"id": OWNER_ID, "type": "private"}
            }
        }
    }));
    engine
        .runtime
        .dispatch(EngineEvent::Update(Box::new(confirm)))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    // the kickoff edit still happens, but no recipient traffic follows
    assert!(edits.calls_async().await <= 2);
    prompt.assert_calls_async(1).await;
}
