//! End-to-end moderation flows driven through the engine's event dispatch.

mod common;

use httpmock::Method::POST;
use httpmock::MockServer;
use serde_json::json;

use common::{build_engine, group_message, update_from, BOT_ID};
use vela_runtime::EngineEvent;

async fn mock_member<'a>(
    server: &'a MockServer,
    chat_id: i64,
    user_id: i64,
    status: &str,
) -> httpmock::Mock<'a> {
    let body = json!({
        "ok": true,
        "result": {
            "user": {"id": user_id, "is_bot": user_id == BOT_ID, "first_name": "x"},
            "status": status
        }
    });
    let partial = format!(r#"{{"chat_id": {chat_id}, "user_id": {user_id}}}"#);
    server
        .mock_async(move |when, then| {
            when.method(POST)
                .path("/bottt/getChatMember")
                .json_body_includes(partial);
            then.status(200).json_body(body);
        })
        .await
}

#[tokio::test]
async fn integration_escalation_scenario_deletes_warns_and_mutes_once() {
    let server = MockServer::start_async().await;
    let engine = build_engine(&server);
    mock_member(&server, -100, BOT_ID, "administrator").await;
    mock_member(&server, -100, 5, "member").await;
    let delete = server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/deleteMessage");
            then.status(200).json_body(json!({"ok": true, "result": true}));
        })
        .await;
    let notice = server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/sendMessage");
            then.status(200).json_body(json!({
                "ok": true,
                "result": {"message_id": 321, "chat": {"id": -100, "type": "supergroup"}}
            }));
        })
        .await;
    let restrict = server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/restrictChatMember");
            then.status(200).json_body(json!({"ok": true, "result": true}));
        })
        .await;

    for update_id in 1..=3 {
        engine
            .runtime
            .dispatch(EngineEvent::Update(Box::new(group_message(
                update_id,
                -100,
                5,
                "spam https://spam.example",
            ))))
            .await;
    }
    delete.assert_calls_async(3).await;
    restrict.assert_calls_async(1).await;
    // two removal warnings plus one mute announcement
    notice.assert_calls_async(3).await;

    // a violation while the mute window is open: deleted, counted as
    // muted, but no further notice and no second restriction call
    engine
        .runtime
        .dispatch(EngineEvent::Update(Box::new(group_message(
            4,
            -100,
            5,
            "again https://spam.example",
        ))))
        .await;
    delete.assert_calls_async(4).await;
    restrict.assert_calls_async(1).await;
    notice.assert_calls_async(3).await;
}

#[tokio::test]
async fn integration_clean_and_admin_messages_are_untouched() {
    let server = MockServer::start_async().await;
    let engine = build_engine(&server);
    mock_member(&server, -100, BOT_ID, "administrator").await;
    mock_member(&server, -100, 6, "administrator").await;
    let delete = server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/deleteMessage");
            then.status(200).json_body(json!({"ok": true, "result": true}));
        })
        .await;

    engine
        .runtime
        .dispatch(EngineEvent::Update(Box::new(group_message(
            1,
            -100,
            5,
            "no links here",
        ))))
        .await;
    engine
        .runtime
        .dispatch(EngineEvent::Update(Box::new(group_message(
            2,
            -100,
            6,
            "admin sharing https://ok.example",
        ))))
        .await;

    delete.assert_calls_async(0).await;
}

#[tokio::test]
async fn integration_promotion_cancels_reminder_sequence() {
    let server = MockServer::start_async().await;
    let engine = build_engine(&server);
    let send = server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/sendMessage");
            then.status(200).json_body(json!({
                "ok": true,
                "result": {"message_id": 11, "chat": {"id": -100, "type": "supergroup"}}
            }));
        })
        .await;

    let added = update_from(json!({
        "update_id": 1,
        "my_chat_member": {
            "chat": {"id": -100, "type": "supergroup"},
            "from": {"id": 1, "is_bot": false, "first_name": "Ada"},
            "old_chat_member": {
                "user": {"id": BOT_ID, "is_bot": true, "first_name": "Vela"},
                "status": "left"
            },
            "new_chat_member": {
                "user": {"id": BOT_ID, "is_bot": true, "first_name": "Vela"},
                "status": "member"
            }
        }
    }));
    engine
        .runtime
        .dispatch(EngineEvent::Update(Box::new(added)))
        .await;
    assert_eq!(engine.scheduler.pending_jobs(), 6);

    let promoted = update_from(json!({
        "update_id": 2,
        "my_chat_member": {
            "chat": {"id": -100, "type": "supergroup"},
            "from": {"id": 1, "is_bot": false, "first_name": "Ada"},
            "old_chat_member": {
                "user": {"id": BOT_ID, "is_bot": true, "first_name": "Vela"},
                "status": "member"
            },
            "new_chat_member": {
                "user": {"id": BOT_ID, "is_bot": true, "first_name": "Vela"},
                "status": "administrator"
            }
        }
    }));
    engine
        .runtime
        .dispatch(EngineEvent::Update(Box::new(promoted)))
        .await;

    // the reminder/auto-leave set is gone; only the welcome notice-delete
    // job survives
    assert_eq!(engine.scheduler.pending_jobs(), 1);
    send.assert_calls_async(2).await;
}

#[tokio::test]
async fn integration_chat_migration_moves_persisted_state() {
    let server = MockServer::start_async().await;
    let engine = build_engine(&server);
    engine.store.set_chat_admin(-100, true).await.expect("seed");
    engine
        .store
        .upsert_spam_counter(
            -100,
            5,
            vela_store::SpamCounterRow {
                count: 1,
                last_violation_unix: vela_core::current_unix_timestamp(),
            },
        )
        .await
        .expect("seed counter");

    server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/bottt/getChatMember")
                .json_body_includes(r#"{"chat_id": -100}"#);
            then.status(400).json_body(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: group chat was upgraded to a supergroup chat",
                "parameters": {"migrate_to_chat_id": -200}
            }));
        })
        .await;
    mock_member(&server, -200, BOT_ID, "administrator").await;
    mock_member(&server, -200, 5, "member").await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/deleteMessage");
            then.status(200).json_body(json!({"ok": true, "result": true}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/bottt/sendMessage");
            then.status(200).json_body(json!({
                "ok": true,
                "result": {"message_id": 321, "chat": {"id": -200, "type": "supergroup"}}
            }));
        })
        .await;

    engine
        .runtime
        .dispatch(EngineEvent::Update(Box::new(group_message(
            1,
            -100,
            5,
            "link https://spam.example",
        ))))
        .await;

    engine.writer.flush().await;
    // nothing remains under the old identity; the counter moved and then
    // advanced under the new one
    let chats = engine
        .store
        .scan_chats(i64::MIN, 10, false)
        .await
        .expect("chats");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].chat_id, -200);
    assert!(engine
        .store
        .fetch_spam_counter(-100, 5)
        .await
        .expect("old counter")
        .is_none());
    assert_eq!(
        engine
            .store
            .fetch_spam_counter(-200, 5)
            .await
            .expect("new counter")
            .map(|row| row.count),
        Some(2)
    );
}
