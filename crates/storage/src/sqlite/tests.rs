use std::time::Duration;

use tokio::sync::mpsc;

use super::*;
use crate::{ChatBackend, StorageError};

type Inbox<T> = mpsc::UnboundedReceiver<Vec<T>>;

fn forwarding<T: Send + 'static>() -> (SnapshotCallback<T>, Inbox<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let callback: SnapshotCallback<T> = Box::new(move |snapshot| {
        let _ = sender.send(snapshot);
    });
    (callback, receiver)
}

async fn next_snapshot<T>(inbox: &mut Inbox<T>) -> Vec<T> {
    tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("snapshot arrives in time")
        .expect("subscription still open")
}

async fn backend() -> SqliteBackend {
    SqliteBackend::open_in_memory()
        .await
        .expect("in-memory backend opens")
}

#[tokio::test]
async fn created_chat_shows_up_in_next_snapshot_with_equal_timestamps() {
    let backend = backend().await;
    let (callback, mut inbox) = forwarding();
    let _subscription = backend
        .subscribe_conversations(callback)
        .await
        .expect("subscribe");

    assert!(next_snapshot(&mut inbox).await.is_empty());

    let created = backend
        .create_conversation(NewConversation::new("  Team  ", "alice"))
        .await
        .expect("create");

    let snapshot = next_snapshot(&mut inbox).await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, created.id);
    assert_eq!(snapshot[0].name, "Team");
    assert_eq!(snapshot[0].created_at, snapshot[0].updated_at);
    assert_eq!(
        snapshot[0].participants.iter().collect::<Vec<_>>(),
        vec!["alice"]
    );
}

#[tokio::test]
async fn blank_names_are_rejected_without_writing() {
    let backend = backend().await;

    let error = backend
        .create_conversation(NewConversation::new("   ", "alice"))
        .await
        .expect_err("blank name rejected");
    assert!(error.is_validation());

    let created = backend
        .create_conversation(NewConversation::new("General", "alice"))
        .await
        .expect("create");
    let error = backend
        .rename_conversation(created.id, "\t")
        .await
        .expect_err("blank rename rejected");
    assert!(error.is_validation());

    let listed = backend.list_conversations().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "General");
}

#[tokio::test]
async fn sent_messages_arrive_in_creation_order() {
    let backend = backend().await;
    let chat = backend
        .create_conversation(NewConversation::new("Ordering", "alice"))
        .await
        .expect("create");

    for index in 0..25 {
        backend
            .send_message(chat.id, &format!("message {index}"), "alice")
            .await
            .expect("send");
    }

    let (callback, mut inbox) = forwarding();
    let _subscription = backend
        .subscribe_messages(chat.id, callback)
        .await
        .expect("subscribe");
    let messages = next_snapshot(&mut inbox).await;

    assert_eq!(messages.len(), 25);
    assert!(
        messages
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at)
    );
    assert_eq!(messages[0].content, "message 0");
    assert_eq!(messages[24].content, "message 24");
}

#[tokio::test]
async fn sent_message_is_stored_trimmed() {
    let backend = backend().await;
    let chat = backend
        .create_conversation(NewConversation::new("Team", "alice"))
        .await
        .expect("create");

    let outcome = backend
        .send_message(chat.id, "  hello there \n", " bob ")
        .await
        .expect("send");

    assert_eq!(outcome.message.content, "hello there");
    assert_eq!(outcome.message.username, "bob");
    let stored = backend.list_messages(chat.id).await.expect("list");
    assert_eq!(stored[0].content, "hello there");
    let chat = backend
        .get_conversation(chat.id)
        .await
        .expect("get")
        .expect("chat exists");
    assert!(chat.participants.contains("bob"));
}

#[tokio::test]
async fn empty_message_is_rejected_before_insert() {
    let backend = backend().await;
    let chat = backend
        .create_conversation(NewConversation::new("Quiet", "alice"))
        .await
        .expect("create");

    let error = backend
        .send_message(chat.id, "  \n ", "alice")
        .await
        .expect_err("blank content rejected");

    assert!(matches!(
        error,
        StorageError::EmptyField {
            field: "message content",
            ..
        }
    ));
    assert!(backend.list_messages(chat.id).await.expect("list").is_empty());
}

#[tokio::test]
async fn rename_bumps_updated_at_and_moves_chat_to_head() {
    let backend = backend().await;
    let first = backend
        .create_conversation(NewConversation::new("First", "alice"))
        .await
        .expect("create first");
    let second = backend
        .create_conversation(NewConversation::new("Second", "alice"))
        .await
        .expect("create second");

    let before = backend.list_conversations().await.expect("list");
    assert_eq!(before[0].id, second.id);

    let renamed = backend
        .rename_conversation(first.id, "Renamed")
        .await
        .expect("rename");

    assert_eq!(renamed.name, "Renamed");
    assert!(renamed.updated_at > first.updated_at);
    assert_eq!(renamed.created_at, first.created_at);

    let after = backend.list_conversations().await.expect("list");
    assert_eq!(after[0].id, first.id);
    assert_eq!(after[1].id, second.id);
}

#[tokio::test]
async fn sending_touches_parent_chat_and_records_participant() {
    let backend = backend().await;
    let older = backend
        .create_conversation(NewConversation::new("Older", "alice"))
        .await
        .expect("create older");
    let newer = backend
        .create_conversation(NewConversation::new("Newer", "alice"))
        .await
        .expect("create newer");

    let outcome = backend
        .send_message(older.id, "bump", "bob")
        .await
        .expect("send");
    assert!(outcome.conversation_touched);
    assert_eq!(outcome.message.role, Some(MessageRole::User));

    let listed = backend.list_conversations().await.expect("list");
    assert_eq!(listed[0].id, older.id);
    assert_eq!(listed[1].id, newer.id);
    assert!(listed[0].participants.contains("bob"));
    assert!(listed[0].participants.contains("alice"));
}

#[tokio::test]
async fn delete_cascades_to_messages_and_empties_live_thread() {
    let backend = backend().await;
    let chat = backend
        .create_conversation(NewConversation::new("Doomed", "alice"))
        .await
        .expect("create");
    backend
        .send_message(chat.id, "soon gone", "alice")
        .await
        .expect("send");

    let (callback, mut inbox) = forwarding();
    let _subscription = backend
        .subscribe_messages(chat.id, callback)
        .await
        .expect("subscribe");
    assert_eq!(next_snapshot(&mut inbox).await.len(), 1);

    backend.delete_conversation(chat.id).await.expect("delete");

    assert!(next_snapshot(&mut inbox).await.is_empty());
    assert!(backend.list_messages(chat.id).await.expect("list").is_empty());
    assert!(
        backend
            .get_conversation(chat.id)
            .await
            .expect("get")
            .is_none()
    );

    let orphaned = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages")
        .fetch_one(&backend.pool)
        .await
        .expect("count");
    assert_eq!(orphaned, 0);
}

#[tokio::test]
async fn operations_on_missing_chat_report_not_found() {
    let backend = backend().await;
    let missing = ConversationId::new_v7();

    let rename = backend
        .rename_conversation(missing, "Anything")
        .await
        .expect_err("rename missing");
    let delete = backend
        .delete_conversation(missing)
        .await
        .expect_err("delete missing");
    let send = backend
        .send_message(missing, "hello", "alice")
        .await
        .expect_err("send to missing");

    assert!(rename.is_not_found());
    assert!(delete.is_not_found());
    assert!(send.is_not_found());
}

#[tokio::test]
async fn team_scenario_lists_messages_with_senders_in_order() {
    let backend = backend().await;
    let team = backend
        .create_conversation(NewConversation::new("Team", "alice"))
        .await
        .expect("create");
    backend
        .send_message(team.id, "hi", "alice")
        .await
        .expect("send hi");
    backend
        .send_message(team.id, "yo", "bob")
        .await
        .expect("send yo");

    let (callback, mut inbox) = forwarding();
    let _subscription = backend
        .subscribe_messages(team.id, callback)
        .await
        .expect("subscribe");
    let thread = next_snapshot(&mut inbox)
        .await
        .into_iter()
        .map(|message| (message.content, message.username))
        .collect::<Vec<_>>();

    assert_eq!(
        thread,
        vec![
            ("hi".to_string(), "alice".to_string()),
            ("yo".to_string(), "bob".to_string()),
        ]
    );
}

#[tokio::test]
async fn released_subscriptions_stop_delivering_and_are_counted() {
    let backend = backend().await;
    let (callback, mut inbox) = forwarding();
    let subscription = backend
        .subscribe_conversations(callback)
        .await
        .expect("subscribe");
    let _initial = next_snapshot(&mut inbox).await;
    assert_eq!(backend.active_subscriptions(), 1);

    subscription.unsubscribe();
    assert_eq!(backend.active_subscriptions(), 0);

    backend
        .create_conversation(NewConversation::new("After", "alice"))
        .await
        .expect("create");

    // The listener task is gone, so the channel closes without another snapshot.
    let next = tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("channel settles");
    assert!(next.is_none());
}

#[tokio::test]
async fn messages_subscription_ignores_other_chats() {
    let backend = backend().await;
    let watched = backend
        .create_conversation(NewConversation::new("Watched", "alice"))
        .await
        .expect("create watched");
    let other = backend
        .create_conversation(NewConversation::new("Other", "alice"))
        .await
        .expect("create other");

    let (callback, mut inbox) = forwarding();
    let _subscription = backend
        .subscribe_messages(watched.id, callback)
        .await
        .expect("subscribe");
    assert!(next_snapshot(&mut inbox).await.is_empty());

    backend
        .send_message(other.id, "elsewhere", "alice")
        .await
        .expect("send other");
    backend
        .send_message(watched.id, "here", "alice")
        .await
        .expect("send watched");

    let snapshot = next_snapshot(&mut inbox).await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].content, "here");
}

#[tokio::test]
async fn reopened_database_keeps_data_and_clock_moves_forward() {
    let directory = std::env::temp_dir().join(format!("parlor-storage-{}", uuid::Uuid::now_v7()));
    let path = directory.join("nested").join("chat.db");
    let location = path.display().to_string();

    let created = {
        let backend = SqliteBackend::open(&location).await.expect("first open");
        let created = backend
            .create_conversation(NewConversation::new("Durable", "alice"))
            .await
            .expect("create");
        backend.pool.close().await;
        created
    };

    let reopened = SqliteBackend::open(&location).await.expect("second open");
    let listed = reopened.list_conversations().await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);

    let renamed = reopened
        .rename_conversation(created.id, "Still durable")
        .await
        .expect("rename");
    assert!(renamed.updated_at > created.updated_at);

    drop(reopened);
    let _ = std::fs::remove_dir_all(directory);
}
