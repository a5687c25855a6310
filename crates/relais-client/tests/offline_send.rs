mod common;

use std::sync::Arc;

use relais_client::ChatSession;
use relais_shared::{
    Channel, ChatEvent, Cid, EventPayload, Member, Message, SyncStatus, User,
};
use relais_store::{CachedRepository, Database, Repository, SqliteRepository};

use common::{fast_config, InMemoryBackend, InstantUploader};

fn general() -> Channel {
    let mut channel = Channel::new("messaging", "general");
    channel.upsert_member(Member::new(User::new("alice")));
    channel.upsert_member(Member::new(User::new("bob")));
    channel
}

fn connected() -> ChatEvent {
    ChatEvent::global(EventPayload::Connected {
        user: User::new("alice"),
        connection_id: "conn-1".into(),
    })
}

fn draft(text: &str) -> Message {
    Message {
        text: text.into(),
        ..Default::default()
    }
}

async fn open(backend: Arc<InMemoryBackend>, repository: Arc<dyn Repository>) -> ChatSession {
    ChatSession::open(
        User::new("alice"),
        fast_config(),
        repository,
        backend,
        Arc::new(InstantUploader),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn offline_message_is_delivered_after_reconnect() {
    let backend = InMemoryBackend::with_channel(general());
    let repository: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
    let session = open(Arc::clone(&backend), Arc::clone(&repository)).await;
    let cid = Cid::new("messaging", "general");

    let channel = session.watch_channel(&cid).await.unwrap();
    let pending = session.send_message(&cid, draft("sent while offline")).await.unwrap();

    assert!(!pending.id.is_empty());
    assert_eq!(pending.cid, "messaging:general");
    assert_eq!(pending.sync_status, SyncStatus::SyncNeeded);
    let stored = repository.select_message(&pending.id).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::SyncNeeded);
    assert_eq!(channel.last_message().unwrap().id, pending.id);
    assert!(backend.sent_ids().is_empty());

    session.handle_event(connected()).await.unwrap();
    session.flush_events().await.unwrap();
    session.wait_for_sync().await;

    assert_eq!(backend.sent_ids(), vec![pending.id.clone()]);
    let stored = repository.select_message(&pending.id).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Completed);
    assert!(stored.created_at.is_some());

    let last = channel.last_message().unwrap();
    assert_eq!(last.id, pending.id);
    assert_eq!(last.sync_status, SyncStatus::Completed);
    assert!(channel.snapshot().members.contains_key("bob"));
}

#[tokio::test]
async fn rejected_message_stays_visible_as_failed() {
    let backend = InMemoryBackend::with_channel(general());
    backend.reject_text("forbidden");
    let repository: Arc<dyn Repository> = Arc::new(SqliteRepository::open_in_memory().unwrap());
    let session = open(Arc::clone(&backend), Arc::clone(&repository)).await;
    let cid = Cid::new("messaging", "general");

    session.handle_event(connected()).await.unwrap();
    session.flush_events().await.unwrap();
    session.wait_for_sync().await;
    let channel = session.watch_channel(&cid).await.unwrap();

    let mut message = draft("forbidden");
    message.id = "m-forbidden".into();
    let err = session.send_message(&cid, message).await.unwrap_err();
    assert!(err.is_permanent());

    let visible = channel.message("m-forbidden").await.unwrap();
    assert_eq!(visible.sync_status, SyncStatus::FailedPermanently);
}

#[tokio::test]
async fn pending_message_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alice.db");
    let backend = InMemoryBackend::with_channel(general());
    let cid = Cid::new("messaging", "general");

    let first_run = {
        let repository: Arc<dyn Repository> = Arc::new(CachedRepository::new(
            SqliteRepository::new(Database::open_at(&path).unwrap()),
            16,
            16,
        ));
        let session = open(Arc::clone(&backend), repository).await;
        let pending = session.send_message(&cid, draft("before restart")).await.unwrap();
        session.shutdown().await.unwrap();
        pending
    };

    let repository: Arc<dyn Repository> = Arc::new(SqliteRepository::new(Database::open_at(&path).unwrap()));
    let session = open(Arc::clone(&backend), Arc::clone(&repository)).await;
    session.handle_event(connected()).await.unwrap();
    session.flush_events().await.unwrap();
    session.wait_for_sync().await;

    assert_eq!(backend.sent_ids(), vec![first_run.id.clone()]);
    let stored = repository.select_message(&first_run.id).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Completed);
}
