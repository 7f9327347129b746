use std::sync::Arc;
use std::time::Duration;

use chatsync::chatsync::test_utils::*;
use chatsync::{
    Address, Anchor, ChatSync, ChatSyncConfig, GroupId, MessageListParams, Notification,
    RawItem, Scope, SessionServices, SessionState, StorageAdapter,
};
use tempfile::TempDir;

fn fast_config(data_dir: &TempDir, logs_dir: &TempDir) -> ChatSyncConfig {
    let mut config = ChatSyncConfig::new(data_dir.path(), logs_dir.path());
    config.scheduler.sleep_interval = Duration::from_millis(50);
    config.event_source.empty_page_cooldown = Duration::from_millis(200);
    config.event_source.flush_interval = Duration::from_millis(100);
    config.output_sending.public_key_retry = Duration::from_millis(300);
    config.output_sending.check_public_key_sleep = Duration::from_millis(10);
    config.output_sending.join_group_sleep = Duration::from_millis(10);
    config
}

fn services_over(chat_sync: &ChatSync, fakes: &TestServices) -> SessionServices {
    let storage: Arc<dyn StorageAdapter> = chat_sync
        .durable_storage()
        .expect("initialized with a durable store");
    SessionServices {
        storage,
        ..fakes.services()
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_syncs_into_sqlite_and_survives_address_switch() {
    let data_dir = TempDir::new().unwrap();
    let logs_dir = TempDir::new().unwrap();
    let chat_sync = ChatSync::initialize(fast_config(&data_dir, &logs_dir))
        .await
        .unwrap();
    let group = GroupId::from("g1");

    let fakes = TestServices::new();
    let mut items: Vec<RawItem> = Vec::new();
    for n in 1..=160u64 {
        let output_id = format!("o{n}");
        fakes
            .resolver
            .add(&output_id, test_message(&format!("m{n:03}"), "g1", "0xfriend", n));
        items.push(message_ref(&output_id, "g1"));
    }
    items.push(member_changed("g1", "0xfriend"));
    fakes.upstream.push_page(items, Some("c1"));
    fakes.group_data.set_members("g1", &["0xme", "0xfriend"]);

    let session = chat_sync
        .switch_address(Address::from("0xme"), services_over(&chat_sync, &fakes))
        .await
        .unwrap();

    eventually("all messages appended", || async {
        session
            .get_message_list(&MessageListParams::latest("g1", 500))
            .await
            .map(|page| page.message_ids.len() == 160)
            .unwrap_or(false)
    })
    .await;
    eventually("membership refreshed", || async {
        matches!(session.get_group_members(&group).await, Ok(Some(_)))
    })
    .await;

    let page = session
        .get_message_list(&MessageListParams::latest("g1", 500))
        .await
        .unwrap();
    let expected: Vec<String> = (1..=160u64).map(|n| format!("m{n:03}")).collect();
    assert_eq!(page.message_ids, expected);
    assert!(page.reached_start);
    let head = session.conversation().head(&group).await.unwrap();
    assert_eq!(head.len(), 60);
    assert!(head.next_key.is_some());

    // Switch away and back with a fresh upstream
    let other = TestServices::new();
    chat_sync
        .switch_address(Address::from("0xother"), services_over(&chat_sync, &other))
        .await
        .unwrap();
    assert_eq!(session.state().await, SessionState::Destroyed);

    let returning = TestServices::new();
    let restored = chat_sync
        .switch_address(Address::from("0xme"), services_over(&chat_sync, &returning))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&session, &restored));

    eventually("resumed pull", || async { returning.upstream.fetch_count() > 0 }).await;
    assert_eq!(
        returning.upstream.cursors_seen.lock()[0],
        Some(Anchor("c1".to_string()))
    );

    let page = restored
        .get_message_list(&MessageListParams::latest("g1", 500))
        .await
        .unwrap();
    assert_eq!(page.message_ids, expected);
    assert_eq!(restored.pending_count().await, 0);

    chat_sync.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_waits_for_public_key_bootstrap() {
    let data_dir = TempDir::new().unwrap();
    let logs_dir = TempDir::new().unwrap();
    let chat_sync = ChatSync::initialize(fast_config(&data_dir, &logs_dir))
        .await
        .unwrap();

    let fakes = TestServices::new();
    fakes
        .outbound
        .publish_key_on_probe
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let session = chat_sync
        .switch_address(Address::from("0xme"), services_over(&chat_sync, &fakes))
        .await
        .unwrap();
    let mut global = session.subscribe(Scope::Global);
    session.join_group(GroupId::from("g7"));

    eventually("group joined", || async {
        !fakes.outbound.joined.lock().is_empty()
    })
    .await;

    assert_eq!(*fakes.outbound.joined.lock(), vec![GroupId::from("g7")]);
    assert!(fakes.outbound.probes.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    let mut announced = Vec::new();
    while let Some(notification) = global.try_recv() {
        if let Notification::PublicKeyAvailability { available } = notification {
            announced.push(available);
        }
    }
    assert_eq!(announced.last(), Some(&true));

    chat_sync.shutdown().await.unwrap();
}
