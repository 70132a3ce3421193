/// Presence and profile tracking through the chat client
mod common;

use common::{eventually, loopback_manager, test_config, wait_for_state, FakeApi, Remote, WAIT};
use helplink_core::models::{Post, UserProfile};
use helplink_core::protocol::{ClientEvent, ServerEvent};
use helplink_core::realtime::ConnectionState;
use helplink_core::{ChatClient, SyncUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn started(me: &str) -> (ChatClient, Arc<FakeApi>, Remote) {
    let (manager, _connector, mut remotes) = loopback_manager(test_config());
    let api = FakeApi::new(me);
    let client = ChatClient::new(test_config(), manager.clone(), api.clone());
    client.start(me);

    let mut remote = remotes.accept().await;
    assert_eq!(remote.next_event().await, ClientEvent::Join(me.to_string()));
    wait_for_state(&manager, ConnectionState::Connected).await;
    (client, api, remote)
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn lookups(api: &FakeApi) -> usize {
    api.calls().iter().filter(|c| *c == "fetch_user").count()
}

#[tokio::test]
async fn test_broadcast_replaces_online_set_without_self() {
    let (client, _api, remote) = started("me").await;

    remote.push(&ServerEvent::UsersOnline(ids(&["u1", "me", "u2"]))).await;
    eventually("first broadcast", || client.online() == ids(&["u1", "u2"])).await;
    assert!(!client.is_online("me"));

    remote.push(&ServerEvent::UsersOnline(ids(&["u3"]))).await;
    eventually("second broadcast", || client.online() == ids(&["u3"])).await;
    assert!(!client.is_online("u1"));

    remote.push(&ServerEvent::UsersOnline(Vec::new())).await;
    eventually("empty broadcast", || client.online().is_empty()).await;
}

#[tokio::test]
async fn test_failed_lookup_does_not_block_the_rest() {
    let (client, api, remote) = started("me").await;
    api.add_profile("u1", "Ana");
    api.fail_profile("u2");

    remote.push(&ServerEvent::UsersOnline(ids(&["u1", "u2"]))).await;
    eventually("u1 resolved", || client.profile("u1").is_some()).await;

    assert_eq!(client.online(), ids(&["u1", "u2"]));
    assert!(client.profile("u2").is_none());
    let profiles = client.online_profiles();
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0].display_name(), "Ana");
}

#[tokio::test]
async fn test_cached_profiles_are_not_fetched_again() {
    let (client, api, remote) = started("me").await;
    api.add_profile("u1", "Ana");

    remote.push(&ServerEvent::UsersOnline(ids(&["u1"]))).await;
    eventually("u1 resolved", || client.profile("u1").is_some()).await;
    assert_eq!(lookups(&api), 1);

    // Gone and back again: the profile outlived the presence
    remote.push(&ServerEvent::UsersOnline(Vec::new())).await;
    remote.push(&ServerEvent::UsersOnline(ids(&["u1"]))).await;
    eventually("u1 back", || client.is_online("u1")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(lookups(&api), 1);
}

#[tokio::test]
async fn test_presence_changes_are_published() {
    let (client, _api, remote) = started("me").await;
    let mut updates = client.updates();

    remote.push(&ServerEvent::UsersOnline(ids(&["u2", "u1"]))).await;
    let online = timeout(WAIT, async {
        loop {
            if let Ok(SyncUpdate::PresenceChanged { online }) = updates.recv().await {
                return online;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(online, ids(&["u1", "u2"]));
}

#[tokio::test]
async fn test_profile_update_merges_into_cache() {
    let (client, api, remote) = started("me").await;
    api.add_profile("u1", "Ana");
    remote.push(&ServerEvent::UsersOnline(ids(&["u1"]))).await;
    eventually("u1 resolved", || client.profile("u1").is_some()).await;

    let mut patch = UserProfile::new("u1");
    patch.bio = Some("Happy to walk dogs".to_string());
    remote.push(&ServerEvent::UserUpdated(patch)).await;

    eventually("bio merged", || {
        client.profile("u1").is_some_and(|p| p.bio.is_some())
    })
    .await;
    let profile = client.profile("u1").unwrap();
    assert_eq!(profile.display_name(), "Ana");
    assert_eq!(profile.bio.as_deref(), Some("Happy to walk dogs"));
}

#[tokio::test]
async fn test_post_updates_merge_into_tracked_posts() {
    let (client, _api, remote) = started("me").await;
    client.track_post(Post {
        id: "p1".to_string(),
        title: Some("Need help moving".to_string()),
        status: Some("open".to_string()),
        extra: serde_json::Map::new(),
    });

    remote
        .push(&ServerEvent::PostUpdated(Post {
            id: "p1".to_string(),
            title: None,
            status: Some("in_progress".to_string()),
            extra: serde_json::Map::new(),
        }))
        .await;

    eventually("status merged", || {
        client
            .post("p1")
            .is_some_and(|p| p.status.as_deref() == Some("in_progress"))
    })
    .await;
    assert_eq!(
        client.post("p1").unwrap().title.as_deref(),
        Some("Need help moving")
    );
}
