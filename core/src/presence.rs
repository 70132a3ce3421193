/// Presence tracking: who is online right now, and what we know about them
use crate::api::ChatApi;
use crate::models::UserProfile;
use crate::utils::with_timeout;
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// Online set plus a profile cache.
///
/// The online set always mirrors the most recent `users:online` broadcast.
/// Profiles outlive presence: someone going offline keeps their cached
/// profile so the next broadcast does not trigger another lookup.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    local_id: Option<String>,
    online: BTreeSet<String>,
    profiles: HashMap<String, UserProfile>,
}

impl PresenceTracker {
    pub fn new(local_id: Option<String>) -> Self {
        Self {
            local_id,
            ..Self::default()
        }
    }

    pub fn set_local_identity(&mut self, local_id: Option<String>) {
        if let Some(id) = &local_id {
            self.online.remove(id);
        }
        self.local_id = local_id;
    }

    /// Replace the online set with `ids`, minus the local identity.
    ///
    /// Returns the ids that have no cached profile yet, in broadcast order.
    pub fn apply_broadcast(&mut self, ids: &[String]) -> Vec<String> {
        let local = self.local_id.as_deref();
        self.online = ids
            .iter()
            .filter(|id| Some(id.as_str()) != local)
            .cloned()
            .collect();

        let mut unknown = Vec::new();
        for id in ids {
            if Some(id.as_str()) != local
                && !self.profiles.contains_key(id)
                && !unknown.contains(id)
            {
                unknown.push(id.clone());
            }
        }
        debug!("{} online, {} to resolve", self.online.len(), unknown.len());
        unknown
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.online.contains(id)
    }

    /// Online identities other than ours, sorted
    pub fn online(&self) -> Vec<String> {
        self.online.iter().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    pub fn profile(&self, id: &str) -> Option<&UserProfile> {
        self.profiles.get(id)
    }

    pub fn insert_profile(&mut self, profile: UserProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    /// Fold a `user:updated` push into the cache
    pub fn apply_profile_update(&mut self, patch: &UserProfile) {
        self.profiles
            .entry(patch.id.clone())
            .and_modify(|profile| profile.merge(patch))
            .or_insert_with(|| patch.clone());
    }

    /// Profiles of everyone online whose details are known. Identities still
    /// unresolved are left out rather than blanking the list.
    pub fn online_profiles(&self) -> Vec<UserProfile> {
        self.online
            .iter()
            .filter_map(|id| self.profiles.get(id).cloned())
            .collect()
    }
}

/// Look up profiles concurrently.
///
/// Each lookup is bounded by `limit`. A failed lookup is logged and left
/// out; the rest of the batch still comes back.
pub async fn resolve_profiles(api: &dyn ChatApi, ids: &[String], limit: Duration) -> Vec<UserProfile> {
    let lookups = ids.iter().map(|id| async move {
        let result = with_timeout(limit, "profile lookup", api.fetch_user(id)).await;
        (id, result)
    });

    join_all(lookups)
        .await
        .into_iter()
        .filter_map(|(id, result)| match result {
            Ok(profile) => Some(profile),
            Err(e) => {
                warn!("Could not resolve profile for {}: {}", id, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_broadcast_replaces_set() {
        let mut presence = PresenceTracker::new(Some("me".to_string()));
        presence.apply_broadcast(&ids(&["a", "b", "me"]));
        assert_eq!(presence.online(), ids(&["a", "b"]));

        presence.apply_broadcast(&ids(&["c"]));
        assert_eq!(presence.online(), ids(&["c"]));
        assert!(!presence.is_online("a"));
    }

    #[test]
    fn test_broadcast_reports_unknown_ids_once() {
        let mut presence = PresenceTracker::new(Some("me".to_string()));
        presence.insert_profile(UserProfile::new("a"));

        let unknown = presence.apply_broadcast(&ids(&["a", "b", "b", "me", "c"]));
        assert_eq!(unknown, ids(&["b", "c"]));
    }

    #[test]
    fn test_local_identity_set_later_is_removed() {
        let mut presence = PresenceTracker::new(None);
        presence.apply_broadcast(&ids(&["me", "a"]));
        assert_eq!(presence.online_count(), 2);

        presence.set_local_identity(Some("me".to_string()));
        assert_eq!(presence.online(), ids(&["a"]));
    }

    #[test]
    fn test_online_profiles_skip_unresolved() {
        let mut presence = PresenceTracker::new(None);
        let mut ana = UserProfile::new("a");
        ana.name = Some("Ana".to_string());
        presence.insert_profile(ana);
        presence.apply_broadcast(&ids(&["a", "b"]));

        let profiles = presence.online_profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].display_name(), "Ana");
    }

    #[test]
    fn test_profile_update_merges() {
        let mut presence = PresenceTracker::new(None);
        let mut ana = UserProfile::new("a");
        ana.name = Some("Ana".to_string());
        presence.insert_profile(ana);

        let mut patch = UserProfile::new("a");
        patch.reputation = Some(42);
        presence.apply_profile_update(&patch);

        let profile = presence.profile("a").unwrap();
        assert_eq!(profile.name.as_deref(), Some("Ana"));
        assert_eq!(profile.reputation, Some(42));
    }
}
