use super::*;
use crate::state::test_helpers::test_app_state;

fn entry(name: &str, online: bool) -> RosterEntry {
    RosterEntry { user_id: Uuid::new_v4(), display_name: name.to_string(), avatar_url: None, online }
}

// =============================================================================
// ONLINE TRANSITIONS
// =============================================================================

#[tokio::test]
async fn first_connection_comes_online() {
    let state = test_app_state();
    let user = Uuid::new_v4();

    assert!(mark_online(&state, user).await);
    assert!(is_online(&state, user).await);
}

#[tokio::test]
async fn second_connection_is_silent() {
    let state = test_app_state();
    let user = Uuid::new_v4();

    assert!(mark_online(&state, user).await);
    assert!(!mark_online(&state, user).await);
}

#[tokio::test]
async fn offline_only_after_last_connection() {
    let state = test_app_state();
    let user = Uuid::new_v4();

    mark_online(&state, user).await;
    mark_online(&state, user).await;

    assert!(!mark_offline(&state, user).await);
    assert!(is_online(&state, user).await);
    assert!(mark_offline(&state, user).await);
    assert!(!is_online(&state, user).await);
}

#[tokio::test]
async fn offline_for_unknown_user_is_noop() {
    let state = test_app_state();
    assert!(!mark_offline(&state, Uuid::new_v4()).await);
}

#[tokio::test]
async fn online_subset_filters() {
    let state = test_app_state();
    let here = Uuid::new_v4();
    let away = Uuid::new_v4();
    mark_online(&state, here).await;

    let subset = online_subset(&state, &[here, away]).await;
    assert!(subset.contains(&here));
    assert!(!subset.contains(&away));
}

// =============================================================================
// ROSTER ORDERING
// =============================================================================

#[test]
fn online_sorts_before_offline() {
    let mut roster = vec![entry("zoe", false), entry("amir", true)];
    sort_roster(&mut roster);
    assert_eq!(roster[0].display_name, "amir");
    assert!(roster[0].online);
}

#[test]
fn same_presence_sorts_by_name() {
    let mut roster = vec![entry("carol", true), entry("Bob", true), entry("alice", true)];
    sort_roster(&mut roster);
    let names: Vec<_> = roster.iter().map(|e| e.display_name.as_str()).collect();
    assert_eq!(names, vec!["alice", "Bob", "carol"]);
}

#[test]
fn offline_block_is_ordered_too() {
    let mut roster = vec![
        entry("dana", false),
        entry("bea", true),
        entry("abe", false),
        entry("cal", true),
    ];
    sort_roster(&mut roster);
    let names: Vec<_> = roster.iter().map(|e| e.display_name.as_str()).collect();
    assert_eq!(names, vec!["bea", "cal", "abe", "dana"]);
}
