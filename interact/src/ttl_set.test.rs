use super::*;
use crate::entities::ActorIdentity;
use crate::test_utils::next_event;

use assert_matches::assert_matches;

fn actors(ttl: Duration) -> ExpiringSet<ActorIdentity> {
    ExpiringSet::with_equality(ttl, |a: &ActorIdentity, b: &ActorIdentity| a.same_actor(b)).unwrap()
}

fn actor(id: &str) -> ActorIdentity {
    ActorIdentity::new(id, "test")
}

fn ids(values: &[ActorIdentity]) -> Vec<&str> {
    let mut ids: Vec<&str> = values.iter().map(|value| value.id.as_str()).collect();
    ids.sort_unstable();
    ids
}

#[test_log::test(tokio::test)]
async fn test_entries_expire() {
    let set = actors(Duration::from_millis(200));
    assert!(set.add(actor("1"), None));
    assert!(set.add(actor("2"), None));
    assert!(set.add(actor("3"), Some(Duration::from_millis(1000))));
    let mut events = set.subscribe();

    tokio::time::sleep(Duration::from_millis(250)).await;

    let alive = set.snapshot();
    assert_eq!(ids(&alive), vec!["3"]);
    let expired = next_event(&mut events).await;
    assert_matches!(expired, SetEvent::Expired(values) if ids(&values) == vec!["1", "2"]);
}

#[test_log::test(tokio::test)]
async fn test_appended_notification() {
    let set = actors(Duration::from_secs(2));
    let mut events = set.subscribe();

    assert!(set.add(actor("1"), None));
    assert!(!set.add(actor("1"), None));

    assert_eq!(ids(&set.snapshot()), vec!["1"]);
    let appended = next_event(&mut events).await;
    assert_matches!(appended, SetEvent::Appended(values) if ids(&values) == vec!["1"]);
    assert_matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty));
}

#[test_log::test(tokio::test)]
async fn test_refresh_replaces_lifetime() {
    // A shorter refresh shortens the lifetime
    let set = actors(Duration::from_secs(20));
    assert!(set.add(actor("1"), None));
    assert!(!set.add(actor("1"), Some(Duration::from_millis(200))));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(set.is_empty());

    // A longer refresh extends it
    let set = actors(Duration::from_millis(200));
    assert!(set.add(actor("1"), None));
    assert!(!set.add(actor("1"), Some(Duration::from_secs(20))));
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(set.len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_expired_value_is_added_again() {
    let set = actors(Duration::from_millis(100));
    assert!(set.add(actor("1"), None));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(set.add(actor("1"), None));
    assert!(set.contains(&actor("1")));
}

#[test]
fn test_custom_equality() {
    let set = actors(Duration::from_secs(10));
    let mut renamed = actor("1");
    renamed.kind = "other".into();
    assert!(set.add(actor("1"), None));
    assert!(!set.add(renamed, None));
    assert_eq!(set.len(), 1);

    let plain = ExpiringSet::new(Duration::from_secs(10)).unwrap();
    assert!(plain.add(actor("1"), None));
    let mut renamed = actor("1");
    renamed.kind = "other".into();
    assert!(plain.add(renamed, None));
    assert_eq!(plain.len(), 2);
}

#[test]
fn test_zero_ttl_is_rejected() {
    assert_matches!(
        ExpiringSet::<u32>::new(Duration::ZERO),
        Err(InteractError::InvalidArgument(_))
    );
}
