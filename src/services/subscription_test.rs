use super::*;
use crate::frame::Data;
use tokio::sync::mpsc;

fn chat_frame(body: &str) -> Frame {
    Frame::push("chat:send", Data::new()).with_data("body", body)
}

#[tokio::test]
async fn publish_reaches_all_subscribers() {
    let registry = SubscriptionRegistry::new();
    let room = Uuid::new_v4();
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);

    registry.subscribe(Topic::Room(room), Uuid::new_v4(), tx_a).await;
    registry.subscribe(Topic::Room(room), Uuid::new_v4(), tx_b).await;

    registry.publish(Topic::Room(room), &chat_frame("hello")).await;

    assert_eq!(rx_a.recv().await.unwrap().syscall, "chat:send");
    assert_eq!(rx_b.recv().await.unwrap().syscall, "chat:send");
}

#[tokio::test]
async fn publish_excluding_skips_origin() {
    let registry = SubscriptionRegistry::new();
    let room = Uuid::new_v4();
    let origin = Uuid::new_v4();
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);

    registry.subscribe(Topic::Room(room), origin, tx_a).await;
    registry.subscribe(Topic::Room(room), Uuid::new_v4(), tx_b).await;

    registry
        .publish_excluding(Topic::Room(room), &chat_frame("hello"), Some(origin))
        .await;

    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.recv().await.is_some());
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let registry = SubscriptionRegistry::new();
    let room = Uuid::new_v4();
    let conn = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(8);

    registry.subscribe(Topic::Room(room), conn, tx).await;
    registry.unsubscribe(Topic::Room(room), conn).await;
    registry.publish(Topic::Room(room), &chat_frame("hello")).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(registry.subscriber_count(Topic::Room(room)).await, 0);
}

#[tokio::test]
async fn drop_connection_clears_every_topic() {
    let registry = SubscriptionRegistry::new();
    let conn = Uuid::new_v4();
    let user = Uuid::new_v4();
    let room = Uuid::new_v4();
    let (tx, _rx) = mpsc::channel(8);

    registry.subscribe(Topic::User(user), conn, tx.clone()).await;
    registry.subscribe(Topic::Room(room), conn, tx).await;

    registry.drop_connection(conn).await;

    assert_eq!(registry.subscriber_count(Topic::User(user)).await, 0);
    assert_eq!(registry.subscriber_count(Topic::Room(room)).await, 0);
}

#[tokio::test]
async fn full_buffer_drops_frame_without_blocking() {
    let registry = SubscriptionRegistry::new();
    let room = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(1);

    registry.subscribe(Topic::Room(room), Uuid::new_v4(), tx).await;

    registry.publish(Topic::Room(room), &chat_frame("first")).await;
    registry.publish(Topic::Room(room), &chat_frame("second")).await;

    // Capacity 1: exactly one frame delivered, the overflow dropped.
    let first = rx.recv().await.unwrap();
    assert_eq!(first.data.get("body").unwrap(), "first");
    assert!(rx.try_recv().is_err());

    // Subscriber stays attached for future publishes.
    assert_eq!(registry.subscriber_count(Topic::Room(room)).await, 1);
}

#[tokio::test]
async fn closed_receiver_pruned_on_publish() {
    let registry = SubscriptionRegistry::new();
    let room = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(8);

    registry.subscribe(Topic::Room(room), Uuid::new_v4(), tx).await;
    drop(rx);

    registry.publish(Topic::Room(room), &chat_frame("hello")).await;
    assert_eq!(registry.subscriber_count(Topic::Room(room)).await, 0);
}

#[tokio::test]
async fn distinct_topics_are_isolated() {
    let registry = SubscriptionRegistry::new();
    let room_a = Uuid::new_v4();
    let room_b = Uuid::new_v4();
    let (tx_a, mut rx_a) = mpsc::channel(8);
    let (tx_b, mut rx_b) = mpsc::channel(8);

    registry.subscribe(Topic::Room(room_a), Uuid::new_v4(), tx_a).await;
    registry.subscribe(Topic::Room(room_b), Uuid::new_v4(), tx_b).await;

    registry.publish(Topic::Room(room_a), &chat_frame("only a")).await;

    assert!(rx_a.recv().await.is_some());
    assert!(rx_b.try_recv().is_err());
}
