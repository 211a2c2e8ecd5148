// src/change_feed.rs - Soil test change notifications
use actix_web::web::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{SoilTest, SoilTestStatus};

pub const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub event: ChangeKind,
    pub table: &'static str,
    pub id: String,
    pub user_id: String,
    pub status: SoilTestStatus,
}

impl ChangeEvent {
    pub fn for_soil_test(event: ChangeKind, test: &SoilTest) -> Self {
        Self {
            event,
            table: "soil_tests",
            id: test.id.clone(),
            user_id: test.user_id.clone(),
            status: test.status,
        }
    }

    /// One server-sent-events frame.
    pub fn to_sse_frame(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        let name = match self.event {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
        };
        format!("event: {}\ndata: {}\n\n", name, data)
    }
}

/// Fan-out of row changes. Delivery is best effort: a slow subscriber skips
/// what it missed and is expected to re-fetch.
pub struct ChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(CHANGE_FEED_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        match self.sender.send(event) {
            Ok(receivers) => log::debug!("Change event delivered to {} subscribers", receivers),
            Err(_) => log::trace!("Change event dropped, no subscribers"),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events for one user's rows only.
    pub fn subscribe_user(&self, user_id: &str) -> impl Stream<Item = ChangeEvent> {
        let receiver = self.sender.subscribe();
        stream::unfold((receiver, user_id.to_string()), |(mut receiver, user_id)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.user_id == user_id => {
                        return Some((event, (receiver, user_id)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Change subscriber for user {} lagged by {} events", user_id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// SSE body for `subscribe_user`, opened with a comment frame.
    pub fn sse_stream(&self, user_id: &str) -> impl Stream<Item = Result<Bytes, actix_web::Error>> {
        let opening = stream::once(async { Ok::<Bytes, actix_web::Error>(Bytes::from_static(b": connected\n\n")) });
        let events = self
            .subscribe_user(user_id)
            .map(|event| Ok::<Bytes, actix_web::Error>(Bytes::from(event.to_sse_frame())));
        opening.chain(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(user_id: &str, id: &str, status: SoilTestStatus) -> ChangeEvent {
        let now = Utc::now();
        let test = SoilTest {
            id: id.into(),
            user_id: user_id.into(),
            location: "Field".into(),
            field_size: None,
            test_type: "Basic Soil Analysis".into(),
            test_date: now,
            status,
            ph_level: None,
            nitrogen_level: None,
            phosphorus_level: None,
            potassium_level: None,
            organic_matter: None,
            moisture_content: None,
            sample_collection_date: None,
            analysis_started_date: None,
            completed_date: None,
            created_at: now,
            updated_at: now,
        };
        ChangeEvent::for_soil_test(ChangeKind::Update, &test)
    }

    #[tokio::test]
    async fn test_subscription_is_filtered_by_user() {
        let feed = ChangeFeed::default();
        let stream = feed.subscribe_user("alice");
        futures_util::pin_mut!(stream);

        feed.publish(event("bob", "t1", SoilTestStatus::Analyzing));
        feed.publish(event("alice", "t2", SoilTestStatus::SampleCollection));

        let received = stream.next().await.unwrap();
        assert_eq!(received.id, "t2");
        assert_eq!(received.status, SoilTestStatus::SampleCollection);
    }

    #[tokio::test]
    async fn test_sse_frames() {
        let feed = ChangeFeed::default();
        let stream = feed.sse_stream("alice");
        futures_util::pin_mut!(stream);

        let opening = stream.next().await.unwrap().unwrap();
        assert_eq!(&opening[..], b": connected\n\n");

        feed.publish(event("alice", "t9", SoilTestStatus::Completed));
        let frame = stream.next().await.unwrap().unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.starts_with("event: update\ndata: "));
        assert!(text.contains("\"table\":\"soil_tests\""));
        assert!(text.contains("\"status\":\"completed\""));
    }

    #[test]
    fn test_publish_without_subscribers_is_harmless() {
        let feed = ChangeFeed::new(4);
        feed.publish(event("alice", "t1", SoilTestStatus::Pending));
        assert_eq!(feed.subscriber_count(), 0);
    }
}
