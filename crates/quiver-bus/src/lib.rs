//! # Quiver Bus
//!
//! Topic-indexed in-process publish/subscribe.
//!
//! Each topic is a bounded broadcast channel. Every subscription carries
//! compiled expression programs applied before delivery, so subscribers
//! only see events their filter matches. A subscriber that falls behind
//! its buffer is dropped (its stream ends with
//! [`Error::Unavailable`](quiver_types::Error::Unavailable)) rather than
//! blocking the publisher. Publishes from a single writer reach each
//! subscriber in publish order.

use std::collections::HashMap;

use quiver_types::{Change, Context, Error, Message, Result};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

pub use quiver_vm::Program;

/// Reserved topic carrying mutation events, published after commit.
pub const CHANGES_TOPIC: &str = "changes";

/// Default per-subscriber buffer size.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// An event flowing through the bus.
#[derive(Debug, Clone)]
pub enum Event {
    Message(Message),
    Change(Change),
}

impl Event {
    /// The environment value filter programs are evaluated against. A
    /// message program applied to a change event (or vice versa) misses
    /// its root variable and simply filters the event out.
    pub fn env_value(&self) -> Result<Value> {
        match self {
            Event::Message(message) => quiver_vm::message_env(message),
            Event::Change(change) => quiver_vm::change_env(change),
        }
    }
}

/// Topic registry. Topics are created lazily on first publish or
/// subscribe and live for the life of the bus.
pub struct Bus {
    topics: RwLock<HashMap<String, broadcast::Sender<Event>>>,
    capacity: usize,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { topics: RwLock::new(HashMap::new()), capacity }
    }

    async fn sender(&self, topic: &str) -> broadcast::Sender<Event> {
        if let Some(sender) = self.topics.read().await.get(topic) {
            return sender.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event; returns the number of subscribers it reached.
    pub async fn publish(&self, topic: &str, event: Event) -> usize {
        let sender = self.sender(topic).await;
        sender.send(event).unwrap_or(0)
    }

    /// Open a filtered subscription on a topic. Events published after
    /// this call are delivered in publish order.
    pub async fn subscribe(
        &self,
        ctx: Context,
        topic: &str,
        programs: Vec<Program>,
    ) -> Subscription {
        let rx = self.sender(topic).await.subscribe();
        Subscription { rx, programs, ctx, topic: topic.to_string() }
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        match self.topics.read().await.get(topic) {
            Some(sender) => sender.receiver_count(),
            None => 0,
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of a topic.
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    programs: Vec<Program>,
    ctx: Context,
    topic: String,
}

impl Subscription {
    /// Receive the next event passing the filter.
    ///
    /// Returns `Ok(None)` when the topic closes, `Err(Cancelled)` when the
    /// caller's context is cancelled, and `Err(Unavailable)` when this
    /// subscriber lagged past its buffer and was dropped.
    pub async fn recv(&mut self) -> Result<Option<Event>> {
        loop {
            self.ctx.err()?;
            let event = tokio::select! {
                _ = self.ctx.cancel_token().cancelled() => return Err(Error::Cancelled),
                event = self.rx.recv() => event,
            };
            match event {
                Ok(event) => {
                    let env = match event.env_value() {
                        Ok(env) => env,
                        Err(err) => {
                            tracing::error!(topic = %self.topic, error = %err, "subscription filter failure");
                            continue;
                        }
                    };
                    match quiver_vm::eval(&env, &self.programs) {
                        Ok(true) => return Ok(Some(event)),
                        Ok(false) => continue,
                        Err(err) => {
                            tracing::error!(topic = %self.topic, error = %err, "subscription filter failure");
                            continue;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    return Err(Error::Unavailable(format!(
                        "subscriber lagged {skipped} events behind on {:?}",
                        self.topic
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use quiver_types::{Doc, DocChange, Ref};
    use quiver_vm::EnvKind;
    use serde_json::Map;

    use super::*;

    fn ctx() -> Context {
        Context::background(Doc::new(Ref::user("root@x")), "Subscribe")
    }

    fn message(channel: &str, key: &str) -> Message {
        let mut data = Map::new();
        data.insert(key.to_string(), Value::from(true));
        Message {
            channel: channel.to_string(),
            data,
            sender: Ref::user("root@x"),
            timestamp: Utc::now(),
        }
    }

    fn doc_created(gid: &str) -> Change {
        Change {
            method: "CreateDoc".to_string(),
            identity: Doc::new(Ref::user("root@x")),
            timestamp: Utc::now(),
            doc_changes: vec![DocChange {
                before: None,
                after: Some(Doc::new(Ref::new("dog", gid))),
            }],
            connection_changes: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_publish_and_receive_in_order() {
        let bus = Bus::new();
        let mut sub = bus.subscribe(ctx(), "alerts", Vec::new()).await;

        bus.publish("alerts", Event::Message(message("alerts", "first"))).await;
        bus.publish("alerts", Event::Message(message("alerts", "second"))).await;

        for expected in ["first", "second"] {
            match sub.recv().await.unwrap().unwrap() {
                Event::Message(message) => assert!(message.data.contains_key(expected)),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_filter_excludes_events() {
        let bus = Bus::new();
        let programs =
            quiver_vm::programs(EnvKind::Change, &["change.doc_changes.size() > 0".to_string()])
                .unwrap();
        let mut sub = bus.subscribe(ctx(), CHANGES_TOPIC, programs).await;

        let mut connection_only = doc_created("ignored");
        connection_only.doc_changes.clear();
        bus.publish(CHANGES_TOPIC, Event::Change(connection_only)).await;
        bus.publish(CHANGES_TOPIC, Event::Change(doc_created("charlie"))).await;

        match sub.recv().await.unwrap().unwrap() {
            Event::Change(change) => {
                let after = change.doc_changes[0].after.as_ref().unwrap();
                assert_eq!(after.ref_.gid, "charlie");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_filter_skips_change_events() {
        let bus = Bus::new();
        let programs =
            quiver_vm::programs(EnvKind::Message, &["message.channel == 'alerts'".to_string()])
                .unwrap();
        let mut sub = bus.subscribe(ctx(), CHANGES_TOPIC, programs).await;

        bus.publish(CHANGES_TOPIC, Event::Change(doc_created("charlie"))).await;
        bus.publish(
            CHANGES_TOPIC,
            Event::Message(message("alerts", "wanted")),
        )
        .await;

        match sub.recv().await.unwrap().unwrap() {
            Event::Message(message) => assert!(message.data.contains_key("wanted")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped() {
        let bus = Bus::with_capacity(2);
        let mut sub = bus.subscribe(ctx(), "alerts", Vec::new()).await;

        for i in 0..8 {
            bus.publish("alerts", Event::Message(message("alerts", &format!("m{i}")))).await;
        }

        let err = sub.recv().await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_subscription() {
        let bus = Bus::new();
        let (handle, token) = quiver_types::cancel_pair();
        let ctx = Context::new(Doc::new(Ref::user("root@x")), "Subscribe", token);
        let mut sub = bus.subscribe(ctx, "alerts", Vec::new()).await;

        handle.cancel();
        assert!(matches!(sub.recv().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = Bus::new();
        assert_eq!(bus.publish("nowhere", Event::Message(message("nowhere", "x"))).await, 0);
        assert_eq!(bus.subscriber_count("nowhere").await, 0);
    }
}
