use std::sync::Arc;

use tokio::sync::broadcast;

use crate::topic_tree::TopicTree;
use embermq_core::{message::Message, Result};
use embermq_storage::RetainedMessageStore;

/// Message broker that handles pub/sub routing.
///
/// The broker maintains a topic tree for efficient message routing with wildcard support.
/// It uses a pluggable storage backend for retained messages.
/// It is thread-safe and can be cloned cheaply (uses Arc internally).
#[derive(Clone)]
pub(crate) struct Broker<S: RetainedMessageStore> {
    subscriptions: TopicTree<Message>,
    /// Storage backend for retained messages
    storage: Arc<S>,
}

impl<S: RetainedMessageStore> Broker<S> {
    pub(crate) fn new(storage: Arc<S>) -> Broker<S> {
        Broker {
            subscriptions: TopicTree::new(),
            storage,
        }
    }

    /// Subscribe to a topic filter. Returns a receiver for matching messages
    /// and any retained messages that match the filter.
    pub(crate) async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<(broadcast::Receiver<Message>, Vec<Message>)> {
        let receiver = self.subscriptions.subscribe(topic);
        let retained_messages = self
            .storage
            .get_retained(topic)
            .await
            .map_err(|e| embermq_core::error::Error::Storage(e.to_string()))?;
        Ok((receiver, retained_messages))
    }

    /// Publish a message to a topic. Delivers to all matching subscribers.
    /// If the retain flag is set, stores or clears the retained message for this topic.
    pub(crate) async fn publish(&self, topic: &str, message: Message) -> Result<()> {
        // Handle retained message storage
        if message.retain {
            if message.payload.as_ref().is_none_or(|p| p.is_empty()) {
                // Empty payload clears the retained message
                self.storage
                    .store_retained(topic, None)
                    .await
                    .map_err(|e| embermq_core::error::Error::Storage(e.to_string()))?;
            } else {
                // Store the retained message (with retain flag set to false for storage)
                let mut retained_msg = message.clone();
                retained_msg.retain = false;
                self.storage
                    .store_retained(topic, Some(retained_msg))
                    .await
                    .map_err(|e| embermq_core::error::Error::Storage(e.to_string()))?;
            }
        }

        // Deliver to current subscribers
        self.subscriptions.publish(topic, message);
        Ok(())
    }
}
