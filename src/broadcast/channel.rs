//! Transport-neutral message channel ends.
//!
//! Worker loops are written against [`MessageSource`] and [`MessageSink`]
//! so the same loop runs on a thread fed by a hub [`Subscription`] or in a
//! child process fed by a pipe.
//!
//! [`Subscription`]: super::Subscription

use std::time::Duration;

use thiserror::Error;

use super::hub::BroadcastHub;
use super::message::Message;

/// Errors raised by channel ends.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("invalid frame magic")]
    InvalidMagic,
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("message encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receiving end of a channel.
pub trait MessageSource: Send {
    /// Waits up to `timeout` for a message; `Ok(None)` on timeout.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, ChannelError>;

    /// Returns a message only if one is already queued.
    fn try_receive(&mut self) -> Result<Option<Message>, ChannelError> {
        self.receive(Duration::ZERO)
    }
}

/// Sending end of a channel.
pub trait MessageSink: Send {
    fn send(&mut self, message: &Message) -> Result<(), ChannelError>;

    /// Flushes and releases the channel. Further sends may fail.
    fn close(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }
}

impl<T: MessageSink + ?Sized> MessageSink for Box<T> {
    fn send(&mut self, message: &Message) -> Result<(), ChannelError> {
        (**self).send(message)
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        (**self).close()
    }
}

impl<T: MessageSource + ?Sized> MessageSource for Box<T> {
    fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, ChannelError> {
        (**self).receive(timeout)
    }
}

/// Publishes everything it is sent onto one hub topic.
#[derive(Debug, Clone)]
pub struct HubSink {
    hub: BroadcastHub,
    topic: String,
}

impl HubSink {
    pub fn new(hub: BroadcastHub, topic: impl Into<String>) -> Self {
        Self {
            hub,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl MessageSink for HubSink {
    fn send(&mut self, message: &Message) -> Result<(), ChannelError> {
        self.hub.publish(&self.topic, message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::DeliveryPolicy;

    #[test]
    fn test_hub_sink_publishes_to_topic() {
        let hub = BroadcastHub::new();
        let mut sub = hub.subscribe("out", DeliveryPolicy::default());
        let mut sink = HubSink::new(hub.clone(), "out");

        sink.send(&Message::Exit).unwrap();
        let received = sub.try_receive().unwrap();
        assert_eq!(received, Some(Message::Exit));
    }
}
