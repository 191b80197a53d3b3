//! Publish/subscribe fan-out of frames and results.
//!
//! Producers publish [`Message`]s on named topics of a [`BroadcastHub`];
//! each subscriber gets its own bounded queue. The same messages can cross
//! a process boundary through [`FramedWriter`] / [`FramedSource`], which
//! share the [`MessageSink`] / [`MessageSource`] interface with in-process
//! subscriptions.

mod channel;
mod framing;
mod hub;
mod message;

pub use channel::{ChannelError, HubSink, MessageSink, MessageSource};
pub use framing::{
    decode_message, encode_message, FrameReader, FramedSource, FramedWriter, DEFAULT_MAX_PAYLOAD,
};
pub use hub::{BroadcastHub, DeliveryPolicy, Subscription};
pub use message::{free_run_topic, locations_topic, Message, FREE_RUN_SUFFIX, LOCATIONS_SUFFIX};
