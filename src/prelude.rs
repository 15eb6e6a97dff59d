//! Convenience re-exports of the types a game client touches.

pub use crate::message::buffer::{MessageBuffer, RecyclingArray};
pub use crate::message::cursor::{MessageReader, MessageWriter};
pub use crate::message::{command, Message, Tag};
pub use crate::net::client::{Client, DisconnectedEvent, MessageReceivedEvent};
pub use crate::net::connection::{
    BichannelConnection, ConnectionConfig, ConnectionState, HelloProducer,
};
pub use crate::net::rtt::RoundTripTime;
pub use crate::pool::cache::{CacheSettings, ObjectCache};
pub use crate::shared::{ClientId, ErrorType, NetworkError, NetworkResult, SendMode};
