#![doc = include_str!("../README.md")]

pub mod channel;
pub mod client;
pub mod error;
pub mod frame;
pub mod message;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use channel::{ChannelOptions, CommandChannel, EventChannel};
pub use client::IpcClient;
pub use error::IpcError;
pub use frame::{Frame, FrameType};
pub use message::{
    AccessInfo, Command, CommandResponse, Event, EventMessage, ResponseStatus, StartMonitor,
};
