pub mod channel;

pub use channel::{
    ChannelOptions, ChannelRegistry, ChannelState, FrameStream, MessageFrame, SocketConnector,
    TransportChannel,
};
