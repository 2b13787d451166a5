//! Backend abstractions
//!
//! The session core talks to SSH and SFTP only through these seams, so the
//! russh backend and in-memory test doubles are interchangeable.

mod agent;
mod fs;
mod link;

pub use agent::KeyAgent;

pub use fs::{RemoteFs, RemoteFsFactory, RemoteReader, RemoteStat, RemoteWriter};
pub use link::{
    AsyncStream, BoxedStream, ChannelControl, ChannelInput, ChannelRequest, Connector,
    HostTarget, KeyboardInteractiveReply, LinkChannel, SshLink, StreamRequest,
};
