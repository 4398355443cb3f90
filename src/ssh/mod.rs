//! SSH module - control connections to pods
//!
//! - russh client with per-pod host key pinning
//! - single-owner handle task driven through `HandleController`
//! - `RemoteTransport`: exec, streamed processes, direct-tcpip, SFTP

mod client;
mod error;
mod handle_owner;
pub mod transport;

pub use client::{fingerprint, ClientHandler, SshTarget};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use transport::{
    shell_escape, AsyncStream, BoxedReader, BoxedStream, Connector, Established, ExecOutput,
    ProcessOutput, RemoteProcess, RemoteShell, RemoteTransport, ShellInput, SshConnector,
    SshTransport,
};
