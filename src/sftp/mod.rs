//! Content sync between a pod and the local machine

pub mod pull;

pub use pull::{pull, PullError, PullReport, RemoteFile};
