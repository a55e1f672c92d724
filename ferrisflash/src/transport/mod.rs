//! SSH transport layer wrapping russh.
//!
//! This module provides the low-level SSH connection management,
//! handling connection setup, authentication, and shell channel creation.

pub mod config;
mod ssh;

pub use config::{Credentials, HostKeyVerification, SshConfig, SshOptions};
pub use ssh::SshTransport;
