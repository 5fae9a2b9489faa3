//! Sockets and transports.
//!
//! This module provides the connection-oriented layer built on top of the
//! proactor.
//!
//! It exposes:
//! - [`Socket`], an owned non-blocking stream socket,
//! - [`Transport`], which drives a socket's read and write loops,
//! - [`Protocol`], the callbacks a transport reports to,
//! - [`Server`], an accept loop creating one transport per connection.
mod protocol;
mod server;
mod socket;
mod transport;

pub use protocol::Protocol;
pub use server::Server;
pub use socket::Socket;
pub(crate) use socket::WeakSocket;
pub use transport::{Transport, TransportOptions};
