use super::Transport;
use crate::error::Error;

/// Application callbacks notified by a [`Transport`].
///
/// For a given transport the calls arrive in this order:
/// `connection_made` once, `data_received` any number of times,
/// `end_of_stream` at most once, and `connection_lost` exactly once.
/// Each call runs as its own loop callback.
pub trait Protocol {
    /// The transport is ready; keep the handle to write or close.
    fn connection_made(&mut self, transport: Transport);

    /// Bytes read from the socket, never empty.
    fn data_received(&mut self, data: &[u8]);

    /// The peer closed its sending side. The transport closes itself
    /// right after this returns.
    fn end_of_stream(&mut self) {}

    /// The connection is gone. `error` is the cause if it was not a clean
    /// close.
    fn connection_lost(&mut self, error: Option<Error>) {
        let _ = error;
    }
}
