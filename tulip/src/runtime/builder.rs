use super::EventLoop;
use crate::error::Result;
use crate::proactor::{self, Proactor};

/// Size of each `recv` submitted by transports and by the self-pipe reader.
pub(crate) const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Writes dropped after a connection loss before a warning is logged.
pub(crate) const DEFAULT_LOST_WRITE_THRESHOLD: usize = 5;

/// Completions requested from the OS per poll.
pub(crate) const DEFAULT_MAX_EVENTS: usize = 64;

/// Settings an [`EventLoop`] hands to everything built on it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Config {
    pub(crate) read_buffer_size: usize,
    pub(crate) lost_write_threshold: usize,
    pub(crate) max_events: usize,
}

/// Builder for configuring and creating an event loop.
///
/// `EventLoopBuilder` allows customizing loop parameters before
/// constructing it: transport buffer sizing, the lost-write warning
/// threshold, the completion batch size and the proactor itself.
///
/// # Examples
///
/// ```rust,ignore
/// let event_loop = EventLoopBuilder::new()
///     .read_buffer_size(16 * 1024)
///     .build()?;
/// ```
pub struct EventLoopBuilder {
    read_buffer_size: usize,
    lost_write_threshold: usize,
    max_events: usize,
    proactor: Option<Box<dyn Proactor>>,
}

impl EventLoopBuilder {
    /// Creates a new `EventLoopBuilder` with default configuration.
    pub fn new() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            lost_write_threshold: DEFAULT_LOST_WRITE_THRESHOLD,
            max_events: DEFAULT_MAX_EVENTS,
            proactor: None,
        }
    }

    /// Sets the number of bytes requested by each transport read.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn read_buffer_size(mut self, n: usize) -> Self {
        assert!(n > 0, "read_buffer_size must be > 0");

        self.read_buffer_size = n;
        self
    }

    /// Sets how many writes a transport silently drops after losing its
    /// connection before it logs a warning.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn lost_write_threshold(mut self, n: usize) -> Self {
        assert!(n > 0, "lost_write_threshold must be > 0");

        self.lost_write_threshold = n;
        self
    }

    /// Sets how many completion events the platform proactor collects per
    /// poll.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn max_events(mut self, n: usize) -> Self {
        assert!(n > 0, "max_events must be > 0");

        self.max_events = n;
        self
    }

    /// Uses `proactor` instead of the platform proactor.
    pub fn proactor(mut self, proactor: Box<dyn Proactor>) -> Self {
        self.proactor = Some(proactor);
        self
    }

    /// Builds the event loop with the configured options.
    ///
    /// This creates the proactor (unless one was supplied) and the loop's
    /// self-pipe.
    ///
    /// # Errors
    ///
    /// Fails if the operating system refuses either resource.
    pub fn build(self) -> Result<EventLoop> {
        let config = Config {
            read_buffer_size: self.read_buffer_size,
            lost_write_threshold: self.lost_write_threshold,
            max_events: self.max_events,
        };

        let proactor = match self.proactor {
            Some(proactor) => proactor,
            None => proactor::platform(config.max_events)?,
        };

        EventLoop::with_proactor(config, proactor)
    }
}

impl Default for EventLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
