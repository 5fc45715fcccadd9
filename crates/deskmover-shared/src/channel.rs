//! Transport abstraction over the mutex, the two events and the shared message
//!
//! The server never takes the mutex. It only touches the shared message
//! between `command-ready` and its own `response-ready` signal, a window in
//! which the client is holding the mutex and blocked on the response wait.

use crate::Result;
use crate::messages::Message;
use std::time::Duration;

/// Names of the four kernel objects forming one channel
///
/// These strings are the wire contract: controller and worker builds must
/// agree on them exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    /// Shared memory segment
    pub segment: String,
    /// Mutex serializing transactions
    pub mutex: String,
    /// Auto-reset event the client sets after writing a command
    pub command_event: String,
    /// Auto-reset event the server sets after writing a response
    pub response_event: String,
}

impl ChannelNames {
    /// Stable names used by released builds
    pub const SEGMENT: &'static str = "Local\\DeskMover.Segment";
    /// Mutex name
    pub const MUTEX: &'static str = "Local\\DeskMover.Mutex";
    /// Command event name
    pub const COMMAND_EVENT: &'static str = "Local\\DeskMover.CommandReady";
    /// Response event name
    pub const RESPONSE_EVENT: &'static str = "Local\\DeskMover.ResponseReady";

    /// Names with a suffix appended, for isolated channels
    pub fn with_suffix(suffix: &str) -> Self {
        Self {
            segment: format!("{}.{suffix}", Self::SEGMENT),
            mutex: format!("{}.{suffix}", Self::MUTEX),
            command_event: format!("{}.{suffix}", Self::COMMAND_EVENT),
            response_event: format!("{}.{suffix}", Self::RESPONSE_EVENT),
        }
    }
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            segment: Self::SEGMENT.to_string(),
            mutex: Self::MUTEX.to_string(),
            command_event: Self::COMMAND_EVENT.to_string(),
            response_event: Self::RESPONSE_EVENT.to_string(),
        }
    }
}

/// One end of the command channel
///
/// Waits return `Ok(false)` on timeout and `Err` only when the wait itself
/// failed. Both events are auto-reset: a successful wait consumes the signal.
pub trait Channel {
    /// Take the transaction mutex
    fn acquire(&self, timeout: Duration) -> Result<bool>;

    /// Give the transaction mutex back
    fn release(&self) -> Result<()>;

    /// Block until a command is posted; `None` waits forever
    fn wait_command(&self, timeout: Option<Duration>) -> Result<bool>;

    /// Tell the server a command is in the shared message
    fn signal_command(&self) -> Result<()>;

    /// Block until the server is ready or has answered
    fn wait_response(&self, timeout: Duration) -> Result<bool>;

    /// Tell the client the shared message holds a response
    fn signal_response(&self) -> Result<()>;

    /// Run `f` against the shared message
    ///
    /// Callers must be inside their side's exclusive window.
    fn with_shared<R>(&self, f: impl FnOnce(&mut Message) -> R) -> R;

    /// Copy `src` into the shared message
    fn store(&self, src: &Message) {
        self.with_shared(|shared| shared.copy_from(src));
    }
}

impl<C: Channel> Channel for &C {
    fn acquire(&self, timeout: Duration) -> Result<bool> {
        (**self).acquire(timeout)
    }

    fn release(&self) -> Result<()> {
        (**self).release()
    }

    fn wait_command(&self, timeout: Option<Duration>) -> Result<bool> {
        (**self).wait_command(timeout)
    }

    fn signal_command(&self) -> Result<()> {
        (**self).signal_command()
    }

    fn wait_response(&self, timeout: Duration) -> Result<bool> {
        (**self).wait_response(timeout)
    }

    fn signal_response(&self) -> Result<()> {
        (**self).signal_response()
    }

    fn with_shared<R>(&self, f: impl FnOnce(&mut Message) -> R) -> R {
        (**self).with_shared(f)
    }
}

/// Held transaction mutex, released on drop
pub struct ChannelLock<'a, C: Channel> {
    channel: &'a C,
}

impl<'a, C: Channel> ChannelLock<'a, C> {
    /// Acquire the mutex, `Ok(None)` on timeout
    pub fn acquire(channel: &'a C, timeout: Duration) -> Result<Option<Self>> {
        if channel.acquire(timeout)? {
            Ok(Some(Self { channel }))
        } else {
            Ok(None)
        }
    }
}

impl<C: Channel> Drop for ChannelLock<'_, C> {
    fn drop(&mut self) {
        if let Err(e) = self.channel.release() {
            tracing::warn!(error = %e, "failed to release channel mutex");
        }
    }
}
