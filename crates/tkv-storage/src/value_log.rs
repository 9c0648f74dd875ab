//! Append-only value log.
//!
//! Values are addressed by `(offset, length)`. The log is opened in one phase
//! at a time:
//!
//! ```text
//!            open_output                 open_input
//!   Writing <------------  Closed  ------------> Reading
//!           -------------->       <-------------
//!        flush_and_close_output         close_input
//! ```
//!
//! Appends go to the durable store through an in-memory staging buffer that
//! spills once it reaches `write_buffer_bytes`. Reads are served from a local
//! mirror that is refreshed from the durable copy when the read phase opens.

use crate::blob::BlobStore;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tkv_common::{Result, TkvError};
use tracing::{debug, warn};

/// Operating phase of the value log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPhase {
    Closed,
    Writing,
    Reading,
}

impl fmt::Display for LogPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogPhase::Closed => "closed",
            LogPhase::Writing => "writing",
            LogPhase::Reading => "reading",
        };
        f.write_str(name)
    }
}

/// Mutable log state, guarded by one mutex.
struct LogState {
    phase: LogPhase,
    /// Appended bytes not yet handed to the durable store.
    staged: BytesMut,
    /// Bytes already in the durable store.
    spilled: u64,
}

impl LogState {
    fn len(&self) -> u64 {
        self.spilled + self.staged.len() as u64
    }

    fn expect(&self, expected: LogPhase) -> Result<()> {
        if self.phase != expected {
            return Err(TkvError::InvalidPhase {
                expected: expected.to_string(),
                actual: self.phase.to_string(),
            });
        }
        Ok(())
    }
}

/// Append-only byte log over a durable store with a local read mirror.
pub struct ValueLog {
    name: String,
    durable: Arc<dyn BlobStore>,
    local: Arc<dyn BlobStore>,
    write_buffer_bytes: usize,
    state: Mutex<LogState>,
}

impl ValueLog {
    /// Opens the log named `name`. The log starts closed.
    pub fn open(
        name: impl Into<String>,
        durable: Arc<dyn BlobStore>,
        local: Arc<dyn BlobStore>,
        write_buffer_bytes: usize,
    ) -> Result<Self> {
        let name = name.into();
        let spilled = durable.size(&name)?;

        Ok(Self {
            name,
            durable,
            local,
            write_buffer_bytes,
            state: Mutex::new(LogState {
                phase: LogPhase::Closed,
                staged: BytesMut::new(),
                spilled,
            }),
        })
    }

    /// Returns the current phase.
    pub fn phase(&self) -> LogPhase {
        self.state.lock().phase
    }

    /// Returns the total log size, including staged bytes.
    ///
    /// This is the offset the next `append` will return.
    pub fn len(&self) -> u64 {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enters the write phase.
    pub fn open_output(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.expect(LogPhase::Closed)?;
        state.spilled = self.durable.size(&self.name)?;
        state.phase = LogPhase::Writing;
        debug!(log = %self.name, size = state.spilled, "value log opened for writing");
        Ok(())
    }

    /// Appends `data` and returns the offset it begins at.
    pub fn append(&self, data: &[u8]) -> Result<u64> {
        let mut state = self.state.lock();
        state.expect(LogPhase::Writing)?;

        let offset = state.len();
        state.staged.extend_from_slice(data);
        if state.staged.len() >= self.write_buffer_bytes {
            self.spill(&mut state)?;
        }
        Ok(offset)
    }

    /// Hands staged bytes to the durable store.
    fn spill(&self, state: &mut LogState) -> Result<()> {
        if state.staged.is_empty() {
            return Ok(());
        }
        let at = self.durable.append(&self.name, &state.staged)?;
        if at != state.spilled {
            return Err(TkvError::IoError(format!(
                "value log {} grew underneath the writer: expected offset {}, got {}",
                self.name, state.spilled, at
            )));
        }
        state.spilled += state.staged.len() as u64;
        state.staged.clear();
        Ok(())
    }

    /// Spills staged bytes, syncs the durable copy and leaves the write phase.
    pub fn flush_and_close_output(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.expect(LogPhase::Writing)?;
        self.finish_output(&mut state)
    }

    fn finish_output(&self, state: &mut LogState) -> Result<()> {
        self.spill(state)?;
        self.durable.sync(&self.name)?;
        self.durable.close(&self.name)?;
        state.phase = LogPhase::Closed;
        debug!(log = %self.name, size = state.spilled, "value log closed for writing");
        Ok(())
    }

    /// Enters the read phase, refreshing the local mirror if it is stale.
    pub fn open_input(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.expect(LogPhase::Closed)?;

        let mirrored =
            self.local.exists(&self.name)? && self.local.size(&self.name)? == state.spilled;
        if !mirrored {
            let contents = if self.durable.exists(&self.name)? {
                self.durable.read_all(&self.name)?
            } else {
                Vec::new()
            };
            self.local.write_all(&self.name, &contents)?;
            state.spilled = contents.len() as u64;
            debug!(log = %self.name, size = state.spilled, "value log mirror refreshed");
        }

        state.phase = LogPhase::Reading;
        Ok(())
    }

    /// Reads `length` bytes at `offset`. Only valid in the read phase.
    pub fn read(&self, offset: u64, length: u64) -> Result<Bytes> {
        let state = self.state.lock();
        state.expect(LogPhase::Reading)?;

        if offset.saturating_add(length) > state.spilled {
            return Err(TkvError::ReadOutOfBounds {
                offset,
                length,
                size: state.spilled,
            });
        }
        if length == 0 {
            return Ok(Bytes::new());
        }
        let data = self.local.read_at(&self.name, offset, length as usize)?;
        Ok(Bytes::from(data))
    }

    /// Leaves the read phase.
    pub fn close_input(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.expect(LogPhase::Reading)?;
        self.finish_input(&mut state)
    }

    fn finish_input(&self, state: &mut LogState) -> Result<()> {
        self.local.close(&self.name)?;
        state.phase = LogPhase::Closed;
        Ok(())
    }

    /// Closes whichever phase is open.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.phase {
            LogPhase::Writing => self.finish_output(&mut state),
            LogPhase::Reading => self.finish_input(&mut state),
            LogPhase::Closed => Ok(()),
        }
    }

    /// Deletes both copies. True if both are gone afterwards.
    pub fn delete(&self) -> bool {
        let local = self.delete_local();
        let remote = self.delete_remote();
        local && remote
    }

    /// Deletes the local mirror.
    pub fn delete_local(&self) -> bool {
        self.close_quietly();
        remove(self.local.as_ref(), &self.name, "local")
    }

    /// Deletes the durable copy, discarding any staged bytes.
    ///
    /// The local mirror goes too: offsets restart at zero, and a stale mirror
    /// of the same size would otherwise be served as current.
    pub fn delete_remote(&self) -> bool {
        self.close_quietly();
        let removed = remove(self.durable.as_ref(), &self.name, "remote");
        if removed {
            let mut state = self.state.lock();
            state.staged.clear();
            state.spilled = 0;
        }
        let mirror = remove(self.local.as_ref(), &self.name, "local");
        removed && mirror
    }

    fn close_quietly(&self) {
        if let Err(e) = self.close() {
            warn!(log = %self.name, error = %e, "failed to close value log before delete");
            self.state.lock().phase = LogPhase::Closed;
        }
    }
}

/// Best-effort removal; true when the object is absent afterwards.
pub(crate) fn remove(store: &dyn BlobStore, name: &str, target: &str) -> bool {
    match store.delete(name) {
        Ok(_) => true,
        Err(e) => {
            warn!(name, target, error = %e, "failed to delete object");
            false
        }
    }
}
