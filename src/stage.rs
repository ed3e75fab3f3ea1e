//! Multiplexing of many outstanding group collectives.
//!
//! The stage tracks opaque handles whose collectives are in flight and
//! surfaces progress and completion to the driver. It does not touch the
//! groups itself; the caller supplies a polling closure, which keeps the
//! stage independent of where the groups are stored.

use crate::comm::CommError;
use crate::group::Poll;

/// Opaque handle of a registered participant (a dendrogram node in the
/// clustering engine).
pub type StageHandle = usize;

/// How the engine driver advances outstanding collectives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvanceMode {
    /// Drive every collective to completion when it is posted.
    Synchronous,
    /// Return from the stage as soon as any collective progresses.
    AdvanceAny,
    /// Return from the stage once at least one collective completes.
    AdvanceSome,
}

/// Container of in-flight collectives.
#[derive(Default)]
pub struct CommStage {
    active: Vec<StageHandle>,
    synchronous: bool,
}

impl CommStage {
    /// Create an empty stage.
    pub fn new() -> Self {
        Self::default()
    }

    /// If set, posts drive their collective to completion before
    /// returning, making the whole algorithm run synchronously.
    pub fn set_synchronous(&mut self, flag: bool) {
        self.synchronous = flag;
    }

    /// Return true if posts complete synchronously.
    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    /// Track a handle with an outstanding collective. Registering a handle
    /// twice is harmless.
    pub fn register(&mut self, handle: StageHandle) {
        if !self.active.contains(&handle) {
            self.active.push(handle);
        }
    }

    /// Return true if no collective is outstanding.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Number of outstanding collectives.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Block until at least one tracked collective completes; return all
    /// handles that completed in this round.
    ///
    /// Polling touches every tracked handle on every round, so I/O on one
    /// group keeps progressing while another is waited for.
    pub fn advance_some<F>(&mut self, mut poll: F) -> Result<Vec<StageHandle>, CommError>
    where
        F: FnMut(StageHandle) -> Result<Poll, CommError>,
    {
        if self.active.is_empty() {
            return Ok(Vec::new());
        }
        loop {
            let mut completed = Vec::new();
            for &handle in self.active.iter() {
                if poll(handle)? == Poll::Complete {
                    completed.push(handle);
                }
            }
            if !completed.is_empty() {
                self.active.retain(|h| !completed.contains(h));
                return Ok(completed);
            }
        }
    }

    /// Block until at least one tracked collective progresses; return the
    /// handles that progressed. Completed handles are removed from the
    /// stage, handles that merely received messages stay registered.
    pub fn advance_any<F>(&mut self, mut poll: F) -> Result<Vec<StageHandle>, CommError>
    where
        F: FnMut(StageHandle) -> Result<Poll, CommError>,
    {
        if self.active.is_empty() {
            return Ok(Vec::new());
        }
        loop {
            let mut advanced = Vec::new();
            let mut completed = Vec::new();
            for &handle in self.active.iter() {
                match poll(handle)? {
                    Poll::Complete => {
                        advanced.push(handle);
                        completed.push(handle);
                    }
                    Poll::Progressed => advanced.push(handle),
                    Poll::Pending => {}
                }
            }
            if !advanced.is_empty() {
                self.active.retain(|h| !completed.contains(h));
                return Ok(advanced);
            }
        }
    }
}
