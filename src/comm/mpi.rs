//! MPI transport for the exchange trait.

use std::cell::RefCell;
use std::ptr::NonNull;

use mpi::point_to_point::{Destination, Source};
use mpi::request::{Request, StaticScope};
use mpi::traits::{Communicator, Equivalence};

use super::{CommError, Exchange};

// MPI guarantees at least this many usable tag values; implementations may
// offer more but querying MPI_TAG_UB is not worth the portability trouble.
const GUARANTEED_TAG_UPPER_BOUND: i32 = 32767;

// An immediate send together with the leaked buffer it reads from. The
// buffer is reclaimed once the request tests complete.
struct PendingSend {
    request: Option<Request<'static, [i32], StaticScope>>,
    buffer: Option<NonNull<[i32]>>,
}

impl PendingSend {
    // Returns true once the send has completed and the buffer is freed.
    fn try_complete(&mut self) -> bool {
        if let Some(request) = self.request.take() {
            match request.test() {
                Ok(_status) => {}
                Err(request) => {
                    self.request = Some(request);
                    return false;
                }
            }
        }
        if let Some(ptr) = self.buffer.take() {
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
        true
    }
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        if let Some(request) = self.request.take() {
            let _ = request.wait();
        }
        if let Some(ptr) = self.buffer.take() {
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
    }
}

/// Exchange backed by an MPI communicator.
///
/// Use an isolated (duplicated) communicator to keep clustering traffic
/// away from other message tags in the application. The communicator's
/// error handler is assumed fatal, matching the fail-stop model of the
/// engine; transport errors therefore abort inside MPI rather than
/// surfacing here.
pub struct MpiExchange<C: Communicator> {
    comm: C,
    pending: RefCell<Vec<PendingSend>>,
}

impl<C: Communicator> MpiExchange<C> {
    /// Wrap a communicator.
    pub fn new(comm: C) -> Self {
        Self {
            comm,
            pending: RefCell::new(Vec::new()),
        }
    }

    /// Return the wrapped communicator.
    pub fn communicator(&self) -> &C {
        &self.comm
    }

    fn poll_sends(&self) {
        self.pending
            .borrow_mut()
            .retain_mut(|send| !send.try_complete());
    }
}

impl<C: Communicator> Exchange for MpiExchange<C> {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn send(&self, dest: usize, tag: i32, payload: Vec<i32>) -> Result<(), CommError> {
        // The buffer must outlive the request, so it is leaked here and
        // reclaimed when the request tests complete.
        let raw: *mut [i32] = Box::into_raw(payload.into_boxed_slice());
        let slice: &'static [i32] = unsafe { &*raw };
        let request = self
            .comm
            .process_at_rank(dest as i32)
            .immediate_send_with_tag(StaticScope, slice, tag);
        self.pending.borrow_mut().push(PendingSend {
            request: Some(request),
            buffer: Some(unsafe { NonNull::new_unchecked(raw) }),
        });
        self.poll_sends();
        Ok(())
    }

    fn try_recv(&self, source: usize, tag: i32) -> Result<Option<Vec<i32>>, CommError> {
        let process = self.comm.process_at_rank(source as i32);
        match process.immediate_matched_probe_with_tag(tag) {
            Some((message, status)) => {
                let count = status.count(i32::equivalent_datatype()) as usize;
                let mut payload = vec![0_i32; count];
                message.matched_receive_into(&mut payload[..]);
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    fn progress(&self) -> Result<(), CommError> {
        self.poll_sends();
        Ok(())
    }

    fn tag_upper_bound(&self) -> i32 {
        GUARANTEED_TAG_UPPER_BOUND
    }
}
