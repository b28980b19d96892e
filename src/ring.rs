//! Thin wrapper around the io_uring instance.
//!
//! The ring knows nothing about operations: it pushes pre-encoded SQEs,
//! submits, and pops completions. Operation encoding lives with the records
//! so the pointers written into an SQE always come from a record's stable
//! fields.

use io_uring::{squeue, types, IoUring};

use crate::error::{Error, Result};

pub(crate) struct Ring {
    ring: IoUring,
}

impl Ring {
    /// Create the ring at the given submission-queue depth.
    pub fn new(depth: u32) -> Result<Ring> {
        let ring = IoUring::new(depth).map_err(|e| Error::Setup {
            operation: "io_uring_queue_init",
            source: e,
        })?;
        Ok(Ring { ring })
    }

    /// Push one SQE. If the submission queue is full, flush it and retry
    /// once before reporting exhaustion.
    pub fn push(&mut self, entry: squeue::Entry) -> Result<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.submit()?;
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| Error::SubmissionQueueFull)?;
            }
        }
        Ok(())
    }

    /// Submit all pending SQEs without waiting.
    pub fn submit(&mut self) -> Result<()> {
        self.ring.submit().map_err(|e| Error::Setup {
            operation: "io_uring_submit",
            source: e,
        })?;
        Ok(())
    }

    /// Wait for one completion, up to `timeout`. Returns the completion's
    /// user-data word and result, or `None` on timeout. Pending SQEs are
    /// submitted as part of the wait.
    pub fn wait_one(&mut self, timeout: &types::Timespec) -> Result<Option<(u64, i32)>> {
        if let Some(cqe) = self.ring.completion().next() {
            return Ok(Some((cqe.user_data(), cqe.result())));
        }

        let args = types::SubmitArgs::new().timespec(timeout);
        match self.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
            Err(e) => return Err(Error::RingWait(e)),
        }

        Ok(self
            .ring
            .completion()
            .next()
            .map(|cqe| (cqe.user_data(), cqe.result())))
    }
}
