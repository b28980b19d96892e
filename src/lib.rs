//! A single-threaded, completion-based I/O runtime over io_uring.
//!
//! Operations are submitted together with a completion handler; the loop
//! invokes the handler on its own thread when the kernel posts the
//! completion, and repeating operations (accept loops, stream reads,
//! periodic timers) are resubmitted in place when the handler asks for it.
//!
//! ```no_run
//! use std::time::Duration;
//! use ringloop::{EventLoop, StopSignal};
//!
//! let mut event_loop = EventLoop::new()?;
//! let stop = StopSignal::new();
//!
//! event_loop.timer(Duration::from_secs(1), |ctx, response| {
//!     println!("tick after {:.3}s", response.elapsed);
//!     !ctx.stop.stop_requested()
//! })?;
//!
//! event_loop.run(&stop)?;
//! # Ok::<(), ringloop::Error>(())
//! ```

pub mod buffer;
pub mod error;
pub mod event_loop;
pub mod fd;
pub mod guard;
pub mod operation;
mod ring;

pub use buffer::{Buffer, BufferPool};
pub use error::{error_string, try_extract_error, Error, Result};
pub use event_loop::{Dispatcher, EventLoop, StopSignal, TcpListener, UnixListener};
pub use fd::{AnyFd, File, Socket};
pub use guard::SubmitGuard;
pub use operation::{
    AcceptResponse, CloseResponse, ConnectResponse, Context, FileStats, OpenFileResponse,
    OperationId, ReadFileResponse, ReadLineResponse, ReceiveResponse, RemoteAddr, SendResponse,
    StatFileResponse, TimerResponse, WriteFileResponse,
};
