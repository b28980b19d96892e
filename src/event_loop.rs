//! The event loop: registry, completion dispatch, and the submission facade.
//!
//! The loop owns the ring, the id-keyed registry of in-flight operation
//! records, and the cross-thread dispatch queue. Everything except
//! [`Dispatcher::dispatch`] and [`StopSignal`] must happen on the thread
//! that calls [`EventLoop::run`]: handlers run to completion on that thread
//! and may submit further operations (including resubmitting their own)
//! from inside completion dispatch.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use io_uring::types;
use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferPool};
use crate::error::{Error, Result};
use crate::fd::{AnyFd, File, Socket};
use crate::guard::SubmitGuard;
use crate::operation::{
    decode_sockaddr, fill_inet_sockaddr, fill_unix_sockaddr, AcceptHandler, AcceptResponse,
    AddressFamily, CloseHandler, CloseResponse, ConnectHandler, ConnectResponse, Context,
    OpenFileHandler, OpenFileResponse, Operation, OperationId, ReadFileHandler, ReadFileResponse,
    ReadLineResponse, ReceiveHandler, ReceiveResponse, RemoteAddr, SendHandler, SendResponse,
    StatFileHandler, StatFileResponse, TimerHandler, TimerResponse, Verdict, WriteFileHandler,
    WriteFileResponse,
};
use crate::ring::Ring;

/// Default submission-queue depth.
const DEFAULT_DEPTH: u32 = 256;

/// How long one ring wait may block before the loop wakes to drain the
/// dispatch queue and re-check the stop signal.
const WAKE_INTERVAL: Duration = Duration::from_millis(500);

/// Cooperative stop flag for [`EventLoop::run`]. Cloneable and safe to
/// raise from any thread; the loop notices within one wake interval.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> StopSignal {
        StopSignal::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

type DispatchedCallback = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// Cross-thread handle onto the loop's dispatch queue.
///
/// The loop itself is single-threaded; this is the one way other threads
/// hand it work. Queued callbacks run on the loop thread, after the next
/// completion or within one wake interval, whichever comes first.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<Mutex<Vec<DispatchedCallback>>>,
}

impl Dispatcher {
    pub fn dispatch(&self, callback: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.queue.lock().push(Box::new(callback));
    }
}

/// A listening TCP socket plus the address it is bound to.
#[derive(Debug, Clone, Copy)]
pub struct TcpListener {
    socket: Socket,
    address: SocketAddrV4,
}

impl TcpListener {
    pub fn socket(&self) -> Socket {
        self.socket
    }

    /// The bound address, with the kernel-assigned port when port 0 was
    /// requested.
    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }
}

/// A listening Unix-domain socket plus its filesystem path.
#[derive(Debug, Clone)]
pub struct UnixListener {
    socket: Socket,
    path: PathBuf,
}

impl UnixListener {
    pub fn socket(&self) -> Socket {
        self.socket
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether a submission flushes the ring immediately or is counted by a
/// [`SubmitGuard`] for a single flush at the end of the burst.
pub(crate) enum SubmitMode<'g> {
    Now,
    Deferred(&'g mut usize),
}

/// The completion-based I/O runtime.
pub struct EventLoop {
    ring: Ring,
    next_id: OperationId,
    operations: HashMap<OperationId, Box<Operation>>,
    dispatched: Arc<Mutex<Vec<DispatchedCallback>>>,
    pool: BufferPool,
}

impl EventLoop {
    /// Create a loop with the default ring depth.
    pub fn new() -> Result<EventLoop> {
        EventLoop::with_depth(DEFAULT_DEPTH)
    }

    /// Create a loop with an explicit ring depth.
    pub fn with_depth(depth: u32) -> Result<EventLoop> {
        Ok(EventLoop {
            ring: Ring::new(depth)?,
            next_id: 1,
            operations: HashMap::new(),
            dispatched: Arc::new(Mutex::new(Vec::new())),
            pool: BufferPool::new(),
        })
    }

    /// Run until the stop signal is raised. Blocks the calling thread;
    /// every handler and dispatched callback runs here.
    pub fn run(&mut self, stop: &StopSignal) -> Result<()> {
        let timeout = types::Timespec::new()
            .sec(WAKE_INTERVAL.as_secs())
            .nsec(WAKE_INTERVAL.subsec_nanos());

        while !stop.stop_requested() {
            match self.ring.wait_one(&timeout)? {
                None => {
                    self.run_dispatched();
                }
                Some((id, result)) => {
                    self.complete(id, result, stop)?;
                    self.run_dispatched();
                }
            }
        }
        Ok(())
    }

    /// Queue a callback to run on the loop thread. Safe to call from
    /// handlers; for other threads, see [`EventLoop::dispatcher`].
    pub fn dispatch(&self, callback: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.dispatched.lock().push(Box::new(callback));
    }

    /// A cloneable, thread-safe handle onto the dispatch queue.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            queue: self.dispatched.clone(),
        }
    }

    /// Start a batched-submission scope. Submissions made through the
    /// returned guard are flushed to the kernel with a single submit when
    /// the guard is dropped.
    pub fn batch(&mut self) -> SubmitGuard<'_> {
        SubmitGuard::new(self)
    }

    /// Number of operations submitted but not yet retired.
    pub fn pending_operations(&self) -> usize {
        self.operations.len()
    }

    /// A pooled, zeroed buffer of exactly `size` bytes.
    pub fn allocate(&mut self, size: usize) -> Buffer {
        self.pool.allocate(size)
    }

    /// Return a buffer to the pool. The region is recycled when no other
    /// handle refers to it; otherwise the handle is simply dropped.
    pub fn deallocate(&mut self, buffer: Buffer) {
        self.pool.deallocate(buffer);
    }

    // Submission facade.

    /// Asynchronously close a descriptor.
    pub fn close(
        &mut self,
        fd: impl Into<AnyFd>,
        handler: impl FnMut(&mut Context<'_>, CloseResponse) + 'static,
    ) -> Result<()> {
        self.submit_close(fd.into(), Box::new(handler), SubmitMode::Now)
    }

    /// Fire a timer after `duration`. The handler returns true to re-arm
    /// the timer, restarting the countdown from the current instant.
    pub fn timer(
        &mut self,
        duration: Duration,
        handler: impl FnMut(&mut Context<'_>, TimerResponse) -> bool + 'static,
    ) -> Result<()> {
        self.submit_timer(duration, Box::new(handler), SubmitMode::Now)
    }

    /// Accept connections on a TCP listener. The handler returns true to
    /// keep accepting with the same operation.
    pub fn accept(
        &mut self,
        listener: &TcpListener,
        handler: impl FnMut(&mut Context<'_>, AcceptResponse) -> bool + 'static,
    ) -> Result<()> {
        self.submit_accept(
            listener.socket(),
            AddressFamily::Inet,
            Box::new(handler),
            SubmitMode::Now,
        )
    }

    /// Accept connections on a Unix-domain listener.
    pub fn accept_unix(
        &mut self,
        listener: &UnixListener,
        handler: impl FnMut(&mut Context<'_>, AcceptResponse) -> bool + 'static,
    ) -> Result<()> {
        self.submit_accept(
            listener.socket(),
            AddressFamily::Unix,
            Box::new(handler),
            SubmitMode::Now,
        )
    }

    /// Connect to an IPv4 endpoint. The client socket is created
    /// synchronously; the connect itself completes through the handler,
    /// which receives an error string when the kernel refused it.
    pub fn connect(
        &mut self,
        address: Ipv4Addr,
        port: u16,
        handler: impl FnMut(&mut Context<'_>, ConnectResponse) + 'static,
    ) -> Result<()> {
        self.submit_connect_inet(
            SocketAddrV4::new(address, port),
            Box::new(handler),
            SubmitMode::Now,
        )
    }

    /// Connect to a Unix-domain socket path.
    pub fn connect_unix(
        &mut self,
        path: impl AsRef<Path>,
        handler: impl FnMut(&mut Context<'_>, ConnectResponse) + 'static,
    ) -> Result<()> {
        self.submit_connect_unix(path.as_ref(), Box::new(handler), SubmitMode::Now)
    }

    /// Receive into `buffer`. The handler returns true to keep receiving
    /// with the same operation; a non-positive result retires it regardless.
    pub fn receive(
        &mut self,
        client: Socket,
        buffer: Buffer,
        handler: impl FnMut(&mut Context<'_>, ReceiveResponse<'_>) -> bool + 'static,
    ) -> Result<()> {
        self.submit_receive(client, buffer, Box::new(handler), SubmitMode::Now)
    }

    /// Send the bytes of `data`. The operation holds a handle on the
    /// buffer until it completes.
    pub fn send(
        &mut self,
        client: Socket,
        data: Buffer,
        handler: impl FnMut(&mut Context<'_>, SendResponse) + 'static,
    ) -> Result<()> {
        self.submit_send(client, data, Box::new(handler), SubmitMode::Now)
    }

    /// Open a file read-only.
    pub fn open_file(
        &mut self,
        path: impl AsRef<Path>,
        handler: impl FnMut(&mut Context<'_>, OpenFileResponse) + 'static,
    ) -> Result<()> {
        self.open_file_with(path, 0, 0, handler)
    }

    /// Open a file with explicit flags and mode.
    pub fn open_file_with(
        &mut self,
        path: impl AsRef<Path>,
        flags: i32,
        mode: u32,
        handler: impl FnMut(&mut Context<'_>, OpenFileResponse) + 'static,
    ) -> Result<()> {
        self.submit_open_file(path.as_ref(), flags, mode, Box::new(handler), SubmitMode::Now)
    }

    /// Read from `file` at `offset`. On resubmission the offset advances by
    /// the bytes read, so a handler returning true streams through the file.
    pub fn read_file(
        &mut self,
        file: File,
        buffer: Buffer,
        offset: u64,
        handler: impl FnMut(&mut Context<'_>, ReadFileResponse<'_>) -> bool + 'static,
    ) -> Result<()> {
        self.submit_read_file(file, buffer, offset, Box::new(handler), SubmitMode::Now)
    }

    /// Write the bytes of `data` to `file`.
    pub fn write_file(
        &mut self,
        file: File,
        data: Buffer,
        handler: impl FnMut(&mut Context<'_>, WriteFileResponse) + 'static,
    ) -> Result<()> {
        self.submit_write_file(file, data, Box::new(handler), SubmitMode::Now)
    }

    /// Stat a path. The response carries the stats on success; on failure
    /// the handler derives the error from the context result.
    pub fn stat_file(
        &mut self,
        path: impl AsRef<Path>,
        handler: impl FnMut(&mut Context<'_>, StatFileResponse) + 'static,
    ) -> Result<()> {
        self.submit_stat_file(path.as_ref(), Box::new(handler), SubmitMode::Now)
    }

    /// Read lines from standard input. The handler receives each completed
    /// line including its newline and returns true to keep reading.
    pub fn read_line(
        &mut self,
        buffer: Buffer,
        handler: impl FnMut(&mut Context<'_>, ReadLineResponse<'_>) -> bool + 'static,
    ) -> Result<()> {
        self.read_line_from(File::STDIN, buffer, handler)
    }

    /// Read lines from an arbitrary readable descriptor.
    pub fn read_line_from(
        &mut self,
        file: File,
        buffer: Buffer,
        handler: impl FnMut(&mut Context<'_>, ReadLineResponse<'_>) -> bool + 'static,
    ) -> Result<()> {
        self.submit_read_line(file, buffer, Box::new(handler), SubmitMode::Now)
    }

    /// Asynchronously write `text` to a file using a pooled buffer. The
    /// buffer handle is released back to the pool before the caller's
    /// handler runs.
    pub fn print_file(
        &mut self,
        file: File,
        text: &str,
        handler: impl FnMut(&mut Context<'_>, WriteFileResponse) + 'static,
    ) -> Result<()> {
        let buffer = self.pool.allocate(text.len());
        buffer.copy_from(text.as_bytes());
        let mut returned = Some(buffer.clone());
        let mut handler = handler;
        self.write_file(file, buffer, move |ctx, response| {
            if let Some(pooled) = returned.take() {
                ctx.event_loop.deallocate(pooled);
            }
            handler(ctx, response);
        })
    }

    pub fn print_stdout(
        &mut self,
        text: &str,
        handler: impl FnMut(&mut Context<'_>, WriteFileResponse) + 'static,
    ) -> Result<()> {
        self.print_file(File::STDOUT, text, handler)
    }

    pub fn print_stderr(
        &mut self,
        text: &str,
        handler: impl FnMut(&mut Context<'_>, WriteFileResponse) + 'static,
    ) -> Result<()> {
        self.print_file(File::STDERR, text, handler)
    }

    // Synchronous listener construction.

    /// Create, bind, and listen on a TCP socket with address reuse.
    pub fn tcp_listen(
        &mut self,
        address: Ipv4Addr,
        port: u16,
        backlog: i32,
    ) -> Result<TcpListener> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(Error::last_os("socket"));
        }

        let enable: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&enable as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(close_on_error(fd, "setsockopt(SO_REUSEADDR)"));
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = fill_inet_sockaddr(&mut storage, SocketAddrV4::new(address, port));
        let rc = unsafe {
            libc::bind(fd, (&storage as *const libc::sockaddr_storage).cast(), len)
        };
        if rc < 0 {
            return Err(close_on_error(fd, "bind"));
        }

        let rc = unsafe { libc::listen(fd, backlog) };
        if rc < 0 {
            return Err(close_on_error(fd, "listen"));
        }

        let bound = local_inet_addr(fd)?;
        tracing::debug!(address = %bound, "tcp listener ready");
        Ok(TcpListener {
            socket: Socket::new(fd),
            address: bound,
        })
    }

    /// Create, bind, and listen on a Unix-domain socket. Any existing
    /// socket file at `path` is unlinked first.
    pub fn unix_listen(&mut self, path: impl AsRef<Path>, backlog: i32) -> Result<UnixListener> {
        let path = path.as_ref();
        let c_path =
            CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::InvalidPath)?;

        let rc = unsafe { libc::unlink(c_path.as_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::Setup {
                    operation: "unlink",
                    source: err,
                });
            }
        }

        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(Error::last_os("socket"));
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match fill_unix_sockaddr(&mut storage, path) {
            Ok(len) => len,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        let rc = unsafe {
            libc::bind(fd, (&storage as *const libc::sockaddr_storage).cast(), len)
        };
        if rc < 0 {
            return Err(close_on_error(fd, "bind"));
        }

        let rc = unsafe { libc::listen(fd, backlog) };
        if rc < 0 {
            return Err(close_on_error(fd, "listen"));
        }

        tracing::debug!(path = %path.display(), "unix listener ready");
        Ok(UnixListener {
            socket: Socket::new(fd),
            path: path.to_path_buf(),
        })
    }

    /// Create a datagram socket bound to the address.
    pub fn udp_receiver(&mut self, address: Ipv4Addr, port: u16) -> Result<Socket> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(Error::last_os("socket"));
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = fill_inet_sockaddr(&mut storage, SocketAddrV4::new(address, port));
        let rc = unsafe {
            libc::bind(fd, (&storage as *const libc::sockaddr_storage).cast(), len)
        };
        if rc < 0 {
            return Err(close_on_error(fd, "bind"));
        }

        Ok(Socket::new(fd))
    }

    // Internal submission paths, shared with SubmitGuard.

    pub(crate) fn submit_close(
        &mut self,
        fd: AnyFd,
        handler: CloseHandler,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        self.submit_operation(Operation::Close { fd, handler }, submit)
    }

    pub(crate) fn submit_timer(
        &mut self,
        duration: Duration,
        handler: TimerHandler,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        self.submit_operation(
            Operation::Timer {
                start: std::time::Instant::now(),
                duration,
                timespec: types::Timespec::new(),
                handler,
            },
            submit,
        )
    }

    pub(crate) fn submit_accept(
        &mut self,
        server: Socket,
        family: AddressFamily,
        handler: AcceptHandler,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        self.submit_operation(
            Operation::Accept {
                server,
                family,
                peer_addr: unsafe { mem::zeroed() },
                peer_len: 0,
                handler,
            },
            submit,
        )
    }

    pub(crate) fn submit_connect_inet(
        &mut self,
        address: SocketAddrV4,
        handler: ConnectHandler,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(Error::last_os("socket"));
        }

        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let addr_len = fill_inet_sockaddr(&mut addr, address);
        let result = self.submit_operation(
            Operation::Connect {
                client: Socket::new(fd),
                server: RemoteAddr::Inet(address),
                addr,
                addr_len,
                handler,
            },
            submit,
        );
        if result.is_err() {
            unsafe { libc::close(fd) };
        }
        result
    }

    pub(crate) fn submit_connect_unix(
        &mut self,
        path: &Path,
        handler: ConnectHandler,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(Error::last_os("socket"));
        }

        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let addr_len = match fill_unix_sockaddr(&mut addr, path) {
            Ok(len) => len,
            Err(e) => {
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        let result = self.submit_operation(
            Operation::Connect {
                client: Socket::new(fd),
                server: RemoteAddr::Unix(path.to_path_buf()),
                addr,
                addr_len,
                handler,
            },
            submit,
        );
        if result.is_err() {
            unsafe { libc::close(fd) };
        }
        result
    }

    pub(crate) fn submit_receive(
        &mut self,
        client: Socket,
        buffer: Buffer,
        handler: ReceiveHandler,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        self.submit_operation(
            Operation::Receive {
                client,
                buffer,
                handler,
            },
            submit,
        )
    }

    pub(crate) fn submit_send(
        &mut self,
        client: Socket,
        data: Buffer,
        handler: SendHandler,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        self.submit_operation(
            Operation::Send {
                client,
                data,
                handler,
            },
            submit,
        )
    }

    pub(crate) fn submit_open_file(
        &mut self,
        path: &Path,
        flags: i32,
        mode: u32,
        handler: OpenFileHandler,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::InvalidPath)?;
        self.submit_operation(
            Operation::OpenFile {
                path,
                flags,
                mode,
                handler,
            },
            submit,
        )
    }

    pub(crate) fn submit_read_file(
        &mut self,
        file: File,
        buffer: Buffer,
        offset: u64,
        handler: ReadFileHandler,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        self.submit_operation(
            Operation::ReadFile {
                file,
                buffer,
                offset,
                handler,
            },
            submit,
        )
    }

    pub(crate) fn submit_write_file(
        &mut self,
        file: File,
        data: Buffer,
        handler: WriteFileHandler,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        self.submit_operation(
            Operation::WriteFile {
                file,
                data,
                handler,
            },
            submit,
        )
    }

    pub(crate) fn submit_stat_file(
        &mut self,
        path: &Path,
        handler: StatFileHandler,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::InvalidPath)?;
        self.submit_operation(
            Operation::StatFile {
                path,
                flags: 0,
                mask: libc::STATX_BASIC_STATS,
                stats: unsafe { mem::zeroed() },
                handler,
            },
            submit,
        )
    }

    pub(crate) fn submit_read_line(
        &mut self,
        file: File,
        buffer: Buffer,
        mut handler: Box<dyn FnMut(&mut Context<'_>, ReadLineResponse<'_>) -> bool>,
        submit: SubmitMode<'_>,
    ) -> Result<()> {
        let mut line: Vec<u8> = Vec::new();
        self.submit_read_file(
            file,
            buffer,
            0,
            Box::new(move |ctx, response| {
                for &byte in response.data {
                    line.push(byte);
                    if byte == b'\n' {
                        let text = String::from_utf8_lossy(&line).into_owned();
                        line.clear();
                        if !handler(ctx, ReadLineResponse { line: &text }) {
                            return false;
                        }
                    }
                }
                true
            }),
            submit,
        )
    }

    /// Flush pending submission-queue entries. Used by the submit guard on
    /// scope exit.
    pub(crate) fn flush_ring(&mut self) -> Result<()> {
        self.ring.submit()
    }

    /// Allocate an id, stash the record, encode and push its SQE, and
    /// either flush now or leave the flush to the guard. On any failure
    /// the record is retired before the error propagates.
    fn submit_operation(&mut self, operation: Operation, submit: SubmitMode<'_>) -> Result<()> {
        let id = self.next_id;
        self.next_id += 1;

        let mut record = Box::new(operation);
        let entry = record.encode(id);
        tracing::trace!(id, operation = record.name(), "submit");
        self.operations.insert(id, record);

        if let Err(e) = self.ring.push(entry) {
            self.operations.remove(&id);
            return Err(e);
        }

        match submit {
            SubmitMode::Now => {
                if let Err(e) = self.ring.submit() {
                    self.operations.remove(&id);
                    return Err(e);
                }
            }
            SubmitMode::Deferred(pending) => *pending += 1,
        }
        Ok(())
    }

    /// Route one completion to its record's handler, then retire the
    /// record or re-encode and resubmit it.
    fn complete(&mut self, id: OperationId, result: i32, stop: &StopSignal) -> Result<()> {
        let Some(mut record) = self.operations.remove(&id) else {
            tracing::trace!(id, result, "completion for unknown operation");
            return Ok(());
        };

        if result < 0 && !matches!(*record, Operation::Timer { .. }) {
            tracing::warn!(
                id,
                operation = record.name(),
                result,
                "operation completed with error"
            );
        } else {
            tracing::trace!(id, operation = record.name(), result, "completion");
        }

        // The record is out of the registry for the duration of the handler
        // call, so handlers may submit further operations freely. The boxed
        // contents never move; kernel-visible pointers stay valid across
        // the reinsertion below.
        let verdict = {
            let mut ctx = Context {
                event_loop: self,
                stop,
                result,
            };
            record.handle(&mut ctx)
        };

        match verdict {
            Verdict::Retire => {
                tracing::trace!(id, operation = record.name(), "retired");
            }
            Verdict::Resubmit => {
                let entry = record.encode(id);
                self.operations.insert(id, record);
                if let Err(e) = self.ring.push(entry) {
                    self.operations.remove(&id);
                    return Err(e);
                }
                if let Err(e) = self.ring.submit() {
                    self.operations.remove(&id);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Move the queued callbacks out under the lock, then run them without
    /// it: callbacks submit operations and may enqueue further dispatches,
    /// which land in the next drain.
    fn run_dispatched(&mut self) {
        let callbacks = { mem::take(&mut *self.dispatched.lock()) };
        for callback in callbacks {
            callback(self);
        }
    }
}

fn close_on_error(fd: libc::c_int, operation: &'static str) -> Error {
    let err = Error::last_os(operation);
    unsafe { libc::close(fd) };
    err
}

/// The address a socket is actually bound to.
fn local_inet_addr(fd: libc::c_int) -> Result<SocketAddrV4> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, (&mut storage as *mut libc::sockaddr_storage).cast(), &mut len)
    };
    if rc < 0 {
        return Err(close_on_error(fd, "getsockname"));
    }
    match decode_sockaddr(AddressFamily::Inet, &storage, len) {
        RemoteAddr::Inet(addr) => Ok(addr),
        RemoteAddr::Unix(_) => unreachable!("inet decode"),
    }
}
