//! Operation records and their completion handling.
//!
//! Every in-flight operation is one variant of [`Operation`], heap-allocated
//! in the loop's registry and never moved while the kernel holds pointers
//! into it. A variant owns everything its kind needs: the kernel-visible
//! cells (timespec, sockaddr storage, C path, statx buffer), any buffers
//! handed to the kernel, and the boxed completion handler.
//!
//! `encode` builds the SQE for a (re)submission from the record's stable
//! fields; `handle` assembles the response from the completion result,
//! invokes the handler, and returns the retire/resubmit verdict.

use std::ffi::CString;
use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use io_uring::{opcode, squeue, types};

use crate::buffer::Buffer;
use crate::error::{try_extract_error, Error, Result};
use crate::event_loop::EventLoop;
use crate::event_loop::StopSignal;
use crate::fd::{AnyFd, File, Socket};

/// Identifier assigned by the loop at submission, carried in the SQE
/// user-data word, unique for the lifetime of a run.
pub type OperationId = u64;

/// The context handed to every completion handler.
pub struct Context<'a> {
    /// The loop that dispatched this completion. Handlers submit further
    /// operations through it.
    pub event_loop: &'a mut EventLoop,
    /// The run's stop signal; handlers may request a stop.
    pub stop: &'a StopSignal,
    /// The kernel's completion result: non-negative on success, a negated
    /// errno on failure.
    pub result: i32,
}

impl Context<'_> {
    /// The result as a byte count, clamped to zero on failure.
    pub fn result_size(&self) -> usize {
        if self.result > 0 {
            self.result as usize
        } else {
            0
        }
    }

    /// The result as an error message, when it is negative.
    pub fn error(&self) -> Option<String> {
        try_extract_error(self.result)
    }
}

/// The remote end of a connection-oriented operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAddr {
    Inet(SocketAddrV4),
    Unix(PathBuf),
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAddr::Inet(addr) => write!(f, "{addr}"),
            RemoteAddr::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// File metadata from an asynchronous stat.
#[derive(Clone, Copy)]
pub struct FileStats {
    raw: libc::statx,
}

impl FileStats {
    pub(crate) fn new(raw: libc::statx) -> FileStats {
        FileStats { raw }
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.raw.stx_size
    }

    /// File mode bits (type and permissions).
    pub fn mode(&self) -> u16 {
        self.raw.stx_mode
    }

    /// Number of 512-byte blocks allocated.
    pub fn blocks(&self) -> u64 {
        self.raw.stx_blocks
    }

    pub fn is_file(&self) -> bool {
        u32::from(self.raw.stx_mode) & libc::S_IFMT == libc::S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        u32::from(self.raw.stx_mode) & libc::S_IFMT == libc::S_IFDIR
    }
}

impl fmt::Debug for FileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStats")
            .field("size", &self.size())
            .field("mode", &self.mode())
            .field("blocks", &self.blocks())
            .finish()
    }
}

// Response payloads, one per operation kind.

#[derive(Debug, Clone, Copy)]
pub struct CloseResponse {
    /// The descriptor that was closed.
    pub fd: AnyFd,
}

#[derive(Debug, Clone, Copy)]
pub struct TimerResponse {
    /// Seconds elapsed since the timer was (re)armed.
    pub elapsed: f64,
}

#[derive(Debug, Clone)]
pub struct AcceptResponse {
    /// The accepted client socket; invalid when the accept failed.
    pub client: Socket,
    /// The client's address as reported by the kernel.
    pub peer: RemoteAddr,
}

#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub client: Socket,
    pub server: RemoteAddr,
    /// Present when the connect failed.
    pub error: Option<String>,
}

/// Received bytes. The slice borrows the operation's buffer and is only
/// valid for the duration of the handler call.
#[derive(Debug)]
pub struct ReceiveResponse<'a> {
    pub client: Socket,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct SendResponse {
    pub client: Socket,
    /// Bytes sent; zero on disconnect or error.
    pub size: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct OpenFileResponse {
    /// The opened file; invalid when the open failed.
    pub file: File,
}

/// Bytes read from a file. The slice borrows the operation's buffer and is
/// only valid for the duration of the handler call.
#[derive(Debug)]
pub struct ReadFileResponse<'a> {
    pub file: File,
    pub data: &'a [u8],
    /// The byte offset these bytes were read at.
    pub offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct WriteFileResponse {
    pub file: File,
    /// Bytes written; zero on error.
    pub size: usize,
}

#[derive(Debug)]
pub struct StatFileResponse {
    /// Present when the stat succeeded.
    pub stats: Option<FileStats>,
}

/// A completed line from the line reader, including its trailing newline.
#[derive(Debug)]
pub struct ReadLineResponse<'a> {
    pub line: &'a str,
}

// Handler contracts. One-shot kinds return unit; repeating kinds return
// true to resubmit the same operation.

pub type CloseHandler = Box<dyn FnMut(&mut Context<'_>, CloseResponse)>;
pub type TimerHandler = Box<dyn FnMut(&mut Context<'_>, TimerResponse) -> bool>;
pub type AcceptHandler = Box<dyn FnMut(&mut Context<'_>, AcceptResponse) -> bool>;
pub type ConnectHandler = Box<dyn FnMut(&mut Context<'_>, ConnectResponse)>;
pub type ReceiveHandler = Box<dyn FnMut(&mut Context<'_>, ReceiveResponse<'_>) -> bool>;
pub type SendHandler = Box<dyn FnMut(&mut Context<'_>, SendResponse)>;
pub type OpenFileHandler = Box<dyn FnMut(&mut Context<'_>, OpenFileResponse)>;
pub type ReadFileHandler = Box<dyn FnMut(&mut Context<'_>, ReadFileResponse<'_>) -> bool>;
pub type WriteFileHandler = Box<dyn FnMut(&mut Context<'_>, WriteFileResponse)>;
pub type StatFileHandler = Box<dyn FnMut(&mut Context<'_>, StatFileResponse)>;

/// Address family of an accept's listener, deciding how the peer address
/// cell is decoded.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AddressFamily {
    Inet,
    Unix,
}

/// What the loop does with a record after its handler ran.
pub(crate) enum Verdict {
    Retire,
    Resubmit,
}

/// One in-flight operation: kind, kernel-stable parameter cells, and the
/// completion handler.
pub(crate) enum Operation {
    Close {
        fd: AnyFd,
        handler: CloseHandler,
    },
    Timer {
        start: Instant,
        duration: Duration,
        timespec: types::Timespec,
        handler: TimerHandler,
    },
    Accept {
        server: Socket,
        family: AddressFamily,
        peer_addr: libc::sockaddr_storage,
        peer_len: libc::socklen_t,
        handler: AcceptHandler,
    },
    Connect {
        client: Socket,
        server: RemoteAddr,
        addr: libc::sockaddr_storage,
        addr_len: libc::socklen_t,
        handler: ConnectHandler,
    },
    Receive {
        client: Socket,
        buffer: Buffer,
        handler: ReceiveHandler,
    },
    Send {
        client: Socket,
        data: Buffer,
        handler: SendHandler,
    },
    OpenFile {
        path: CString,
        flags: i32,
        mode: u32,
        handler: OpenFileHandler,
    },
    ReadFile {
        file: File,
        buffer: Buffer,
        offset: u64,
        handler: ReadFileHandler,
    },
    WriteFile {
        file: File,
        data: Buffer,
        handler: WriteFileHandler,
    },
    StatFile {
        path: CString,
        flags: i32,
        mask: u32,
        stats: libc::statx,
        handler: StatFileHandler,
    },
}

impl Operation {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Operation::Close { .. } => "close",
            Operation::Timer { .. } => "timer",
            Operation::Accept { .. } => "accept",
            Operation::Connect { .. } => "connect",
            Operation::Receive { .. } => "receive",
            Operation::Send { .. } => "send",
            Operation::OpenFile { .. } => "open_file",
            Operation::ReadFile { .. } => "read_file",
            Operation::WriteFile { .. } => "write_file",
            Operation::StatFile { .. } => "stat_file",
        }
    }

    /// Build the SQE for this operation. Every pointer written into the
    /// entry targets a field of this record, which the registry keeps at a
    /// stable address until the completion is observed.
    pub(crate) fn encode(&mut self, id: OperationId) -> squeue::Entry {
        let entry = match self {
            Operation::Close { fd, .. } => opcode::Close::new(types::Fd(fd.raw())).build(),
            Operation::Timer {
                start,
                duration,
                timespec,
                ..
            } => {
                // Each (re)submission sleeps only for what is left of the
                // requested duration; the handler resets `start` when it
                // asks for a fresh countdown.
                let remaining = duration.saturating_sub(start.elapsed());
                *timespec = types::Timespec::new()
                    .sec(remaining.as_secs())
                    .nsec(remaining.subsec_nanos());
                let ts: *const types::Timespec = timespec;
                opcode::Timeout::new(ts).count(1).build()
            }
            Operation::Accept {
                server,
                peer_addr,
                peer_len,
                ..
            } => {
                *peer_addr = unsafe { mem::zeroed() };
                *peer_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                let addr: *mut libc::sockaddr_storage = peer_addr;
                opcode::Accept::new(
                    types::Fd(server.raw()),
                    addr.cast::<libc::sockaddr>(),
                    peer_len as *mut libc::socklen_t,
                )
                .build()
            }
            Operation::Connect {
                client,
                addr,
                addr_len,
                ..
            } => {
                let addr: *const libc::sockaddr_storage = addr;
                opcode::Connect::new(
                    types::Fd(client.raw()),
                    addr.cast::<libc::sockaddr>(),
                    *addr_len,
                )
                .build()
            }
            Operation::Receive { client, buffer, .. } => opcode::Recv::new(
                types::Fd(client.raw()),
                buffer.data(),
                buffer.size() as u32,
            )
            .build(),
            Operation::Send { client, data, .. } => opcode::Send::new(
                types::Fd(client.raw()),
                data.data(),
                data.size() as u32,
            )
            .build(),
            Operation::OpenFile {
                path, flags, mode, ..
            } => opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), path.as_ptr())
                .flags(*flags)
                .mode(*mode)
                .build(),
            Operation::ReadFile {
                file,
                buffer,
                offset,
                ..
            } => opcode::Read::new(
                types::Fd(file.raw()),
                buffer.data(),
                buffer.size() as u32,
            )
            .offset(*offset)
            .build(),
            Operation::WriteFile { file, data, .. } => opcode::Write::new(
                types::Fd(file.raw()),
                data.data(),
                data.size() as u32,
            )
            .offset(0)
            .build(),
            Operation::StatFile {
                path,
                flags,
                mask,
                stats,
                ..
            } => {
                let stats: *mut libc::statx = stats;
                opcode::Statx::new(types::Fd(libc::AT_FDCWD), path.as_ptr(), stats.cast())
                    .flags(*flags)
                    .mask(*mask)
                    .build()
            }
        };
        entry.user_data(id)
    }

    /// Dispatch a completion to the handler and decide the record's fate.
    ///
    /// For the repeating kinds a non-positive result retires the operation
    /// regardless of the handler's vote: resubmitting after end-of-stream or
    /// error would spin against the kernel.
    pub(crate) fn handle(&mut self, ctx: &mut Context<'_>) -> Verdict {
        match self {
            Operation::Close { fd, handler } => {
                handler(ctx, CloseResponse { fd: *fd });
                Verdict::Retire
            }
            Operation::Timer {
                start,
                duration,
                handler,
                ..
            } => {
                let elapsed = start.elapsed();
                if elapsed < *duration {
                    // Woken early by unrelated ring activity; go back to
                    // sleep for the remainder without involving the handler.
                    return Verdict::Resubmit;
                }
                let fire_again = handler(
                    ctx,
                    TimerResponse {
                        elapsed: elapsed.as_secs_f64(),
                    },
                );
                if fire_again {
                    *start = Instant::now();
                    Verdict::Resubmit
                } else {
                    Verdict::Retire
                }
            }
            Operation::Accept {
                family,
                peer_addr,
                peer_len,
                handler,
                ..
            } => {
                let client = Socket::new(ctx.result);
                let peer = decode_sockaddr(*family, peer_addr, *peer_len);
                let keep = handler(ctx, AcceptResponse { client, peer });
                if keep && ctx.result > 0 {
                    Verdict::Resubmit
                } else {
                    Verdict::Retire
                }
            }
            Operation::Connect {
                client,
                server,
                handler,
                ..
            } => {
                let response = ConnectResponse {
                    client: *client,
                    server: server.clone(),
                    error: ctx.error(),
                };
                handler(ctx, response);
                Verdict::Retire
            }
            Operation::Receive {
                client,
                buffer,
                handler,
            } => {
                let size = ctx.result_size();
                let data = view(buffer, size);
                let keep = handler(
                    ctx,
                    ReceiveResponse {
                        client: *client,
                        data,
                    },
                );
                if keep && ctx.result > 0 {
                    buffer.clear();
                    Verdict::Resubmit
                } else {
                    Verdict::Retire
                }
            }
            Operation::Send {
                client,
                handler,
                ..
            } => {
                let response = SendResponse {
                    client: *client,
                    size: ctx.result_size(),
                };
                handler(ctx, response);
                Verdict::Retire
            }
            Operation::OpenFile { handler, .. } => {
                let response = OpenFileResponse {
                    file: File::new(ctx.result),
                };
                handler(ctx, response);
                Verdict::Retire
            }
            Operation::ReadFile {
                file,
                buffer,
                offset,
                handler,
            } => {
                let size = ctx.result_size();
                let data = view(buffer, size);
                let keep = handler(
                    ctx,
                    ReadFileResponse {
                        file: *file,
                        data,
                        offset: *offset,
                    },
                );
                if keep && ctx.result > 0 {
                    *offset += ctx.result as u64;
                    buffer.clear();
                    Verdict::Resubmit
                } else {
                    Verdict::Retire
                }
            }
            Operation::WriteFile { file, handler, .. } => {
                let response = WriteFileResponse {
                    file: *file,
                    size: ctx.result_size(),
                };
                handler(ctx, response);
                Verdict::Retire
            }
            Operation::StatFile { stats, handler, .. } => {
                let stats = if ctx.result >= 0 {
                    Some(FileStats::new(*stats))
                } else {
                    None
                };
                handler(ctx, StatFileResponse { stats });
                Verdict::Retire
            }
        }
    }
}

/// A slice of the first `size` bytes of a buffer. The lifetime is detached
/// from the buffer handle; callers only pass it down into a handler call.
fn view(buffer: &Buffer, size: usize) -> &'static [u8] {
    if size == 0 {
        &[]
    } else {
        let size = size.min(buffer.size());
        unsafe { std::slice::from_raw_parts(buffer.data(), size) }
    }
}

/// Encode an IPv4 address into pre-zeroed sockaddr storage.
pub(crate) fn fill_inet_sockaddr(
    storage: &mut libc::sockaddr_storage,
    addr: SocketAddrV4,
) -> libc::socklen_t {
    *storage = unsafe { mem::zeroed() };
    let sa = (storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>();
    unsafe {
        (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
        (*sa).sin_port = addr.port().to_be();
        (*sa).sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    }
    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
}

/// Encode a filesystem path into pre-zeroed sockaddr storage as a Unix
/// socket address.
pub(crate) fn fill_unix_sockaddr(
    storage: &mut libc::sockaddr_storage,
    path: &Path,
) -> Result<libc::socklen_t> {
    *storage = unsafe { mem::zeroed() };
    let sa = (storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_un>();
    let bytes = path.as_os_str().as_bytes();

    let capacity = unsafe { (*sa).sun_path.len() };
    if bytes.len() >= capacity {
        return Err(Error::PathTooLong);
    }

    unsafe {
        (*sa).sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (i, &byte) in bytes.iter().enumerate() {
            (*sa).sun_path[i] = byte as libc::c_char;
        }
    }
    Ok((mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t)
}

/// Decode the kernel-populated peer address cell of an accept.
pub(crate) fn decode_sockaddr(
    family: AddressFamily,
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> RemoteAddr {
    match family {
        AddressFamily::Inet => {
            let sa = (storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>();
            let (ip, port) = unsafe {
                (
                    Ipv4Addr::from(u32::from_be((*sa).sin_addr.s_addr)),
                    u16::from_be((*sa).sin_port),
                )
            };
            RemoteAddr::Inet(SocketAddrV4::new(ip, port))
        }
        AddressFamily::Unix => {
            let sa = (storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_un>();
            let header = mem::size_of::<libc::sa_family_t>();
            let mut path = Vec::new();
            if (len as usize) > header {
                let sun_path = unsafe { &(*sa).sun_path };
                for &byte in sun_path.iter() {
                    if byte == 0 {
                        break;
                    }
                    path.push(byte as u8);
                }
            }
            RemoteAddr::Unix(PathBuf::from(
                std::ffi::OsString::from_vec(path),
            ))
        }
    }
}
