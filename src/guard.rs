//! Scoped submission batching.
//!
//! A handler broadcasting one message to N connections would otherwise pay
//! N ring submits; a [`SubmitGuard`] collapses the burst into one. While the
//! guard is in scope, submissions made through it only push their SQEs and
//! bump a counter; dropping the guard issues a single ring submit if the
//! counter is nonzero.

use std::path::Path;
use std::time::Duration;

use crate::buffer::Buffer;
use crate::error::Result;
use crate::event_loop::{EventLoop, SubmitMode, TcpListener, UnixListener};
use crate::fd::{AnyFd, File, Socket};
use crate::operation::{
    AcceptResponse, AddressFamily, CloseResponse, ConnectResponse, Context, OpenFileResponse,
    ReadFileResponse, ReadLineResponse, ReceiveResponse, SendResponse, StatFileResponse,
    TimerResponse, WriteFileResponse,
};

/// A batching scope over the event loop's submission facade.
///
/// Obtained from [`EventLoop::batch`]. Mutably borrows the loop for its
/// lifetime, so a burst is naturally scoped; there is no way to copy one.
pub struct SubmitGuard<'a> {
    event_loop: &'a mut EventLoop,
    pending: usize,
}

impl<'a> SubmitGuard<'a> {
    pub(crate) fn new(event_loop: &'a mut EventLoop) -> SubmitGuard<'a> {
        SubmitGuard {
            event_loop,
            pending: 0,
        }
    }

    /// Submissions deferred so far in this scope.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Flush the batch now instead of waiting for the scope to end.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending > 0 {
            self.pending = 0;
            self.event_loop.flush_ring()?;
        }
        Ok(())
    }

    pub fn close(
        &mut self,
        fd: impl Into<AnyFd>,
        handler: impl FnMut(&mut Context<'_>, CloseResponse) + 'static,
    ) -> Result<()> {
        self.event_loop.submit_close(
            fd.into(),
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn timer(
        &mut self,
        duration: Duration,
        handler: impl FnMut(&mut Context<'_>, TimerResponse) -> bool + 'static,
    ) -> Result<()> {
        self.event_loop.submit_timer(
            duration,
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn accept(
        &mut self,
        listener: &TcpListener,
        handler: impl FnMut(&mut Context<'_>, AcceptResponse) -> bool + 'static,
    ) -> Result<()> {
        self.event_loop.submit_accept(
            listener.socket(),
            AddressFamily::Inet,
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn accept_unix(
        &mut self,
        listener: &UnixListener,
        handler: impl FnMut(&mut Context<'_>, AcceptResponse) -> bool + 'static,
    ) -> Result<()> {
        self.event_loop.submit_accept(
            listener.socket(),
            AddressFamily::Unix,
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn connect(
        &mut self,
        address: std::net::Ipv4Addr,
        port: u16,
        handler: impl FnMut(&mut Context<'_>, ConnectResponse) + 'static,
    ) -> Result<()> {
        self.event_loop.submit_connect_inet(
            std::net::SocketAddrV4::new(address, port),
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn connect_unix(
        &mut self,
        path: impl AsRef<Path>,
        handler: impl FnMut(&mut Context<'_>, ConnectResponse) + 'static,
    ) -> Result<()> {
        self.event_loop.submit_connect_unix(
            path.as_ref(),
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn receive(
        &mut self,
        client: Socket,
        buffer: Buffer,
        handler: impl FnMut(&mut Context<'_>, ReceiveResponse<'_>) -> bool + 'static,
    ) -> Result<()> {
        self.event_loop.submit_receive(
            client,
            buffer,
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn send(
        &mut self,
        client: Socket,
        data: Buffer,
        handler: impl FnMut(&mut Context<'_>, SendResponse) + 'static,
    ) -> Result<()> {
        self.event_loop.submit_send(
            client,
            data,
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn open_file(
        &mut self,
        path: impl AsRef<Path>,
        handler: impl FnMut(&mut Context<'_>, OpenFileResponse) + 'static,
    ) -> Result<()> {
        self.open_file_with(path, 0, 0, handler)
    }

    pub fn open_file_with(
        &mut self,
        path: impl AsRef<Path>,
        flags: i32,
        mode: u32,
        handler: impl FnMut(&mut Context<'_>, OpenFileResponse) + 'static,
    ) -> Result<()> {
        self.event_loop.submit_open_file(
            path.as_ref(),
            flags,
            mode,
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn read_file(
        &mut self,
        file: File,
        buffer: Buffer,
        offset: u64,
        handler: impl FnMut(&mut Context<'_>, ReadFileResponse<'_>) -> bool + 'static,
    ) -> Result<()> {
        self.event_loop.submit_read_file(
            file,
            buffer,
            offset,
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn write_file(
        &mut self,
        file: File,
        data: Buffer,
        handler: impl FnMut(&mut Context<'_>, WriteFileResponse) + 'static,
    ) -> Result<()> {
        self.event_loop.submit_write_file(
            file,
            data,
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn stat_file(
        &mut self,
        path: impl AsRef<Path>,
        handler: impl FnMut(&mut Context<'_>, StatFileResponse) + 'static,
    ) -> Result<()> {
        self.event_loop.submit_stat_file(
            path.as_ref(),
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }

    pub fn read_line(
        &mut self,
        buffer: Buffer,
        handler: impl FnMut(&mut Context<'_>, ReadLineResponse<'_>) -> bool + 'static,
    ) -> Result<()> {
        self.read_line_from(File::STDIN, buffer, handler)
    }

    pub fn read_line_from(
        &mut self,
        file: File,
        buffer: Buffer,
        handler: impl FnMut(&mut Context<'_>, ReadLineResponse<'_>) -> bool + 'static,
    ) -> Result<()> {
        self.event_loop.submit_read_line(
            file,
            buffer,
            Box::new(handler),
            SubmitMode::Deferred(&mut self.pending),
        )
    }
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        if self.pending > 0 {
            if let Err(e) = self.event_loop.flush_ring() {
                tracing::warn!("batched submit failed on scope exit: {e}");
            }
        }
    }
}
