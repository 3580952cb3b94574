// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Unifies a plain TCP socket and a TLS session behind one `AsyncRead` +
//! `AsyncWrite` type (spec §4.5: "TLS read/write differ from plaintext only
//! in that WANT_READ/WANT_WRITE are mapped to wrote/read 0 bytes").
//!
//! `tokio_rustls` already does that WANT_READ/WANT_WRITE -> `WouldBlock`
//! translation for us inside its `poll_read`/`poll_write`, so this enum's
//! only job is to let `Connection` hold either variant without caring which
//! one it has.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{client, server};

pub enum RawStream {
    Plain(TcpStream),
    ClientTls(Box<client::TlsStream<TcpStream>>),
    ServerTls(Box<server::TlsStream<TcpStream>>),
}

impl RawStream {
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match self {
            RawStream::Plain(s) => s.set_nodelay(nodelay),
            RawStream::ClientTls(s) => s.get_ref().0.set_nodelay(nodelay),
            RawStream::ServerTls(s) => s.get_ref().0.set_nodelay(nodelay),
        }
    }

    /// The raw TCP socket underlying either a plain or TLS stream, used by
    /// the `FdSet` background task to learn socket-level readiness without
    /// needing to know which variant it's looking at.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            RawStream::Plain(s) => s,
            RawStream::ClientTls(s) => &s.get_ref().0,
            RawStream::ServerTls(s) => &s.get_ref().0,
        }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, RawStream::Plain(_))
    }
}

impl AsyncRead for RawStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            RawStream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            RawStream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RawStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RawStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            RawStream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            RawStream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Plain(s) => Pin::new(s).poll_flush(cx),
            RawStream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            RawStream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RawStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            RawStream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            RawStream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Polls a future exactly once with a no-op waker and returns whether it
/// completed. This is how `Connection::unlocked_read`/`unlocked_write`
/// implement the spec's "attempt one non-blocking operation" semantics on
/// top of `tokio`'s normally-awaiting I/O traits, instead of spawning a task
/// per attempt.
pub fn poll_once<F: std::future::Future>(fut: F) -> Poll<F::Output> {
    let waker = futures_util::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut fut = Box::pin(fut);
    fut.as_mut().poll(&mut cx)
}
