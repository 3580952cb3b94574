// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error and outcome types (spec §7).
//!
//! `ConnError` is the hard-failure type: it is returned from operations that
//! either never partially succeed (`open_tcp`, `register`) or that are fatal
//! to the process (TLS configuration). Everything else that can be transient
//! — would-block, timeout, interruption, a broken transport, end of stream —
//! is modeled as an explicit outcome enum returned by value, never raised.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("connection is broken")]
    Broken,

    #[error("operation not valid while connecting")]
    StillConnecting,

    #[error("connection already claimed by another owner")]
    AlreadyClaimed,

    #[error("connection is already registered with a different FdSet")]
    AlreadyRegisteredElsewhere,

    #[error("claimed connections cannot be registered with an FdSet")]
    ClaimedCannotRegister,

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("TLS handshake timed out")]
    TlsHandshakeTimeout,

    #[error("peer sent a plaintext HTTP request on a TLS port")]
    HttpOnHttps,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of `try_write` / `unlocked_write` (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// `outbuf` fully drained.
    Clean,
    /// Bytes remain queued (either below `output_buffering` or a partial
    /// send).
    Queued,
    /// The transport is broken; see `read_error`/`eof` for detail on reads,
    /// the write path simply stops making progress.
    Error,
}

/// Outcome of `wait` (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Something happened: output drained, input arrived, or the poll
    /// reported an event that was handled.
    Progress,
    /// The timeout elapsed with nothing to report.
    TimedOut,
    /// `thread_wakeup`-equivalent fired; the caller should reassess and
    /// decide whether to call `wait` again.
    Interrupted,
    /// The fd is no longer valid or the poll reported a fatal condition.
    Broken,
}

/// Outcome of `flush` (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// `outbuf` is fully drained.
    Clean,
    /// Interrupted by an external wakeup before draining completed.
    Interrupted,
    /// The transport is broken.
    Broken,
}

/// Outcome of `get_connect_result` (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectResult {
    Established,
    StillConnecting,
    Failed,
}
