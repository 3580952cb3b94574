// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Non-blocking, buffered, dual-locked connection core for a WAP/SMS
//! gateway: wraps a TCP or TLS byte stream behind either direct synchronous
//! calls or a shared poller (`FdSet`) that dispatches readiness callbacks.
//!
//! Every higher-level protocol (HTTP, SMPP, WSP, RADIUS, WTLS) is expected
//! to be a state machine layered over [`connection::Connection`]; this
//! crate only provides that one abstraction, not the protocols themselves.

pub mod buffer;
pub mod cfg;
pub mod claim;
pub mod connection;
pub mod error;
pub mod fdset;
pub mod stream;
pub mod tls;

pub use connection::Connection;
pub use error::ConnError;
pub use fdset::FdSet;
