// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use gwconn::Connection;
use tokio::net::TcpListener;

/// Binds an ephemeral loopback listener and returns it alongside its address,
/// mirroring the teacher's `connect_cfg`-style helper of hiding socket
/// plumbing behind one call so each scenario file only deals with
/// `Connection`.
pub async fn loopback_listener() -> Result<(TcpListener, std::net::SocketAddr)> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind loopback listener")?;
    let addr = listener.local_addr().context("local_addr")?;
    Ok((listener, addr))
}

/// Connects one side via the public `Connection::open_tcp` entry point and
/// wraps the accepted peer via `wrap_fd` (plain, not TLS), so both ends of
/// the pair are ordinary `Connection`s built only through public API.
pub async fn connected_pair(
    listener: TcpListener,
    addr: std::net::SocketAddr,
) -> Result<(Arc<Connection>, Arc<Connection>)> {
    let accept = tokio::spawn(async move { listener.accept().await });
    let client = Connection::open_tcp(&addr.ip().to_string(), addr.port(), None)
        .await
        .context("open_tcp")?;
    let (server_stream, _) = accept.await.context("join accept")?.context("accept")?;
    let server = Connection::wrap_fd(server_stream, false, Duration::from_secs(5))
        .await
        .context("wrap_fd")?;
    Ok((client, server))
}
