// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Spec §8 end-to-end scenario 1: "Length-prefixed echo". Over the wire this
//! is `00 00 00 02 68 69` for the payload `"hi"`.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use gwconn::error::WriteOutcome;

use crate::integration_tests::common::{connected_pair, loopback_listener};

#[tokio::test]
async fn write_withlen_round_trips_exact_bytes() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let (client, server) = connected_pair(listener, addr).await?;

    assert_eq!(client.write_withlen(b"hi"), WriteOutcome::Clean);

    let mut received = None;
    for _ in 0..50 {
        if let Some(payload) = server.read_withlen() {
            received = Some(payload);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let Some(payload) = received else {
        bail!("read_withlen never produced the echoed payload");
    };
    assert_eq!(payload, b"hi".to_vec());

    client.destroy().await;
    server.destroy().await;
    Ok(())
}

/// Confirms the literal wire bytes the spec calls out, by reading the raw
/// framing straight off a second loopback pair with no `Connection` on the
/// reading side to intercept it.
#[tokio::test]
async fn wire_bytes_match_the_spec_literal() -> Result<()> {
    use tokio::io::AsyncReadExt;

    let (listener, addr) = loopback_listener().await?;
    let accept = tokio::spawn(async move { listener.accept().await });
    let client = gwconn::Connection::open_tcp(&addr.ip().to_string(), addr.port(), None)
        .await
        .context("open_tcp")?;
    let (mut raw_server, _) = accept.await.context("join")?.context("accept")?;

    assert_eq!(client.write_withlen(b"hi"), WriteOutcome::Clean);

    let mut buf = [0u8; 6];
    raw_server.read_exact(&mut buf).await.context("read_exact")?;
    assert_eq!(buf, [0x00, 0x00, 0x00, 0x02, b'h', b'i']);

    client.destroy().await;
    Ok(())
}
