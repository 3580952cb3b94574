// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Spec §8 end-to-end scenario 2: "Line reassembly across reads". Side B
//! starts with `inbuf = "abc"` (no LF, `read_line` returns `None`); once side
//! A sends `"def\r\nghi\n"`, the next two `read_line` calls return
//! `"abcdef"` then `"ghi"`.

use std::time::Duration;

use anyhow::Result;
use gwconn::error::WriteOutcome;

use crate::integration_tests::common::{connected_pair, loopback_listener};

#[tokio::test]
async fn partial_line_reassembles_once_the_rest_arrives() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let (client, server) = connected_pair(listener, addr).await?;

    assert_eq!(client.write(b"abc"), WriteOutcome::Clean);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.read_line(), None);

    assert_eq!(client.write(b"def\r\nghi\n"), WriteOutcome::Clean);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.read_line(), Some(b"abcdef".to_vec()));
    assert_eq!(server.read_line(), Some(b"ghi".to_vec()));

    client.destroy().await;
    server.destroy().await;
    Ok(())
}

/// The classic three-line stream from spec §8 "Round-trip / idempotence":
/// `"A\nB\r\nC\n"` yields `"A"`, `"B"`, `"C"` in order.
#[tokio::test]
async fn three_lines_in_one_stream_yield_in_order() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let (client, server) = connected_pair(listener, addr).await?;

    assert_eq!(client.write(b"A\nB\r\nC\n"), WriteOutcome::Clean);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(server.read_line(), Some(b"A".to_vec()));
    assert_eq!(server.read_line(), Some(b"B".to_vec()));
    assert_eq!(server.read_line(), Some(b"C".to_vec()));
    assert_eq!(server.read_line(), None);

    client.destroy().await;
    server.destroy().await;
    Ok(())
}
