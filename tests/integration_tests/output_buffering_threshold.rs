// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Spec §8 boundary: "Output buffering of 100 plus a single 10-byte write
//! leaves bytes queued and does not transmit until either buffering is
//! lowered, or the queue grows past the threshold, or flush/wait is called."

use std::time::Duration;

use anyhow::Result;
use gwconn::error::{FlushOutcome, WriteOutcome};

use crate::integration_tests::common::{connected_pair, loopback_listener};

#[tokio::test]
async fn below_threshold_stays_queued_until_flushed() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let (client, server) = connected_pair(listener, addr).await?;

    client.set_output_buffering(100);
    assert_eq!(client.write(&[0u8; 10]), WriteOutcome::Queued);
    assert_eq!(client.outbuf_len(), 10);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        server.read_fixed(10),
        None,
        "nothing should have been transmitted below the buffering threshold"
    );

    assert_eq!(client.flush().await, FlushOutcome::Clean);
    assert_eq!(client.outbuf_len(), 0);

    let received = server.read_fixed(10);
    assert_eq!(received, Some(vec![0u8; 10]));

    client.destroy().await;
    server.destroy().await;
    Ok(())
}

#[tokio::test]
async fn growing_past_the_threshold_transmits_without_a_flush() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let (client, server) = connected_pair(listener, addr).await?;

    client.set_output_buffering(10);
    assert_eq!(client.write(&[1u8; 5]), WriteOutcome::Queued);
    assert_eq!(client.write(&[2u8; 20]), WriteOutcome::Clean);

    let mut received = None;
    for _ in 0..50 {
        if let Some(payload) = server.read_fixed(25) {
            received = Some(payload);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mut expected = vec![1u8; 5];
    expected.extend(vec![2u8; 20]);
    assert_eq!(received, Some(expected));

    client.destroy().await;
    server.destroy().await;
    Ok(())
}
