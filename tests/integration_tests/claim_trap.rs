// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Spec §8 end-to-end scenario 6: "Claim + concurrent-access trap". After
//! `claim(conn)` on one thread, any lock operation from a different thread
//! trips a thread-identity assertion.

use std::time::Duration;

use anyhow::{Context, Result};

use crate::integration_tests::common::{connected_pair, loopback_listener};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn claim_is_one_shot_and_traps_cross_thread_access() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let (client, server) = connected_pair(listener, addr).await?;
    drop(server);

    assert!(client.claim());
    assert!(!client.claim(), "claim must be one-shot");

    // Operations from the claiming thread proceed normally.
    client.write(b"ping");

    let other = client.clone();
    let handle = std::thread::spawn(move || {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            other.write(b"pong");
        }))
    });
    let result = handle.join().context("joining the other thread")?;
    assert!(
        result.is_err(),
        "a write from a non-claiming thread must panic the thread-identity assertion"
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    client.destroy().await;
    Ok(())
}

/// A claimed connection cannot be registered with an `FdSet` (spec §5:
/// "Claim is incompatible with register").
#[tokio::test]
async fn claimed_connection_cannot_be_registered() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let (client, server) = connected_pair(listener, addr).await?;
    drop(server);

    assert!(client.claim());

    let fdset = gwconn::FdSet::new(Duration::from_millis(50)).context("spawn FdSet")?;
    let result = client.register(&fdset, std::sync::Arc::new(|_| {}));
    assert!(matches!(
        result,
        Err(gwconn::error::ConnError::ClaimedCannotRegister)
    ));

    client.destroy().await;
    Ok(())
}
