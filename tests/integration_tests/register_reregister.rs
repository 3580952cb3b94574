// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Spec §8 "Round-trip / idempotence": re-registering with the same `FdSet`
//! only swaps the callback; re-registering with a different `FdSet` fails.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use gwconn::{FdSet, error::{ConnError, WriteOutcome}};

use crate::integration_tests::common::{connected_pair, loopback_listener};

#[tokio::test]
async fn reregistering_the_same_fdset_only_swaps_the_callback() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let (client, server) = connected_pair(listener, addr).await?;

    let fdset = FdSet::new(Duration::from_millis(20)).context("spawn FdSet")?;

    let first_calls = Arc::new(AtomicUsize::new(0));
    let fc = first_calls.clone();
    client
        .register(&fdset, Arc::new(move |_| { fc.fetch_add(1, Ordering::SeqCst); }))
        .context("first register")?;

    let second_calls = Arc::new(AtomicUsize::new(0));
    let sc = second_calls.clone();
    client
        .register(&fdset, Arc::new(move |_| { sc.fetch_add(1, Ordering::SeqCst); }))
        .context("re-register with same fdset must succeed")?;

    // Trigger a POLLIN-driven callback on `client` by having the peer send
    // data, rather than relying on `client`'s own write draining (which
    // may complete synchronously and never touch the poll loop at all).
    assert_eq!(server.write(b"trigger a callback"), WriteOutcome::Clean);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        first_calls.load(Ordering::SeqCst),
        0,
        "the first callback must never fire again once swapped"
    );
    assert!(
        second_calls.load(Ordering::SeqCst) > 0,
        "the second (current) callback should have fired"
    );

    client.destroy().await;
    server.destroy().await;
    Ok(())
}

#[tokio::test]
async fn reregistering_a_different_fdset_fails() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let (client, server) = connected_pair(listener, addr).await?;
    drop(server);

    let fdset_a = FdSet::new(Duration::from_millis(20)).context("spawn fdset a")?;
    let fdset_b = FdSet::new(Duration::from_millis(20)).context("spawn fdset b")?;

    client.register(&fdset_a, Arc::new(|_| {})).context("register with a")?;
    let result = client.register(&fdset_b, Arc::new(|_| {}));
    assert!(matches!(
        result,
        Err(ConnError::AlreadyRegisteredElsewhere)
    ));

    client.destroy().await;
    Ok(())
}
