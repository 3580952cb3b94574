// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Spec §8 end-to-end scenario 4: "Non-blocking connect". `open_tcp_nb`
//! returns a connection in *connecting* state; `get_connect_result` (driven
//! here directly, and via an `FdSet` registration) transitions it to
//! *established* on success or *failed* on error.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use gwconn::{FdSet, error::ConnectResult};

use crate::integration_tests::common::loopback_listener;

#[tokio::test]
async fn successful_connect_transitions_to_established() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let accept = tokio::spawn(async move { listener.accept().await });

    let conn = gwconn::Connection::open_tcp_nb(&addr.ip().to_string(), addr.port(), None)
        .context("open_tcp_nb")?;

    let mut result = ConnectResult::StillConnecting;
    for _ in 0..200 {
        result = conn.get_connect_result();
        if result != ConnectResult::StillConnecting {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(result, ConnectResult::Established);
    assert!(conn.is_connected());

    let _ = accept.await.context("join accept")?.context("accept")?;
    conn.destroy().await;
    Ok(())
}

#[tokio::test]
async fn refused_connect_transitions_to_failed() -> Result<()> {
    // Bind then immediately drop the listener: the port is valid but nothing
    // is listening on it, so the connect attempt is refused quickly and
    // deterministically instead of timing out against a routable-but-silent
    // host.
    let (listener, addr) = loopback_listener().await?;
    drop(listener);

    let conn = gwconn::Connection::open_tcp_nb(&addr.ip().to_string(), addr.port(), None)
        .context("open_tcp_nb")?;

    let mut result = ConnectResult::StillConnecting;
    for _ in 0..200 {
        result = conn.get_connect_result();
        if result != ConnectResult::StillConnecting {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(result, ConnectResult::Failed);
    assert!(!conn.is_connected());
    Ok(())
}

/// Registers a still-connecting connection with an `FdSet`; the first
/// dispatched callback observes `connected == connecting` and is responsible
/// for calling `get_connect_result` itself (spec §4.4 rule 1).
#[tokio::test]
async fn registered_connecting_connection_is_driven_by_the_callback() -> Result<()> {
    let (listener, addr) = loopback_listener().await?;
    let accept = tokio::spawn(async move { listener.accept().await });

    let conn = gwconn::Connection::open_tcp_nb(&addr.ip().to_string(), addr.port(), None)
        .context("open_tcp_nb")?;

    let fdset = FdSet::new(Duration::from_millis(20)).context("spawn FdSet")?;
    let established = std::sync::Arc::new(tokio::sync::Notify::new());
    let established_cb = established.clone();
    conn.register(
        &fdset,
        std::sync::Arc::new(move |conn| {
            if conn.get_connect_result() == ConnectResult::Established {
                established_cb.notify_one();
            }
        }),
    )
    .context("register")?;

    let Ok(()) = tokio::time::timeout(Duration::from_secs(2), established.notified()).await else {
        bail!("callback never observed the connection becoming established");
    };

    let _ = accept.await.context("join accept")?.context("accept")?;
    conn.destroy().await;
    Ok(())
}
