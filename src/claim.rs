// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The claim bypass (spec §3 "claimed/claiming_thread", §4.1, §9).
//!
//! `claim` is documented as one-shot and irrevocable: once set, every lock
//! operation on the connection becomes a thread-identity assertion instead
//! of taking a mutex. Design note §9 suggests a compile-time witness is the
//! more idiomatic expression of this, but the testable property in spec §8
//! ("any lock operation from T2 must fail a thread-identity assertion,
//! observable as a panic in test mode") asks for a runtime check, so that's
//! what this module provides.
use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::ThreadId,
};

/// Tracks whether a connection has been claimed and, if so, by which OS
/// thread. Cheap to check on the hot path (`is_claimed` is a single atomic
/// load); the owning thread id is only consulted once claimed.
#[derive(Debug, Default)]
pub struct Claim {
    claimed: AtomicBool,
    owner: Mutex<Option<ThreadId>>,
}

impl Claim {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Claims the connection for the current thread. Returns `false` if it
    /// was already claimed (claim is one-shot).
    pub fn claim(&self) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.owner.lock().expect("claim owner mutex poisoned") =
            Some(std::thread::current().id());
        true
    }

    /// Panics if claimed and the calling thread isn't the claiming one. A
    /// no-op if the connection was never claimed (normal mutex discipline
    /// applies instead).
    #[track_caller]
    pub fn assert_owner_if_claimed(&self) {
        if !self.is_claimed() {
            return;
        }
        let owner = *self.owner.lock().expect("claim owner mutex poisoned");
        let current = std::thread::current().id();
        assert_eq!(
            owner,
            Some(current),
            "connection is claimed by another thread; claimed connections may \
             only be touched by their claiming thread"
        );
    }
}
