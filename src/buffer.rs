// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Growable octet buffer (spec §2 "Byte buffer", §6 external interface).
//!
//! This is deliberately narrow: append, delete-prefix, search-for-byte,
//! length, and "extend from a raw read" are all `Connection` ever needs.
//! Formatting/hex/base64 helpers are explicitly out of scope (spec §6).

/// A growable byte buffer with a reclaimable prefix.
///
/// `Connection` keeps one of these per direction (`inbuf`/`outbuf`) alongside
/// a `pos` cursor it owns; the buffer itself has no notion of "already
/// consumed" bytes, that's layered on by the caller via `delete_prefix`.
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Appends `bytes` to the end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Drops the first `n` octets in place. `n` must be `<= len()`.
    pub fn delete_prefix(&mut self, n: usize) {
        debug_assert!(n <= self.data.len());
        self.data.drain(..n);
    }

    /// Index of the first occurrence of `needle` at or after `from`, if any.
    pub fn find(&self, needle: u8, from: usize) -> Option<usize> {
        self.data[from.min(self.data.len())..]
            .iter()
            .position(|&b| b == needle)
            .map(|i| i + from)
    }

    /// Reserves room for at least `additional` more octets and returns a
    /// mutable spare-capacity slice a raw (non-blocking) read can fill, along
    /// with the length to commit via `commit_read`. Used by
    /// `Connection::unlocked_read` so the syscall writes directly into the
    /// buffer instead of through an intermediate stack array.
    pub fn spare_capacity_mut(&mut self, additional: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.resize(start + additional, 0);
        &mut self.data[start..]
    }

    /// Shrinks the buffer back down after a read that filled fewer than
    /// `additional` bytes reserved by `spare_capacity_mut`.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}
