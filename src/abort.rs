// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::sync::{atomic::AtomicBool, Arc};

/// Cooperative cancellation flag polled by builders and searches
///
/// Cloning shares the flag. The default value is "not aborted".
#[derive(Clone, Debug, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    /// Requests cancellation.
    pub fn send(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Release);
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Raises [`crate::Error::Cancelled`] once cancellation was requested.
    pub(crate) fn check(&self) -> crate::Result<()> {
        if self.is_aborted() {
            Err(crate::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
