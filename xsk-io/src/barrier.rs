//! Ordering primitives between the application and the kernel side of a ring.
//!
//! The kernel is an independent agent that only sees memory. A slot must be visible
//! before the index that publishes it, and slot reads must complete before the index
//! that releases them. On total-store-order targets hardware already keeps that order
//! and only the compiler has to be stopped from reordering; everywhere else a real
//! fence is emitted.

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
use std::sync::atomic::compiler_fence as order;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
use std::sync::atomic::fence as order;
use std::sync::atomic::Ordering;

/// Orders index loads before the slot loads that follow them.
#[inline(always)]
pub fn read_barrier() {
    order(Ordering::Acquire);
}

/// Orders every preceding slot access before the index store that follows it.
#[inline(always)]
pub fn write_barrier() {
    order(Ordering::Release);
}
