//! Interrupt-safe critical sections
//!
//! The buddy allocator, the ready queue, and every wait queue are mutated
//! under a brief interrupt-disable, the same discipline the reference
//! scheduler already applies around its own ready-queue update
//! (`cortex_m::interrupt::free` in `pick_next_task`). We go through the
//! `critical-section` crate instead of calling `cortex_m::interrupt::free`
//! directly so that the exact same call sites also run under `cargo test`
//! on the host: the `cortex-m` dependency registers a real single-core
//! implementation for the embedded target (via its
//! `critical-section-single-core` feature), and the `critical-section`
//! crate's own `std` feature registers a `std::sync::Mutex`-backed
//! implementation for host test binaries. This mirrors the reference
//! scheduler's own example application, which enables
//! `critical-section-single-core` on `cortex-m` for exactly this reason.

// Copyright (c) 2025 Ferrous Systems
// SPDX-License-Identifier: GPL-3.0-or-later

/// Run `f` with interrupts masked, returning its result.
pub(crate) fn free<R>(f: impl FnOnce() -> R) -> R {
    critical_section::with(|_cs| f())
}

// End of File
