//! # oneloop-core
//!
//! Core types for the oneloop event loop.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific implementations are in `oneloop-runtime`.
//!
//! ## Modules
//!
//! - `error` - Error and fault types
//! - `buffer` - FIFO read buffer and write chunks
//! - `frame` - Frame boundary detection (fixed / delimiter / length field)
//! - `reconnect` - Reconnect delay policy
//! - `id` - Monotonic event id generator
//! - `lprint` - Kernel-style debug printing macros

#![allow(dead_code)]

pub mod buffer;
pub mod error;
pub mod frame;
pub mod id;
pub mod lprint;
pub mod reconnect;

// Re-exports for convenience
pub use buffer::{FifoBuffer, WriteChunk};
pub use error::{FrameError, IoFault, LoopError, Result, TimeoutKind};
pub use frame::{FrameDecoder, FrameMode, LengthCoding};
pub use reconnect::{DelayPolicy, ReconnectPolicy};

/// Event priorities and dispatch constants.
pub mod priority {
    /// Lowest priority an event can have.
    pub const LOWEST: i8 = -5;
    /// Highest priority an event can have.
    pub const HIGHEST: i8 = 5;
    pub const LOW: i8 = -3;
    pub const NORMAL: i8 = 0;
    pub const HIGH: i8 = 3;

    /// Number of pending stacks, one per priority level.
    pub const SLOTS: usize = (HIGHEST - LOWEST + 1) as usize;

    /// Clamp into the valid range.
    #[inline]
    pub fn clamp(p: i8) -> i8 {
        p.max(LOWEST).min(HIGHEST)
    }

    /// Stack index for a priority, 0 for LOWEST up to SLOTS-1 for HIGHEST.
    #[inline]
    pub fn slot(p: i8) -> usize {
        (clamp(p) - LOWEST) as usize
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_slot_mapping() {
            assert_eq!(SLOTS, 11);
            assert_eq!(slot(LOWEST), 0);
            assert_eq!(slot(NORMAL), 5);
            assert_eq!(slot(HIGHEST), 10);
        }

        #[test]
        fn test_clamp_out_of_range() {
            assert_eq!(clamp(100), HIGHEST);
            assert_eq!(clamp(-100), LOWEST);
            assert_eq!(slot(127), 10);
        }
    }
}

/// Repeat count sentinel for timers and idles that never expire.
pub const REPEAT_UNLIMITED: u32 = u32::MAX;
