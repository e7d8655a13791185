//! Object lifecycle flags

use bitflags::bitflags;
use std::sync::atomic::{AtomicU32, Ordering};

bitflags! {
    /// Lifecycle and reachability flags of a managed object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFlags: u32 {
        /// Explicitly rooted
        const ROOT_SET = 1 << 0;
        /// Kept alive by runtime policy
        const KEEP_ALIVE = 1 << 1;
        /// Not reached by the current or last reachability pass
        const UNREACHABLE = 1 << 2;
        /// Marked for destruction; strong references to it are eliminated
        const PENDING_KILL = 1 << 3;
        /// BeginDestroy has run
        const BEGIN_DESTROYED = 1 << 4;
        /// FinishDestroy has run
        const FINISH_DESTROYED = 1 << 5;
        /// Root of a cluster; reaching any cluster object marks the whole cluster
        const CLUSTER_ROOT = 1 << 6;

        /// Flags that seed a reachability pass
        const ROOTS = Self::ROOT_SET.bits() | Self::KEEP_ALIVE.bits();
        /// Any destruction stage
        const DESTROYING = Self::BEGIN_DESTROYED.bits() | Self::FINISH_DESTROYED.bits();
    }
}

/// Flag word shared between collector threads
#[derive(Debug, Default)]
pub struct AtomicObjectFlags(AtomicU32);

impl AtomicObjectFlags {
    /// Create with initial flags
    pub fn new(flags: ObjectFlags) -> Self {
        Self(AtomicU32::new(flags.bits()))
    }

    /// Current flags
    #[inline(always)]
    pub fn load(&self) -> ObjectFlags {
        ObjectFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    /// Check whether any of `flags` is set
    #[inline(always)]
    pub fn intersects(&self, flags: ObjectFlags) -> bool {
        self.load().intersects(flags)
    }

    /// Set `flags`
    pub fn insert(&self, flags: ObjectFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear `flags`
    pub fn remove(&self, flags: ObjectFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Clear UNREACHABLE, returning true only for the caller that cleared it
    ///
    /// Two workers racing on the same object see exactly one `true`.
    #[inline(always)]
    pub fn try_clear_unreachable(&self) -> bool {
        let bit = ObjectFlags::UNREACHABLE.bits();
        self.0.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }
}
