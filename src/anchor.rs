//! Frame anchors: the (SP, IP) of the last managed frame, recorded every time
//! a thread leaves managed code.
//!
//! Each thread owns a fixed-capacity arena of anchor slots used as a stack.
//! The chain is threaded through the slots by index (`AnchorHandle`), newest
//! first. Only the owning thread pushes and pops, and only while it is in
//! managed code; other threads read the chain while the owner is parked at a
//! safepoint. All slot fields are atomics so those reads never race in the
//! language sense, but the values are only meaningful under the safepoint
//! protocol.
//!
//! # Performance
//!
//! - push/pop: O(1), no allocation
//! - integrity check: O(depth), only with verification enabled

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::error::{WalkError, fatal_error};
use crate::trace::{self, EventKind};

pub const ANCHOR_CAPACITY: usize = 64;

const ANCHOR_MAGIC: usize = 0xA5C4_0D1E;
const NO_ANCHOR: u32 = u32::MAX;

cfg_if::cfg_if! {
    if #[cfg(any(debug_assertions, feature = "verify-anchors"))] {
        pub const VERIFY_ANCHORS_DEFAULT: bool = true;
    } else {
        pub const VERIFY_ANCHORS_DEFAULT: bool = false;
    }
}

/// Index of an anchor slot in its thread's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AnchorHandle(u32);

impl AnchorHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Values recorded in one anchor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameAnchor {
    pub last_sp: usize,
    pub last_ip: usize,
}

struct AnchorSlot {
    magic: AtomicUsize,
    previous: AtomicU32,
    last_sp: AtomicUsize,
    last_ip: AtomicUsize,
}

impl AnchorSlot {
    const fn new() -> Self {
        AnchorSlot {
            magic: AtomicUsize::new(0),
            previous: AtomicU32::new(NO_ANCHOR),
            last_sp: AtomicUsize::new(0),
            last_ip: AtomicUsize::new(0),
        }
    }
}

pub struct AnchorChain {
    slots: [AnchorSlot; ANCHOR_CAPACITY],
    head: AtomicU32,
    depth: AtomicUsize,
    verify: AtomicBool,
}

impl Default for AnchorChain {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AnchorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter().map(|(_, anchor)| anchor)).finish()
    }
}

impl AnchorChain {
    pub const fn new() -> Self {
        AnchorChain {
            slots: [const { AnchorSlot::new() }; ANCHOR_CAPACITY],
            head: AtomicU32::new(NO_ANCHOR),
            depth: AtomicUsize::new(0),
            verify: AtomicBool::new(VERIFY_ANCHORS_DEFAULT),
        }
    }

    pub fn set_verification(&self, enabled: bool) {
        self.verify.store(enabled, Ordering::Relaxed);
    }

    /// Link a new anchor with cleared SP/IP in front of the chain. The owner
    /// fills it in with `set_last_frame` once the transition is complete.
    pub(crate) fn push_cleared(&self) -> Result<AnchorHandle, WalkError> {
        self.verify_or_die();
        let depth = self.depth.load(Ordering::Relaxed);
        if depth >= ANCHOR_CAPACITY {
            return Err(WalkError::AnchorOverflow {
                capacity: ANCHOR_CAPACITY,
            });
        }
        let slot = &self.slots[depth];
        slot.last_sp.store(0, Ordering::Relaxed);
        slot.last_ip.store(0, Ordering::Relaxed);
        slot.previous
            .store(self.head.load(Ordering::Relaxed), Ordering::Relaxed);
        slot.magic.store(ANCHOR_MAGIC, Ordering::Relaxed);
        self.depth.store(depth + 1, Ordering::Release);
        self.head.store(depth as u32, Ordering::Release);
        Ok(AnchorHandle(depth as u32))
    }

    pub(crate) fn set_last_frame(
        &self,
        handle: AnchorHandle,
        sp: usize,
        ip: usize,
    ) -> Result<(), WalkError> {
        if (sp == 0) != (ip == 0) {
            return Err(WalkError::CorruptAnchor {
                index: handle.index(),
                reason: "sp and ip must be recorded together",
            });
        }
        let slot = &self.slots[handle.index()];
        slot.last_sp.store(sp, Ordering::Release);
        slot.last_ip.store(ip, Ordering::Release);
        self.verify_or_die();
        Ok(())
    }

    pub(crate) fn push(&self, sp: usize, ip: usize) -> Result<AnchorHandle, WalkError> {
        let handle = self.push_cleared()?;
        if let Err(err) = self.set_last_frame(handle, sp, ip) {
            let _ = self.pop();
            return Err(err);
        }
        Ok(handle)
    }

    pub(crate) fn pop(&self) -> Result<FrameAnchor, WalkError> {
        self.verify_or_die();
        let head = self.head.load(Ordering::Relaxed);
        if head == NO_ANCHOR {
            return Err(WalkError::AnchorUnderflow);
        }
        let slot = &self.slots[head as usize];
        let anchor = FrameAnchor {
            last_sp: slot.last_sp.load(Ordering::Relaxed),
            last_ip: slot.last_ip.load(Ordering::Relaxed),
        };
        self.head
            .store(slot.previous.load(Ordering::Relaxed), Ordering::Release);
        slot.magic.store(0, Ordering::Relaxed);
        self.depth.store(head as usize, Ordering::Release);
        self.verify_or_die();
        Ok(anchor)
    }

    pub fn head(&self) -> Option<AnchorHandle> {
        match self.head.load(Ordering::Acquire) {
            NO_ANCHOR => None,
            index => Some(AnchorHandle(index)),
        }
    }

    pub fn get(&self, handle: AnchorHandle) -> FrameAnchor {
        let slot = &self.slots[handle.index()];
        FrameAnchor {
            last_sp: slot.last_sp.load(Ordering::Acquire),
            last_ip: slot.last_ip.load(Ordering::Acquire),
        }
    }

    pub fn previous(&self, handle: AnchorHandle) -> Option<AnchorHandle> {
        match self.slots[handle.index()].previous.load(Ordering::Acquire) {
            NO_ANCHOR => None,
            index => Some(AnchorHandle(index)),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Starting at `from`, drop anchors recorded strictly below `sp`. Those
    /// belong to stack regions that are already unwound past, which happens
    /// when a thread re-enters managed code on a slow path while an older
    /// anchor is still pending. An anchor exactly at `sp` is kept.
    pub fn skip_anchors_below(
        &self,
        from: Option<AnchorHandle>,
        sp: usize,
    ) -> Option<AnchorHandle> {
        let mut current = from;
        while let Some(handle) = current {
            let anchor = self.get(handle);
            if anchor.last_sp >= sp {
                return Some(handle);
            }
            trace::record(EventKind::AnchorSkipped {
                anchor_sp: anchor.last_sp,
                caller_sp: sp,
            });
            current = self.previous(handle);
        }
        None
    }

    /// Anchors from newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = (AnchorHandle, FrameAnchor)> + '_ {
        let mut current = self.head();
        let mut remaining = ANCHOR_CAPACITY;
        std::iter::from_fn(move || {
            let handle = current?;
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            current = self.previous(handle);
            Some((handle, self.get(handle)))
        })
    }

    /// Verify magic markers, SP/IP pairing and chain shape.
    pub fn check_integrity(&self) -> Result<(), WalkError> {
        let depth = self.depth();
        let mut expected = depth;
        let mut current = self.head.load(Ordering::Acquire);
        while current != NO_ANCHOR {
            let index = current as usize;
            if index >= ANCHOR_CAPACITY || expected == 0 || index != expected - 1 {
                return Err(WalkError::CorruptAnchor {
                    index,
                    reason: "chain link out of order",
                });
            }
            let slot = &self.slots[index];
            if slot.magic.load(Ordering::Acquire) != ANCHOR_MAGIC {
                return Err(WalkError::CorruptAnchor {
                    index,
                    reason: "bad magic",
                });
            }
            let sp = slot.last_sp.load(Ordering::Acquire);
            let ip = slot.last_ip.load(Ordering::Acquire);
            if (sp == 0) != (ip == 0) {
                return Err(WalkError::CorruptAnchor {
                    index,
                    reason: "sp and ip must be both null or both set",
                });
            }
            expected -= 1;
            current = slot.previous.load(Ordering::Acquire);
        }
        if expected != 0 {
            return Err(WalkError::CorruptAnchor {
                index: expected,
                reason: "chain shorter than arena depth",
            });
        }
        Ok(())
    }

    fn verify_or_die(&self) {
        if !self.verify.load(Ordering::Relaxed) {
            return;
        }
        if let Err(WalkError::CorruptAnchor { index, reason }) = self.check_integrity() {
            let slot = &self.slots[index.min(ANCHOR_CAPACITY - 1)];
            fatal_error(
                reason,
                slot.last_sp.load(Ordering::Relaxed),
                slot.last_ip.load(Ordering::Relaxed),
            );
        }
    }

    #[cfg(test)]
    fn corrupt_magic(&self, handle: AnchorHandle) {
        self.slots[handle.index()].magic.store(0xbad, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn corrupt_ip(&self, handle: AnchorHandle) {
        self.slots[handle.index()].last_ip.store(0, Ordering::Relaxed);
    }
}
