//! Deoptimized frames as seen by the walker.
//!
//! The deoptimizer replaces a compiled physical frame with a chain of
//! virtual frames, one per logical (possibly inlined) method activation. The
//! physical frame stays on the stack with its original size, so the walker
//! still steps over it in one move; only visitor dispatch expands the chain.

use std::collections::BTreeMap;

/// Opaque description of one logical frame. Decoding it into a method and a
/// source position is the job of the metadata layer, not of the walker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub method_id: u32,
    pub bci: i32,
}

impl FrameInfo {
    pub fn new(method_id: u32, bci: i32) -> Self {
        FrameInfo { method_id, bci }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFrame {
    pub frame_info: FrameInfo,
    caller: Option<Box<VirtualFrame>>,
}

impl VirtualFrame {
    pub fn caller(&self) -> Option<&VirtualFrame> {
        self.caller.as_deref()
    }
}

/// A physical frame that was deoptimized, with its virtual frame chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptimizedFrame {
    source_total_frame_size: usize,
    source_ip: usize,
    top_frame: Box<VirtualFrame>,
}

impl DeoptimizedFrame {
    /// Build a chain from logical frames listed innermost first. Returns
    /// `None` for an empty list, a deoptimized frame always has at least one
    /// virtual frame.
    pub fn new(
        source_total_frame_size: usize,
        source_ip: usize,
        frames: &[FrameInfo],
    ) -> Option<Self> {
        let mut caller: Option<Box<VirtualFrame>> = None;
        for frame_info in frames.iter().rev() {
            caller = Some(Box::new(VirtualFrame {
                frame_info: *frame_info,
                caller,
            }));
        }
        caller.map(|top_frame| DeoptimizedFrame {
            source_total_frame_size,
            source_ip,
            top_frame,
        })
    }

    /// Size of the physical frame the chain replaced.
    pub fn source_total_frame_size(&self) -> usize {
        self.source_total_frame_size
    }

    /// IP of the compiled code at the time of deoptimization.
    pub fn source_ip(&self) -> usize {
        self.source_ip
    }

    pub fn top_frame(&self) -> &VirtualFrame {
        &self.top_frame
    }

    /// Iterate the chain innermost to outermost.
    pub fn frames(&self) -> VirtualFrames<'_> {
        VirtualFrames {
            next: Some(&self.top_frame),
        }
    }

    pub fn len(&self) -> usize {
        self.frames().count()
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

pub struct VirtualFrames<'a> {
    next: Option<&'a VirtualFrame>,
}

impl<'a> Iterator for VirtualFrames<'a> {
    type Item = &'a VirtualFrame;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.caller();
        Some(current)
    }
}

/// Deoptimized and lazily deoptimized frames of one stack, keyed by SP.
#[derive(Debug, Default)]
pub struct DeoptimizedFrameTable {
    frames: BTreeMap<usize, DeoptimizedFrame>,
    /// sp -> (deopt stub address written as return address, original ip)
    pending_lazy: BTreeMap<usize, (usize, usize)>,
}

impl DeoptimizedFrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, sp: usize, frame: DeoptimizedFrame) {
        self.frames.insert(sp, frame);
    }

    pub fn remove(&mut self, sp: usize) -> Option<DeoptimizedFrame> {
        self.frames.remove(&sp)
    }

    pub fn find(&self, sp: usize) -> Option<&DeoptimizedFrame> {
        self.frames.get(&sp)
    }

    /// Record that the frame at `sp` had its return address `original_ip`
    /// replaced by `stub_ip`.
    pub fn schedule_lazy(&mut self, sp: usize, stub_ip: usize, original_ip: usize) {
        self.pending_lazy.insert(sp, (stub_ip, original_ip));
    }

    pub fn lazy_original_ip(&self, sp: usize, ip: usize) -> Option<usize> {
        match self.pending_lazy.get(&sp) {
            Some((stub_ip, original_ip)) if *stub_ip == ip => Some(*original_ip),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_iterates_innermost_first() {
        let frame = DeoptimizedFrame::new(
            64,
            0x4000,
            &[FrameInfo::new(1, 10), FrameInfo::new(2, 20), FrameInfo::new(3, 30)],
        )
        .unwrap();

        let methods: Vec<u32> = frame.frames().map(|f| f.frame_info.method_id).collect();
        assert_eq!(methods, vec![1, 2, 3]);
        assert_eq!(frame.len(), 3);
        assert_eq!(frame.top_frame().frame_info.bci, 10);
        assert!(frame.top_frame().caller().unwrap().caller().unwrap().caller().is_none());
    }

    #[test]
    fn test_empty_chain_is_rejected() {
        assert!(DeoptimizedFrame::new(64, 0x4000, &[]).is_none());
    }

    #[test]
    fn test_lazy_deopt_only_matches_stub_address() {
        let mut table = DeoptimizedFrameTable::new();
        table.schedule_lazy(0x7000, 0xdead, 0x1234);
        assert_eq!(table.lazy_original_ip(0x7000, 0xdead), Some(0x1234));
        assert_eq!(table.lazy_original_ip(0x7000, 0x1234), None);
        assert_eq!(table.lazy_original_ip(0x7008, 0xdead), None);
    }
}
