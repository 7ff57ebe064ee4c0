use std::fmt;

use bincode::{Decode, Encode};

use crate::deopt::{DeoptimizedFrame, DeoptimizedFrameTable};

/// How the walker gets from a frame to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum FrameKind {
    /// Caller SP is SP + frame size, return address stored below it.
    Regular,
    /// Transition from foreign into managed code; the caller is found through
    /// the thread's frame anchors.
    EntryPoint,
    /// Stub whose real size is packed into the frame at run time.
    VariableSizeStub,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Regular => write!(f, "regular"),
            FrameKind::EntryPoint => write!(f, "entry"),
            FrameKind::VariableSizeStub => write!(f, "variable"),
        }
    }
}

/// Per-instruction frame metadata emitted by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct CodeInfo {
    pub total_frame_size: usize,
    pub kind: FrameKind,
    /// Offset of the exception handler from the IP, 0 if none.
    pub exception_offset: i32,
    /// Opaque handle into the compiler's reference map encoding.
    pub reference_map_index: u32,
}

pub const NO_REFERENCE_MAP: u32 = u32::MAX;

impl CodeInfo {
    pub fn regular(total_frame_size: usize) -> Self {
        Self::with_kind(total_frame_size, FrameKind::Regular)
    }

    pub fn entry_point(total_frame_size: usize) -> Self {
        Self::with_kind(total_frame_size, FrameKind::EntryPoint)
    }

    /// `nominal_frame_size` is the statically known part of the frame; the
    /// packed size slot sits two words below `SP + nominal_frame_size`.
    pub fn variable_size_stub(nominal_frame_size: usize) -> Self {
        Self::with_kind(nominal_frame_size, FrameKind::VariableSizeStub)
    }

    fn with_kind(total_frame_size: usize, kind: FrameKind) -> Self {
        CodeInfo {
            total_frame_size,
            kind,
            exception_offset: 0,
            reference_map_index: NO_REFERENCE_MAP,
        }
    }

    pub fn with_exception_offset(mut self, exception_offset: i32) -> Self {
        self.exception_offset = exception_offset;
        self
    }

    pub fn with_reference_map(mut self, reference_map_index: u32) -> Self {
        self.reference_map_index = reference_map_index;
        self
    }

    pub fn is_entry_point(&self) -> bool {
        self.kind == FrameKind::EntryPoint
    }

    pub fn is_variable_size_stub(&self) -> bool {
        self.kind == FrameKind::VariableSizeStub
    }
}

/// The code metadata service consumed by the walker.
///
/// Every method is called from the walk path: implementations must not
/// allocate, block or panic.
pub trait CodeInfoSource {
    /// Metadata for the frame whose current IP is `ip`, `None` if `ip` is not
    /// in managed code.
    fn lookup_code_info(&self, ip: usize) -> Option<CodeInfo>;

    /// The virtual frame chain replacing the physical frame at `sp`, if that
    /// frame was deoptimized.
    fn deoptimized_frame(&self, _sp: usize) -> Option<&DeoptimizedFrame> {
        None
    }

    /// When the frame at `sp` is scheduled for lazy deoptimization its return
    /// address `ip` was patched to the deopt stub; this returns the original
    /// IP the metadata must be resolved against.
    fn lazy_deopt_original_ip(&self, _sp: usize, _ip: usize) -> Option<usize> {
        None
    }
}

/// Sorted table from return address to frame metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct CodeInfoTable {
    details: Vec<(usize, CodeInfo)>,
}

impl CodeInfoTable {
    pub fn new() -> Self {
        Self { details: vec![] }
    }

    pub fn find_code_info(&self, ip: usize) -> Option<&CodeInfo> {
        self.details
            .binary_search_by_key(&ip, |(key, _)| *key)
            .ok()
            .map(|index| &self.details[index].1)
    }

    /// Insert or replace the metadata for `ip`.
    pub fn insert(&mut self, ip: usize, info: CodeInfo) {
        match self.details.binary_search_by_key(&ip, |(key, _)| *key) {
            Ok(index) => self.details[index].1 = info,
            Err(index) => self.details.insert(index, (ip, info)),
        }
    }

    pub fn extend(&mut self, entries: Vec<(usize, CodeInfo)>) {
        self.details.extend(entries);
        self.details.sort_by_key(|(key, _)| *key);
        self.details.dedup_by_key(|(key, _)| *key);
    }

    pub fn entries(&self) -> &[(usize, CodeInfo)] {
        &self.details
    }

    pub fn len(&self) -> usize {
        self.details.len()
    }

    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }
}

impl CodeInfoSource for CodeInfoTable {
    fn lookup_code_info(&self, ip: usize) -> Option<CodeInfo> {
        self.find_code_info(ip).copied()
    }
}

/// Code metadata together with the deoptimizer's view of the stack.
#[derive(Debug, Default)]
pub struct CodeCache {
    pub code_info: CodeInfoTable,
    pub deoptimized: DeoptimizedFrameTable,
}

impl CodeCache {
    pub fn new(code_info: CodeInfoTable) -> Self {
        CodeCache {
            code_info,
            deoptimized: DeoptimizedFrameTable::new(),
        }
    }
}

impl CodeInfoSource for CodeCache {
    fn lookup_code_info(&self, ip: usize) -> Option<CodeInfo> {
        self.code_info.lookup_code_info(ip)
    }

    fn deoptimized_frame(&self, sp: usize) -> Option<&DeoptimizedFrame> {
        self.deoptimized.find(sp)
    }

    fn lazy_deopt_original_ip(&self, sp: usize, ip: usize) -> Option<usize> {
        self.deoptimized.lazy_original_ip(sp, ip)
    }
}
