//! Mapped stack memory and a builder that lays managed frames out in it.
//!
//! A region is an mmap with an inaccessible guard page at its low end, the
//! same way thread stacks are set up for managed code. Frames are laid out
//! from the top of the region downward, innermost frame lowest.

use std::ffi::c_void;

use mmap_rs::{MmapMut, MmapOptions};

use crate::anchor::FrameAnchor;
use crate::error::WalkError;
use crate::frame_access::{
    FrameAccess, VARIABLE_FRAME_SIZE_SLOT_OFFSET, WORD_SIZE, pack_variable_frame_size,
};

pub struct StackRegion {
    map: MmapMut,
    guard_size: usize,
}

impl std::fmt::Debug for StackRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackRegion")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("top", &format_args!("{:#x}", self.top()))
            .finish()
    }
}

impl StackRegion {
    /// Map at least `size` usable bytes plus one guard page below them.
    pub fn new(size: usize) -> Result<Self, WalkError> {
        let page_size = MmapOptions::page_size();
        let size = size.max(WORD_SIZE).next_multiple_of(page_size);
        let map = MmapOptions::new(size + page_size)?.map_mut()?;
        // the stack grows down, so overrunning it hits the first page
        let result =
            unsafe { libc::mprotect(map.as_ptr() as *mut c_void, page_size, libc::PROT_NONE) };
        if result != 0 {
            return Err(WalkError::MemoryMapping(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok(StackRegion {
            map,
            guard_size: page_size,
        })
    }

    /// Lowest usable address.
    pub fn base(&self) -> usize {
        self.map.as_ptr() as usize + self.guard_size
    }

    /// One past the highest usable address. Stacks start here.
    pub fn top(&self) -> usize {
        self.map.as_ptr() as usize + self.map.len()
    }

    pub fn size(&self) -> usize {
        self.top() - self.base()
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base() && address < self.top()
    }

    fn offset_of_word(&self, address: usize) -> Option<usize> {
        if !address.is_multiple_of(WORD_SIZE)
            || address < self.base()
            || address.checked_add(WORD_SIZE)? > self.top()
        {
            return None;
        }
        Some(address - self.map.as_ptr() as usize)
    }

    pub fn load(&self, address: usize) -> Option<usize> {
        let offset = self.offset_of_word(address)?;
        let bytes = self.map[offset..offset + WORD_SIZE].try_into().ok()?;
        Some(usize::from_ne_bytes(bytes))
    }

    pub fn store(&mut self, address: usize, value: usize) -> Result<(), WalkError> {
        let offset = self.offset_of_word(address).ok_or_else(|| WalkError::InvalidLayout {
            reason: format!("word {:#x} is outside of {:?}", address, self),
        })?;
        self.map[offset..offset + WORD_SIZE].copy_from_slice(&value.to_ne_bytes());
        Ok(())
    }

    /// The usable bytes, without the guard page.
    pub fn bytes(&self) -> &[u8] {
        &self.map[self.guard_size..]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let guard_size = self.guard_size;
        &mut self.map[guard_size..]
    }
}

/// Bounds-checked reads: anything outside the region reads as 0, which the
/// walker treats as the end of the stack or an unknown frame.
unsafe impl FrameAccess for StackRegion {
    unsafe fn read_word(&self, address: usize) -> usize {
        self.load(address).unwrap_or(0)
    }

    unsafe fn read_return_address(&self, sp: usize) -> usize {
        match sp.checked_sub(self.return_address_size()) {
            Some(address) => self.load(address).unwrap_or(0),
            None => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayout {
    Managed {
        ip: usize,
        size: usize,
    },
    /// A stub whose metadata gives `nominal_size`; `extra_size` more bytes
    /// are allocated at run time and recorded in the frame.
    VariableSize {
        ip: usize,
        nominal_size: usize,
        extra_size: usize,
    },
    /// Frames of code without metadata. Managed code is re-entered through
    /// an entry point below it and resumed through an anchor above it.
    Native {
        size: usize,
    },
}

impl FrameLayout {
    pub fn ip(&self) -> Option<usize> {
        match *self {
            FrameLayout::Managed { ip, .. } | FrameLayout::VariableSize { ip, .. } => Some(ip),
            FrameLayout::Native { .. } => None,
        }
    }

    pub fn size(&self) -> usize {
        match *self {
            FrameLayout::Managed { size, .. } | FrameLayout::Native { size } => size,
            FrameLayout::VariableSize {
                nominal_size,
                extra_size,
                ..
            } => nominal_size + extra_size,
        }
    }

    fn validate(&self) -> Result<(), WalkError> {
        let reason = match *self {
            _ if !self.size().is_multiple_of(WORD_SIZE) => "frame size is not word aligned",
            FrameLayout::Managed { ip: 0, .. } | FrameLayout::VariableSize { ip: 0, .. } => {
                "managed frame without an ip"
            }
            FrameLayout::Managed { size, .. } | FrameLayout::Native { size } if size == 0 => {
                "empty frame"
            }
            FrameLayout::VariableSize {
                nominal_size,
                extra_size,
                ..
            } if nominal_size < VARIABLE_FRAME_SIZE_SLOT_OFFSET
                || !extra_size.is_multiple_of(WORD_SIZE) =>
            {
                "variable size stub too small for its size slot"
            }
            _ => return Ok(()),
        };
        Err(WalkError::InvalidLayout {
            reason: format!("{} ({:?})", reason, self),
        })
    }
}

/// Where a laid out stack ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltStack {
    /// SP of the innermost frame.
    pub start_sp: usize,
    /// Caller SP of the outermost frame.
    pub end_sp: usize,
    /// SP of every frame, innermost first.
    pub frame_sps: Vec<usize>,
    /// Anchors a thread would hold for the native frames, oldest first.
    pub anchors: Vec<FrameAnchor>,
}

/// Frames to lay out, listed innermost first.
#[derive(Debug, Clone, Default)]
pub struct StackBuilder {
    frames: Vec<FrameLayout>,
}

impl StackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn managed(mut self, ip: usize, size: usize) -> Self {
        self.frames.push(FrameLayout::Managed { ip, size });
        self
    }

    pub fn variable_size(mut self, ip: usize, nominal_size: usize, extra_size: usize) -> Self {
        self.frames.push(FrameLayout::VariableSize {
            ip,
            nominal_size,
            extra_size,
        });
        self
    }

    pub fn native(mut self, size: usize) -> Self {
        self.frames.push(FrameLayout::Native { size });
        self
    }

    pub fn frames(&self) -> &[FrameLayout] {
        &self.frames
    }

    pub fn has_native_frames(&self) -> bool {
        self.frames
            .iter()
            .any(|frame| matches!(frame, FrameLayout::Native { .. }))
    }

    /// Bytes needed, including the slot holding the innermost frame's IP.
    pub fn required_size(&self) -> usize {
        self.frames.iter().map(FrameLayout::size).sum::<usize>() + WORD_SIZE
    }

    /// Lay the frames out at the top of `region`.
    ///
    /// Every managed frame gets its caller's IP in its highest word (0 when
    /// the caller is native or missing), a variable-size stub also gets its
    /// packed extra size, and the innermost frame's own IP is stored just
    /// below it.
    pub fn build(&self, region: &mut StackRegion) -> Result<BuiltStack, WalkError> {
        if self.frames.is_empty() {
            return Err(WalkError::InvalidLayout {
                reason: "no frames".to_string(),
            });
        }
        for frame in &self.frames {
            frame.validate()?;
        }
        if self.required_size() > region.size() {
            return Err(WalkError::InvalidLayout {
                reason: format!(
                    "{} bytes of frames do not fit in a {} byte region",
                    self.required_size(),
                    region.size()
                ),
            });
        }

        let end_sp = region.top();
        let mut frame_sps = vec![0; self.frames.len()];
        let mut caller_sp = end_sp;
        for (index, frame) in self.frames.iter().enumerate().rev() {
            caller_sp -= frame.size();
            frame_sps[index] = caller_sp;
        }

        let mut anchors = Vec::new();
        for (index, frame) in self.frames.iter().enumerate() {
            let sp = frame_sps[index];
            let caller = self.frames.get(index + 1);
            match *frame {
                FrameLayout::Native { .. } => {
                    if let Some(ip) = caller.and_then(FrameLayout::ip) {
                        anchors.push(FrameAnchor {
                            last_sp: frame_sps[index + 1],
                            last_ip: ip,
                        });
                    }
                    continue;
                }
                FrameLayout::VariableSize { nominal_size, extra_size, .. } => {
                    region.store(
                        sp + nominal_size - VARIABLE_FRAME_SIZE_SLOT_OFFSET,
                        pack_variable_frame_size(extra_size),
                    )?;
                }
                FrameLayout::Managed { .. } => {}
            }
            let caller_ip = caller.and_then(FrameLayout::ip).unwrap_or(0);
            region.store(sp + frame.size() - WORD_SIZE, caller_ip)?;
        }

        let start_sp = frame_sps[0];
        if let Some(ip) = self.frames[0].ip() {
            region.store(start_sp - WORD_SIZE, ip)?;
        }
        anchors.reverse();

        Ok(BuiltStack {
            start_sp,
            end_sp,
            frame_sps,
            anchors,
        })
    }
}
