//! Raw access to words stored in stack frames.
//!
//! Every frame on a walkable stack ends with the return address into its
//! caller, stored one word below the caller's stack pointer:
//!
//! ```text
//!     | caller frame ...   |
//!     |--------------------| <-- caller SP = SP + total frame size
//!     | return address     |
//!     | ...                |
//!     | frame of callee    |
//!     |--------------------| <-- SP
//! ```
//!
//! The same layout holds for continuation storage, which is a copy of such
//! frames at a different address.

/// Size in bytes of one stack slot.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Low byte marking a packed variable frame size.
pub const VARIABLE_FRAME_SIZE_TAG: usize = 0x5a;
const VARIABLE_FRAME_SIZE_SHIFT: u32 = 8;

/// Offset below the nominal caller SP of the slot holding a variable-size
/// stub's packed extra frame size. The slot just above it holds the return
/// address of a fixed-size frame, so the two never overlap.
pub const VARIABLE_FRAME_SIZE_SLOT_OFFSET: usize = 2 * WORD_SIZE;

/// Pack the extra frame size of a variable-size stub into a stack word.
pub fn pack_variable_frame_size(extra_size: usize) -> usize {
    debug_assert!(
        extra_size.is_multiple_of(WORD_SIZE),
        "variable frame size must be word aligned"
    );
    (extra_size << VARIABLE_FRAME_SIZE_SHIFT) | VARIABLE_FRAME_SIZE_TAG
}

/// Unpack a word written by [`pack_variable_frame_size`]. Returns `None` for
/// anything else, which means the frame is not what the metadata claims.
pub fn unpack_variable_frame_size(word: usize) -> Option<usize> {
    if word & 0xff != VARIABLE_FRAME_SIZE_TAG {
        return None;
    }
    let size = word >> VARIABLE_FRAME_SIZE_SHIFT;
    if !size.is_multiple_of(WORD_SIZE) {
        return None;
    }
    Some(size)
}

/// Reads the walker needs from raw stack memory.
///
/// # Safety
///
/// Implementations hand back values straight from memory. The walk session
/// only passes addresses derived from a stack the caller vouched for when the
/// session was created; an implementation must not add its own translation
/// that could send reads outside that stack.
pub unsafe trait FrameAccess {
    /// Size of the return address slot below a caller SP.
    fn return_address_size(&self) -> usize {
        WORD_SIZE
    }

    /// Load one word.
    ///
    /// # Safety
    ///
    /// `address` must be word aligned and readable.
    unsafe fn read_word(&self, address: usize) -> usize;

    /// Load the return address stored for the frame whose caller SP is `sp`.
    ///
    /// # Safety
    ///
    /// `sp` must be a valid caller SP on a live (or stored) stack.
    unsafe fn read_return_address(&self, sp: usize) -> usize {
        unsafe { self.read_word(sp.wrapping_sub(self.return_address_size())) }
    }
}

/// Direct loads from the address space of the current process. Used for
/// thread stacks and for continuation storage alike.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFrameAccess;

unsafe impl FrameAccess for HostFrameAccess {
    #[inline]
    unsafe fn read_word(&self, address: usize) -> usize {
        debug_assert!(address.is_multiple_of(WORD_SIZE), "unaligned stack read");
        unsafe { std::ptr::read_volatile(address as *const usize) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_frame_size_packing() {
        let packed = pack_variable_frame_size(96);
        assert_eq!(unpack_variable_frame_size(packed), Some(96));
        assert_eq!(unpack_variable_frame_size(96), None);
        assert_eq!(unpack_variable_frame_size(0), None);
    }

    #[test]
    fn test_read_return_address_reads_word_below_sp() {
        let words: [usize; 4] = [11, 22, 33, 44];
        let base = words.as_ptr() as usize;
        let access = HostFrameAccess;
        let ra = unsafe { access.read_return_address(base + 3 * WORD_SIZE) };
        assert_eq!(ra, 33);
    }
}
