//! Stored continuations: managed frames copied off a thread stack into their
//! own storage, which may be moved while a walk over it is in progress.

use crate::error::WalkError;
use crate::stack_region::{BuiltStack, StackBuilder, StackRegion};

/// What the walker needs to know about a continuation's frame storage.
pub trait ContinuationFrames {
    /// SP of the innermost stored frame, 0 if the continuation holds none.
    fn frames_start(&self) -> usize;

    /// Caller SP of the outermost stored frame, 0 for no bound.
    fn frames_end(&self) -> usize;

    /// IP to resume at, 0 to read it from the stored frames.
    fn ip(&self) -> usize;
}

/// A continuation backed by a mapped stack region. Positions are kept as
/// depths below the top of the region so they survive relocation.
#[derive(Debug, Default)]
pub struct StoredContinuation {
    region: Option<StackRegion>,
    start_depth: usize,
    end_depth: usize,
    ip: usize,
}

impl StoredContinuation {
    /// A continuation that was never filled.
    pub fn uninitialized() -> Self {
        Self::default()
    }

    /// Store frames laid out by `builder`. A continuation only holds managed
    /// frames.
    pub fn from_builder(builder: &StackBuilder) -> Result<(Self, BuiltStack), WalkError> {
        if builder.has_native_frames() {
            return Err(WalkError::InvalidLayout {
                reason: "continuations cannot hold native frames".to_string(),
            });
        }
        let mut region = StackRegion::new(builder.required_size())?;
        let built = builder.build(&mut region)?;
        let continuation = Self::from_region(region, built.start_sp, built.end_sp, 0)?;
        Ok((continuation, built))
    }

    /// Wrap frames already present in `region` between `start_sp` and
    /// `end_sp`.
    pub fn from_region(
        region: StackRegion,
        start_sp: usize,
        end_sp: usize,
        ip: usize,
    ) -> Result<Self, WalkError> {
        let top = region.top();
        if !region.contains(start_sp) || end_sp > top || end_sp < start_sp {
            return Err(WalkError::InvalidLayout {
                reason: format!(
                    "frames {:#x}..{:#x} are not inside {:?}",
                    start_sp, end_sp, region
                ),
            });
        }
        Ok(StoredContinuation {
            start_depth: top - start_sp,
            end_depth: top - end_sp,
            ip,
            region: Some(region),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.region.is_some()
    }

    pub fn region(&self) -> Option<&StackRegion> {
        self.region.as_ref()
    }

    pub(crate) fn depths(&self) -> (usize, usize) {
        (self.start_depth, self.end_depth)
    }

    /// Move the frames to a fresh region and release the old one. Returns
    /// how far the frames moved; any walk session over this continuation
    /// must be rebased before it advances again.
    pub fn relocate(&mut self) -> Result<isize, WalkError> {
        let old = self
            .region
            .as_ref()
            .ok_or(WalkError::UninitializedContinuation)?;
        let mut new = StackRegion::new(old.size())?;
        new.bytes_mut().copy_from_slice(old.bytes());
        let delta = new.top().wrapping_sub(old.top()) as isize;
        self.region = Some(new);
        Ok(delta)
    }
}

impl ContinuationFrames for StoredContinuation {
    fn frames_start(&self) -> usize {
        self.region
            .as_ref()
            .map_or(0, |region| region.top() - self.start_depth)
    }

    fn frames_end(&self) -> usize {
        self.region
            .as_ref()
            .map_or(0, |region| region.top() - self.end_depth)
    }

    fn ip(&self) -> usize {
        self.ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_access::WORD_SIZE;

    #[test]
    fn test_uninitialized_has_no_frames() {
        let continuation = StoredContinuation::uninitialized();
        assert!(!continuation.is_initialized());
        assert_eq!(continuation.frames_start(), 0);
        assert_eq!(continuation.frames_end(), 0);
        let mut continuation = continuation;
        assert_eq!(
            continuation.relocate(),
            Err(WalkError::UninitializedContinuation)
        );
    }

    #[test]
    fn test_relocate_preserves_frames() {
        let builder = StackBuilder::new().managed(0x1000, 32).managed(0x2000, 32);
        let (mut continuation, built) = StoredContinuation::from_builder(&builder).unwrap();
        assert_eq!(continuation.frames_start(), built.start_sp);
        assert_eq!(continuation.frames_end(), built.end_sp);

        let delta = continuation.relocate().unwrap();
        assert_ne!(delta, 0);
        let start = continuation.frames_start();
        assert_eq!(start, built.start_sp.wrapping_add_signed(delta));

        let region = continuation.region().unwrap();
        assert_eq!(region.load(start - WORD_SIZE), Some(0x1000));
        assert_eq!(region.load(start + 32 - WORD_SIZE), Some(0x2000));
    }

    #[test]
    fn test_native_frames_are_rejected() {
        let builder = StackBuilder::new().managed(0x1000, 32).native(32);
        assert!(StoredContinuation::from_builder(&builder).is_err());
    }
}
