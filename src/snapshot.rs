//! Offline stack snapshots.
//!
//! A snapshot is a copy of a continuation's frames plus the code metadata
//! needed to walk them, encoded with bincode so a stack can be captured in
//! one process and inspected in another (see the `stack_explorer` binary).
//! Positions are stored as depths below the top of the stack, so restoring
//! at any address yields the same walk.

use std::fs;
use std::path::Path;

use bincode::{Decode, Encode};

use crate::code_info::CodeInfoTable;
use crate::continuation::{ContinuationFrames, StoredContinuation};
use crate::error::WalkError;
use crate::frame_access::WORD_SIZE;
use crate::stack_region::StackRegion;

const SNAPSHOT_MAGIC: u32 = 0x4657_534b;
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StackSnapshot {
    magic: u32,
    version: u32,
    /// Depth of the innermost frame's SP below the top of the stack.
    pub start_depth: usize,
    /// Depth of the walk bound below the top of the stack.
    pub end_depth: usize,
    /// Explicit resume IP, 0 if it is stored in the frames.
    pub start_ip: usize,
    /// Stack contents from one word below the innermost SP up to the top.
    pub stack: Vec<u8>,
    pub code_info: CodeInfoTable,
}

impl StackSnapshot {
    pub fn capture(
        continuation: &StoredContinuation,
        code_info: &CodeInfoTable,
    ) -> Result<Self, WalkError> {
        let region = continuation
            .region()
            .ok_or(WalkError::UninitializedContinuation)?;
        let (start_depth, end_depth) = continuation.depths();
        let bytes = region.bytes();
        let captured = match start_depth.checked_add(WORD_SIZE) {
            Some(captured) if captured <= bytes.len() => captured,
            _ => {
                return Err(WalkError::InvalidLayout {
                    reason: format!("start depth {} is outside the region", start_depth),
                });
            }
        };
        Ok(StackSnapshot {
            magic: SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            start_depth,
            end_depth,
            start_ip: continuation.ip(),
            stack: bytes[bytes.len() - captured..].to_vec(),
            code_info: code_info.clone(),
        })
    }

    pub fn to_binary(&self) -> Result<Vec<u8>, WalkError> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn from_binary(bytes: &[u8]) -> Result<Self, WalkError> {
        let (snapshot, _): (StackSnapshot, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), WalkError> {
        fs::write(path, self.to_binary()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, WalkError> {
        Self::from_binary(&fs::read(path)?)
    }

    fn validate(&self) -> Result<(), WalkError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(WalkError::Snapshot("not a stack snapshot".to_string()));
        }
        if self.version != SNAPSHOT_VERSION {
            return Err(WalkError::Snapshot(format!(
                "unsupported snapshot version {}",
                self.version
            )));
        }
        if !self.start_depth.is_multiple_of(WORD_SIZE)
            || !self.end_depth.is_multiple_of(WORD_SIZE)
            || self.end_depth > self.start_depth
            || self.start_depth.checked_add(WORD_SIZE) != Some(self.stack.len())
        {
            return Err(WalkError::Snapshot(format!(
                "inconsistent frame bounds (start depth {}, end depth {}, {} stack bytes)",
                self.start_depth,
                self.end_depth,
                self.stack.len()
            )));
        }
        Ok(())
    }

    /// Copy the frames into a fresh region and wrap them as a continuation.
    pub fn restore(&self) -> Result<StoredContinuation, WalkError> {
        self.validate()?;
        let mut region = StackRegion::new(self.stack.len())?;
        let bytes = region.bytes_mut();
        let offset = bytes.len() - self.stack.len();
        bytes[offset..].copy_from_slice(&self.stack);
        let top = region.top();
        StoredContinuation::from_region(
            region,
            top - self.start_depth,
            top - self.end_depth,
            self.start_ip,
        )
    }
}
