#![allow(clippy::missing_safety_doc)]
//! Physical stack walking for a managed runtime.
//!
//! Given a thread (or a stored continuation) and the code metadata of the
//! compiled code on it, [`walker::StackWalker`] steps from callee to caller
//! over physical frames, re-entering managed code through frame anchors at
//! entry points, expanding deoptimized frames into their virtual frames and
//! reporting each logical frame to a [`visitor::StackFrameVisitor`].
//!
//! Walks run inside an uninterruptible section: nothing on the walk path
//! allocates, and visitors receive an [`visitor::Uninterruptible`] token to
//! make that explicit.

pub mod anchor;
pub mod backtrace;
pub mod code_info;
pub mod continuation;
pub mod deopt;
pub mod error;
pub mod frame_access;
pub mod snapshot;
pub mod stack_region;
pub mod thread;
pub mod trace;
pub mod visitor;
pub mod walker;

pub use anchor::{AnchorChain, AnchorHandle, FrameAnchor};
pub use backtrace::{FrameBuffer, FrameRecord, WalkReport};
pub use code_info::{CodeCache, CodeInfo, CodeInfoSource, CodeInfoTable, FrameKind};
pub use continuation::{ContinuationFrames, StoredContinuation};
pub use deopt::{DeoptimizedFrame, DeoptimizedFrameTable, FrameInfo, VirtualFrame};
pub use error::WalkError;
pub use frame_access::{FrameAccess, HostFrameAccess};
pub use snapshot::StackSnapshot;
pub use stack_region::{BuiltStack, FrameLayout, StackBuilder, StackRegion};
pub use thread::{ThreadContext, ThreadRegistry, ThreadStatus};
pub use visitor::{FrameRef, StackFrameVisitor, Uninterruptible, UnknownFrame, WalkOutcome};
pub use walker::{PhysicalFrame, StackWalk, StackWalker, WalkState, WalkerOptions};
