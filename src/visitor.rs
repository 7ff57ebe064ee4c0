//! Visitor dispatch: turns physical frames into visitor callbacks.
//!
//! A regular frame is visited once. A deoptimized frame is visited once per
//! virtual frame in its chain, innermost first. An unknown frame is handed to
//! `visit_unknown_frame` exactly once and ends the walk.

use std::cell::Cell;
use std::marker::PhantomData;

use crate::deopt::{FrameInfo, VirtualFrame};
use crate::error::fatal_error;
use crate::trace::{self, EventKind};
use crate::walker::PhysicalFrame;

thread_local! {
    static UNINTERRUPTIBLE_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Proof that the code holding it runs inside a stack walk, where nothing may
/// allocate, block or trigger a safepoint. Only the walker creates one.
pub struct Uninterruptible {
    _not_send: PhantomData<*const ()>,
}

impl Uninterruptible {
    /// Explicitly re-enter an allocatable context for the duration of `f`.
    /// The caller is responsible for the heap being usable at this point.
    pub fn allow_allocation<R>(&self, f: impl FnOnce() -> R) -> R {
        let saved = UNINTERRUPTIBLE_DEPTH.with(|depth| depth.replace(0));
        let _restore = DepthRestore(saved);
        f()
    }
}

struct DepthRestore(u32);

impl Drop for DepthRestore {
    fn drop(&mut self) {
        UNINTERRUPTIBLE_DEPTH.with(|depth| depth.set(self.0));
    }
}

/// Run `f` as an uninterruptible section.
pub(crate) fn run_uninterruptible<R>(f: impl FnOnce(&Uninterruptible) -> R) -> R {
    let saved = UNINTERRUPTIBLE_DEPTH.with(|depth| {
        let saved = depth.get();
        depth.set(saved + 1);
        saved
    });
    let _restore = DepthRestore(saved);
    f(&Uninterruptible {
        _not_send: PhantomData,
    })
}

pub fn in_uninterruptible() -> bool {
    UNINTERRUPTIBLE_DEPTH.with(|depth| depth.get() > 0)
}

/// Allocating entry points call this first.
#[inline]
pub fn assert_allocation_allowed(what: &'static str) {
    debug_assert!(
        !in_uninterruptible(),
        "{} allocates inside an uninterruptible stack walk",
        what
    );
}

/// One logical frame handed to a visitor.
#[derive(Clone, Copy, Debug)]
pub enum FrameRef<'f> {
    /// A compiled or stub frame, visited once.
    Compiled(&'f PhysicalFrame<'f>),
    /// One virtual frame of a deoptimized physical frame. `depth` is 0 for
    /// the innermost virtual frame.
    Virtual {
        physical: &'f PhysicalFrame<'f>,
        frame: &'f VirtualFrame,
        depth: usize,
    },
}

impl<'f> FrameRef<'f> {
    pub fn physical(&self) -> &'f PhysicalFrame<'f> {
        match *self {
            FrameRef::Compiled(physical) => physical,
            FrameRef::Virtual { physical, .. } => physical,
        }
    }

    pub fn sp(&self) -> usize {
        self.physical().sp()
    }

    pub fn ip(&self) -> usize {
        self.physical().ip()
    }

    pub fn frame_info(&self) -> Option<FrameInfo> {
        match self {
            FrameRef::Compiled(_) => None,
            FrameRef::Virtual { frame, .. } => Some(frame.frame_info),
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, FrameRef::Virtual { .. })
    }
}

pub trait StackFrameVisitor {
    /// Called once per logical frame, callee to caller. Returning `false`
    /// stops the walk.
    fn visit_frame(&mut self, frame: FrameRef<'_>, scope: &Uninterruptible) -> bool;

    /// Called once when a frame has no code metadata. The walk stops
    /// afterwards regardless.
    fn visit_unknown_frame(&mut self, _frame: &PhysicalFrame<'_>, _scope: &Uninterruptible) {}
}

impl<V: StackFrameVisitor + ?Sized> StackFrameVisitor for &mut V {
    fn visit_frame(&mut self, frame: FrameRef<'_>, scope: &Uninterruptible) -> bool {
        (**self).visit_frame(frame, scope)
    }

    fn visit_unknown_frame(&mut self, frame: &PhysicalFrame<'_>, scope: &Uninterruptible) {
        (**self).visit_unknown_frame(frame, scope)
    }
}

/// Where a frame the metadata service could not resolve sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownFrame {
    pub sp: usize,
    pub ip: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WalkOutcome {
    /// Every frame up to the end of the stack was visited.
    Completed,
    /// A visitor returned `false`.
    StoppedByVisitor,
    /// The physical stack and the code metadata disagree.
    StructuralFailure(UnknownFrame),
}

impl WalkOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, WalkOutcome::Completed)
    }

    pub fn unknown_frame(&self) -> Option<UnknownFrame> {
        match self {
            WalkOutcome::StructuralFailure(frame) => Some(*frame),
            _ => None,
        }
    }

    /// The default policy: an unknown frame is fatal. Returns whether the
    /// walk completed (`false` means a visitor stopped it).
    pub fn or_abort(self) -> bool {
        match self {
            WalkOutcome::Completed => true,
            WalkOutcome::StoppedByVisitor => false,
            WalkOutcome::StructuralFailure(frame) => fatal_error(
                "Stack walk must walk only frames of known code",
                frame.sp,
                frame.ip,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameVisit {
    Continue,
    Stop,
    Unknown(UnknownFrame),
}

/// Classify one physical frame and invoke the visitor for it.
pub(crate) fn visit_physical_frame<V: StackFrameVisitor + ?Sized>(
    frame: &PhysicalFrame<'_>,
    visitor: &mut V,
    scope: &Uninterruptible,
) -> FrameVisit {
    if frame.is_unknown() {
        visitor.visit_unknown_frame(frame, scope);
        return FrameVisit::Unknown(UnknownFrame {
            sp: frame.sp(),
            ip: frame.ip(),
        });
    }

    if let Some(deoptimized) = frame.deoptimized_frame() {
        let mut count = 0;
        for (depth, virtual_frame) in deoptimized.frames().enumerate() {
            count = depth + 1;
            let frame_ref = FrameRef::Virtual {
                physical: frame,
                frame: virtual_frame,
                depth,
            };
            if !visitor.visit_frame(frame_ref, scope) {
                return FrameVisit::Stop;
            }
        }
        trace::record(EventKind::DeoptimizedFrame {
            sp: frame.sp(),
            virtual_frames: count,
        });
        return FrameVisit::Continue;
    }

    if visitor.visit_frame(FrameRef::Compiled(frame), scope) {
        FrameVisit::Continue
    } else {
        FrameVisit::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uninterruptible_section_nesting() {
        assert!(!in_uninterruptible());
        run_uninterruptible(|scope| {
            assert!(in_uninterruptible());
            run_uninterruptible(|_| assert!(in_uninterruptible()));
            assert!(in_uninterruptible());
            scope.allow_allocation(|| assert!(!in_uninterruptible()));
            assert!(in_uninterruptible());
        });
        assert!(!in_uninterruptible());
    }

    #[test]
    fn test_outcome_helpers() {
        assert!(WalkOutcome::Completed.or_abort());
        assert!(!WalkOutcome::StoppedByVisitor.or_abort());
        let failure = WalkOutcome::StructuralFailure(UnknownFrame { sp: 8, ip: 16 });
        assert_eq!(failure.unknown_frame(), Some(UnknownFrame { sp: 8, ip: 16 }));
        assert!(!failure.is_completed());
    }
}
