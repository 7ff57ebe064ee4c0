//! The stack walking engine.
//!
//! A walk starts from a stack pointer (and optionally an instruction pointer)
//! and moves from callee to caller one physical frame at a time:
//!
//! - a regular frame's caller starts at `SP + total frame size`, and the
//!   return address stored just below that caller SP is the caller's IP;
//! - a variable-size stub packs its extra size into the slot two words below
//!   its nominal caller SP;
//! - an entry point has native frames above it, so the walk continues at the
//!   next frame anchor recorded at or above the caller SP.
//!
//! Deoptimized frames are recognized by SP before any metadata lookup. They
//! still take exactly one physical step; visitor dispatch expands them.
//!
//! Nothing here allocates. `advance` is safe to call because creating the
//! session was not: whoever creates a session vouches that the SPs, anchors
//! and continuation it was built from describe a stack that stays put (or is
//! explicitly rebased) until the session is dropped.

use std::marker::PhantomData;

use crate::anchor::{AnchorChain, AnchorHandle, VERIFY_ANCHORS_DEFAULT};
use crate::code_info::{CodeInfo, CodeInfoSource, FrameKind, NO_REFERENCE_MAP};
use crate::continuation::ContinuationFrames;
use crate::deopt::DeoptimizedFrame;
use crate::error::{WalkError, fatal_error};
use crate::frame_access::{
    FrameAccess, HostFrameAccess, VARIABLE_FRAME_SIZE_SLOT_OFFSET, unpack_variable_frame_size,
};
use crate::thread::{ThreadContext, ThreadRegistry, current_thread};
use crate::trace::{self, EventKind};
use crate::visitor::{
    FrameVisit, StackFrameVisitor, Uninterruptible, WalkOutcome, run_uninterruptible,
    visit_physical_frame,
};

cfg_if::cfg_if! {
    if #[cfg(feature = "debug-stackwalk")] {
        macro_rules! walk_debug {
            ($($arg:tt)*) => {
                eprintln!("[STACKWALK] {}", format_args!($($arg)*))
            };
        }
    } else {
        macro_rules! walk_debug {
            ($($arg:tt)*) => {};
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkerOptions {
    /// Check a thread's anchor chain before walking it; corruption is fatal.
    pub verify_anchors: bool,
    /// Record trace events (see `trace`).
    pub trace: bool,
}

impl Default for WalkerOptions {
    fn default() -> Self {
        WalkerOptions {
            verify_anchors: VERIFY_ANCHORS_DEFAULT,
            trace: false,
        }
    }
}

impl WalkerOptions {
    /// Defaults overridden by FRAMEWALK_TRACE and FRAMEWALK_VERIFY_ANCHORS.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        WalkerOptions {
            verify_anchors: match std::env::var("FRAMEWALK_VERIFY_ANCHORS") {
                Ok(value) => value != "0",
                Err(_) => defaults.verify_anchors,
            },
            trace: std::env::var("FRAMEWALK_TRACE").is_ok(),
        }
    }
}

/// The physical frame a walk is currently positioned at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalFrame<'a> {
    sp: usize,
    ip: usize,
    total_frame_size: usize,
    kind: FrameKind,
    exception_offset: i32,
    reference_map_index: u32,
    pending_lazy_deopt: bool,
    unknown: bool,
    deoptimized: Option<&'a DeoptimizedFrame>,
}

impl<'a> PhysicalFrame<'a> {
    fn compiled(sp: usize, ip: usize, info: CodeInfo, pending_lazy_deopt: bool) -> Self {
        PhysicalFrame {
            sp,
            ip,
            total_frame_size: info.total_frame_size,
            kind: info.kind,
            exception_offset: info.exception_offset,
            reference_map_index: info.reference_map_index,
            pending_lazy_deopt,
            unknown: false,
            deoptimized: None,
        }
    }

    fn deoptimized(sp: usize, ip: usize, frame: &'a DeoptimizedFrame) -> Self {
        PhysicalFrame {
            sp,
            ip,
            total_frame_size: frame.source_total_frame_size(),
            kind: FrameKind::Regular,
            exception_offset: 0,
            reference_map_index: NO_REFERENCE_MAP,
            pending_lazy_deopt: false,
            unknown: false,
            deoptimized: Some(frame),
        }
    }

    fn unknown(sp: usize, ip: usize) -> Self {
        PhysicalFrame {
            sp,
            ip,
            total_frame_size: 0,
            kind: FrameKind::Regular,
            exception_offset: 0,
            reference_map_index: NO_REFERENCE_MAP,
            pending_lazy_deopt: false,
            unknown: true,
            deoptimized: None,
        }
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    /// For a frame with a pending lazy deopt this is the original IP, not the
    /// deopt stub its return address was patched to.
    pub fn ip(&self) -> usize {
        self.ip
    }

    pub fn total_frame_size(&self) -> usize {
        self.total_frame_size
    }

    pub fn caller_sp(&self) -> usize {
        self.sp.wrapping_add(self.total_frame_size)
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_entry_point(&self) -> bool {
        self.kind == FrameKind::EntryPoint
    }

    pub fn exception_offset(&self) -> i32 {
        self.exception_offset
    }

    pub fn reference_map_index(&self) -> u32 {
        self.reference_map_index
    }

    pub fn has_pending_lazy_deopt(&self) -> bool {
        self.pending_lazy_deopt
    }

    pub fn is_unknown(&self) -> bool {
        self.unknown
    }

    pub fn is_deoptimized(&self) -> bool {
        self.deoptimized.is_some()
    }

    pub fn deoptimized_frame(&self) -> Option<&'a DeoptimizedFrame> {
        self.deoptimized
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkState<'a> {
    /// Nothing can be walked (crashed thread, uninitialized continuation,
    /// thread without managed frames). Terminal.
    Unwalkable,
    NotStarted,
    HasFrame(PhysicalFrame<'a>),
    /// Terminal.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkSource {
    Thread,
    Continuation,
}

/// State of one walk. Lives on the walking thread only and is not reusable:
/// restart a walk with a fresh session.
pub struct StackWalk<'a> {
    code_info: &'a dyn CodeInfoSource,
    frame_access: &'a dyn FrameAccess,
    anchors: Option<&'a AnchorChain>,
    source: WalkSource,
    started: bool,
    start_sp: usize,
    /// Exclusive upper bound, 0 if unbounded.
    end_sp: usize,
    /// 0 if the first IP is read from the stack.
    start_ip: usize,
    anchor: Option<AnchorHandle>,
    state: WalkState<'a>,
    /// Set once the walk is over; later steps report it again.
    outcome: Option<WalkOutcome>,
    _not_send: PhantomData<*const ()>,
}

impl std::fmt::Debug for StackWalk<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackWalk")
            .field("source", &self.source)
            .field("started", &self.started)
            .field("start_sp", &format_args!("{:#x}", self.start_sp))
            .field("end_sp", &format_args!("{:#x}", self.end_sp))
            .field("start_ip", &format_args!("{:#x}", self.start_ip))
            .field("anchor", &self.anchor)
            .field("state", &self.state)
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl<'a> StackWalk<'a> {
    pub fn state(&self) -> WalkState<'a> {
        self.state
    }

    pub fn current(&self) -> Option<PhysicalFrame<'a>> {
        match self.state {
            WalkState::HasFrame(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_walkable(&self) -> bool {
        self.state != WalkState::Unwalkable
    }

    pub fn start_sp(&self) -> usize {
        self.start_sp
    }

    pub fn end_sp(&self) -> Option<usize> {
        (self.end_sp != 0).then_some(self.end_sp)
    }

    /// Move to the next physical frame. Returns `None` once the walk is
    /// exhausted; further calls keep returning `None` without touching the
    /// session.
    pub fn advance(&mut self) -> Option<PhysicalFrame<'a>> {
        let next = match self.state {
            WalkState::Unwalkable | WalkState::Exhausted => return None,
            WalkState::NotStarted => {
                self.started = true;
                self.start()
            }
            // An unknown frame is reported once, then the walk ends.
            WalkState::HasFrame(frame) if frame.is_unknown() => WalkState::Exhausted,
            WalkState::HasFrame(frame) => self.continue_walk(&frame),
        };

        if next == WalkState::Exhausted {
            let last_sp = self.current().map_or(self.start_sp, |frame| frame.sp);
            walk_debug!("exhausted after sp={:#x}", last_sp);
            trace::record(EventKind::Exhausted { last_sp });
        }
        self.state = next;

        let frame = self.current()?;
        walk_debug!(
            "frame sp={:#x} ip={:#x} size={} kind={:?} unknown={}",
            frame.sp,
            frame.ip,
            frame.total_frame_size,
            frame.kind,
            frame.unknown
        );
        trace::record(if frame.unknown {
            EventKind::UnknownFrame {
                sp: frame.sp,
                ip: frame.ip,
            }
        } else {
            EventKind::Frame {
                sp: frame.sp,
                ip: frame.ip,
                kind: frame.kind,
            }
        });
        Some(frame)
    }

    fn start(&mut self) -> WalkState<'a> {
        let sp = self.start_sp;
        if sp == 0 || (self.end_sp != 0 && sp >= self.end_sp) {
            return WalkState::Exhausted;
        }

        let ip = if self.start_ip != 0 {
            self.start_ip
        } else {
            match self.anchor_record() {
                Some((anchor_sp, anchor_ip)) if anchor_sp == sp => anchor_ip,
                _ => unsafe { self.frame_access.read_return_address(sp) },
            }
        };
        if ip == 0 {
            return WalkState::Exhausted;
        }

        trace::record(EventKind::WalkStarted { sp, ip });
        WalkState::HasFrame(self.resolve_frame(sp, ip))
    }

    fn continue_walk(&mut self, frame: &PhysicalFrame<'a>) -> WalkState<'a> {
        let caller_sp = frame.caller_sp();
        match frame.kind {
            FrameKind::EntryPoint => self.resume_at_anchor(caller_sp),
            FrameKind::VariableSizeStub => {
                let packed = unsafe {
                    self.frame_access
                        .read_word(caller_sp.wrapping_sub(VARIABLE_FRAME_SIZE_SLOT_OFFSET))
                };
                match unpack_variable_frame_size(packed) {
                    Some(extra_size) => self.step_to_caller(caller_sp.wrapping_add(extra_size)),
                    None => WalkState::HasFrame(PhysicalFrame::unknown(caller_sp, 0)),
                }
            }
            FrameKind::Regular => self.step_to_caller(caller_sp),
        }
    }

    fn step_to_caller(&self, caller_sp: usize) -> WalkState<'a> {
        if self.end_sp != 0 && caller_sp >= self.end_sp {
            return WalkState::Exhausted;
        }
        let ip = unsafe { self.frame_access.read_return_address(caller_sp) };
        if ip == 0 {
            return WalkState::Exhausted;
        }
        WalkState::HasFrame(self.resolve_frame(caller_sp, ip))
    }

    fn resume_at_anchor(&mut self, caller_sp: usize) -> WalkState<'a> {
        let Some(anchors) = self.anchors else {
            return WalkState::Exhausted;
        };
        self.anchor = anchors.skip_anchors_below(self.anchor, caller_sp);
        let Some(handle) = self.anchor else {
            return WalkState::Exhausted;
        };
        let anchor = anchors.get(handle);
        if anchor.last_sp == 0 || (self.end_sp != 0 && anchor.last_sp >= self.end_sp) {
            return WalkState::Exhausted;
        }
        self.anchor = anchors.previous(handle);
        trace::record(EventKind::AnchorResumed {
            sp: anchor.last_sp,
            ip: anchor.last_ip,
        });
        WalkState::HasFrame(self.resolve_frame(anchor.last_sp, anchor.last_ip))
    }

    fn anchor_record(&self) -> Option<(usize, usize)> {
        let anchors = self.anchors?;
        let anchor = anchors.get(self.anchor?);
        Some((anchor.last_sp, anchor.last_ip))
    }

    fn resolve_frame(&self, sp: usize, ip: usize) -> PhysicalFrame<'a> {
        if let Some(deoptimized) = self.code_info.deoptimized_frame(sp) {
            return PhysicalFrame::deoptimized(sp, ip, deoptimized);
        }
        let (ip, pending_lazy_deopt) = match self.code_info.lazy_deopt_original_ip(sp, ip) {
            Some(original_ip) => (original_ip, true),
            None => (ip, false),
        };
        match self.code_info.lookup_code_info(ip) {
            Some(info) => PhysicalFrame::compiled(sp, ip, info, pending_lazy_deopt),
            None => PhysicalFrame::unknown(sp, ip),
        }
    }

    /// Shift the session after the continuation it walks was moved.
    ///
    /// # Safety
    ///
    /// `continuation` must be the continuation this session was created for,
    /// at its new location. Must be called after every relocation and before
    /// the next `advance`.
    pub unsafe fn rebase(&mut self, continuation: &dyn ContinuationFrames) {
        debug_assert_eq!(self.source, WalkSource::Continuation);
        let delta = continuation.frames_start().wrapping_sub(self.start_sp) as isize;
        if delta == 0 {
            return;
        }
        self.start_sp = self.start_sp.wrapping_add_signed(delta);
        if self.end_sp != 0 {
            self.end_sp = self.end_sp.wrapping_add_signed(delta);
        }
        if let WalkState::HasFrame(ref mut frame) = self.state {
            frame.sp = frame.sp.wrapping_add_signed(delta);
        }
        walk_debug!("rebased by {}", delta);
        trace::record(EventKind::Rebased { delta });
    }

    /// Advance one physical frame and dispatch it to `visitor`. Returns the
    /// outcome once the walk is over, `None` while there is more to walk.
    ///
    /// Between steps the caller is outside the uninterruptible section, so it
    /// may allocate or relocate the continuation being walked (followed by
    /// `rebase`).
    pub fn step<V: StackFrameVisitor + ?Sized>(&mut self, visitor: &mut V) -> Option<WalkOutcome> {
        run_uninterruptible(|scope| self.step_uninterruptible(visitor, scope))
    }

    /// Drive the session to the end, dispatching every frame to `visitor`.
    /// Once the walk is over, further calls return the same outcome without
    /// visiting anything.
    pub fn walk<V: StackFrameVisitor + ?Sized>(&mut self, visitor: &mut V) -> WalkOutcome {
        run_uninterruptible(|scope| loop {
            if let Some(outcome) = self.step_uninterruptible(visitor, scope) {
                return outcome;
            }
        })
    }

    fn step_uninterruptible<V: StackFrameVisitor + ?Sized>(
        &mut self,
        visitor: &mut V,
        scope: &Uninterruptible,
    ) -> Option<WalkOutcome> {
        if self.outcome.is_some() {
            return self.outcome;
        }
        let outcome = match self.advance() {
            None => WalkOutcome::Completed,
            Some(frame) => match visit_physical_frame(&frame, visitor, scope) {
                FrameVisit::Continue => return None,
                FrameVisit::Stop => WalkOutcome::StoppedByVisitor,
                FrameVisit::Unknown(unknown) => WalkOutcome::StructuralFailure(unknown),
            },
        };
        // A stopped or failed walk is never resumed.
        self.state = match self.state {
            WalkState::Unwalkable => WalkState::Unwalkable,
            _ => WalkState::Exhausted,
        };
        self.outcome = Some(outcome);
        Some(outcome)
    }

    /// How the walk ended, `None` while it can still be stepped.
    pub fn outcome(&self) -> Option<WalkOutcome> {
        self.outcome
    }
}

/// Entry points: creates sessions against a code metadata service and walks
/// them.
pub struct StackWalker<'a> {
    code_info: &'a dyn CodeInfoSource,
    frame_access: &'a dyn FrameAccess,
    options: WalkerOptions,
}

impl<'a> StackWalker<'a> {
    pub fn new(code_info: &'a dyn CodeInfoSource) -> Self {
        StackWalker {
            code_info,
            frame_access: &HostFrameAccess,
            options: WalkerOptions::default(),
        }
    }

    pub fn with_frame_access(mut self, frame_access: &'a dyn FrameAccess) -> Self {
        self.frame_access = frame_access;
        self
    }

    pub fn with_options(mut self, options: WalkerOptions) -> Self {
        if options.trace {
            trace::enable();
        }
        self.options = options;
        self
    }

    pub fn options(&self) -> WalkerOptions {
        self.options
    }

    fn session<'w>(
        &'w self,
        source: WalkSource,
        anchors: Option<&'w AnchorChain>,
        start_sp: usize,
        end_sp: usize,
        start_ip: usize,
    ) -> StackWalk<'w> {
        let anchor = anchors.and_then(|chain| chain.skip_anchors_below(chain.head(), start_sp));
        StackWalk {
            code_info: self.code_info,
            frame_access: self.frame_access,
            anchors,
            source,
            started: false,
            start_sp,
            end_sp,
            start_ip,
            anchor,
            state: WalkState::NotStarted,
            outcome: None,
            _not_send: PhantomData,
        }
    }

    fn unwalkable<'w>(&'w self, source: WalkSource) -> StackWalk<'w> {
        let mut walk = self.session(source, None, 0, 0, 0);
        walk.state = WalkState::Unwalkable;
        walk
    }

    fn verify(&self, thread: &ThreadContext) {
        if !self.options.verify_anchors {
            return;
        }
        if let Err(WalkError::CorruptAnchor { reason, .. }) = thread.anchors().check_integrity() {
            let anchor = thread.frame_anchor();
            fatal_error(
                reason,
                anchor.map_or(0, |a| a.last_sp),
                anchor.map_or(0, |a| a.last_ip),
            );
        }
    }

    /// A session over `thread` starting at `start_sp`, bounded by `end_sp`
    /// when given. Without `start_ip` the first IP comes from the anchor
    /// recorded at `start_sp`, or else from the return address below it.
    ///
    /// # Safety
    ///
    /// `thread` must be the calling thread, or parked for as long as the
    /// session lives. `start_sp` must be the SP of a managed frame on its
    /// stack.
    pub unsafe fn initialize_for_thread_from<'w>(
        &'w self,
        thread: &'w ThreadContext,
        start_sp: usize,
        end_sp: Option<usize>,
        start_ip: Option<usize>,
    ) -> StackWalk<'w> {
        debug_assert!(
            thread.is_current() || thread.is_parked_at_safepoint() || thread.is_crashed(),
            "walking a running thread"
        );
        if thread.is_crashed() || start_sp == 0 {
            return self.unwalkable(WalkSource::Thread);
        }
        self.verify(thread);
        self.session(
            WalkSource::Thread,
            Some(thread.anchors()),
            start_sp,
            end_sp.unwrap_or(0),
            start_ip.unwrap_or(0),
        )
    }

    /// A session over a parked thread, starting at its last frame anchor.
    ///
    /// # Safety
    ///
    /// `thread` must stay parked (or be crashed) for as long as the session
    /// lives, and its anchors must describe its stack.
    pub unsafe fn initialize_for_thread<'w>(&'w self, thread: &'w ThreadContext) -> StackWalk<'w> {
        match thread.frame_anchor() {
            Some(anchor) if anchor.last_sp != 0 && !thread.is_crashed() => unsafe {
                self.initialize_for_thread_from(
                    thread,
                    anchor.last_sp,
                    None,
                    Some(anchor.last_ip),
                )
            },
            _ => self.unwalkable(WalkSource::Thread),
        }
    }

    /// A session over the frames stored in `continuation`.
    ///
    /// # Safety
    ///
    /// The continuation's storage must hold valid frames. If it is moved
    /// while the session lives, `StackWalk::rebase` must be called before the
    /// next `advance`.
    pub unsafe fn initialize_for_continuation<'w>(
        &'w self,
        continuation: &dyn ContinuationFrames,
    ) -> StackWalk<'w> {
        let start_sp = continuation.frames_start();
        if start_sp == 0 {
            return self.unwalkable(WalkSource::Continuation);
        }
        self.session(
            WalkSource::Continuation,
            None,
            start_sp,
            continuation.frames_end(),
            continuation.ip(),
        )
    }

    /// Walk the calling thread from `start_sp`.
    ///
    /// # Safety
    ///
    /// See `initialize_for_thread_from`.
    pub unsafe fn walk_current_thread<V: StackFrameVisitor + ?Sized>(
        &self,
        start_sp: usize,
        visitor: &mut V,
    ) -> WalkOutcome {
        unsafe { self.walk_current_thread_from(start_sp, None, None, visitor) }
    }

    /// Walk the calling thread between `start_sp` and `end_sp`.
    ///
    /// A thread that was never registered has no anchors: the walk then ends
    /// at the first entry point.
    ///
    /// # Safety
    ///
    /// See `initialize_for_thread_from`.
    pub unsafe fn walk_current_thread_from<V: StackFrameVisitor + ?Sized>(
        &self,
        start_sp: usize,
        end_sp: Option<usize>,
        start_ip: Option<usize>,
        visitor: &mut V,
    ) -> WalkOutcome {
        match current_thread() {
            Some(thread) => unsafe {
                self.initialize_for_thread_from(&thread, start_sp, end_sp, start_ip)
                    .walk(visitor)
            },
            None => self
                .session(
                    WalkSource::Thread,
                    None,
                    start_sp,
                    end_sp.unwrap_or(0),
                    start_ip.unwrap_or(0),
                )
                .walk(visitor),
        }
    }

    /// Walk a thread parked at a safepoint (or in native code).
    ///
    /// # Safety
    ///
    /// See `initialize_for_thread`.
    pub unsafe fn walk_thread<V: StackFrameVisitor + ?Sized>(
        &self,
        thread: &ThreadContext,
        visitor: &mut V,
    ) -> WalkOutcome {
        unsafe { self.initialize_for_thread(thread).walk(visitor) }
    }

    /// Walk part of a parked thread's stack.
    ///
    /// # Safety
    ///
    /// See `initialize_for_thread_from`.
    pub unsafe fn walk_thread_from<V: StackFrameVisitor + ?Sized>(
        &self,
        thread: &ThreadContext,
        start_sp: usize,
        end_sp: Option<usize>,
        start_ip: Option<usize>,
        visitor: &mut V,
    ) -> WalkOutcome {
        unsafe {
            self.initialize_for_thread_from(thread, start_sp, end_sp, start_ip)
                .walk(visitor)
        }
    }

    /// Walk the calling thread from `start_sp`, then every other thread of
    /// `registry` parked in native code or at a safepoint. Stops at the first
    /// walk that does not complete and returns its outcome.
    ///
    /// # Safety
    ///
    /// See `initialize_for_thread_from` and `initialize_for_thread`; every
    /// parked thread must stay parked until this returns.
    pub unsafe fn walk_all_threads<V: StackFrameVisitor + ?Sized>(
        &self,
        registry: &ThreadRegistry,
        start_sp: usize,
        visitor: &mut V,
    ) -> WalkOutcome {
        let outcome = unsafe { self.walk_current_thread(start_sp, &mut *visitor) };
        if !outcome.is_completed() {
            return outcome;
        }
        for thread in registry.parked_threads() {
            let outcome = unsafe { self.walk_thread(&thread, &mut *visitor) };
            if !outcome.is_completed() {
                return outcome;
            }
        }
        WalkOutcome::Completed
    }

    /// Walk the frames stored in a continuation.
    ///
    /// # Safety
    ///
    /// See `initialize_for_continuation`.
    pub unsafe fn walk_continuation<V: StackFrameVisitor + ?Sized>(
        &self,
        continuation: &dyn ContinuationFrames,
        visitor: &mut V,
    ) -> WalkOutcome {
        unsafe { self.initialize_for_continuation(continuation).walk(visitor) }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::code_info::{CodeCache, CodeInfoTable};
    use crate::deopt::FrameInfo;
    use crate::frame_access::{WORD_SIZE, pack_variable_frame_size};
    use crate::visitor::{FrameRef, UnknownFrame};

    /// Sparse memory: unset words read as 0.
    #[derive(Default)]
    struct SparseStack {
        words: BTreeMap<usize, usize>,
    }

    impl SparseStack {
        fn set(&mut self, address: usize, value: usize) {
            self.words.insert(address, value);
        }

        /// Store `ip` as the return address of the frame whose caller SP is `sp`.
        fn set_return_address(&mut self, sp: usize, ip: usize) {
            self.set(sp - WORD_SIZE, ip);
        }
    }

    unsafe impl FrameAccess for SparseStack {
        unsafe fn read_word(&self, address: usize) -> usize {
            self.words.get(&address).copied().unwrap_or(0)
        }
    }

    fn table(entries: &[(usize, CodeInfo)]) -> CodeInfoTable {
        let mut table = CodeInfoTable::new();
        table.extend(entries.to_vec());
        table
    }

    fn session<'w>(
        walker: &'w StackWalker<'_>,
        start_sp: usize,
        end_sp: usize,
        start_ip: usize,
    ) -> StackWalk<'w> {
        walker.session(WalkSource::Thread, None, start_sp, end_sp, start_ip)
    }

    #[test]
    fn test_null_return_address_exhausts() {
        let mut stack = SparseStack::default();
        stack.set_return_address(0x1000, 0x10);
        let code = table(&[(0x10, CodeInfo::regular(32))]);
        let walker = StackWalker::new(&code).with_frame_access(&stack);

        let mut walk = session(&walker, 0x1000, 0, 0);
        assert_eq!(walk.state(), WalkState::NotStarted);
        let first = walk.advance().unwrap();
        assert_eq!((first.sp(), first.ip()), (0x1000, 0x10));
        assert!(walk.is_started());
        assert_eq!(walk.advance(), None);
        assert_eq!(walk.state(), WalkState::Exhausted);
        assert_eq!(walk.advance(), None);
        assert_eq!(walk.state(), WalkState::Exhausted);
    }

    #[test]
    fn test_explicit_start_ip_wins_over_stack() {
        let mut stack = SparseStack::default();
        stack.set_return_address(0x1000, 0x10);
        let code = table(&[(0x10, CodeInfo::regular(32)), (0x20, CodeInfo::regular(32))]);
        let walker = StackWalker::new(&code).with_frame_access(&stack);

        let mut walk = session(&walker, 0x1000, 0, 0x20);
        assert_eq!(walk.advance().map(|frame| frame.ip()), Some(0x20));
    }

    #[test]
    fn test_start_at_or_above_end_walks_nothing() {
        let stack = SparseStack::default();
        let code = CodeInfoTable::new();
        let walker = StackWalker::new(&code).with_frame_access(&stack);

        let mut walk = session(&walker, 0x1000, 0x1000, 0x10);
        assert_eq!(walk.advance(), None);
        assert_eq!(walk.state(), WalkState::Exhausted);
    }

    #[test]
    fn test_variable_size_stub_uses_packed_size() {
        let mut stack = SparseStack::default();
        // stub at 0x1000: nominal 32, extra 48, caller at 0x1050
        stack.set_return_address(0x1000, 0x10);
        stack.set(0x1020 - 2 * WORD_SIZE, pack_variable_frame_size(48));
        stack.set_return_address(0x1050, 0x20);
        let code = table(&[
            (0x10, CodeInfo::variable_size_stub(32)),
            (0x20, CodeInfo::regular(16)),
        ]);
        let walker = StackWalker::new(&code).with_frame_access(&stack);

        let mut walk = session(&walker, 0x1000, 0, 0);
        let stub = walk.advance().unwrap();
        assert_eq!(stub.kind(), FrameKind::VariableSizeStub);
        let caller = walk.advance().unwrap();
        assert_eq!((caller.sp(), caller.ip()), (0x1050, 0x20));
    }

    #[test]
    fn test_malformed_variable_size_is_unknown() {
        let mut stack = SparseStack::default();
        stack.set_return_address(0x1000, 0x10);
        stack.set(0x1020 - 2 * WORD_SIZE, 0x1234);
        let code = table(&[(0x10, CodeInfo::variable_size_stub(32))]);
        let walker = StackWalker::new(&code).with_frame_access(&stack);

        let mut walk = session(&walker, 0x1000, 0, 0);
        walk.advance().unwrap();
        let unknown = walk.advance().unwrap();
        assert!(unknown.is_unknown());
        assert_eq!(unknown.sp(), 0x1020);
        assert_eq!(walk.advance(), None);
    }

    #[test]
    fn test_entry_point_without_anchors_ends_walk() {
        let mut stack = SparseStack::default();
        stack.set_return_address(0x1000, 0x10);
        stack.set_return_address(0x1020, 0x20);
        let code = table(&[(0x10, CodeInfo::entry_point(32)), (0x20, CodeInfo::regular(16))]);
        let walker = StackWalker::new(&code).with_frame_access(&stack);

        let mut walk = session(&walker, 0x1000, 0, 0);
        assert!(walk.advance().unwrap().is_entry_point());
        assert_eq!(walk.advance(), None);
    }

    #[test]
    fn test_deoptimized_frame_takes_size_from_record() {
        let mut stack = SparseStack::default();
        stack.set_return_address(0x1000, 0x10);
        stack.set_return_address(0x1040, 0x20);
        let mut cache = CodeCache::new(table(&[
            (0x10, CodeInfo::regular(16)),
            (0x20, CodeInfo::regular(16)),
        ]));
        let deoptimized =
            DeoptimizedFrame::new(64, 0x10, &[FrameInfo::new(1, 2)]).unwrap();
        cache.deoptimized.install(0x1000, deoptimized);
        let walker = StackWalker::new(&cache).with_frame_access(&stack);

        let mut walk = session(&walker, 0x1000, 0, 0);
        let frame = walk.advance().unwrap();
        assert!(frame.is_deoptimized());
        assert_eq!(frame.total_frame_size(), 64);
        assert_eq!(walk.advance().map(|frame| frame.sp()), Some(0x1040));
    }

    #[test]
    fn test_walk_reports_unknown_frame_once() {
        struct Counting {
            frames: usize,
            unknown: usize,
        }

        impl StackFrameVisitor for Counting {
            fn visit_frame(&mut self, _frame: FrameRef<'_>, _: &Uninterruptible) -> bool {
                self.frames += 1;
                true
            }

            fn visit_unknown_frame(&mut self, _frame: &PhysicalFrame<'_>, _: &Uninterruptible) {
                self.unknown += 1;
            }
        }

        let mut stack = SparseStack::default();
        stack.set_return_address(0x1000, 0x10);
        stack.set_return_address(0x1020, 0x99);
        let code = table(&[(0x10, CodeInfo::regular(32))]);
        let walker = StackWalker::new(&code).with_frame_access(&stack);

        let mut visitor = Counting {
            frames: 0,
            unknown: 0,
        };
        let mut walk = session(&walker, 0x1000, 0, 0);
        let outcome = walk.walk(&mut visitor);
        assert_eq!(
            outcome,
            WalkOutcome::StructuralFailure(UnknownFrame {
                sp: 0x1020,
                ip: 0x99
            })
        );
        assert_eq!((visitor.frames, visitor.unknown), (1, 1));
        assert_eq!(walk.advance(), None);
    }

    #[test]
    fn test_options_from_env_defaults() {
        let options = WalkerOptions::default();
        assert!(!options.trace);
        assert_eq!(options.verify_anchors, VERIFY_ANCHORS_DEFAULT);
    }
}
