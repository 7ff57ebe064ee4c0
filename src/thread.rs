//! Per-thread state the walker consumes: a status word and the frame anchor
//! chain.
//!
//! Mutating a thread's anchors requires an [`OwnerToken`], which can only be
//! obtained on that thread and cannot be sent to another one. Any thread can
//! read another thread's anchors, but the values are only meaningful while
//! the owner is parked (in native code or at a safepoint); that is an external
//! protocol this module records but does not enforce.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use crate::anchor::{AnchorChain, AnchorHandle, FrameAnchor};
use crate::error::WalkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    /// Running managed code; the anchor chain may change at any time.
    Managed = 0,
    /// Running foreign code behind a frame anchor.
    Native = 1,
    /// Parked at a safepoint.
    Safepoint = 2,
    /// Crashed; its stack must not be trusted.
    Crashed = 3,
}

impl ThreadStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ThreadStatus::Managed,
            1 => ThreadStatus::Native,
            2 => ThreadStatus::Safepoint,
            _ => ThreadStatus::Crashed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ThreadStatus::Managed => "MANAGED",
            ThreadStatus::Native => "NATIVE",
            ThreadStatus::Safepoint => "SAFEPOINT",
            ThreadStatus::Crashed => "CRASHED",
        }
    }
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub struct ThreadContext {
    id: ThreadId,
    status: AtomicU8,
    anchors: AnchorChain,
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("anchors", &self.anchors)
            .finish()
    }
}

/// Capability to mutate the anchor chain of the thread it was created on.
pub struct OwnerToken<'t> {
    thread: &'t ThreadContext,
    _not_send: PhantomData<*const ()>,
}

impl OwnerToken<'_> {
    pub fn thread(&self) -> &ThreadContext {
        self.thread
    }
}

impl ThreadContext {
    /// A context for the calling thread, not yet registered anywhere.
    pub fn for_current_thread() -> Self {
        ThreadContext {
            id: thread::current().id(),
            status: AtomicU8::new(ThreadStatus::Managed as u8),
            anchors: AnchorChain::new(),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn is_current(&self) -> bool {
        thread::current().id() == self.id
    }

    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_crashed(&self) -> bool {
        self.status() == ThreadStatus::Crashed
    }

    /// Whether the thread is stopped in a state where its anchors can be read.
    pub fn is_parked_at_safepoint(&self) -> bool {
        matches!(
            self.status(),
            ThreadStatus::Native | ThreadStatus::Safepoint
        )
    }

    pub fn anchors(&self) -> &AnchorChain {
        &self.anchors
    }

    /// The most recent frame anchor, if the thread has left managed code.
    pub fn frame_anchor(&self) -> Option<FrameAnchor> {
        self.anchors.head().map(|handle| self.anchors.get(handle))
    }

    pub fn owner_token(&self) -> Result<OwnerToken<'_>, WalkError> {
        if !self.is_current() {
            return Err(WalkError::NotOwner {
                thread: format!("{:?}", self.id),
            });
        }
        Ok(OwnerToken {
            thread: self,
            _not_send: PhantomData,
        })
    }

    fn check_token(&self, token: &OwnerToken<'_>) -> Result<(), WalkError> {
        if std::ptr::eq(token.thread, self) {
            Ok(())
        } else {
            Err(WalkError::NotOwner {
                thread: format!("{:?}", self.id),
            })
        }
    }

    pub fn push_anchor(
        &self,
        token: &OwnerToken<'_>,
        sp: usize,
        ip: usize,
    ) -> Result<AnchorHandle, WalkError> {
        self.check_token(token)?;
        debug_assert_eq!(self.status(), ThreadStatus::Managed);
        self.anchors.push(sp, ip)
    }

    pub fn pop_anchor(&self, token: &OwnerToken<'_>) -> Result<FrameAnchor, WalkError> {
        self.check_token(token)?;
        debug_assert_eq!(self.status(), ThreadStatus::Managed);
        self.anchors.pop()
    }

    /// Leave managed code: record the last managed frame and switch to
    /// native status until the returned guard is dropped.
    pub fn enter_native<'t>(
        &'t self,
        token: &OwnerToken<'t>,
        last_sp: usize,
        last_ip: usize,
    ) -> Result<NativeTransition<'t>, WalkError> {
        self.check_token(token)?;
        self.transition(ThreadStatus::Managed, ThreadStatus::Native, || {
            self.anchors.push(last_sp, last_ip)
        })?;
        Ok(NativeTransition {
            thread: self,
            _not_send: PhantomData,
        })
    }

    /// Park at a safepoint until the returned guard is dropped.
    pub fn park_at_safepoint<'t>(
        &'t self,
        token: &OwnerToken<'t>,
    ) -> Result<SafepointPark<'t>, WalkError> {
        self.check_token(token)?;
        self.transition(ThreadStatus::Managed, ThreadStatus::Safepoint, || Ok(()))?;
        Ok(SafepointPark {
            thread: self,
            _not_send: PhantomData,
        })
    }

    /// Crashed is terminal: a crashed thread is never walked again.
    pub fn mark_crashed(&self) {
        self.status
            .store(ThreadStatus::Crashed as u8, Ordering::Release);
    }

    fn transition<T>(
        &self,
        from: ThreadStatus,
        to: ThreadStatus,
        before: impl FnOnce() -> Result<T, WalkError>,
    ) -> Result<T, WalkError> {
        let current = self.status();
        if current != from {
            return Err(WalkError::InvalidStatusTransition {
                from: current.name(),
                to: to.name(),
            });
        }
        let result = before()?;
        self.status.store(to as u8, Ordering::Release);
        Ok(result)
    }

    fn return_to_managed(&self, from: ThreadStatus) {
        let previous = self.status.compare_exchange(
            from as u8,
            ThreadStatus::Managed as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug_assert!(
            previous.is_ok() || self.is_crashed(),
            "thread left {} from an unexpected status",
            from
        );
    }
}

/// A thread's stay in foreign code. Dropping it returns to managed code and
/// pops the anchor pushed on entry.
pub struct NativeTransition<'t> {
    thread: &'t ThreadContext,
    _not_send: PhantomData<*const ()>,
}

impl Drop for NativeTransition<'_> {
    fn drop(&mut self) {
        self.thread.return_to_managed(ThreadStatus::Native);
        let popped = self.thread.anchors.pop();
        debug_assert!(popped.is_ok(), "native transition lost its anchor");
    }
}

pub struct SafepointPark<'t> {
    thread: &'t ThreadContext,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SafepointPark<'_> {
    fn drop(&mut self) {
        self.thread.return_to_managed(ThreadStatus::Safepoint);
    }
}

thread_local! {
    /// Context of the calling thread, set by `ThreadRegistry::register_current_thread`.
    static CURRENT_THREAD: RefCell<Option<Arc<ThreadContext>>> = const { RefCell::new(None) };
}

/// Run `f` with the calling thread's registered context.
pub fn with_current_thread<R>(f: impl FnOnce(Option<&ThreadContext>) -> R) -> R {
    CURRENT_THREAD.with(|current| f(current.borrow().as_deref()))
}

pub fn current_thread() -> Option<Arc<ThreadContext>> {
    CURRENT_THREAD.with(|current| current.borrow().clone())
}

/// All threads that can be walked.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadContext>>>,
}

impl ThreadRegistry {
    pub const fn new() -> Self {
        ThreadRegistry {
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Register the calling thread. Registering twice returns the existing
    /// context.
    pub fn register_current_thread(&self) -> Arc<ThreadContext> {
        if let Some(existing) = current_thread() {
            return existing;
        }
        let context = Arc::new(ThreadContext::for_current_thread());
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&context));
        CURRENT_THREAD.with(|current| *current.borrow_mut() = Some(Arc::clone(&context)));
        context
    }

    pub fn unregister_current_thread(&self) {
        let id = thread::current().id();
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|thread| thread.id() != id);
        CURRENT_THREAD.with(|current| *current.borrow_mut() = None);
    }

    pub fn threads(&self) -> Vec<Arc<ThreadContext>> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Other threads currently parked in native code or at a safepoint.
    pub fn parked_threads(&self) -> Vec<Arc<ThreadContext>> {
        self.threads()
            .into_iter()
            .filter(|thread| !thread.is_current() && thread.is_parked_at_safepoint())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_transition_pushes_and_pops() {
        let thread = ThreadContext::for_current_thread();
        let token = thread.owner_token().unwrap();
        {
            let _native = thread.enter_native(&token, 0x8000, 0x42).unwrap();
            assert_eq!(thread.status(), ThreadStatus::Native);
            assert!(thread.is_parked_at_safepoint());
            assert_eq!(
                thread.frame_anchor(),
                Some(FrameAnchor {
                    last_sp: 0x8000,
                    last_ip: 0x42
                })
            );
        }
        assert_eq!(thread.status(), ThreadStatus::Managed);
        assert_eq!(thread.frame_anchor(), None);
    }

    #[test]
    fn test_owner_token_only_on_owning_thread() {
        let thread = Arc::new(ThreadContext::for_current_thread());
        let other = Arc::clone(&thread);
        let result = std::thread::spawn(move || other.owner_token().is_err())
            .join()
            .unwrap();
        assert!(result);
        assert!(thread.owner_token().is_ok());
    }

    #[test]
    fn test_token_of_other_context_is_rejected() {
        let first = ThreadContext::for_current_thread();
        let second = ThreadContext::for_current_thread();
        let token = first.owner_token().unwrap();
        assert!(matches!(
            second.push_anchor(&token, 0x100, 0x1),
            Err(WalkError::NotOwner { .. })
        ));
    }

    #[test]
    fn test_cannot_enter_native_twice() {
        let thread = ThreadContext::for_current_thread();
        let token = thread.owner_token().unwrap();
        let _native = thread.enter_native(&token, 0x8000, 0x42).unwrap();
        assert!(matches!(
            thread.enter_native(&token, 0x7000, 0x43),
            Err(WalkError::InvalidStatusTransition { .. })
        ));
        assert_eq!(thread.anchors().depth(), 1);
    }

    #[test]
    fn test_safepoint_park_and_crash() {
        let thread = ThreadContext::for_current_thread();
        let token = thread.owner_token().unwrap();
        {
            let _park = thread.park_at_safepoint(&token).unwrap();
            assert_eq!(thread.status(), ThreadStatus::Safepoint);
        }
        assert_eq!(thread.status(), ThreadStatus::Managed);
        thread.mark_crashed();
        assert!(thread.is_crashed());
        assert!(!thread.is_parked_at_safepoint());
    }

    #[test]
    fn test_registry_tracks_current_thread() {
        let registry = ThreadRegistry::new();
        std::thread::spawn(move || {
            let context = registry.register_current_thread();
            assert!(Arc::ptr_eq(&context, &registry.register_current_thread()));
            assert_eq!(registry.len(), 1);
            with_current_thread(|current| {
                assert_eq!(current.map(|t| t.id()), Some(context.id()));
            });
            registry.unregister_current_thread();
            assert!(registry.is_empty());
            assert!(current_thread().is_none());
        })
        .join()
        .unwrap();
    }
}
