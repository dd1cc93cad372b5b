// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Thin adapters that bind an [`EventNode`] to a user action.
//!
//! Both variants embed their `EventNode` as their first field ("`repr(C)`
//! and cast back" instead of a `dyn Trait`), so dispatch costs one function
//! pointer indirection and imposes no allocation of its own beyond whatever
//! the caller's payload needs.

use core::marker::PhantomData;
use core::pin::Pin;
use core::ptr::NonNull;

use crate::node::EventNode;
use crate::tick::Tick;

/// An event bound to a `FnMut()` closure.
#[repr(C)]
pub struct CallbackEvent<F> {
    node: EventNode,
    callback: F,
}

impl<F: FnMut()> CallbackEvent<F> {
    /// Creates a new, inactive event wrapping `callback`.
    ///
    /// The event must be [scheduled](crate::Wheel::schedule) before it will
    /// ever fire.
    pub fn new(callback: F) -> Self {
        Self {
            node: EventNode::new(Self::execute),
            callback,
        }
    }

    /// Projects to this event's node, for use with [`Wheel`](crate::Wheel)'s
    /// scheduling methods.
    pub fn node(self: Pin<&mut Self>) -> Pin<&mut EventNode> {
        // Safety: `node` is structurally pinned: we never move it out from
        // behind a `&mut Self`, and `Self` is itself `!Unpin` because `node`
        // is.
        unsafe { self.map_unchecked_mut(|this| &mut this.node) }
    }

    /// Equivalent to `self.node().cancel()`.
    pub fn cancel(self: Pin<&mut Self>) {
        self.node().cancel();
    }

    #[must_use]
    pub fn active(&self) -> bool {
        self.node.active()
    }

    #[must_use]
    pub fn scheduled_at(&self) -> Tick {
        self.node.scheduled_at()
    }

    /// # Safety
    ///
    /// `ptr` must point at the `node` field of a live `CallbackEvent<F>`.
    unsafe fn execute(ptr: NonNull<EventNode>) {
        // Safety: `node` is `Self`'s first field, so a pointer to it is also
        // a valid pointer to `Self` (the `#[repr(C)]` layout guarantee).
        let this = ptr.cast::<CallbackEvent<F>>();
        // Safety: the wheel only invokes this while the event is live and
        // not concurrently accessed (single-threaded model).
        let this = unsafe { &mut *this.as_ptr() };
        (this.callback)();
    }
}

/// An event bound to a method on a caller-owned instance of `T`.
#[repr(C)]
pub struct MethodEvent<'a, T> {
    node: EventNode,
    target: NonNull<T>,
    method: fn(&mut T),
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T> MethodEvent<'a, T> {
    /// Creates a new, inactive event that calls `method(target)` when fired.
    pub fn new(target: &'a mut T, method: fn(&mut T)) -> Self {
        Self {
            node: EventNode::new(Self::execute),
            target: NonNull::from(target),
            method,
            _marker: PhantomData,
        }
    }

    /// Projects to this event's node, for use with [`Wheel`](crate::Wheel)'s
    /// scheduling methods.
    pub fn node(self: Pin<&mut Self>) -> Pin<&mut EventNode> {
        // Safety: see `CallbackEvent::node`.
        unsafe { self.map_unchecked_mut(|this| &mut this.node) }
    }

    /// Equivalent to `self.node().cancel()`.
    pub fn cancel(self: Pin<&mut Self>) {
        self.node().cancel();
    }

    #[must_use]
    pub fn active(&self) -> bool {
        self.node.active()
    }

    #[must_use]
    pub fn scheduled_at(&self) -> Tick {
        self.node.scheduled_at()
    }

    /// # Safety
    ///
    /// `ptr` must point at the `node` field of a live `MethodEvent<'a, T>`.
    unsafe fn execute(ptr: NonNull<EventNode>) {
        // Safety: see `CallbackEvent::execute`.
        let this = ptr.cast::<MethodEvent<'a, T>>();
        // Safety: the wheel only invokes this while the event is live and
        // `target` outlives the event by construction (`'a` on `Self`).
        let this = unsafe { this.as_ref() };
        let mut target = this.target;
        (this.method)(unsafe { target.as_mut() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::pin::pin;

    #[test]
    fn callback_event_fires_closure() {
        let mut fired = false;
        let mut event = pin!(CallbackEvent::new(|| fired = true));
        // Safety: executing directly (not through a wheel) in a test, on a
        // pointer we know is valid for the duration of the call.
        unsafe {
            let ptr = NonNull::from(event.as_mut().get_unchecked_mut()).cast();
            CallbackEvent::<_>::execute(ptr);
        }
        assert!(fired);
    }

    #[test]
    fn method_event_calls_method() {
        struct Counter(u32);
        let mut counter = Counter(0);
        let counter_ptr: *const Counter = &counter;
        let mut event = pin!(MethodEvent::new(&mut counter, |c: &mut Counter| c.0 += 1));
        unsafe {
            let ptr = NonNull::from(event.as_mut().get_unchecked_mut()).cast();
            MethodEvent::<Counter>::execute(ptr);
        }
        // Safety: `event` no longer touches `counter` after firing; reading
        // through the raw pointer sidesteps the still-live exclusive borrow
        // `event` holds for its lifetime parameter.
        assert_eq!(unsafe { (*counter_ptr).0 }, 1);
    }
}
