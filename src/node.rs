// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::marker::PhantomPinned;
use core::mem::offset_of;
use core::pin::Pin;
use core::ptr::NonNull;

use cordyceps::{Linked, list};

use crate::level::Level;
use crate::tick::Tick;

/// Invokes an [`EventNode`]'s bound action.
///
/// Bound by whichever [`Event Variant`](crate::event) embeds the node as its
/// first field; the pointer passed in is always the node's own address, which
/// a variant's `execute` function casts back to its concrete container type.
///
/// # Safety
///
/// `ptr` must point at the `EventNode` embedded as the first field of the
/// concrete type this function pointer was bound for.
pub(crate) type ExecuteFn = unsafe fn(NonNull<EventNode>);

/// The intrusive node backing every scheduled event.
///
/// An `EventNode` is never constructed directly; it is always embedded as the
/// first field of an [`Event Variant`](crate::event), which binds
/// [`execute`](Self) to its own dispatch function when it is built.
pub struct EventNode {
    pub(crate) scheduled_at: Tick,
    /// The wheel level this node is currently filed under, or `None` if inactive.
    ///
    /// The slot within that level is never stored redundantly; it is always
    /// re-derived from `scheduled_at` when needed (see [`Level::slot_of`]).
    pub(crate) owner: Option<NonNull<Level>>,
    pub(crate) execute: ExecuteFn,
    links: list::Links<EventNode>,
    // This type is !Unpin: once linked into a slot, its address is load-bearing.
    _pin: PhantomPinned,
}

impl EventNode {
    pub(crate) const fn new(execute: ExecuteFn) -> Self {
        Self {
            scheduled_at: Tick::INACTIVE,
            owner: None,
            execute,
            links: list::Links::new(),
            _pin: PhantomPinned,
        }
    }

    /// Returns whether this event is currently scheduled to fire.
    #[inline]
    #[must_use]
    pub fn active(&self) -> bool {
        self.owner.is_some()
    }

    /// Returns the tick this event is scheduled to fire at.
    ///
    /// Only meaningful while [`active`](Self::active) returns `true`. While a
    /// callback is running, this returns the tick it was scheduled for.
    #[inline]
    #[must_use]
    pub fn scheduled_at(&self) -> Tick {
        self.scheduled_at
    }

    /// Unschedules this event. A no-op if it is not currently active.
    ///
    /// Safe to call from within this event's own callback (it has already
    /// been unlinked by the time its callback runs) and from within any other
    /// event's callback.
    pub fn cancel(self: Pin<&mut Self>) {
        let Some(owner) = self.owner else {
            return;
        };
        tracing::trace!(scheduled_at = ?self.scheduled_at, "cancel");
        // Safety: unlinking a node from its slot does not move it.
        let this = unsafe { self.get_unchecked_mut() };
        let ptr = NonNull::from(&*this);
        let scheduled_at = this.scheduled_at;
        this.owner = None;
        this.scheduled_at = Tick::INACTIVE;
        // Safety: `owner` points at a `Level` owned by a `Wheel` that, per the
        // crate's documented precondition, outlives every event scheduled
        // against it.
        unsafe { (*owner.as_ptr()).remove(scheduled_at, ptr) };
    }
}

impl fmt::Debug for EventNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNode")
            .field("scheduled_at", &self.scheduled_at)
            .field("active", &self.active())
            .finish()
    }
}

impl Drop for EventNode {
    fn drop(&mut self) {
        if self.owner.is_some() {
            tracing::trace!("dropping active event, auto-cancelling");
            // Safety: the node is about to be deallocated, it will not be moved again.
            unsafe { Pin::new_unchecked(self) }.cancel();
        }
    }
}

// Safety: `links` is a private field never accessed except through the
// `Linked` contract below, and `EventNode` is `!Unpin` so its address is
// stable for as long as it is linked.
unsafe impl Linked<list::Links<EventNode>> for EventNode {
    type Handle = NonNull<Self>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

#[cfg(test)]
mod tests {
    use crate::event::CallbackEvent;
    use crate::wheel::Wheel;
    use core::pin::pin;

    #[test]
    fn cancel_on_inactive_node_is_a_no_op() {
        let mut event = pin!(CallbackEvent::new(|| {}));
        assert!(!event.active());
        event.as_mut().cancel();
        assert!(!event.active());
    }

    #[test]
    fn drop_auto_cancels_an_active_event() {
        let mut wheel = Wheel::new();
        {
            let mut event = pin!(CallbackEvent::new(|| {}));
            wheel.schedule(event.as_mut().node(), 5);
            assert!(event.active());
            // `event` drops here while still scheduled; its `Drop` impl must
            // splice it out of the wheel before its storage goes away.
        }
        assert!(wheel.advance(5, None), "no dangling event should fire");
    }
}
