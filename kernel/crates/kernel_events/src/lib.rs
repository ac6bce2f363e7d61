//! Per-vector interrupt event registry.
//!
//! Every interrupt the kernel routes ends up here: the registry maps an IRQ
//! number to either a polymorphic handler object or a C-style callback with
//! an optional context. Dispatch walks the list front to back and invokes the
//! first match, so the list is periodically re-sorted so that the hottest
//! handlers are found first.
//!
//! The registry is generic over the frame type and carries no locking of its
//! own; the kernel wraps it in a `spin::Mutex` and resolves the target under
//! the lock, invoking it outside.

#![no_std]

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ffi::c_void;
use core::ptr::NonNull;

use log::{debug, warn};

/// Number of dispatches between two re-sorts of the registry.
pub const SORT_INTERVAL: u32 = if cfg!(debug_assertions) { 1_000 } else { 10_000 };

/// A handler object that wants to be told about interrupts on its vector.
pub trait InterruptHandler<F>: Send + Sync {
    fn on_interrupt_received(&self, frame: &mut F);
}

/// C-style interrupt callback. Receives the registered context if one was
/// supplied, the trap frame otherwise.
pub type IrqCallback = unsafe extern "C" fn(*mut c_void);

pub enum HandlerTarget<F> {
    /// Polymorphic handler, dispatched through its vtable.
    Object(Arc<dyn InterruptHandler<F>>),
    /// C-style callback plus optional context.
    Callback {
        func: IrqCallback,
        context: Option<NonNull<c_void>>,
    },
}

// SAFETY: a registered context pointer is owned by the registering driver,
// which guarantees it outlives the registration and tolerates being handed
// to its callback from any CPU.
unsafe impl<F> Send for HandlerTarget<F> {}
// SAFETY: see above; the registry itself is only mutated under its owner's lock.
unsafe impl<F> Sync for HandlerTarget<F> {}

impl<F> Clone for HandlerTarget<F> {
    fn clone(&self) -> Self {
        match self {
            Self::Object(handler) => Self::Object(handler.clone()),
            Self::Callback { func, context } => Self::Callback {
                func: *func,
                context: *context,
            },
        }
    }
}

impl<F> HandlerTarget<F> {
    /// Invokes the target for `frame`.
    pub fn invoke(&self, frame: &mut F) {
        match self {
            Self::Object(handler) => handler.on_interrupt_received(frame),
            Self::Callback { func, context } => {
                let arg = context.map_or(core::ptr::from_mut(frame).cast(), NonNull::as_ptr);
                // SAFETY: the callback was registered together with this
                // context (or expects the frame) by the contract of
                // `add_callback`.
                unsafe { func(arg) }
            }
        }
    }

    fn is_callback(&self, other: IrqCallback) -> bool {
        matches!(self, Self::Callback { func, .. } if core::ptr::fn_addr_eq(*func, other))
    }

    fn is_object(&self, other: &Arc<dyn InterruptHandler<F>>) -> bool {
        matches!(self, Self::Object(handler) if Arc::ptr_eq(handler, other))
    }
}

pub struct EventEntry<F> {
    irq: u8,
    target: HandlerTarget<F>,
    /// Incremented on every dispatch; the registry sorts by it, descending.
    priority: u64,
    /// Critical entries survive `remove_all` (used for the SCI handler).
    critical: bool,
}

impl<F> EventEntry<F> {
    #[must_use]
    pub fn irq(&self) -> u8 {
        self.irq
    }

    #[must_use]
    pub fn priority(&self) -> u64 {
        self.priority
    }

    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    #[must_use]
    pub fn target(&self) -> &HandlerTarget<F> {
        &self.target
    }
}

/// The ordered multiset of registered interrupt events.
pub struct EventRegistry<F> {
    events: Vec<EventEntry<F>>,
    dispatches_since_sort: u32,
}

impl<F> Default for EventRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> EventRegistry<F> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            events: Vec::new(),
            dispatches_since_sort: 0,
        }
    }

    /// Registers a C-style callback for `irq`. A duplicate (irq, callback)
    /// pair is logged but still registered.
    pub fn add_callback(
        &mut self,
        irq: u8,
        func: IrqCallback,
        context: Option<NonNull<c_void>>,
        critical: bool,
    ) {
        if self
            .events
            .iter()
            .any(|ev| ev.irq == irq && ev.target.is_callback(func))
        {
            warn!("IRQ{irq} is already registered");
        }

        self.events.push(EventEntry {
            irq,
            target: HandlerTarget::Callback { func, context },
            priority: 0,
            critical,
        });
        debug!("registered interrupt callback for IRQ{irq}");
    }

    /// Registers a handler object for `irq`. A second handler on the same
    /// vector is logged but still registered.
    pub fn add_handler(&mut self, irq: u8, handler: Arc<dyn InterruptHandler<F>>, critical: bool) {
        if self.events.iter().any(|ev| ev.irq == irq) {
            warn!("IRQ{irq} is already registered");
        }

        self.events.push(EventEntry {
            irq,
            target: HandlerTarget::Object(handler),
            priority: 0,
            critical,
        });
        debug!("registered interrupt handler for IRQ{irq}");
    }

    /// Removes all non-critical events registered for `irq`.
    pub fn remove_irq(&mut self, irq: u8) {
        let before = self.events.len();
        self.events.retain(|ev| ev.critical || ev.irq != irq);
        if self.events.len() == before {
            warn!("IRQ{irq} not found");
        }
    }

    /// Removes all non-critical events that invoke `func`.
    pub fn remove_callback(&mut self, func: IrqCallback) {
        let before = self.events.len();
        self.events
            .retain(|ev| ev.critical || !ev.target.is_callback(func));
        if self.events.len() == before {
            warn!("callback not found");
        }
    }

    /// Removes the non-critical registration of `func` on `irq`.
    pub fn remove_callback_on(&mut self, irq: u8, func: IrqCallback) {
        let Some(pos) = self
            .events
            .iter()
            .position(|ev| !ev.critical && ev.irq == irq && ev.target.is_callback(func))
        else {
            warn!("event {irq} not found");
            return;
        };
        self.events.remove(pos);
        debug!("unregistered interrupt callback for IRQ{irq}");
    }

    /// Removes all non-critical registrations of a handler object.
    pub fn remove_handler(&mut self, handler: &Arc<dyn InterruptHandler<F>>) {
        let before = self.events.len();
        self.events
            .retain(|ev| ev.critical || !ev.target.is_object(handler));
        if self.events.len() == before {
            warn!("handler not found");
        }
    }

    /// Removes every non-critical event. Critical entries (e.g. the SCI
    /// handler) survive kernel teardown.
    pub fn remove_all(&mut self) {
        self.events.retain(|ev| ev.critical);
    }

    /// Resolves the dispatch target for `irq`: finds the first matching
    /// entry, bumps its priority and hands back a clone of the target to be
    /// invoked without holding the registry lock. Also advances the sort
    /// counter; every [`SORT_INTERVAL`] dispatches the registry is re-sorted
    /// descending by priority so hot entries are found first.
    pub fn resolve(&mut self, irq: u8) -> Option<HandlerTarget<F>> {
        self.dispatches_since_sort += 1;
        if self.dispatches_since_sort > SORT_INTERVAL {
            self.dispatches_since_sort = 0;
            self.events.sort_by(|a, b| b.priority.cmp(&a.priority));
            debug!("sorted {} interrupt events", self.events.len());
        }

        let entry = self.events.iter_mut().find(|ev| ev.irq == irq)?;
        entry.priority += 1;
        Some(entry.target.clone())
    }

    /// Resolves and invokes in one step. Only safe to use where the caller
    /// does not hold the registry behind a lock the handler could take.
    pub fn dispatch(&mut self, irq: u8, frame: &mut F) -> bool {
        match self.resolve(irq) {
            Some(target) => {
                target.invoke(frame);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, irq: u8) -> bool {
        self.events.iter().any(|ev| ev.irq == irq)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &EventEntry<F>> {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::AtomicUsize;
    use core::sync::atomic::Ordering::Relaxed;

    use super::*;

    struct TestFrame {
        touched: bool,
    }

    static CALLBACK_HITS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_callback(_arg: *mut c_void) {
        CALLBACK_HITS.fetch_add(1, Relaxed);
    }

    unsafe extern "C" fn touch_frame(arg: *mut c_void) {
        // SAFETY: registered without a context, so the argument is the frame.
        let frame = unsafe { &mut *arg.cast::<TestFrame>() };
        frame.touched = true;
    }

    unsafe extern "C" fn bump_context(arg: *mut c_void) {
        // SAFETY: registered with an AtomicUsize context.
        let counter = unsafe { &*arg.cast::<AtomicUsize>() };
        counter.fetch_add(1, Relaxed);
    }

    struct CountingHandler {
        hits: AtomicUsize,
    }

    impl InterruptHandler<TestFrame> for CountingHandler {
        fn on_interrupt_received(&self, frame: &mut TestFrame) {
            self.hits.fetch_add(1, Relaxed);
            frame.touched = true;
        }
    }

    fn frame() -> TestFrame {
        TestFrame { touched: false }
    }

    #[test]
    fn dispatch_finds_handler_iff_registered() {
        let mut registry = EventRegistry::<TestFrame>::new();
        let handler = Arc::new(CountingHandler {
            hits: AtomicUsize::new(0),
        });
        registry.add_handler(5, handler.clone(), false);

        let mut f = frame();
        assert!(registry.dispatch(5, &mut f));
        assert!(f.touched);
        assert_eq!(handler.hits.load(Relaxed), 1);

        let mut f = frame();
        assert!(!registry.dispatch(6, &mut f));
        assert!(!f.touched);
    }

    #[test]
    fn callback_receives_frame_without_context() {
        let mut registry = EventRegistry::<TestFrame>::new();
        registry.add_callback(1, touch_frame, None, false);

        let mut f = frame();
        assert!(registry.dispatch(1, &mut f));
        assert!(f.touched);
    }

    #[test]
    fn callback_receives_context_when_registered_with_one() {
        let counter = AtomicUsize::new(0);
        let ctx = NonNull::from(&counter).cast::<c_void>();

        let mut registry = EventRegistry::<TestFrame>::new();
        registry.add_callback(2, bump_context, Some(ctx), false);

        let mut f = frame();
        assert!(registry.dispatch(2, &mut f));
        assert!(!f.touched);
        assert_eq!(counter.load(Relaxed), 1);
    }

    #[test]
    fn registry_contains_exactly_the_live_registrations() {
        let mut registry = EventRegistry::<TestFrame>::new();
        registry.add_callback(1, count_callback, None, false);
        registry.add_callback(2, count_callback, None, false);
        registry.add_callback(3, touch_frame, None, false);
        assert_eq!(registry.len(), 3);

        registry.remove_callback_on(2, count_callback);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(1));
        assert!(!registry.contains(2));
        assert!(registry.contains(3));

        registry.remove_callback(count_callback);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(3));

        registry.remove_irq(3);
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_registration_is_permitted() {
        let mut registry = EventRegistry::<TestFrame>::new();
        registry.add_callback(4, count_callback, None, false);
        registry.add_callback(4, count_callback, None, false);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn critical_entries_survive_remove_all() {
        let mut registry = EventRegistry::<TestFrame>::new();
        let critical = Arc::new(CountingHandler {
            hits: AtomicUsize::new(0),
        });
        registry.add_handler(9, critical.clone(), true);
        registry.add_callback(7, count_callback, None, false);

        registry.remove_all();
        assert_eq!(registry.len(), 1);

        let mut f = frame();
        assert!(registry.dispatch(9, &mut f));
        assert_eq!(critical.hits.load(Relaxed), 1);

        let mut f = frame();
        assert!(!registry.dispatch(7, &mut f));
    }

    #[test]
    fn critical_entries_resist_targeted_removal() {
        let mut registry = EventRegistry::<TestFrame>::new();
        registry.add_callback(9, count_callback, None, true);
        registry.remove_irq(9);
        registry.remove_callback(count_callback);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn hot_entries_sort_to_the_front() {
        let mut registry = EventRegistry::<TestFrame>::new();
        // A cold entry registered first so that the hot one starts behind it.
        registry.add_callback(1, count_callback, None, false);
        let h1 = Arc::new(CountingHandler {
            hits: AtomicUsize::new(0),
        });
        let h2 = Arc::new(CountingHandler {
            hits: AtomicUsize::new(0),
        });
        registry.add_handler(5, h1.clone(), false);
        registry.add_handler(5, h2.clone(), false);

        for _ in 0..=SORT_INTERVAL {
            let mut f = frame();
            assert!(registry.dispatch(5, &mut f));
        }

        // First-registered entry wins every dispatch (ties broken by
        // insertion order), and after the sort threshold it leads the list.
        assert_eq!(h1.hits.load(Relaxed) as u32, SORT_INTERVAL + 1);
        assert_eq!(h2.hits.load(Relaxed), 0);
        let first = registry.entries().next().unwrap();
        assert_eq!(first.irq(), 5);
        assert_eq!(first.priority(), u64::from(SORT_INTERVAL) + 1);
    }
}
