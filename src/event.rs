//! Prioritized multi-phase event dispatch.
//!
//! Every extension point in the bouncer is an [`Event`]: a multicast
//! broadcast with three phases. Pre-observers see every dispatch first,
//! handlers run until one claims the dispatch, post-observers always run
//! afterwards. Listeners can be restricted with predicate filters, and an
//! event can be bound to a parent so its listeners also fire on the parent's
//! dispatches when the bind filter matches — that is how class-level events
//! (all upstream connections, say) fan out to narrower subscriptions.

use std::cell::RefCell;
use std::ops::BitOr;
use std::rc::Rc;

/// Dispatch phases, in invocation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Observes every dispatch before any handler runs. Return value is
    /// ignored apart from [`Outcome::REMOVE_HANDLER`].
    PreObserver,
    /// Runs until one listener returns [`Outcome::HANDLED`].
    Handler,
    /// Observes every dispatch after the handler phase, even when a handler
    /// claimed it.
    PostObserver,
}

/// Bitflag result returned by listeners.
///
/// `REMOVE_HANDLER` may be combined with either of the other two:
/// `Outcome::HANDLED | Outcome::REMOVE_HANDLER`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Outcome(u8);

impl Outcome {
    /// Keep going; the dispatch is not claimed.
    pub const CONTINUE: Outcome = Outcome(0);
    /// Stop further handlers; post-observers still run.
    pub const HANDLED: Outcome = Outcome(1);
    /// Deregister this listener from the event that invoked it.
    pub const REMOVE_HANDLER: Outcome = Outcome(2);

    pub fn is_handled(self) -> bool {
        self.0 & Outcome::HANDLED.0 != 0
    }

    pub fn removes_handler(self) -> bool {
        self.0 & Outcome::REMOVE_HANDLER.0 != 0
    }
}

impl BitOr for Outcome {
    type Output = Outcome;

    fn bitor(self, rhs: Outcome) -> Outcome {
        Outcome(self.0 | rhs.0)
    }
}

/// A listener callback over the event's argument type.
pub type Listener<A> = Rc<dyn Fn(&A) -> Outcome>;

/// A pure predicate over the event's arguments.
pub type Filter<A> = Rc<dyn Fn(&A) -> bool>;

struct Entry<A> {
    id: u64,
    listener: Listener<A>,
    phase: Phase,
    filter: Option<Filter<A>>,
}

struct Binding<A> {
    parent: Rc<Event<A>>,
    filter: Filter<A>,
}

/// A typed broadcast point.
pub struct Event<A> {
    name: &'static str,
    entries: RefCell<Vec<Entry<A>>>,
    binding: RefCell<Option<Binding<A>>>,
    next_id: RefCell<u64>,
}

impl<A: 'static> Event<A> {
    pub fn new(name: &'static str) -> Rc<Event<A>> {
        Rc::new(Event {
            name,
            entries: RefCell::new(Vec::new()),
            binding: RefCell::new(None),
            next_id: RefCell::new(0),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Register a listener.
    ///
    /// `last = false` prepends (most-recent listeners run first within their
    /// phase); `last = true` appends. If this event is bound to a parent,
    /// the listener is also registered there under the conjoined filter.
    pub fn add_listener(
        &self,
        listener: Listener<A>,
        phase: Phase,
        filter: Option<Filter<A>>,
        last: bool,
    ) {
        self.insert(listener.clone(), phase, filter.clone(), last);

        if let Some(binding) = self.binding.borrow().as_ref() {
            let conjoined = conjoin(binding.filter.clone(), filter);
            binding
                .parent
                .insert(listener, phase, Some(conjoined), last);
        }
    }

    /// Deregister a listener, matched by reference and, when `filter` is
    /// given, by filter identity. Parent-side registrations made through a
    /// bind are matched by listener reference alone (their filters are the
    /// conjoined ones).
    pub fn remove_listener(
        &self,
        listener: &Listener<A>,
        phase: Phase,
        filter: Option<&Filter<A>>,
    ) {
        self.entries.borrow_mut().retain(|e| {
            let matched = Rc::ptr_eq(&e.listener, listener)
                && e.phase == phase
                && filter.is_none_or(|f| {
                    e.filter.as_ref().is_some_and(|ef| Rc::ptr_eq(ef, f))
                });
            !matched
        });

        if let Some(binding) = self.binding.borrow().as_ref() {
            binding.parent.remove_listener(listener, phase, None);
        }
    }

    /// Bind this event to a parent: every listener (current and future)
    /// also fires when the parent dispatches and `filter` passes.
    pub fn bind(&self, parent: Rc<Event<A>>, filter: Filter<A>) {
        for e in self.entries.borrow().iter() {
            let conjoined = conjoin(filter.clone(), e.filter.clone());
            parent.insert(e.listener.clone(), e.phase, Some(conjoined), true);
        }

        *self.binding.borrow_mut() = Some(Binding { parent, filter });
    }

    /// Invoke the listeners. Returns `true` iff some handler claimed the
    /// dispatch by returning [`Outcome::HANDLED`].
    pub fn dispatch(&self, args: &A) -> bool {
        // Snapshot so listeners may add or remove listeners mid-dispatch.
        let snapshot: Vec<(u64, Listener<A>, Phase, Option<Filter<A>>)> = self
            .entries
            .borrow()
            .iter()
            .map(|e| (e.id, e.listener.clone(), e.phase, e.filter.clone()))
            .collect();

        let passes = |filter: &Option<Filter<A>>| filter.as_ref().is_none_or(|f| (**f)(args));
        let mut removals: Vec<u64> = Vec::new();

        for (id, listener, _, filter) in snapshot
            .iter()
            .filter(|(_, _, phase, _)| *phase == Phase::PreObserver)
        {
            if !passes(filter) {
                continue;
            }
            let outcome = (**listener)(args);
            debug_assert!(
                !outcome.is_handled(),
                "observer on {} returned HANDLED",
                self.name
            );
            if outcome.removes_handler() {
                removals.push(*id);
            }
        }

        let mut handled = false;
        for (id, listener, _, filter) in snapshot
            .iter()
            .filter(|(_, _, phase, _)| *phase == Phase::Handler)
        {
            if !passes(filter) {
                continue;
            }
            let outcome = (**listener)(args);
            if outcome.removes_handler() {
                removals.push(*id);
            }
            if outcome.is_handled() {
                handled = true;
                break;
            }
        }

        for (id, listener, _, filter) in snapshot
            .iter()
            .filter(|(_, _, phase, _)| *phase == Phase::PostObserver)
        {
            if !passes(filter) {
                continue;
            }
            let outcome = (**listener)(args);
            debug_assert!(
                !outcome.is_handled(),
                "observer on {} returned HANDLED",
                self.name
            );
            if outcome.removes_handler() {
                removals.push(*id);
            }
        }

        if !removals.is_empty() {
            self.entries
                .borrow_mut()
                .retain(|e| !removals.contains(&e.id));
        }

        handled
    }

    /// Number of registered listeners across all phases.
    pub fn listener_count(&self) -> usize {
        self.entries.borrow().len()
    }

    fn insert(&self, listener: Listener<A>, phase: Phase, filter: Option<Filter<A>>, last: bool) {
        let id = {
            let mut next = self.next_id.borrow_mut();
            *next += 1;
            *next
        };

        let entry = Entry {
            id,
            listener,
            phase,
            filter,
        };

        let mut entries = self.entries.borrow_mut();
        if last {
            entries.push(entry);
        } else {
            entries.insert(0, entry);
        }
    }
}

fn conjoin<A: 'static>(bind_filter: Filter<A>, own: Option<Filter<A>>) -> Filter<A> {
    match own {
        Some(own) => Rc::new(move |args: &A| (*bind_filter)(args) && (*own)(args)),
        None => bind_filter,
    }
}

/// Convenience for wrapping a closure as a [`Listener`].
pub fn listener<A, F>(f: F) -> Listener<A>
where
    F: Fn(&A) -> Outcome + 'static,
{
    Rc::new(f)
}

/// Convenience for wrapping a closure as a [`Filter`].
pub fn filter<A, F>(f: F) -> Filter<A>
where
    F: Fn(&A) -> bool + 'static,
{
    Rc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recorder(log: &Rc<RefCell<Vec<&'static str>>>, tag: &'static str) -> Listener<u32> {
        let log = log.clone();
        listener(move |_| {
            log.borrow_mut().push(tag);
            Outcome::CONTINUE
        })
    }

    #[test]
    fn handled_stops_handlers_but_not_observers() {
        let event = Event::new("test");
        let log = Rc::new(RefCell::new(Vec::new()));

        event.add_listener(recorder(&log, "pre"), Phase::PreObserver, None, true);
        {
            let log = log.clone();
            event.add_listener(
                listener(move |_| {
                    log.borrow_mut().push("h1");
                    Outcome::HANDLED
                }),
                Phase::Handler,
                None,
                true,
            );
        }
        event.add_listener(recorder(&log, "h2"), Phase::Handler, None, true);
        event.add_listener(recorder(&log, "post"), Phase::PostObserver, None, true);

        assert!(event.dispatch(&0));
        assert_eq!(*log.borrow(), vec!["pre", "h1", "post"]);
    }

    #[test]
    fn dispatch_returns_false_without_handled() {
        let event = Event::new("test");
        event.add_listener(listener(|_| Outcome::CONTINUE), Phase::Handler, None, true);
        assert!(!event.dispatch(&0));
    }

    #[test]
    fn registration_order_prepends_by_default() {
        let event = Event::new("test");
        let log = Rc::new(RefCell::new(Vec::new()));

        event.add_listener(recorder(&log, "first"), Phase::Handler, None, false);
        event.add_listener(recorder(&log, "second"), Phase::Handler, None, false);
        event.add_listener(recorder(&log, "last"), Phase::Handler, None, true);

        event.dispatch(&0);
        assert_eq!(*log.borrow(), vec!["second", "first", "last"]);
    }

    #[test]
    fn filters_gate_listeners() {
        let event = Event::new("test");
        let hits = Rc::new(Cell::new(0));
        {
            let hits = hits.clone();
            event.add_listener(
                listener(move |_| {
                    hits.set(hits.get() + 1);
                    Outcome::CONTINUE
                }),
                Phase::Handler,
                Some(filter(|n: &u32| *n > 10)),
                true,
            );
        }

        event.dispatch(&5);
        assert_eq!(hits.get(), 0);
        event.dispatch(&11);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn remove_handler_outcome_deregisters() {
        let event = Event::new("test");
        let hits = Rc::new(Cell::new(0));
        {
            let hits = hits.clone();
            event.add_listener(
                listener(move |_| {
                    hits.set(hits.get() + 1);
                    Outcome::HANDLED | Outcome::REMOVE_HANDLER
                }),
                Phase::Handler,
                None,
                true,
            );
        }

        assert!(event.dispatch(&0));
        assert!(!event.dispatch(&0));
        assert_eq!(hits.get(), 1);
        assert_eq!(event.listener_count(), 0);
    }

    #[test]
    fn remove_listener_by_reference() {
        let event = Event::new("test");
        let l = listener(|_: &u32| Outcome::HANDLED);
        event.add_listener(l.clone(), Phase::Handler, None, true);

        assert!(event.dispatch(&0));
        event.remove_listener(&l, Phase::Handler, None);
        assert!(!event.dispatch(&0));
    }

    #[test]
    fn bound_child_listeners_fire_on_parent_iff_filter_matches() {
        let parent = Event::new("parent");
        let child = Event::new("child");
        child.bind(parent.clone(), filter(|n: &u32| *n % 2 == 0));

        let hits = Rc::new(Cell::new(0));
        {
            let hits = hits.clone();
            child.add_listener(
                listener(move |_| {
                    hits.set(hits.get() + 1);
                    Outcome::CONTINUE
                }),
                Phase::PreObserver,
                None,
                true,
            );
        }

        parent.dispatch(&1);
        assert_eq!(hits.get(), 0);
        parent.dispatch(&2);
        assert_eq!(hits.get(), 1);

        // direct child dispatch is unfiltered
        child.dispatch(&3);
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn bind_registers_existing_listeners_on_parent() {
        let parent = Event::new("parent");
        let child = Event::new("child");

        let hits = Rc::new(Cell::new(0));
        {
            let hits = hits.clone();
            child.add_listener(
                listener(move |_| {
                    hits.set(hits.get() + 1);
                    Outcome::CONTINUE
                }),
                Phase::Handler,
                None,
                true,
            );
        }

        child.bind(parent.clone(), filter(|_: &u32| true));
        parent.dispatch(&0);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn conjoined_filter_combines_bind_and_listener_filters() {
        let parent = Event::new("parent");
        let child = Event::new("child");
        child.bind(parent.clone(), filter(|n: &u32| *n >= 10));

        let hits = Rc::new(Cell::new(0));
        {
            let hits = hits.clone();
            child.add_listener(
                listener(move |_| {
                    hits.set(hits.get() + 1);
                    Outcome::CONTINUE
                }),
                Phase::Handler,
                Some(filter(|n: &u32| *n % 2 == 0)),
                true,
            );
        }

        parent.dispatch(&9); // fails bind filter
        parent.dispatch(&11); // fails listener filter
        assert_eq!(hits.get(), 0);
        parent.dispatch(&12);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn remove_listener_unlinks_parent_registration() {
        let parent = Event::new("parent");
        let child = Event::new("child");
        child.bind(parent.clone(), filter(|_: &u32| true));

        let l = listener(|_: &u32| Outcome::HANDLED);
        child.add_listener(l.clone(), Phase::Handler, None, true);
        assert!(parent.dispatch(&0));

        child.remove_listener(&l, Phase::Handler, None);
        assert!(!parent.dispatch(&0));
        assert_eq!(parent.listener_count(), 0);
    }
}
