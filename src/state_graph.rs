//! Generic declarative state machine engine.
//!
//! A [`StateGraph`] is an immutable description of states, actions and
//! transitions, built once and queried repeatedly. A [`StateGraphIterator`]
//! holds the mutable cursor ("current state") over one graph, one per owner.
//!
//! The engine is deliberately small: it knows nothing about environments or
//! capture buffers. Owners attach behavior through enter/exit hooks, each of
//! which receives the shared per-transition [`Event`] and may veto the
//! transition with [`Event::stop`] before anything commits. This is how a
//! cancelled save dialog rolls back a `save` action without corrupting the
//! machine.
//!
//! # Thread safety
//!
//! Every `do_action`/`enter` body runs under one reentrant lock per
//! iterator: concurrent callers on the same iterator serialize, and a hook
//! may safely re-enter the same iterator (query the current state, or even
//! drive a nested action). The lock is exposed through
//! [`StateGraphIterator::lock`] so owners can hold it across multi-step
//! operations (assert-then-dispatch).
//!
//! # Example
//!
//! ```
//! use acqctl::state_graph::{Action, State, StateGraph, StateGraphIterator, Transition};
//! use std::sync::Arc;
//!
//! #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
//! enum S { Idle, Busy }
//! #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
//! enum A { Go }
//!
//! let graph = StateGraph::new(
//!     vec![State::new(S::Idle), State::new(S::Busy)],
//!     vec![Action::new(A::Go)],
//!     vec![Transition::new(S::Idle, A::Go, S::Busy)],
//! )
//! .unwrap();
//! let cursor = StateGraphIterator::new(Arc::new(graph), S::Idle).unwrap();
//! let outcome = cursor.do_action(A::Go).unwrap();
//! assert!(outcome.committed);
//! assert_eq!(cursor.current(), S::Busy);
//! ```

use crate::error::StateMachineError;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Bound for state and action ids. Blanket-implemented; enums derive it with
/// `#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]`.
pub trait GraphId: Copy + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Copy + Eq + Hash + Debug + Send + Sync + 'static> GraphId for T {}

/// Transient value shared by every hook of one transition.
///
/// Calling [`stop`](Self::stop) vetoes the transition: remaining hooks are
/// skipped and the cursor does not advance.
pub struct Event<S, A> {
    /// State the transition leaves (for `enter`, the state being entered).
    pub input_state: S,
    /// Action driving the transition; `None` for an unconditional `enter`.
    pub action: Option<A>,
    /// State the transition enters; `None` for an unconditional `enter`.
    pub output_state: Option<S>,
    is_continue: bool,
}

impl<S: GraphId, A: GraphId> Event<S, A> {
    fn new(input_state: S, action: Option<A>, output_state: Option<S>) -> Self {
        Self {
            input_state,
            action,
            output_state,
            is_continue: true,
        }
    }

    /// Veto the in-progress transition before it commits.
    pub fn stop(&mut self) {
        self.is_continue = false;
    }

    /// Whether processing should continue (no hook vetoed so far).
    pub fn is_continue(&self) -> bool {
        self.is_continue
    }
}

type Hook<S, A> = Box<dyn Fn(&mut Event<S, A>) + Send + Sync>;

/// A named state with optional enter/exit hooks.
pub struct State<S, A> {
    id: S,
    on_enter: Option<Hook<S, A>>,
    on_exit: Option<Hook<S, A>>,
}

impl<S: GraphId, A: GraphId> State<S, A> {
    pub fn new(id: S) -> Self {
        Self {
            id,
            on_enter: None,
            on_exit: None,
        }
    }

    /// Hook run whenever this state is entered.
    pub fn on_enter(mut self, hook: impl Fn(&mut Event<S, A>) + Send + Sync + 'static) -> Self {
        self.on_enter = Some(Box::new(hook));
        self
    }

    /// Hook run whenever this state is left through a transition.
    pub fn on_exit(mut self, hook: impl Fn(&mut Event<S, A>) + Send + Sync + 'static) -> Self {
        self.on_exit = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> S {
        self.id
    }
}

/// A declared action id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Action<A> {
    id: A,
}

impl<A: GraphId> Action<A> {
    pub fn new(id: A) -> Self {
        Self { id }
    }

    pub fn id(&self) -> A {
        self.id
    }
}

/// An action-labeled edge with an optional hook of its own.
pub struct Transition<S, A> {
    in_id: S,
    action: A,
    out_id: S,
    on_enter: Option<Hook<S, A>>,
}

impl<S: GraphId, A: GraphId> Transition<S, A> {
    pub fn new(in_id: S, action: A, out_id: S) -> Self {
        Self {
            in_id,
            action,
            out_id,
            on_enter: None,
        }
    }

    /// Hook run between the input state's exit and the output state's enter.
    pub fn on_enter(mut self, hook: impl Fn(&mut Event<S, A>) + Send + Sync + 'static) -> Self {
        self.on_enter = Some(Box::new(hook));
        self
    }

    pub fn in_id(&self) -> S {
        self.in_id
    }

    pub fn action(&self) -> A {
        self.action
    }

    pub fn out_id(&self) -> S {
        self.out_id
    }
}

fn fmt_id<T: Debug>(id: &T) -> String {
    format!("{id:?}")
}

/// Immutable set of states, actions and transitions plus derived O(1)
/// lookup indices.
///
/// Construction validates that every transition references declared states
/// and actions and that at most one transition exists per `(in_id, action)`
/// pair — ambiguity there would make [`StateGraphIterator::do_action`]
/// non-deterministic.
pub struct StateGraph<S, A> {
    states: HashMap<S, State<S, A>>,
    actions: HashSet<A>,
    transitions: Vec<Transition<S, A>>,
    by_action: HashMap<(S, A), usize>,
    by_edge: HashMap<(S, S), usize>,
}

impl<S: GraphId, A: GraphId> StateGraph<S, A> {
    pub fn new(
        states: Vec<State<S, A>>,
        actions: Vec<Action<A>>,
        transitions: Vec<Transition<S, A>>,
    ) -> Result<Self, StateMachineError> {
        let state_idx: HashMap<S, State<S, A>> =
            states.into_iter().map(|state| (state.id, state)).collect();
        let action_idx: HashSet<A> = actions.into_iter().map(|action| (action.id)).collect();

        let mut by_action = HashMap::new();
        let mut by_edge = HashMap::new();
        for (index, transition) in transitions.iter().enumerate() {
            if !state_idx.contains_key(&transition.in_id) {
                return Err(StateMachineError::StateNotFound {
                    state: fmt_id(&transition.in_id),
                });
            }
            if !state_idx.contains_key(&transition.out_id) {
                return Err(StateMachineError::StateNotFound {
                    state: fmt_id(&transition.out_id),
                });
            }
            if !action_idx.contains(&transition.action) {
                return Err(StateMachineError::ActionNotAvailable {
                    state: fmt_id(&transition.in_id),
                    action: fmt_id(&transition.action),
                });
            }
            if by_action
                .insert((transition.in_id, transition.action), index)
                .is_some()
            {
                return Err(StateMachineError::DuplicateTransition {
                    state: fmt_id(&transition.in_id),
                    action: fmt_id(&transition.action),
                });
            }
            by_edge.insert((transition.in_id, transition.out_id), index);
        }

        Ok(Self {
            states: state_idx,
            actions: action_idx,
            transitions,
            by_action,
            by_edge,
        })
    }

    /// Look up a state by id.
    pub fn state(&self, id: S) -> Result<&State<S, A>, StateMachineError> {
        self.states
            .get(&id)
            .ok_or_else(|| StateMachineError::StateNotFound { state: fmt_id(&id) })
    }

    /// Resolve the transition for `(state, action)`.
    ///
    /// The typed error lets a caller probe "is this action currently legal"
    /// (e.g. to enable/disable a UI control) without crashing.
    pub fn transition_for(&self, state: S, action: A) -> Result<&Transition<S, A>, StateMachineError> {
        self.by_action
            .get(&(state, action))
            .map(|index| &self.transitions[*index])
            .ok_or_else(|| StateMachineError::ActionNotAvailable {
                state: fmt_id(&state),
                action: fmt_id(&action),
            })
    }

    /// Resolve the transition between two states, regardless of action.
    pub fn transition_between(&self, from: S, to: S) -> Result<&Transition<S, A>, StateMachineError> {
        self.by_edge
            .get(&(from, to))
            .map(|index| &self.transitions[*index])
            .ok_or_else(|| StateMachineError::TransitionNotFound {
                from: fmt_id(&from),
                to: fmt_id(&to),
            })
    }

    /// Whether `action` is legal in `state`.
    pub fn has_action(&self, state: S, action: A) -> bool {
        self.by_action.contains_key(&(state, action))
    }
}

/// Which hook vetoed an attempted transition.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HookStage {
    InputExit,
    Transition,
    OutputEnter,
}

/// Result of a [`StateGraphIterator::do_action`] call: which hooks ran and
/// whether the cursor advanced.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TransitionOutcome {
    pub input_exit_ran: bool,
    pub transition_ran: bool,
    pub output_enter_ran: bool,
    /// `false` means a hook vetoed and the current state is unchanged.
    pub committed: bool,
    pub vetoed_at: Option<HookStage>,
}

/// Mutable cursor over one [`StateGraph`], guarded by a reentrant lock.
pub struct StateGraphIterator<S, A> {
    graph: Arc<StateGraph<S, A>>,
    cursor: ReentrantMutex<Cell<S>>,
}

impl<S: GraphId, A: GraphId> StateGraphIterator<S, A> {
    /// Create an iterator and enter `start_state`.
    pub fn new(graph: Arc<StateGraph<S, A>>, start_state: S) -> Result<Self, StateMachineError> {
        graph.state(start_state)?;
        let iterator = Self {
            graph,
            cursor: ReentrantMutex::new(Cell::new(start_state)),
        };
        iterator.enter(start_state)?;
        Ok(iterator)
    }

    /// The graph this iterator walks.
    pub fn graph(&self) -> &Arc<StateGraph<S, A>> {
        &self.graph
    }

    /// Unconditionally jump to `state`, running its on_enter hook with a
    /// fresh event. The jump commits regardless of veto; hooks that need to
    /// refuse work belong on transitions, which `do_action` rolls back.
    pub fn enter(&self, state: S) -> Result<(), StateMachineError> {
        let guard = self.cursor.lock();
        let target = self.graph.state(state)?;
        let mut event = Event::new(state, None, None);
        if let Some(hook) = &target.on_enter {
            hook(&mut event);
        }
        guard.set(state);
        Ok(())
    }

    /// Current state id.
    pub fn current(&self) -> S {
        self.cursor.lock().get()
    }

    /// Whether the current state is one of `candidates`.
    pub fn is_current(&self, candidates: &[S]) -> bool {
        let current = self.current();
        candidates.iter().any(|candidate| *candidate == current)
    }

    /// Fail fast with `WrongState` when called in the wrong lifecycle phase.
    pub fn assert_state(&self, expected: S) -> Result<(), StateMachineError> {
        let actual = self.current();
        if actual == expected {
            Ok(())
        } else {
            Err(StateMachineError::WrongState {
                expected: fmt_id(&expected),
                actual: fmt_id(&actual),
            })
        }
    }

    /// Hold the iterator's reentrant lock across a multi-step operation,
    /// e.g. `assert_state` followed by a command dispatch.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, Cell<S>> {
        self.cursor.lock()
    }

    /// Drive `action` from the current state.
    ///
    /// Runs, in order and sharing one [`Event`]: the input state's on_exit,
    /// the transition's on_enter, the output state's on_enter. If any hook
    /// calls [`Event::stop`], processing halts immediately, the current
    /// state is not advanced and the outcome's `committed` flag is `false`.
    pub fn do_action(&self, action: A) -> Result<TransitionOutcome, StateMachineError> {
        let guard = self.cursor.lock();
        let current = guard.get();
        let transition = self.graph.transition_for(current, action)?;
        let input_state = self.graph.state(transition.in_id)?;
        let output_state = self.graph.state(transition.out_id)?;

        let mut event = Event::new(transition.in_id, Some(action), Some(transition.out_id));
        let mut outcome = TransitionOutcome::default();

        if let Some(hook) = &input_state.on_exit {
            outcome.input_exit_ran = true;
            hook(&mut event);
            if !event.is_continue() {
                outcome.vetoed_at = Some(HookStage::InputExit);
                return Ok(outcome);
            }
        }
        if let Some(hook) = &transition.on_enter {
            outcome.transition_ran = true;
            hook(&mut event);
            if !event.is_continue() {
                outcome.vetoed_at = Some(HookStage::Transition);
                return Ok(outcome);
            }
        }
        if let Some(hook) = &output_state.on_enter {
            outcome.output_enter_ran = true;
            hook(&mut event);
            if !event.is_continue() {
                outcome.vetoed_at = Some(HookStage::OutputEnter);
                return Ok(outcome);
            }
        }

        guard.set(transition.out_id);
        outcome.committed = true;
        Ok(outcome)
    }

    /// Drive the (unique) transition from the current state into `state`.
    pub fn go(&self, state: S) -> Result<TransitionOutcome, StateMachineError> {
        let guard = self.cursor.lock();
        let current = guard.get();
        let action = self.graph.transition_between(current, state)?.action;
        // Reentrant: the guard stays held so no other caller can interleave
        // between resolving the edge and driving it.
        self.do_action(action)
    }
}
