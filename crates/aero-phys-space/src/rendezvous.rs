//! Pause-all / mutate / resume-all coordination.
//!
//! Evicting a chunk mapping invalidates host pointers that other execution threads may be
//! holding. The address space therefore performs evictions through a [`Rendezvous`], which runs
//! the mutation only once every other participant is parked.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

pub trait Rendezvous: Send + Sync {
    /// Runs `work` while every other participant is parked.
    fn run_exclusive(&self, work: &mut dyn FnMut());
}

/// Rendezvous for embeddings where no other thread touches guest memory concurrently (single
/// threaded tools, state load).
#[derive(Debug, Default, Clone, Copy)]
pub struct Quiesced;

impl Rendezvous for Quiesced {
    fn run_exclusive(&self, work: &mut dyn FnMut()) {
        work();
    }
}

#[derive(Debug, Default)]
struct ParkState {
    participants: HashSet<ThreadId>,
    parked: usize,
    active: Option<ThreadId>,
    rounds: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ParkState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ParkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, ParkState>) -> MutexGuard<'a, ParkState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Parks the calling participant until no other thread holds the rendezvous.
    fn park_while_held<'a>(
        &self,
        mut state: MutexGuard<'a, ParkState>,
        me: ThreadId,
    ) -> MutexGuard<'a, ParkState> {
        if state.active.is_none() || state.active == Some(me) {
            return state;
        }
        let counted = state.participants.contains(&me);
        if counted {
            state.parked += 1;
            self.changed.notify_all();
        }
        while state.active.is_some() && state.active != Some(me) {
            state = self.wait(state);
        }
        if counted {
            state.parked -= 1;
        }
        state
    }
}

/// Rendezvous over explicitly registered execution threads.
///
/// Each thread that may hold host pointers into guest memory registers once and calls
/// [`Participant::checkpoint`] whenever it is at a safe point (between guest instructions, before
/// blocking). A thread waiting to run its own exclusive section counts as parked, so two threads
/// requesting a rendezvous at the same time cannot deadlock.
#[derive(Debug, Default, Clone)]
pub struct ParkingRendezvous {
    shared: Arc<Shared>,
}

impl ParkingRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the calling thread. The registration ends when the returned handle is dropped.
    pub fn register(&self) -> Participant {
        let me = thread::current().id();
        let mut state = self.shared.lock();
        state = self.shared.park_while_held(state, me);
        state.participants.insert(me);
        drop(state);
        Participant {
            shared: Arc::clone(&self.shared),
            thread: me,
        }
    }

    pub fn participants(&self) -> usize {
        self.shared.lock().participants.len()
    }

    /// Number of completed exclusive sections.
    pub fn rounds(&self) -> u64 {
        self.shared.lock().rounds
    }
}

impl Rendezvous for ParkingRendezvous {
    fn run_exclusive(&self, work: &mut dyn FnMut()) {
        let me = thread::current().id();
        let mut state = self.shared.lock();
        while state.active.is_some() {
            state = self.shared.park_while_held(state, me);
        }
        state.active = Some(me);
        self.shared.changed.notify_all();

        loop {
            let others = state.participants.len() - usize::from(state.participants.contains(&me));
            if state.parked >= others {
                break;
            }
            state = self.shared.wait(state);
        }
        drop(state);

        work();

        let mut state = self.shared.lock();
        state.active = None;
        state.rounds += 1;
        self.shared.changed.notify_all();
    }
}

/// Registration of one execution thread with a [`ParkingRendezvous`].
#[derive(Debug)]
pub struct Participant {
    shared: Arc<Shared>,
    thread: ThreadId,
}

impl Participant {
    /// Parks the thread if another thread is running an exclusive section.
    pub fn checkpoint(&self) {
        let state = self.shared.lock();
        drop(self.shared.park_while_held(state, self.thread));
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.participants.remove(&self.thread);
        self.shared.changed.notify_all();
    }
}
