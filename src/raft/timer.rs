use super::NodeID;

use crossbeam::channel::Sender;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A logical timer held by a Raft node. Each node runs at most one timer per
/// identity; arming an already-armed timer replaces it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Timer {
    /// The leader timeout. Armed by followers; firing triggers an election.
    Leader,
    /// The election timeout. Armed by candidates; firing restarts the
    /// election at a higher term.
    Election,
    /// A per-peer heartbeat timeout. Armed by candidates and leaders; firing
    /// re-sends RequestVote or AppendEntries to the peer.
    Heartbeat(NodeID),
}

/// A timer expiry, delivered on the scheduler's fire channel. The generation
/// identifies the arm that scheduled it: a fire whose generation no longer
/// matches the armed generation raced with a cancel or reset and must be
/// ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct TimerFire {
    pub timer: Timer,
    pub generation: u64,
}

/// A pending deadline in the scheduler heap. Ordered by soonest deadline
/// first (reverse ordering, since BinaryHeap is a max-heap).
struct Deadline {
    at: Instant,
    generation: u64,
    timer: Timer,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.generation == other.generation
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.at.cmp(&self.at).then(other.generation.cmp(&self.generation))
    }
}

/// Scheduler state shared with the expiry thread.
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

struct State {
    /// Pending deadlines. May contain stale entries for cancelled or re-armed
    /// timers; those are skipped when popped, since their generation no
    /// longer matches.
    deadlines: BinaryHeap<Deadline>,
    /// The current generation of each armed timer.
    armed: HashMap<Timer, u64>,
    /// The next generation to hand out.
    next_generation: u64,
    /// Set to shut the expiry thread down.
    shutdown: bool,
}

/// A one-shot timer scheduler. Timers are armed with a duration and fire a
/// single TimerFire event on the given channel; periodic behaviour is built
/// by re-arming in the fire handler. A dedicated thread tracks deadlines.
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Scheduler {
    /// Creates a scheduler delivering fires on the given channel, and spawns
    /// its expiry thread.
    pub fn new(fire_tx: Sender<TimerFire>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                deadlines: BinaryHeap::new(),
                armed: HashMap::new(),
                next_generation: 1,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || Self::run(shared, fire_tx))
        };
        Self { shared, thread: Some(thread) }
    }

    /// Arms a timer to fire after the given duration, replacing any previous
    /// arm of the same timer. Returns the new generation.
    pub fn arm(&self, timer: Timer, duration: Duration) -> u64 {
        let mut state = self.shared.state.lock().expect("scheduler poisoned");
        let generation = state.next_generation;
        state.next_generation += 1;
        state.armed.insert(timer.clone(), generation);
        state.deadlines.push(Deadline { at: Instant::now() + duration, generation, timer });
        self.shared.wake.notify_all();
        generation
    }

    /// Cancels a timer. A noop if the timer is not armed. A fire already in
    /// flight on the channel is left for the node to discard by generation.
    pub fn cancel(&self, timer: &Timer) {
        let mut state = self.shared.state.lock().expect("scheduler poisoned");
        state.armed.remove(timer);
    }

    /// Resets a timer: equivalent to cancel followed by arm. Returns the new
    /// generation.
    pub fn reset(&self, timer: Timer, duration: Duration) -> u64 {
        self.arm(timer, duration)
    }

    /// The expiry thread: pops due deadlines and delivers fires, skipping
    /// deadlines whose generation is no longer armed.
    fn run(shared: Arc<Shared>, fire_tx: Sender<TimerFire>) {
        let mut state = shared.state.lock().expect("scheduler poisoned");
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            while let Some(deadline) = state.deadlines.peek() {
                if deadline.at > now {
                    break;
                }
                let deadline = state.deadlines.pop().expect("peeked deadline vanished");
                if state.armed.get(&deadline.timer) != Some(&deadline.generation) {
                    continue; // cancelled or re-armed
                }
                // One-shot: the timer is spent once it fires.
                state.armed.remove(&deadline.timer);
                let fire = TimerFire { timer: deadline.timer, generation: deadline.generation };
                if fire_tx.send(fire).is_err() {
                    return; // receiver gone, node shut down
                }
            }
            let wait = state.deadlines.peek().map(|d| d.at.saturating_duration_since(now));
            state = match wait {
                Some(wait) => {
                    shared.wake.wait_timeout(state, wait).expect("scheduler poisoned").0
                }
                None => shared.wake.wait(state).expect("scheduler poisoned"),
            };
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.shutdown = true;
        }
        self.shared.wake.notify_all();
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
    }
}
