//! Rank identity and the collectives the trace flush relies on.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use log::error;

/// Communication among the ranks of one process group.
///
/// `barrier` and `all_gather` are collective: every rank must call them in
/// the same order or the group deadlocks.
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn barrier(&self);

    /// Every rank contributes `local`; every rank receives all contributions
    /// indexed by rank.
    fn all_gather(&self, local: &[u64]) -> Vec<Vec<u64>>;

    /// Tear down the whole group. Never returns.
    fn abort(&self, err: &anyhow::Error) -> !;
}

/// A group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_gather(&self, local: &[u64]) -> Vec<Vec<u64>> {
        vec![local.to_vec()]
    }

    fn abort(&self, err: &anyhow::Error) -> ! {
        error!("aborting: {:#}", err);
        std::process::exit(1)
    }
}

struct Shared {
    size: usize,
    rendezvous: Mutex<Rendezvous>,
    turn: Condvar,
    slots: Mutex<Vec<Vec<u64>>>,
}

/// Generation barrier state. `aborted` is sticky: once a rank aborts, every
/// rank waiting now or arriving later unwinds instead of blocking.
#[derive(Default)]
struct Rendezvous {
    arrived: usize,
    generation: u64,
    aborted: Option<usize>,
}

impl Shared {
    fn rendezvous(&self) -> MutexGuard<'_, Rendezvous> {
        self.rendezvous.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn wait(&self, rank: usize) {
        let mut state = self.rendezvous();
        if let Some(culprit) = state.aborted {
            drop(state);
            peer_aborted(rank, culprit);
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.turn.notify_all();
            return;
        }
        let state = self
            .turn
            .wait_while(state, |s| s.generation == generation && s.aborted.is_none())
            .unwrap_or_else(|p| p.into_inner());
        if state.generation == generation {
            let culprit = state.aborted.unwrap_or(rank);
            drop(state);
            peer_aborted(rank, culprit);
        }
    }

    fn abort(&self, rank: usize) {
        let mut state = self.rendezvous();
        state.aborted.get_or_insert(rank);
        self.turn.notify_all();
    }
}

fn peer_aborted(rank: usize, culprit: usize) -> ! {
    error!("rank {} unwinding: rank {} aborted the group", rank, culprit);
    panic!("rank {} aborted the group", culprit)
}

/// N ranks as N threads of one process.
///
/// ```no_run
/// use ioa_core::collective::{Communicator, LocalGroup};
/// let ranks = LocalGroup::run(4, |comm| comm.rank());
/// assert_eq!(ranks, vec![0, 1, 2, 3]);
/// ```
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// One communicator per rank, to be moved into that rank's thread.
    pub fn new(size: usize) -> Vec<LocalGroup> {
        assert!(size > 0, "a group needs at least one rank");
        let shared = Arc::new(Shared {
            size,
            rendezvous: Mutex::new(Rendezvous::default()),
            turn: Condvar::new(),
            slots: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Run `f` once per rank on scoped threads and collect the results in
    /// rank order.
    ///
    /// If any rank panics (an abort included) the group is torn down and the
    /// panic of the lowest such rank is resumed once every thread has exited.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(LocalGroup) -> T + Sync,
    {
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = LocalGroup::new(size)
                .into_iter()
                .map(|comm| s.spawn(move || f(comm)))
                .collect();
            let joined: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
            joined
                .into_iter()
                .map(|r| r.unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    }
}

impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) {
        self.shared.wait(self.rank);
    }

    fn all_gather(&self, local: &[u64]) -> Vec<Vec<u64>> {
        {
            let mut slots = self.shared.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots[self.rank] = local.to_vec();
        }
        self.shared.wait(self.rank);
        let gathered = self.shared.slots.lock().unwrap_or_else(|p| p.into_inner()).clone();
        // slots are rewritten in the next round only after everyone has read
        self.shared.wait(self.rank);
        gathered
    }

    fn abort(&self, err: &anyhow::Error) -> ! {
        error!("rank {} aborting: {:#}", self.rank, err);
        self.shared.abort(self.rank);
        panic!("rank {} aborted: {:#}", self.rank, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_gather_returns_contributions_in_rank_order() {
        let results = LocalGroup::run(3, |comm| {
            let first = comm.all_gather(&[comm.rank() as u64, 10]);
            let second = comm.all_gather(&[100 + comm.rank() as u64]);
            (first, second)
        });
        for (first, second) in results {
            assert_eq!(first, vec![vec![0, 10], vec![1, 10], vec![2, 10]]);
            assert_eq!(second, vec![vec![100], vec![101], vec![102]]);
        }
    }

    #[test]
    fn abort_unwinds_ranks_blocked_in_collectives() {
        let outcome = std::panic::catch_unwind(|| {
            LocalGroup::run(3, |comm| {
                if comm.rank() == 2 {
                    comm.abort(&anyhow::anyhow!("bad input"));
                }
                comm.barrier();
                comm.all_gather(&[1])
            })
        });
        let panic = outcome.unwrap_err();
        let message = panic
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(message.contains("rank 2"), "{}", message);
    }

    #[test]
    fn barrier_is_reusable_across_generations() {
        let rounds = LocalGroup::run(4, |comm| {
            for _ in 0..50 {
                comm.barrier();
            }
            comm.all_gather(&[comm.rank() as u64]).len()
        });
        assert_eq!(rounds, vec![4; 4]);
    }

    #[test]
    fn single_process_is_rank_zero_of_one() {
        let comm = SingleProcess;
        assert_eq!((comm.rank(), comm.size()), (0, 1));
        assert_eq!(comm.all_gather(&[7, 8]), vec![vec![7, 8]]);
    }
}
