/*
Bootstrap channel contract.

Cluster assembly needs exactly two collectives from the surrounding
communicator: an ordered byte all-gather and a tagged barrier. Both are
blocking and must be entered by every rank; slot order is preserved by
the channel, which is what keeps canonical server-id assignment
deterministic. LocalBootstrapGroup is the in-process implementation the
tests drive with one thread per rank.
*/

use crate::error::{Result, TopoError};
use log::trace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub trait Bootstrap {
    /// `buf` holds `n_ranks` slots of `elem_size` bytes; the caller's
    /// contribution sits at `rank * elem_size` on entry, every rank's on
    /// return. Collective.
    fn all_gather(&self, buf: &mut [u8], elem_size: usize) -> Result<()>;

    /// Collective synchronization point.
    fn barrier(&self, rank: usize, n_ranks: usize, tag: u32) -> Result<()>;
}

#[derive(Default)]
struct Round {
    slots: Vec<Option<Vec<u8>>>,
    consumed: usize,
}

struct Shared {
    n_ranks: usize,
    rounds: Mutex<HashMap<u64, Round>>,
    cv: Condvar,
}

/// One in-process communicator: hand each rank its own handle.
pub struct LocalBootstrapGroup {
    shared: Arc<Shared>,
}

impl LocalBootstrapGroup {
    pub fn new(n_ranks: usize) -> Self {
        assert!(n_ranks > 0, "communicator needs at least one rank");
        Self {
            shared: Arc::new(Shared {
                n_ranks,
                rounds: Mutex::new(HashMap::new()),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn handle(&self, rank: usize) -> LocalBootstrap {
        assert!(rank < self.shared.n_ranks, "rank out of range");
        LocalBootstrap {
            shared: self.shared.clone(),
            rank,
            seq: AtomicU64::new(0),
        }
    }
}

pub struct LocalBootstrap {
    shared: Arc<Shared>,
    rank: usize,
    // Collectives are totally ordered and identical across ranks, so a
    // per-handle operation counter keys the shared round table.
    seq: AtomicU64,
}

impl LocalBootstrap {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn n_ranks(&self) -> usize {
        self.shared.n_ranks
    }

    fn exchange(&self, contribution: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let key = self.seq.fetch_add(1, Ordering::Relaxed);
        let n = self.shared.n_ranks;
        let mut rounds = self
            .shared
            .rounds
            .lock()
            .map_err(|_| TopoError::Bootstrap("bootstrap state poisoned".into()))?;
        let round = rounds.entry(key).or_insert_with(|| Round {
            slots: vec![None; n],
            consumed: 0,
        });
        round.slots[self.rank] = Some(contribution);
        self.shared.cv.notify_all();

        while rounds
            .get(&key)
            .is_some_and(|r| r.slots.iter().any(Option::is_none))
        {
            rounds = self
                .shared
                .cv
                .wait(rounds)
                .map_err(|_| TopoError::Bootstrap("bootstrap state poisoned".into()))?;
        }

        let round = rounds
            .get_mut(&key)
            .ok_or_else(|| TopoError::Bootstrap("bootstrap round vanished".into()))?;
        let gathered: Vec<Vec<u8>> = round
            .slots
            .iter()
            .map(|s| s.clone().expect("round complete"))
            .collect();
        round.consumed += 1;
        if round.consumed == n {
            rounds.remove(&key);
        }
        Ok(gathered)
    }
}

impl Bootstrap for LocalBootstrap {
    fn all_gather(&self, buf: &mut [u8], elem_size: usize) -> Result<()> {
        let n = self.shared.n_ranks;
        if buf.len() != n * elem_size {
            return Err(TopoError::Bootstrap(format!(
                "all-gather buffer is {} bytes, expected {}",
                buf.len(),
                n * elem_size
            )));
        }
        let own = buf[self.rank * elem_size..(self.rank + 1) * elem_size].to_vec();
        trace!("rank {} entering all-gather ({elem_size} bytes)", self.rank);
        let gathered = self.exchange(own)?;
        for (r, slot) in gathered.into_iter().enumerate() {
            buf[r * elem_size..(r + 1) * elem_size].copy_from_slice(&slot);
        }
        Ok(())
    }

    fn barrier(&self, rank: usize, n_ranks: usize, tag: u32) -> Result<()> {
        if rank != self.rank || n_ranks != self.shared.n_ranks {
            return Err(TopoError::Bootstrap(format!(
                "barrier called as rank {rank}/{n_ranks} on handle {}/{}",
                self.rank, self.shared.n_ranks
            )));
        }
        trace!("rank {rank} entering barrier tag {tag}");
        self.exchange(Vec::new())?;
        Ok(())
    }
}
