use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{bail, Error, Result};

use crate::memory::{set_current_device, Device, MAX_DEVICES};

/// Returned by `Rank::barrier` once any rank of the group has failed.
#[derive(Debug)]
pub struct Aborted;

impl fmt::Display for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "another rank of the process group failed")
    }
}

impl std::error::Error for Aborted {}

#[derive(Default)]
struct GateState {
    arrived: usize,
    generation: usize,
    aborted: bool,
}

/// Reusable barrier that releases every waiter when the group aborts.
struct Gate {
    size: usize,
    state: Mutex<GateState>,
    cvar: Condvar,
}

impl Gate {
    fn new(size: usize) -> Self {
        Self { size, state: Mutex::new(GateState::default()), cvar: Condvar::new() }
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::new(Aborted))?;
        if state.aborted {
            return Err(Error::new(Aborted));
        }
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.size {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }
        while state.generation == generation && !state.aborted {
            state = self.cvar.wait(state).map_err(|_| Error::new(Aborted))?;
        }
        if state.generation == generation {
            return Err(Error::new(Aborted));
        }
        Ok(())
    }

    fn abort(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.aborted = true;
        }
        self.cvar.notify_all();
    }
}

/// Aborts the gate when dropped armed, which covers both errors and panics.
struct AbortOnFailure<'a> {
    gate: &'a Gate,
    armed: bool,
}

impl Drop for AbortOnFailure<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.abort();
        }
    }
}

/// A fixed set of ranks that run together on scoped host threads.
pub struct ProcessGroup {
    world_size: usize,
    gate: Arc<Gate>,
}

impl ProcessGroup {
    pub fn new(world_size: usize) -> Result<Self> {
        if world_size == 0 || world_size > MAX_DEVICES {
            bail!("world_size must be between 1 and {MAX_DEVICES}, got {world_size}");
        }
        Ok(Self { world_size, gate: Arc::new(Gate::new(world_size)) })
    }

    pub fn ranks(&self) -> Vec<Rank> {
        (0..self.world_size)
            .map(|rank| Rank { rank, world_size: self.world_size, gate: self.gate.clone() })
            .collect()
    }

    /// Runs `f` once per rank and collects the results in rank order. Each
    /// rank's allocations are charged to its own device. If any rank fails
    /// or panics, ranks waiting at a barrier are released with `Aborted` and
    /// the first error that is not `Aborted` is returned.
    pub fn run<R, F>(&self, f: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(Rank) -> Result<R> + Sync,
    {
        let mut ranks = self.ranks();
        if ranks.len() == 1 {
            set_current_device(0);
            return Ok(vec![f(ranks.remove(0))?]);
        }
        let f = &f;
        let gate = &*self.gate;
        let results = crossbeam::scope(|s| {
            let handles: Vec<_> = ranks
                .into_iter()
                .map(|rank| {
                    s.spawn(move |_| {
                        set_current_device(rank.rank);
                        let mut guard = AbortOnFailure { gate, armed: true };
                        let out = f(rank);
                        guard.armed = out.is_err();
                        out
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .map_err(|x| Error::msg(format!("rank panicked {:?}", x.downcast_ref::<&str>())))
                        .and_then(|r| r)
                })
                .collect::<Vec<Result<R>>>()
        })
        .map_err(|x| Error::msg(format!("thread error {:?}", x.downcast_ref::<&str>())))?;

        let mut first_abort = None;
        let mut out = Vec::with_capacity(results.len());
        for res in results {
            match res {
                Ok(r) => out.push(r),
                Err(e) if e.is::<Aborted>() => {
                    first_abort.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        match first_abort {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

/// One member of a `ProcessGroup`.
#[derive(Clone)]
pub struct Rank {
    pub rank: usize,
    pub world_size: usize,
    gate: Arc<Gate>,
}

impl Rank {
    /// A group of one.
    pub fn single() -> Self {
        Self { rank: 0, world_size: 1, gate: Arc::new(Gate::new(1)) }
    }

    pub fn is_initialized(&self) -> bool {
        self.world_size > 1
    }

    pub fn is_leader(&self) -> bool {
        self.rank == 0
    }

    pub fn device(&self) -> Device {
        Device::new(self.rank)
    }

    /// Blocks until every rank of the group has arrived, or fails with
    /// `Aborted` once any rank has failed.
    pub fn barrier(&self) -> Result<()> {
        self.gate.wait()
    }
}
