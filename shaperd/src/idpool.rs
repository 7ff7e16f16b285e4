//! Allocation of the marks that tag shaped traffic.

use std::collections::BTreeSet;

use parking_lot::Mutex;

/// A firewall mark, also used as the minor number of the session's class.
pub type Mark = u16;

/// The pool has no free mark left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("all marks in [{min}, {max}] are in use")]
pub struct Exhausted {
    /// Lowest mark of the pool.
    pub min: Mark,
    /// Highest mark of the pool.
    pub max: Mark,
}

#[derive(Debug)]
struct PoolState {
    /// Next never-issued mark. Kept as `u32` so it can step past [`Mark::MAX`].
    next_fresh: u32,
    /// Released marks below `next_fresh`.
    recycled: BTreeSet<Mark>,
}

/// A bounded pool of marks in `[min, max]`.
///
/// Recycled marks are reused before fresh ones, smallest first. Releasing the most recently
/// issued fresh mark shrinks the fresh range instead of recycling it.
#[derive(Debug)]
pub struct HandlePool {
    min: Mark,
    max: Mark,
    state: Mutex<PoolState>,
}

impl HandlePool {
    /// Creates a pool over `[min, max]`. An inverted range yields an always-empty pool.
    pub fn new(min: Mark, max: Mark) -> Self {
        Self {
            min,
            max,
            state: Mutex::new(PoolState { next_fresh: u32::from(min), recycled: BTreeSet::new() }),
        }
    }

    /// Takes a mark out of the pool.
    pub fn acquire(&self) -> Result<Mark, Exhausted> {
        let mut state = self.state.lock();

        if let Some(mark) = state.recycled.pop_first() {
            return Ok(mark);
        }

        if state.next_fresh <= u32::from(self.max) {
            // The bound check above keeps this within `Mark`.
            let mark = state.next_fresh as Mark;
            state.next_fresh += 1;
            return Ok(mark);
        }

        Err(Exhausted { min: self.min, max: self.max })
    }

    /// Returns `mark` to the pool.
    ///
    /// Marks outside the range or not currently issued are ignored.
    pub fn release(&self, mark: Mark) {
        let mut state = self.state.lock();

        let mark_wide = u32::from(mark);
        if mark < self.min || mark > self.max || mark_wide >= state.next_fresh {
            tracing::warn!(mark, "releasing a mark that was never issued");
            return;
        }

        if mark_wide + 1 == state.next_fresh {
            state.next_fresh -= 1;
            // Recycled marks now at the top of the range fold back into it.
            while state.next_fresh > u32::from(self.min) {
                let top = (state.next_fresh - 1) as Mark;
                if !state.recycled.remove(&top) {
                    break;
                }
                state.next_fresh -= 1;
            }
        } else if !state.recycled.insert(mark) {
            tracing::warn!(mark, "releasing a mark that is already free");
        }
    }

    /// Number of marks currently issued.
    pub fn in_use(&self) -> usize {
        let state = self.state.lock();
        (state.next_fresh - u32::from(self.min)) as usize - state.recycled.len()
    }
}
