//! Scheduling of per-item work for the solver and collision constraints.
//!
//! One code path serves both modes. With the `parallel` feature the
//! `Parallel` mode fans work out over rayon's global pool; without it,
//! `Parallel` runs sequentially.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::RelaxResult;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Execution {
    #[default]
    Sequential,
    Parallel,
}

impl Execution {
    /// True when work will actually be spread over worker threads.
    pub fn is_parallel(self) -> bool {
        cfg!(feature = "parallel") && self == Execution::Parallel
    }

    /// Run `f` on every item, stopping at the first error.
    ///
    /// In parallel mode which error is reported is unspecified when several
    /// items fail.
    pub fn try_for_each_mut<T, F>(self, items: &mut [T], f: F) -> RelaxResult<()>
    where
        T: Send,
        F: Fn(&mut T) -> RelaxResult<()> + Sync + Send,
    {
        #[cfg(feature = "parallel")]
        {
            if self.is_parallel() {
                return items.par_iter_mut().try_for_each(f);
            }
        }

        items.iter_mut().try_for_each(f)
    }

    /// Map `f` over `0..count`, keeping the output in index order.
    pub fn map_indices<R, F>(self, count: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Sync + Send,
    {
        #[cfg(feature = "parallel")]
        {
            if self.is_parallel() {
                return (0..count).into_par_iter().map(f).collect();
            }
        }

        (0..count).map(f).collect()
    }
}
