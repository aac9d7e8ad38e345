//! Process-wide worker pools for block-level fork-join.
//!
//! A chunk's blocks are the unit of parallel work.  Every call into this
//! module dispatches one chunk's blocks and returns only after all of them
//! finished, with results in block order regardless of which worker
//! finished first.
//!
//! One rayon pool is built per distinct thread count and cached for the
//! life of the process (or until [`crate::shutdown`]).  Without the
//! `parallel` feature everything runs on the calling thread and produces
//! the same bytes.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Upper bound accepted for any thread-count setting.
pub const MAX_THREADS: usize = 256;

static GLOBAL_NTHREADS: AtomicUsize = AtomicUsize::new(1);

/// Set the default thread count used by new parameter sets.
/// Returns the previous value.
pub fn set_nthreads(n: usize) -> Result<usize> {
    check_nthreads(n)?;
    Ok(GLOBAL_NTHREADS.swap(n, Ordering::SeqCst))
}

pub fn nthreads() -> usize {
    GLOBAL_NTHREADS.load(Ordering::SeqCst)
}

pub(crate) fn check_nthreads(n: usize) -> Result<()> {
    if n == 0 || n > MAX_THREADS {
        return Err(Error::invalid(format!("thread count {n} outside 1..={MAX_THREADS}")));
    }
    Ok(())
}

#[cfg(feature = "parallel")]
mod pools {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, OnceLock};

    use log::{debug, warn};
    use rayon::ThreadPool;

    static POOLS: OnceLock<Mutex<HashMap<usize, Arc<ThreadPool>>>> = OnceLock::new();

    pub(super) fn pool_for(nthreads: usize) -> Option<Arc<ThreadPool>> {
        let pools = POOLS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut pools = pools.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = pools.get(&nthreads) {
            return Some(Arc::clone(pool));
        }
        match rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .thread_name(|i| format!("supchunk-worker-{i}"))
            .build()
        {
            Ok(pool) => {
                debug!("started worker pool with {nthreads} threads");
                let pool = Arc::new(pool);
                pools.insert(nthreads, Arc::clone(&pool));
                Some(pool)
            }
            Err(e) => {
                warn!("could not start a {nthreads}-thread pool, running sequentially: {e}");
                None
            }
        }
    }

    pub(super) fn clear() {
        if let Some(pools) = POOLS.get() {
            pools.lock().unwrap_or_else(|e| e.into_inner()).clear();
        }
    }
}

/// Run `f` for every block index in `0..nblocks` and collect the results
/// in block order.  The first error wins.
pub(crate) fn map_blocks<T, F>(nthreads: usize, nblocks: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> Result<T> + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        if nthreads > 1 && nblocks > 1 {
            if let Some(pool) = pools::pool_for(nthreads) {
                return pool.install(|| (0..nblocks).into_par_iter().map(&f).collect());
            }
        }
    }
    #[cfg(not(feature = "parallel"))]
    let _ = nthreads;

    (0..nblocks).map(f).collect()
}

/// Split `dest` into consecutive `span`-byte pieces (the last may be short)
/// and run `f(piece_index, piece)` on each.
pub(crate) fn for_each_span_mut<F>(nthreads: usize, dest: &mut [u8], span: usize, f: F) -> Result<()>
where
    F: Fn(usize, &mut [u8]) -> Result<()> + Sync + Send,
{
    if span == 0 || dest.is_empty() {
        return Ok(());
    }
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        if nthreads > 1 && dest.len() > span {
            if let Some(pool) = pools::pool_for(nthreads) {
                return pool.install(|| {
                    dest.par_chunks_mut(span)
                        .enumerate()
                        .try_for_each(|(i, piece)| f(i, piece))
                });
            }
        }
    }
    #[cfg(not(feature = "parallel"))]
    let _ = nthreads;

    dest.chunks_mut(span)
        .enumerate()
        .try_for_each(|(i, piece)| f(i, piece))
}

pub(crate) fn clear_pools() {
    #[cfg(feature = "parallel")]
    pools::clear();
}
