//! K-way merging of sorted streams, and query cancellation.
//!
//! [`LoserTree`] keeps one "loser" per internal node of a tournament tree. An exhausted
//! source holds no head and loses every match, which acts as the infinitely-late sentinel:
//! once the winner slot holds it, all sources are done. Ties go to the lower source index,
//! so the merge is stable.

use crate::error::DbError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cancellation flag and optional deadline shared by every step of one query.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns an error once the query was cancelled or ran past its deadline.
    pub fn check(&self) -> Result<(), DbError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(DbError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(DbError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

/// Stable k-way merge over fallible, individually sorted sources.
pub struct LoserTree<T, I, F> {
    sources: Vec<I>,
    heads: Vec<Option<T>>,
    /// `tree[0]` is the current winner; `tree[1..k]` hold the losers of internal nodes.
    tree: Vec<usize>,
    less: F,
    started: bool,
    failed: bool,
    ctx: Option<QueryContext>,
}

impl<T, I, F> LoserTree<T, I, F>
where
    I: Iterator<Item = Result<T, DbError>>,
    F: FnMut(&T, &T) -> bool,
{
    /// `less(a, b)` must be a strict weak order consistent with every source's order.
    pub fn new(sources: Vec<I>, less: F) -> Self {
        let k = sources.len();
        Self {
            heads: (0..k).map(|_| None).collect(),
            tree: vec![0; k.max(1)],
            sources,
            less,
            started: false,
            failed: false,
            ctx: None,
        }
    }

    /// Checks `ctx` before producing each item.
    pub fn with_context(mut self, ctx: QueryContext) -> Self {
        self.ctx = Some(ctx);
        self
    }

    fn beats(&mut self, a: usize, b: usize) -> bool {
        match (&self.heads[a], &self.heads[b]) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(x), Some(y)) => {
                if (self.less)(x, y) {
                    true
                } else if (self.less)(y, x) {
                    false
                } else {
                    a < b
                }
            }
        }
    }

    fn build(&mut self, node: usize) -> usize {
        let k = self.sources.len();
        if node >= k {
            return node - k;
        }
        let l = self.build(2 * node);
        let r = self.build(2 * node + 1);
        let (winner, loser) = if self.beats(l, r) { (l, r) } else { (r, l) };
        self.tree[node] = loser;
        winner
    }

    fn replay(&mut self, from: usize) {
        let k = self.sources.len();
        let mut winner = from;
        let mut node = (from + k) / 2;
        while node > 0 {
            let contender = self.tree[node];
            if self.beats(contender, winner) {
                self.tree[node] = winner;
                winner = contender;
            }
            node /= 2;
        }
        self.tree[0] = winner;
    }

    fn pull(&mut self, i: usize) -> Result<(), DbError> {
        self.heads[i] = self.sources[i].next().transpose()?;
        Ok(())
    }

    fn start(&mut self) -> Result<(), DbError> {
        for i in 0..self.sources.len() {
            self.pull(i)?;
        }
        self.tree[0] = if self.sources.len() > 1 { self.build(1) } else { 0 };
        Ok(())
    }
}

impl<T, I, F> Iterator for LoserTree<T, I, F>
where
    I: Iterator<Item = Result<T, DbError>>,
    F: FnMut(&T, &T) -> bool,
{
    type Item = Result<T, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.sources.is_empty() {
            return None;
        }
        if let Some(ctx) = &self.ctx {
            if let Err(e) = ctx.check() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        if !self.started {
            self.started = true;
            if let Err(e) = self.start() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        let w = self.tree[0];
        let item = self.heads[w].take()?;
        if let Err(e) = self.pull(w) {
            self.failed = true;
            return Some(Err(e));
        }
        if self.sources.len() > 1 {
            self.replay(w);
        }
        Some(Ok(item))
    }
}

/// Merges already-sorted vectors.
pub fn merge_sorted<T, F>(runs: Vec<Vec<T>>, less: F) -> Vec<T>
where
    F: FnMut(&T, &T) -> bool,
{
    let total = runs.iter().map(Vec::len).sum();
    let sources: Vec<_> = runs
        .into_iter()
        .map(|r| r.into_iter().map(Ok::<T, DbError>))
        .collect();
    let mut out = Vec::with_capacity(total);
    // infallible sources never produce an error
    out.extend(LoserTree::new(sources, less).flatten());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_iter(v: Vec<i32>) -> impl Iterator<Item = Result<i32, DbError>> {
        v.into_iter().map(Ok)
    }

    #[test]
    fn merges_any_number_of_sources() {
        for k in 0..7 {
            let runs: Vec<Vec<i32>> = (0..k).map(|i| (0..5).map(|j| j * k + i).collect()).collect();
            let mut expected: Vec<i32> = runs.iter().flatten().copied().collect();
            expected.sort();
            assert_eq!(merge_sorted(runs, |a, b| a < b), expected, "k={}", k);
        }
    }

    #[test]
    fn ties_keep_source_order() {
        let runs = vec![vec![(1, 'a'), (2, 'a')], vec![(1, 'b')], vec![(1, 'c'), (2, 'c')]];
        let merged = merge_sorted(runs, |a, b| a.0 < b.0);
        assert_eq!(
            merged,
            vec![(1, 'a'), (1, 'b'), (1, 'c'), (2, 'a'), (2, 'c')]
        );
    }

    #[test]
    fn handles_empty_and_uneven_sources() {
        let merged: Vec<i32> = LoserTree::new(
            vec![ok_iter(vec![]), ok_iter(vec![3]), ok_iter(vec![1, 2, 9, 10]), ok_iter(vec![])],
            |a, b| a < b,
        )
        .collect::<Result<_, _>>()
        .unwrap();
        assert_eq!(merged, vec![1, 2, 3, 9, 10]);
    }

    #[test]
    fn source_errors_stop_the_merge() {
        let bad = vec![Ok(1), Err(DbError::corruption("boom")), Ok(5)].into_iter();
        let good = vec![Ok(2), Ok(3)].into_iter();
        let out: Vec<Result<i32, DbError>> = LoserTree::new(vec![bad, good], |a, b| a < b).collect();
        assert!(matches!(out[0], Ok(1)));
        assert!(out.iter().any(|r| r.is_err()));
        assert!(out.last().map_or(false, |r| r.is_err()));
    }

    #[test]
    fn cancelled_context_interrupts_the_merge() {
        let ctx = QueryContext::new();
        let mut merge = LoserTree::new(vec![ok_iter(vec![1, 2, 3])], |a, b| a < b)
            .with_context(ctx.clone());
        assert_eq!(merge.next().unwrap().unwrap(), 1);
        ctx.cancel();
        assert!(matches!(merge.next(), Some(Err(DbError::Cancelled))));
        assert!(merge.next().is_none());
    }

    #[test]
    fn expired_deadline_is_reported() {
        let ctx = QueryContext::with_timeout(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(ctx.check(), Err(DbError::DeadlineExceeded)));
    }
}
