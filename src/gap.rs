//! A memory-efficient record of which change-log ids have been replayed.
//!
//! Replay normally advances a single high-water mark, but a batch that
//! skips an id (because, say, that row is being replayed out of order in
//! a parallel gap-catchup pass) leaves a hole below the mark. Storing
//! every seen id would cost memory proportional to the whole change-log;
//! storing only the holes costs memory proportional to how far out of
//! order replay actually got, which in practice is tiny.

/// High-water mark plus sparse set of ids below it that have not yet been
/// replayed.
#[derive(Debug, Clone, Default)]
pub struct ReplayedSet {
    stop: u64,
    gap: Vec<u64>,
}

impl ReplayedSet {
    pub fn new() -> ReplayedSet {
        ReplayedSet::default()
    }

    /// Records a batch of newly replayed ids, in ascending order. Any id
    /// skipped between the previous high-water mark and the next point in
    /// `points` becomes a hole.
    pub fn extend(&mut self, points: &[u64]) {
        let mut last_point = self.stop;
        for &current_point in points {
            if current_point != last_point + 1 {
                self.gap.extend(last_point + 1..current_point);
            }
            self.stop = current_point;
            last_point = current_point;
        }
    }

    /// Marks a previously skipped id as now replayed.
    ///
    /// # Panics
    /// Panics if `point` is not a recorded hole and is not within the
    /// covered range — mirrors the original's refusal to silently accept
    /// an out-of-range or already-filled id, since either indicates a bug
    /// in the caller's replay bookkeeping.
    pub fn fill(&mut self, point: u64) {
        if let Some(pos) = self.gap.iter().position(|&p| p == point) {
            self.gap.remove(pos);
        } else if point > self.stop {
            panic!("attempted to fill id {point} beyond the current covering range");
        } else {
            panic!("attempted to fill id {point} which is not a recorded gap");
        }
    }

    /// Ids below the high-water mark that have not yet been replayed.
    pub fn missing_points(&self) -> &[u64] {
        &self.gap
    }

    /// The highest id recorded as replayed (the high-water mark).
    pub fn stop(&self) -> u64 {
        self.stop
    }

    /// Whether every id up to the high-water mark has been replayed.
    pub fn is_complete(&self) -> bool {
        self.gap.is_empty()
    }
}
