use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A generic trait for implementing new replacement policies. Can be used to parameterise a Cache.
///
/// Line indices are flat indices into the cache's set-major line arena, so a
/// policy can keep one metadata slot per line in a plain vector. Ties are
/// always broken towards the lowest way index: implementations scan ways in
/// order and only move the candidate on a strict improvement.
pub trait ReplacementPolicy {
    /// Updates the policy when a cached line is hit
    ///
    /// Not applicable for some policies, a default which does nothing is provided
    ///
    /// # Arguments
    ///
    /// * `set`: The set the hit line belongs to
    /// * `line_index`: The flat index of the hit line
    fn update_on_hit(&mut self, _set: usize, _line_index: usize) {}

    /// Selects the victim line for a miss. Always returns a line, even when
    /// the set is full; selection is metadata-driven and never inspects tags.
    ///
    /// # Arguments
    ///
    /// * `set_lower_bound_index`: The flat index of the set's first line. This is equal to
    ///   set * lines_per_set, but it is already known by the cache so it can be passed in
    /// * `set`: The cache set
    /// * `lines_per_set`: The number of cache lines per set
    /// * `first_empty`: The flat index of the first invalid line in the set, if any.
    ///   Policies that prefer empty slots take it; the rest ignore it
    ///
    /// returns: the flat index of the line to evict
    fn select_victim(
        &mut self,
        set_lower_bound_index: usize,
        set: usize,
        lines_per_set: usize,
        first_empty: Option<usize>,
    ) -> usize;
}

/// Random replacement. Prefers an empty way; otherwise evicts a uniformly
/// random way.
///
/// The generator is seeded once at cache creation, by default from
/// wall-clock time, so two caches created at the same instant may produce
/// correlated victim sequences. Pass an explicit seed for reproducibility.
pub struct Random {
    rng: StdRng,
}

impl Random {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ReplacementPolicy for Random {
    fn select_victim(
        &mut self,
        set_lower_bound_index: usize,
        _set: usize,
        lines_per_set: usize,
        first_empty: Option<usize>,
    ) -> usize {
        first_empty.unwrap_or_else(|| set_lower_bound_index + self.rng.gen_range(0..lines_per_set))
    }
}

/// First-in first-out replacement, which keeps a rotating cursor for each
/// set and evicts whatever the cursor lands on, valid or not. Hits do not
/// move the cursor.
pub struct Fifo {
    set_cursors: Vec<usize>,
}

impl Fifo {
    pub fn new(num_sets: usize) -> Self {
        Self {
            set_cursors: vec![0; num_sets],
        }
    }
}

impl ReplacementPolicy for Fifo {
    fn select_victim(
        &mut self,
        set_lower_bound_index: usize,
        set: usize,
        lines_per_set: usize,
        _first_empty: Option<usize>,
    ) -> usize {
        let cursor = &mut self.set_cursors[set];
        *cursor = (*cursor + 1) % lines_per_set;
        set_lower_bound_index + *cursor
    }
}

/// Least recently used replacement
///
/// Each set keeps a monotonic cursor; a hit or an insertion stamps the
/// line with the incremented cursor value, so the smallest stamp in a set
/// is always the least recently touched line. Untouched (invalid) lines
/// keep stamp 0 and are therefore picked up before any valid line.
pub struct LeastRecentlyUsed {
    accessed_order: Vec<u64>,
    set_cursors: Vec<u64>,
}

impl LeastRecentlyUsed {
    pub fn new(num_lines: usize, num_sets: usize) -> Self {
        Self {
            accessed_order: vec![0; num_lines],
            set_cursors: vec![0; num_sets],
        }
    }

    fn stamp(&mut self, set: usize, line_index: usize) {
        self.set_cursors[set] += 1;
        self.accessed_order[line_index] = self.set_cursors[set];
    }
}

impl ReplacementPolicy for LeastRecentlyUsed {
    fn update_on_hit(&mut self, set: usize, line_index: usize) {
        self.stamp(set, line_index);
    }

    fn select_victim(
        &mut self,
        set_lower_bound_index: usize,
        set: usize,
        lines_per_set: usize,
        _first_empty: Option<usize>,
    ) -> usize {
        let mut victim = set_lower_bound_index;
        for index in set_lower_bound_index..set_lower_bound_index + lines_per_set {
            if self.accessed_order[index] < self.accessed_order[victim] {
                victim = index;
            }
        }
        // The incoming line is most recently used the moment it lands
        self.stamp(set, victim);
        victim
    }
}

/// Most recently used replacement. Prefers an empty way; otherwise evicts
/// the line with the largest access stamp.
pub struct MostRecentlyUsed {
    accessed_order: Vec<u64>,
    set_cursors: Vec<u64>,
}

impl MostRecentlyUsed {
    pub fn new(num_lines: usize, num_sets: usize) -> Self {
        Self {
            accessed_order: vec![0; num_lines],
            set_cursors: vec![0; num_sets],
        }
    }

    fn stamp(&mut self, set: usize, line_index: usize) {
        self.set_cursors[set] += 1;
        self.accessed_order[line_index] = self.set_cursors[set];
    }
}

impl ReplacementPolicy for MostRecentlyUsed {
    fn update_on_hit(&mut self, set: usize, line_index: usize) {
        self.stamp(set, line_index);
    }

    fn select_victim(
        &mut self,
        set_lower_bound_index: usize,
        set: usize,
        lines_per_set: usize,
        first_empty: Option<usize>,
    ) -> usize {
        let victim = first_empty.unwrap_or_else(|| {
            let mut candidate = set_lower_bound_index;
            for index in set_lower_bound_index..set_lower_bound_index + lines_per_set {
                if self.accessed_order[index] > self.accessed_order[candidate] {
                    candidate = index;
                }
            }
            candidate
        });
        self.stamp(set, victim);
        victim
    }
}

/// Least frequently used replacement
///
/// Each line carries a hit counter; insertion resets the victim's counter
/// to 1 and each subsequent hit adds one. Invalid lines sit at 0, so they
/// are filled before any valid line is evicted.
pub struct LeastFrequentlyUsed {
    usages: Vec<u64>,
}

impl LeastFrequentlyUsed {
    pub fn new(num_lines: usize) -> Self {
        Self {
            usages: vec![0; num_lines],
        }
    }
}

impl ReplacementPolicy for LeastFrequentlyUsed {
    fn update_on_hit(&mut self, _set: usize, line_index: usize) {
        self.usages[line_index] += 1;
    }

    fn select_victim(
        &mut self,
        set_lower_bound_index: usize,
        _set: usize,
        lines_per_set: usize,
        _first_empty: Option<usize>,
    ) -> usize {
        let mut victim = set_lower_bound_index;
        for index in set_lower_bound_index..set_lower_bound_index + lines_per_set {
            if self.usages[index] < self.usages[victim] {
                victim = index;
            }
        }
        self.usages[victim] = 1;
        victim
    }
}

/// Most frequently used replacement. Prefers an empty way; otherwise evicts
/// the line with the largest hit counter, resetting it to 1 for the new
/// occupant.
pub struct MostFrequentlyUsed {
    usages: Vec<u64>,
}

impl MostFrequentlyUsed {
    pub fn new(num_lines: usize) -> Self {
        Self {
            usages: vec![0; num_lines],
        }
    }
}

impl ReplacementPolicy for MostFrequentlyUsed {
    fn update_on_hit(&mut self, _set: usize, line_index: usize) {
        self.usages[line_index] += 1;
    }

    fn select_victim(
        &mut self,
        set_lower_bound_index: usize,
        _set: usize,
        lines_per_set: usize,
        first_empty: Option<usize>,
    ) -> usize {
        let victim = first_empty.unwrap_or_else(|| {
            let mut candidate = set_lower_bound_index;
            for index in set_lower_bound_index..set_lower_bound_index + lines_per_set {
                if self.usages[index] > self.usages[candidate] {
                    candidate = index;
                }
            }
            candidate
        });
        self.usages[victim] = 1;
        victim
    }
}
