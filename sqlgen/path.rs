use indexmap::IndexSet;

/// Which grammar rules one generated statement exercised.
///
/// Productions and `(production, alternative)` pairs are deduplicated but
/// keep first-visit order, so two statements that walked the same rules in
/// the same order report identical paths. Useful for coverage accounting
/// and for deciding whether a reduced repro still takes the failing path.
#[derive(Debug, Clone, Default)]
pub struct PathInfo {
    pub depth: usize,
    productions: IndexSet<usize>,
    alts: IndexSet<(usize, usize)>,
}

impl PathInfo {
    pub(crate) fn add_production(&mut self, number: usize) {
        self.productions.insert(number);
    }

    pub(crate) fn add_alt(&mut self, prod_num: usize, alt_num: usize) {
        self.alts.insert((prod_num, alt_num));
    }

    pub(crate) fn clear(&mut self) {
        self.depth = 0;
        self.productions.clear();
        self.alts.clear();
    }

    /// Visited production numbers in first-visit order.
    pub fn productions(&self) -> impl Iterator<Item = usize> + '_ {
        self.productions.iter().copied()
    }

    /// Visited `(production, alternative)` identities in first-visit order.
    pub fn alts(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.alts.iter().copied()
    }

    pub fn production_count(&self) -> usize {
        self.productions.len()
    }

    pub fn alt_count(&self) -> usize {
        self.alts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupes_but_keeps_first_visit_order() {
        let mut p = PathInfo::default();
        p.add_production(3);
        p.add_production(1);
        p.add_production(3);
        p.add_alt(3, 0);
        p.add_alt(1, 1);
        p.add_alt(3, 0);
        assert_eq!(p.productions().collect::<Vec<_>>(), vec![3, 1]);
        assert_eq!(p.alts().collect::<Vec<_>>(), vec![(3, 0), (1, 1)]);
        p.clear();
        assert_eq!(p.production_count(), 0);
        assert_eq!(p.alt_count(), 0);
    }
}
