use std::collections::BTreeSet;

/// Photo positions the user has currently selected
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionSet {
    positions: BTreeSet<usize>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips membership of a position, returning whether it is now selected
    pub fn toggle(&mut self, position: usize) -> bool {
        if self.positions.remove(&position) {
            false
        } else {
            self.positions.insert(position);
            true
        }
    }

    pub fn contains(&self, position: usize) -> bool {
        self.positions.contains(&position)
    }

    pub fn positions(&self) -> &BTreeSet<usize> {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn clear(&mut self) {
        self.positions.clear();
    }
}

impl FromIterator<usize> for SelectionSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self {
            positions: iter.into_iter().collect(),
        }
    }
}
