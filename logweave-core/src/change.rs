use std::fmt;

/// a contiguous range of rows, `[start, start + count)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Section {
    pub start: usize,
    pub count: usize,
}

impl Section {
    pub fn new(start: usize, count: usize) -> Self {
        Self { start, count }
    }

    /// one past the last row of this section
    pub fn end(&self) -> usize {
        self.start + self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.end()
    }

    pub fn indices(&self) -> std::ops::Range<usize> {
        self.start..self.end()
    }

    /// smallest section starting at zero that covers both `self` and `other`
    pub fn bounding(&self, other: Section) -> Section {
        let end = self.end().max(other.end());
        Section::new(0, end)
    }
}

/// Unit of change carried from a source to each of its listeners.
///
/// Listeners must apply changes in the order they were emitted: an
/// [`Change::Invalidate`] followed by an [`Change::Append`] over the same rows
/// is how a row's interpretation changes, there is no in-place update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Change {
    /// `count` new rows exist starting at `start`
    Append(Section),
    /// rows from `start` onwards are void until re-described by an append
    Invalidate(Section),
    /// every previously announced row is void
    Reset,
}

impl Change {
    pub fn append(start: usize, count: usize) -> Self {
        Change::Append(Section::new(start, count))
    }

    pub fn invalidate(start: usize, count: usize) -> Self {
        Change::Invalidate(Section::new(start, count))
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, Change::Reset)
    }

    pub fn is_invalidate(&self) -> bool {
        matches!(self, Change::Invalidate(_))
    }

    /// section affected by this change, `None` for resets
    pub fn section(&self) -> Option<Section> {
        match self {
            Change::Append(section) | Change::Invalidate(section) => Some(*section),
            Change::Reset => None,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Append(s) => write!(f, "Append({}, {})", s.start, s.count),
            Change::Invalidate(s) => write!(f, "Invalidate({}, {})", s.start, s.count),
            Change::Reset => write!(f, "Reset"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_end() {
        assert_eq!(Section::new(3, 4).end(), 7);
        assert!(Section::new(3, 0).is_empty());
    }

    #[test]
    fn test_section_bounding() {
        let known = Section::new(0, 5);
        assert_eq!(known.bounding(Section::new(5, 3)), Section::new(0, 8));
        assert_eq!(known.bounding(Section::new(1, 2)), Section::new(0, 5));
    }

    #[test]
    fn test_change_display() {
        assert_eq!(Change::append(0, 2).to_string(), "Append(0, 2)");
        assert_eq!(Change::invalidate(1, 1).to_string(), "Invalidate(1, 1)");
        assert_eq!(Change::Reset.to_string(), "Reset");
    }
}
