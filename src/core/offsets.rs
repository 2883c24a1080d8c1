//! Prefix-sum assignment of global column and row ranges.
//!
//! The table is computed once per step by the coordinating system, after every
//! container has reported its counts, and handed to each container read-only.

use std::ops::Range;

/// Counts a container reports before offsets are assigned.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerCounts {
    pub num_dofs: usize,
    pub num_rows: usize,
}

/// Global placement of one container for the current step.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerOffsets {
    pub dof_start: usize,
    pub num_dofs: usize,
    pub row_start: usize,
    pub num_rows: usize,
}

impl ContainerOffsets {
    #[inline]
    pub fn dofs(&self) -> Range<usize> {
        self.dof_start..self.dof_start + self.num_dofs
    }

    #[inline]
    pub fn rows(&self) -> Range<usize> {
        self.row_start..self.row_start + self.num_rows
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OffsetTable {
    rigid_dofs: usize,
    entries: Vec<ContainerOffsets>,
    total_dofs: usize,
    total_rows: usize,
}

impl OffsetTable {
    /// Lays containers out after `rigid_dofs` body columns, in the order given.
    pub fn build(rigid_dofs: usize, counts: impl IntoIterator<Item = ContainerCounts>) -> Self {
        let mut dof_cursor = rigid_dofs;
        let mut row_cursor = 0;
        let entries = counts
            .into_iter()
            .map(|c| {
                let offsets = ContainerOffsets {
                    dof_start: dof_cursor,
                    num_dofs: c.num_dofs,
                    row_start: row_cursor,
                    num_rows: c.num_rows,
                };
                dof_cursor += c.num_dofs;
                row_cursor += c.num_rows;
                offsets
            })
            .collect();

        Self {
            rigid_dofs,
            entries,
            total_dofs: dof_cursor,
            total_rows: row_cursor,
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&ContainerOffsets> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ContainerOffsets> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn rigid_dofs(&self) -> usize {
        self.rigid_dofs
    }

    pub fn total_dofs(&self) -> usize {
        self.total_dofs
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_are_contiguous_and_disjoint() {
        let counts = [
            ContainerCounts { num_dofs: 9, num_rows: 4 },
            ContainerCounts { num_dofs: 0, num_rows: 0 },
            ContainerCounts { num_dofs: 6, num_rows: 7 },
        ];
        let table = OffsetTable::build(12, counts);

        assert_eq!(table.total_dofs(), 12 + 15);
        assert_eq!(table.total_rows(), 11);

        let mut next_row = 0;
        let mut next_dof = 12;
        for entry in table.iter() {
            assert_eq!(entry.row_start, next_row);
            assert_eq!(entry.dof_start, next_dof);
            next_row = entry.rows().end;
            next_dof = entry.dofs().end;
        }
        assert_eq!(table.get(2).map(|e| e.rows()), Some(4..11));
    }
}
