//! Index-linked circular free list.
//!
//! The list is intrusive: its links live in the [`PageDescriptor`]s it threads, and refer to
//! other descriptors by their index in the table. Nodes are never owned by the list, which only
//! remembers its head. An empty list has no head, which is distinct from a one-node list whose
//! node links to itself.
//!
//! All operations are `O(1)`, except for [`FreeList::len`] and [`count_from`], which walk the
//! list and are meant for diagnostics and assertions only.

use crate::page::{PageDescriptor, NIL};

/// Previous/next links of a descriptor on a free list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Link {
    pub(crate) prev: u32,
    pub(crate) next: u32,
}

impl Link {
    /// Links of a descriptor which is not on any list.
    pub(crate) const UNLINKED: Self = Self {
        prev: NIL,
        next: NIL,
    };

    const fn to_self(idx: u32) -> Self {
        Self {
            prev: idx,
            next: idx,
        }
    }
}

/// A circular doubly-linked list of page descriptors.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<u32>,
}

impl FreeList {
    /// Creates an empty list.
    pub(crate) const fn new() -> Self {
        Self { head: None }
    }

    /// Returns the index of the first node, if any.
    pub(crate) const fn head(&self) -> Option<u32> {
        self.head
    }

    /// Returns `true` if the list has no nodes.
    pub(crate) const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Makes `idx` the new head of the list, preserving the circular order.
    ///
    /// `idx` must be a node of this list.
    pub(crate) fn rotate_to(&mut self, idx: u32) {
        debug_assert!(!self.is_empty());
        self.head = Some(idx);
    }

    /// Inserts node `idx` before the head, i.e. at the tail of the list.
    pub(crate) fn push_back(&mut self, table: &mut [PageDescriptor], idx: u32) {
        match self.head {
            None => {
                table[idx as usize].link = Link::to_self(idx);
                self.head = Some(idx);
            }
            Some(head) => {
                let tail = table[head as usize].link.prev;

                table[idx as usize].link = Link {
                    prev: tail,
                    next: head,
                };
                table[tail as usize].link.next = idx;
                table[head as usize].link.prev = idx;
            }
        }
    }

    /// Unlinks node `idx` from the list, leaving its neighbors linked to each other.
    ///
    /// If `idx` was the head, its successor becomes the new head.
    pub(crate) fn remove(&mut self, table: &mut [PageDescriptor], idx: u32) {
        let Link { prev, next } = table[idx as usize].link;

        if next == idx {
            // Last node standing.
            self.head = None;
        } else {
            table[prev as usize].link.next = next;
            table[next as usize].link.prev = prev;

            if self.head == Some(idx) {
                self.head = Some(next);
            }
        }

        table[idx as usize].link = Link::UNLINKED;
    }

    /// Removes the head of the list and returns its index.
    pub(crate) fn pop_front(&mut self, table: &mut [PageDescriptor]) -> Option<u32> {
        let head = self.head?;
        self.remove(table, head);
        Some(head)
    }

    /// Moves all nodes of `other` to the tail of this list, leaving `other` empty.
    pub(crate) fn append(&mut self, table: &mut [PageDescriptor], other: &mut FreeList) {
        let Some(first) = other.head.take() else {
            return;
        };

        let Some(head) = self.head else {
            self.head = Some(first);
            return;
        };

        let tail = table[head as usize].link.prev;
        let last = table[first as usize].link.prev;

        table[tail as usize].link.next = first;
        table[first as usize].link.prev = tail;
        table[last as usize].link.next = head;
        table[head as usize].link.prev = last;
    }

    /// Returns the number of nodes in the list.
    pub(crate) fn len(&self, table: &[PageDescriptor]) -> usize {
        self.head.map_or(0, |head| count_from(table, head))
    }

    /// Returns an iterator over the node indices, starting from the head.
    pub(crate) fn iter<'a>(&self, table: &'a [PageDescriptor]) -> Iter<'a> {
        Iter {
            table,
            start: self.head.unwrap_or(NIL),
            next: self.head,
        }
    }
}

/// Counts the nodes of the list containing `start` by walking forward until `start` is reached
/// again.
///
/// The walk gives up after visiting more nodes than the table holds, which can only happen on a
/// corrupted list; the returned count then exceeds `table.len()`.
pub(crate) fn count_from(table: &[PageDescriptor], start: u32) -> usize {
    let mut count = 1;
    let mut idx = table[start as usize].link.next;

    while idx != start {
        if count > table.len() {
            break;
        }
        count += 1;
        idx = table[idx as usize].link.next;
    }

    count
}

/// Iterator over the nodes of a [`FreeList`].
#[derive(Debug)]
pub(crate) struct Iter<'a> {
    table: &'a [PageDescriptor],
    start: u32,
    next: Option<u32>,
}

impl Iterator for Iter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let idx = self.next?;
        let next = self.table[idx as usize].link.next;

        self.next = if next == self.start { None } else { Some(next) };
        Some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{addr::Addr, PAGE_SIZE};

    fn table(n: usize) -> Vec<PageDescriptor> {
        (0..n)
            .map(|i| PageDescriptor::new(Addr::new(i * PAGE_SIZE)))
            .collect()
    }

    fn list_of(table: &mut [PageDescriptor], nodes: &[u32]) -> FreeList {
        let mut list = FreeList::new();
        for &idx in nodes {
            list.push_back(table, idx);
        }
        list
    }

    fn assert_consistent(table: &[PageDescriptor], list: &FreeList) {
        for idx in list.iter(table) {
            let Link { prev, next } = table[idx as usize].link;
            assert_eq!(table[prev as usize].link.next, idx);
            assert_eq!(table[next as usize].link.prev, idx);
        }
    }

    #[test]
    fn empty_list() {
        let table = table(4);
        let list = FreeList::new();

        assert!(list.is_empty());
        assert_eq!(list.head(), None);
        assert_eq!(list.len(&table), 0);
        assert_eq!(list.iter(&table).count(), 0);
    }

    #[test]
    fn single_node_links_to_itself() {
        let mut table = table(4);
        let list = list_of(&mut table, &[2]);

        assert!(!list.is_empty());
        assert_eq!(list.head(), Some(2));
        assert_eq!(table[2].link, Link::to_self(2));
        assert_eq!(list.len(&table), 1);
    }

    #[test]
    fn push_back_keeps_insertion_order() {
        let mut table = table(8);
        let list = list_of(&mut table, &[5, 1, 7, 3]);

        assert_eq!(list.iter(&table).collect::<Vec<_>>(), [5, 1, 7, 3]);
        assert_eq!(list.len(&table), 4);
        assert_eq!(count_from(&table, 7), 4);
        assert_consistent(&table, &list);
    }

    #[test]
    fn remove_nodes() {
        let mut table = table(8);
        let mut list = list_of(&mut table, &[0, 1, 2, 3]);

        // Middle node
        list.remove(&mut table, 2);
        assert_eq!(list.iter(&table).collect::<Vec<_>>(), [0, 1, 3]);
        assert_eq!(table[2].link, Link::UNLINKED);
        assert_consistent(&table, &list);

        // Head node
        list.remove(&mut table, 0);
        assert_eq!(list.head(), Some(1));
        assert_eq!(list.iter(&table).collect::<Vec<_>>(), [1, 3]);

        // Tail node
        list.remove(&mut table, 3);
        assert_eq!(list.iter(&table).collect::<Vec<_>>(), [1]);

        // Last node
        list.remove(&mut table, 1);
        assert!(list.is_empty());
    }

    #[test]
    fn pop_front() {
        let mut table = table(4);
        let mut list = list_of(&mut table, &[3, 0]);

        assert_eq!(list.pop_front(&mut table), Some(3));
        assert_eq!(list.pop_front(&mut table), Some(0));
        assert_eq!(list.pop_front(&mut table), None);
    }

    #[test]
    fn rotate() {
        let mut table = table(4);
        let mut list = list_of(&mut table, &[0, 1, 2, 3]);

        list.rotate_to(2);
        assert_eq!(list.iter(&table).collect::<Vec<_>>(), [2, 3, 0, 1]);
        assert_eq!(list.pop_front(&mut table), Some(2));
        assert_eq!(list.iter(&table).collect::<Vec<_>>(), [3, 0, 1]);
    }

    #[test]
    fn append_lists() {
        let mut table = table(8);
        let mut list = list_of(&mut table, &[0, 4]);
        let mut other = list_of(&mut table, &[6, 2, 5]);

        list.append(&mut table, &mut other);
        assert!(other.is_empty());
        assert_eq!(list.iter(&table).collect::<Vec<_>>(), [0, 4, 6, 2, 5]);
        assert_consistent(&table, &list);

        // Appending an empty list is a no-op
        list.append(&mut table, &mut FreeList::new());
        assert_eq!(list.len(&table), 5);

        // Appending to an empty list adopts the other list
        let mut empty = FreeList::new();
        let mut other = list_of(&mut table, &[1, 3]);
        empty.append(&mut table, &mut other);
        assert_eq!(empty.iter(&table).collect::<Vec<_>>(), [1, 3]);
        assert_consistent(&table, &empty);
    }

    #[test]
    fn corrupted_list_count_terminates() {
        let mut table = table(4);
        let _ = list_of(&mut table, &[0, 1, 2]);

        // Node 3 points into a cycle that never returns to it.
        table[3].link = Link { prev: 2, next: 0 };

        assert!(count_from(&table, 3) > table.len());
    }
}
