//! Dense bump arenas backing the IR
//!
//! Storage is reserved up front and grows only by appending, so every
//! element keeps its index for the lifetime of the translation unit.

/// Append-only arena with a fixed reserved backing.
#[derive(Debug)]
pub struct Arena<T> {
    items: Vec<T>,
    backing: usize,
}

impl<T> Arena<T> {
    /// Create an arena whose backing holds `backing` elements.
    pub fn with_backing(backing: usize) -> Self {
        Arena {
            items: Vec::with_capacity(backing),
            backing,
        }
    }

    /// Append an element and return its dense index.
    pub fn allocate(&mut self, item: T) -> u32 {
        let idx = self.items.len() as u32;
        self.items.push(item);
        idx
    }

    pub fn get(&self, idx: u32) -> &T {
        &self.items[idx as usize]
    }

    pub fn get_mut(&mut self, idx: u32) -> &mut T {
        &mut self.items[idx as usize]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of elements the backing was reserved for.
    pub fn backing_size(&self) -> usize {
        self.backing
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Rewind to empty without releasing the backing.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> Arena<T> {
    /// Rewind this arena and copy `other`'s contents into it.
    ///
    /// Copying from an arena holding more elements than this arena's
    /// backing is a programmer error and aborts.
    pub fn copy_data(&mut self, other: &Arena<T>) {
        assert!(
            other.items.len() <= self.backing,
            "arena copy source ({} elements) exceeds destination backing ({})",
            other.items.len(),
            self.backing
        );
        self.items.clear();
        self.items.extend_from_slice(&other.items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_returns_dense_indices() {
        let mut arena: Arena<u64> = Arena::with_backing(16);
        assert_eq!(arena.allocate(10), 0);
        assert_eq!(arena.allocate(20), 1);
        assert_eq!(arena.allocate(30), 2);
        assert_eq!(*arena.get(1), 20);
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn test_clear_keeps_backing() {
        let mut arena: Arena<u8> = Arena::with_backing(8);
        arena.allocate(1);
        arena.allocate(2);
        arena.clear();
        assert!(arena.is_empty());
        assert_eq!(arena.backing_size(), 8);
        assert_eq!(arena.allocate(3), 0);
    }

    #[test]
    fn test_copy_data_rewinds_destination() {
        let mut src: Arena<u32> = Arena::with_backing(8);
        src.allocate(7);
        src.allocate(9);

        let mut dst: Arena<u32> = Arena::with_backing(8);
        dst.allocate(1);
        dst.allocate(2);
        dst.allocate(3);

        dst.copy_data(&src);
        assert_eq!(dst.len(), 2);
        assert_eq!(*dst.get(0), 7);
        assert_eq!(*dst.get(1), 9);
    }

    #[test]
    #[should_panic(expected = "exceeds destination backing")]
    fn test_copy_into_smaller_backing_aborts() {
        let mut src: Arena<u32> = Arena::with_backing(8);
        for i in 0..5 {
            src.allocate(i);
        }
        let mut dst: Arena<u32> = Arena::with_backing(4);
        dst.copy_data(&src);
    }
}
