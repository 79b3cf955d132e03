//! Connection table: a generation-tagged slab holding live connections,
//! threaded through an intrusive doubly-linked list ordered by last
//! activity so `touch` and `reap` are both O(1).
//!
//! Grounded on the original C `client` list (`add_client`/`delete_client`/
//! `check_timeout`/`reinsert_client`): append at the tail on `add`, "touch"
//! moves an entry to the tail, and `reap` only ever needs to look at the
//! head, since the list stays ordered by last-activity.

use std::time::Instant;

/// A stable, generation-checked reference to a slot in the arena. Safe to
/// hold across ticks (e.g. from a CGI pipe back to its host connection)
/// without risking use of a slot that has since been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u64,
}

struct Slot<T> {
    generation: u64,
    entry: Option<Entry<T>>,
}

struct Entry<T> {
    value: T,
    last_activity: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Generation-tagged slab plus an activity-ordered intrusive list.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>, // least-recently touched
    tail: Option<usize>, // most-recently touched
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new value, appending it at the tail of the activity list.
    pub fn add(&mut self, value: T, now: Instant) -> Handle {
        let entry = Entry {
            value,
            last_activity: now,
            prev: self.tail,
            next: None,
        };

        let index = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.entry = Some(entry);
            index
        } else {
            let index = self.slots.len();
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            index
        };

        if let Some(tail) = self.tail {
            self.slots[tail].entry.as_mut().unwrap().next = Some(index);
        } else {
            self.head = Some(index);
        }
        self.tail = Some(index);

        Handle {
            index,
            generation: self.slots[index].generation,
        }
    }

    fn valid(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index)
            .map(|slot| slot.generation == handle.generation && slot.entry.is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        if !self.valid(handle) {
            return None;
        }
        self.slots[handle.index].entry.as_ref().map(|e| &e.value)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        if !self.valid(handle) {
            return None;
        }
        self.slots[handle.index].entry.as_mut().map(|e| &mut e.value)
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let entry = self.slots[index].entry.as_ref().unwrap();
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.slots[p].entry.as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].entry.as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn link_at_tail(&mut self, index: usize) {
        let old_tail = self.tail;
        {
            let entry = self.slots[index].entry.as_mut().unwrap();
            entry.prev = old_tail;
            entry.next = None;
        }
        if let Some(tail) = old_tail {
            self.slots[tail].entry.as_mut().unwrap().next = Some(index);
        } else {
            self.head = Some(index);
        }
        self.tail = Some(index);
    }

    /// Mark a connection as having just done I/O: move it to the tail of
    /// the activity list so it is the last candidate `reap` considers.
    pub fn touch(&mut self, handle: Handle, now: Instant) {
        if !self.valid(handle) {
            return;
        }
        self.unlink(handle.index);
        self.link_at_tail(handle.index);
        self.slots[handle.index].entry.as_mut().unwrap().last_activity = now;
    }

    /// Remove a connection from the arena and return its value.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if !self.valid(handle) {
            return None;
        }
        self.unlink(handle.index);
        let slot = &mut self.slots[handle.index];
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        entry.map(|e| e.value)
    }

    /// If the least-recently-touched connection has been idle longer than
    /// `timeout` as of `now`, remove and return it (its handle and value).
    /// Only ever inspects the head, matching the original's
    /// `check_timeout`, since the list stays ordered by activity.
    pub fn reap(&mut self, now: Instant, timeout: std::time::Duration) -> Option<(Handle, T)> {
        let head = self.head?;
        let last_activity = self.slots[head].entry.as_ref().unwrap().last_activity;
        if now.duration_since(last_activity) <= timeout {
            return None;
        }
        let handle = Handle {
            index: head,
            generation: self.slots[head].generation,
        };
        let value = self.remove(handle)?;
        Some((handle, value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|e| {
                (
                    Handle {
                        index,
                        generation: slot.generation,
                    },
                    &e.value,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn reap_only_considers_head_and_respects_touch_order() {
        let mut arena: Arena<&'static str> = Arena::new();
        let t0 = Instant::now();
        let a = arena.add("a", t0);
        let _b = arena.add("b", t0 + Duration::from_secs(1));

        // Neither is stale yet.
        assert!(arena.reap(t0 + Duration::from_secs(2), Duration::from_secs(10)).is_none());

        // `a` goes stale first since it was added first and never touched.
        let later = t0 + Duration::from_secs(11);
        let (handle, value) = arena.reap(later, Duration::from_secs(10)).unwrap();
        assert_eq!(handle, a);
        assert_eq!(value, "a");

        // `b` is still fresh relative to its own insertion time.
        assert!(arena.reap(later, Duration::from_secs(10)).is_none());
    }

    #[test]
    fn touch_moves_entry_to_tail_delaying_its_reap() {
        let mut arena: Arena<&'static str> = Arena::new();
        let t0 = Instant::now();
        let a = arena.add("a", t0);
        let _b = arena.add("b", t0);

        arena.touch(a, t0 + Duration::from_secs(5));

        // `b` is now the least-recently touched and reaps first.
        let (handle, value) = arena
            .reap(t0 + Duration::from_secs(11), Duration::from_secs(10))
            .unwrap();
        assert_eq!(value, "b");
        assert_ne!(handle, a);
    }

    #[test]
    fn stale_handle_after_removal_is_rejected() {
        let mut arena: Arena<&'static str> = Arena::new();
        let t0 = Instant::now();
        let a = arena.add("a", t0);
        arena.remove(a);
        assert!(arena.get(a).is_none());

        let b = arena.add("b", t0);
        // `b` may reuse `a`'s slot index, but its generation differs.
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
    }
}
