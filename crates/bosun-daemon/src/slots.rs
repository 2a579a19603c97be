//! Slot counter: bounded global parallelism plus per-base-branch sub-limits.
//! Mutations are atomic under a single lock, matching the concurrency
//! model's requirement that slot counter mutations and base-branch
//! sub-counts update together.

use std::collections::HashMap;
use std::sync::Mutex;

pub struct SlotManager {
    max_parallel: u32,
    base_branch_limit: u32,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    in_use: u32,
    per_base_branch: HashMap<String, u32>,
}

pub struct SlotGuard<'a> {
    manager: &'a SlotManager,
    base_branch: String,
    released: bool,
}

impl SlotGuard<'_> {
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        let mut inner = self.manager.inner.lock().unwrap();
        inner.in_use = inner.in_use.saturating_sub(1);
        if let Some(count) = inner.per_base_branch.get_mut(&self.base_branch) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.per_base_branch.remove(&self.base_branch);
            }
        }
        self.released = true;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

impl SlotManager {
    pub fn new(max_parallel: u32, base_branch_limit: u32) -> Self {
        Self { max_parallel, base_branch_limit, inner: Mutex::new(Inner::default()) }
    }

    /// Attempts to reserve a slot for `base_branch`. Returns `None` if no
    /// slot (or base-branch sub-slot) is free.
    pub fn try_acquire(&self, base_branch: &str) -> Option<SlotGuard<'_>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_use >= self.max_parallel {
            return None;
        }
        if self.base_branch_limit > 0 {
            let current = *inner.per_base_branch.get(base_branch).unwrap_or(&0);
            if current >= self.base_branch_limit {
                return None;
            }
        }
        inner.in_use += 1;
        *inner.per_base_branch.entry(base_branch.to_string()).or_insert(0) += 1;
        Some(SlotGuard { manager: self, base_branch: base_branch.to_string(), released: false })
    }

    pub fn in_use(&self) -> u32 {
        self.inner.lock().unwrap().in_use
    }
}
