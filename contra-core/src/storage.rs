use contra_ir::Type;
use contra_ir::ValueId;
use tracing::trace;

use crate::tasker::ResourceKind;

/// Whether a scope owes the release of the resource behind an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    Borrowed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Slot {
    Local(ValueId),
    Global(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct StorageEntry {
    pub slot: Slot,
    /// Type stored in the slot.
    pub ty: Type,
    pub ownership: Ownership,
}

impl StorageEntry {
    pub fn local(ptr: ValueId, ty: Type, ownership: Ownership) -> Self {
        Self {
            slot: Slot::Local(ptr),
            ty,
            ownership,
        }
    }
}

/// Owned resources released by a scope pop, grouped by kind in the order
/// they must be destroyed.
#[derive(Debug, Default, PartialEq)]
pub struct Teardown {
    pub arrays: Vec<Slot>,
    pub futures: Vec<Slot>,
    pub fields: Vec<Slot>,
    pub accessors: Vec<Slot>,
    pub partitions: Vec<Slot>,
    pub ranges: Vec<Slot>,
}

impl Teardown {
    pub fn len(&self) -> usize {
        self.arrays.len()
            + self.futures.len()
            + self.fields.len()
            + self.accessors.len()
            + self.partitions.len()
            + self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const TEMPORARY: &str = "__tmp";

/// Names to live storage, one frame per open scope. The outermost frame
/// holds globals and is never popped.
#[derive(Debug)]
pub struct StorageTable {
    frames: Vec<Vec<(String, StorageEntry)>>,
    next_temporary: u32,
}

impl Default for StorageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageTable {
    pub fn new() -> Self {
        Self {
            frames: vec![Vec::new()],
            next_temporary: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_scope(&mut self) {
        self.frames.push(Vec::new());
        trace!(depth = self.frames.len(), "push storage scope");
    }

    /// Removes the innermost frame and returns what it owned. `kind_of`
    /// classifies backend handles; arrays are recognized structurally.
    pub fn pop_scope(&mut self, kind_of: impl Fn(&Type) -> Option<ResourceKind>) -> Teardown {
        let mut teardown = Teardown::default();
        if self.frames.len() <= 1 {
            return teardown;
        }
        let Some(frame) = self.frames.pop() else {
            return teardown;
        };
        for (_, entry) in frame {
            if entry.ownership != Ownership::Owned {
                continue;
            }
            let group = match (&entry.ty, kind_of(&entry.ty)) {
                (Type::Array(_), _) => &mut teardown.arrays,
                (_, Some(ResourceKind::Future)) => &mut teardown.futures,
                (_, Some(ResourceKind::Field)) => &mut teardown.fields,
                (_, Some(ResourceKind::Accessor)) => &mut teardown.accessors,
                (_, Some(ResourceKind::Partition)) => &mut teardown.partitions,
                (_, Some(ResourceKind::Range)) => &mut teardown.ranges,
                (_, None) => continue,
            };
            group.push(entry.slot);
        }
        trace!(depth = self.frames.len(), released = teardown.len(), "pop storage scope");
        teardown
    }

    /// Pops every frame above `depth` without releasing anything.
    pub fn unwind_to(&mut self, depth: usize) {
        self.frames.truncate(depth.max(1));
    }

    pub fn insert(&mut self, name: &str, entry: StorageEntry) {
        if let Some(frame) = self.frames.last_mut() {
            frame.retain(|(n, _)| n != name);
            trace!(name, ownership = ?entry.ownership, "insert storage");
            frame.push((name.to_string(), entry));
        }
    }

    pub fn insert_global(&mut self, name: &str, ty: Type) {
        if let Some(frame) = self.frames.first_mut() {
            frame.retain(|(n, _)| n != name);
            frame.push((
                name.to_string(),
                StorageEntry {
                    slot: Slot::Global(name.to_string()),
                    ty,
                    ownership: Ownership::Owned,
                },
            ));
        }
    }

    /// Registers an owned temporary in the innermost scope and returns its name.
    pub fn insert_temporary(&mut self, ptr: ValueId, ty: Type) -> String {
        let name = format!("{TEMPORARY}{}", self.next_temporary);
        self.next_temporary += 1;
        self.insert(&name, StorageEntry::local(ptr, ty, Ownership::Owned));
        name
    }

    pub fn get(&self, name: &str) -> Option<&StorageEntry> {
        self.frames
            .iter()
            .rev()
            .find_map(|f| f.iter().rev().find(|(n, _)| n == name).map(|(_, e)| e))
    }

    /// Marks a variable as not owning its storage.
    pub fn demote(&mut self, name: &str) {
        for frame in self.frames.iter_mut().rev() {
            if let Some((_, entry)) = frame.iter_mut().find(|(n, _)| n == name) {
                entry.ownership = Ownership::Borrowed;
                return;
            }
        }
    }

    pub fn is_temporary(&self, ptr: ValueId) -> bool {
        self.frames.iter().flatten().any(|(n, e)| {
            n.starts_with(TEMPORARY) && e.slot == Slot::Local(ptr) && e.ownership == Ownership::Owned
        })
    }

    /// Removes an owned temporary so that a declaration can adopt it.
    pub fn take_temporary(&mut self, ptr: ValueId) -> Option<StorageEntry> {
        for frame in self.frames.iter_mut().rev() {
            let pos = frame.iter().position(|(n, e)| {
                n.starts_with(TEMPORARY)
                    && e.slot == Slot::Local(ptr)
                    && e.ownership == Ownership::Owned
            });
            if let Some(pos) = pos {
                let (_, entry) = frame.remove(pos);
                return Some(entry);
            }
        }
        None
    }

    /// Drops ownership of whatever entry holds `ptr`; the resource now
    /// belongs to someone else.
    pub fn release_slot(&mut self, ptr: ValueId) -> bool {
        for frame in self.frames.iter_mut().rev() {
            if let Some((_, entry)) = frame.iter_mut().find(|(_, e)| e.slot == Slot::Local(ptr)) {
                entry.ownership = Ownership::Borrowed;
                return true;
            }
        }
        false
    }
}
