//! Per-instance handle tables.
//!
//! One unified table per component instance holds every kind of table-backed
//! entity: resource handles, subtasks, stream and future ends, waitable
//! sets, and error contexts. Index 0 is reserved; freed slots are recycled
//! from a free list, most recently freed first.

use crate::resources::ResourceHandle;
use crate::streams::{FutureEndData, StreamEndData};
use crate::task::SubtaskData;
use crate::trap::{trap_if, Trap};
use crate::waitable::WaitableSetData;
use anyhow::Result;
use std::rc::Rc;

pub(crate) const MAX_TABLE_LENGTH: usize = 1 << 28;

pub(crate) enum TableEntry {
    Resource(ResourceHandle),
    Subtask(SubtaskData),
    StreamEnd(StreamEndData),
    FutureEnd(FutureEndData),
    WaitableSet(WaitableSetData),
    ErrorContext(ErrorContextData),
}

pub(crate) struct ErrorContextData {
    pub message: Rc<str>,
}

pub(crate) struct Table {
    entries: Vec<Option<TableEntry>>,
    free: Vec<u32>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            entries: vec![None],
            free: Vec::new(),
        }
    }

    pub fn add(&mut self, entry: TableEntry) -> Result<u32> {
        if let Some(i) = self.free.pop() {
            debug_assert!(self.entries[i as usize].is_none());
            self.entries[i as usize] = Some(entry);
            return Ok(i);
        }
        trap_if!(self.entries.len() >= MAX_TABLE_LENGTH, Trap::TableFull);
        let i = self.entries.len() as u32;
        self.entries.push(Some(entry));
        Ok(i)
    }

    pub fn get(&self, i: u32) -> Result<&TableEntry> {
        match self.entries.get(i as usize) {
            Some(Some(e)) if i != 0 => Ok(e),
            _ => Err(Trap::UnknownHandleIndex.err()),
        }
    }

    pub fn get_mut(&mut self, i: u32) -> Result<&mut TableEntry> {
        match self.entries.get_mut(i as usize) {
            Some(Some(_)) if i != 0 => Ok(self.entries[i as usize].as_mut().unwrap()),
            _ => Err(Trap::UnknownHandleIndex.err()),
        }
    }

    pub fn remove(&mut self, i: u32) -> Result<TableEntry> {
        match self.entries.get_mut(i as usize) {
            Some(slot @ Some(_)) if i != 0 => {
                let e = slot.take().unwrap();
                self.free.push(i);
                Ok(e)
            }
            _ => Err(Trap::UnknownHandleIndex.err()),
        }
    }

    /// Iterates occupied slots; used for instance teardown and diagnostics.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &TableEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| Some((i as u32, e.as_ref()?)))
    }

    #[cfg(test)]
    pub fn occupied(&self) -> usize {
        self.iter().count()
    }

    /// Raw slot count including the reserved zero slot, matching what guest
    /// code can observe through index probing.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}
