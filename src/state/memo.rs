use std::collections::HashMap;
use std::collections::hash_map::Entry;

/// Set-once record of what the first pass decided for each frame.
#[derive(Debug)]
pub struct FrameMemo<F> {
    frames: HashMap<u64, F>,
}

/// A frame was recorded twice: some decoder ran its first pass over an already
/// visited frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyRecorded(pub u64);

impl<F> Default for FrameMemo<F> {
    fn default() -> Self {
        Self {
            frames: HashMap::new(),
        }
    }
}

impl<F> FrameMemo<F> {
    pub fn record(&mut self, frame: u64, facts: F) -> Result<(), AlreadyRecorded> {
        match self.frames.entry(frame) {
            Entry::Occupied(_) => Err(AlreadyRecorded(frame)),
            Entry::Vacant(slot) => {
                slot.insert(facts);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, frame: u64) -> Option<&F> {
        self.frames.get(&frame)
    }

    pub fn contains(&self, frame: u64) -> bool {
        self.frames.contains_key(&frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}
