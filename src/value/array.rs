// Array: dense ordered sequence. Each slot carries a modified flag so the
// GC's re-scan after a write barrier only visits changed slots.

use crate::value::Value;

#[derive(Clone, Copy, Default)]
pub struct ArraySlot {
    pub value: Value,
    pub modified: bool,
}

pub struct CrocArray {
    slots: Vec<ArraySlot>,
}

impl CrocArray {
    pub fn new(len: usize) -> Self {
        CrocArray {
            slots: vec![ArraySlot::default(); len],
        }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        CrocArray {
            slots: values
                .into_iter()
                .map(|value| ArraySlot { value, modified: false })
                .collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.slots.get(index).map(|s| s.value)
    }

    /// Store and flag the slot for barrier re-scan.
    #[inline]
    pub fn set(&mut self, index: usize, value: Value) -> bool {
        match self.slots.get_mut(index) {
            Some(slot) => {
                slot.value = value;
                slot.modified = true;
                true
            }
            None => false,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.slots.push(ArraySlot { value, modified: true });
    }

    pub fn resize(&mut self, new_len: usize) {
        self.slots.resize(new_len, ArraySlot::default());
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.slots.iter().map(|s| s.value)
    }

    /// Values of slots flagged modified since the last scan, clearing the
    /// flags as it goes.
    pub fn take_modified(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            if slot.modified {
                slot.modified = false;
                out.push(slot.value);
            }
        }
        out
    }

    pub fn clear_modified(&mut self) {
        for slot in &mut self.slots {
            slot.modified = false;
        }
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.slots.iter().any(|s| s.value.raw_equal(value))
    }
}
