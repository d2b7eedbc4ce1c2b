// Memblock: raw byte buffer, either owned by the VM or a borrowed snapshot
// of host data. Only owned memblocks may be resized or serialized.

pub struct CrocMemblock {
    data: Vec<u8>,
    owned: bool,
}

impl CrocMemblock {
    pub fn new(len: usize) -> Self {
        CrocMemblock {
            data: vec![0; len],
            owned: true,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        CrocMemblock { data, owned: true }
    }

    /// View over host-provided bytes. The VM copies the bytes but does not
    /// treat them as its own: the block refuses resizing and serialization.
    pub fn view(data: &[u8]) -> Self {
        CrocMemblock {
            data: data.to_vec(),
            owned: false,
        }
    }

    #[inline]
    pub fn owns_data(&self) -> bool {
        self.owned
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<u8> {
        self.data.get(index).copied()
    }

    #[inline]
    pub fn set(&mut self, index: usize, byte: u8) -> bool {
        match self.data.get_mut(index) {
            Some(b) => {
                *b = byte;
                true
            }
            None => false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Resizing is only legal on owned blocks.
    pub fn resize(&mut self, new_len: usize) -> bool {
        if !self.owned {
            return false;
        }
        self.data.resize(new_len, 0);
        true
    }
}
