use alloc::{boxed::Box, vec};

const WORD_BITS: usize = u64::BITS as usize;

/// A fixed-length array of bits, used to track free slots.
#[derive(Clone, Debug)]
pub struct Bitmap {
    words: Box<[u64]>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all cleared.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)].into_boxed_slice(),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        self.words[idx / WORD_BITS] & (1 << (idx % WORD_BITS)) != 0
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        let mask = 1 << (idx % WORD_BITS);
        if value {
            self.words[idx / WORD_BITS] |= mask;
        } else {
            self.words[idx / WORD_BITS] &= !mask;
        }
    }

    /// Finds the first cleared bit, sets it, and returns its index.
    pub fn scan_and_flip(&mut self) -> Option<usize> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let idx = i * WORD_BITS + word.trailing_ones() as usize;
            if idx >= self.len {
                return None;
            }
            *word |= 1 << (idx % WORD_BITS);
            return Some(idx);
        }
        None
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}
