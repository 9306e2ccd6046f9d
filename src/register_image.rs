use crate::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq)]
struct ImageBlock {
    start: u16,
    words: Vec<u16>,
}

/// One complete set of encoded register words. Never mutated once built; the
/// refresh engine replaces the whole image on publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterImage {
    blocks: Vec<ImageBlock>,
}

impl RegisterImage {
    /// Every register at its encoded default; the boot-time image.
    pub fn defaults(map: &RegisterMap) -> Self {
        Self::from_values(map, |d| d.default)
    }

    /// Encodes `value_of(descriptor)` for every descriptor in `map`. Gap words
    /// inside a block stay 0.
    pub fn from_values<F>(map: &RegisterMap, value_of: F) -> Self
    where
        F: Fn(&RegisterDescriptor) -> f64,
    {
        let mut blocks: Vec<ImageBlock> = map
            .blocks()
            .iter()
            .map(|b| ImageBlock {
                start: b.start,
                words: vec![0; b.len as usize],
            })
            .collect();

        for descriptor in map.iter() {
            let words = descriptor.encode(value_of(descriptor));
            // RegisterMap guarantees every descriptor lies in exactly one block
            if let Some(block) = blocks.iter_mut().find(|b| b.covers(descriptor)) {
                let offset = (descriptor.address - block.start) as usize;
                block.words[offset..offset + words.len()].copy_from_slice(&words);
            }
        }

        Self { blocks }
    }

    /// `count` words starting at `address`; the range must sit inside a single
    /// block.
    pub fn read(&self, address: u16, count: u16) -> Result<Vec<u16>, MeterError> {
        let end = address as u32 + count as u32;

        self.blocks
            .iter()
            .find(|b| count > 0 && address >= b.start && end <= b.end())
            .map(|b| {
                let offset = (address - b.start) as usize;
                b.words[offset..offset + count as usize].to_vec()
            })
            .ok_or(MeterError::NoSuchAddress { address, count })
    }

    pub fn words(&self, descriptor: &RegisterDescriptor) -> Result<Vec<u16>, MeterError> {
        self.read(descriptor.address, descriptor.width as u16)
    }

    /// Decoded physical value of `descriptor`, for display only.
    pub fn value(&self, descriptor: &RegisterDescriptor) -> Result<f64, MeterError> {
        Ok(descriptor.decode(&self.words(descriptor)?))
    }

    pub fn word_count(&self) -> usize {
        self.blocks.iter().map(|b| b.words.len()).sum()
    }
}

impl ImageBlock {
    fn end(&self) -> u32 {
        self.start as u32 + self.words.len() as u32
    }

    fn covers(&self, descriptor: &RegisterDescriptor) -> bool {
        descriptor.address >= self.start && descriptor.end() <= self.end()
    }
}
