use std::fmt;
use zon_fw_common::RuleBitmap;

/// Set of rule ids, one bit per id.
#[derive(Clone, Default)]
pub struct RuleMask {
    words: Vec<u64>,
}

impl RuleMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: u32) {
        let word = (id / 64) as usize;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1_u64 << (id % 64);
    }

    pub fn union_with(&mut self, other: &RuleMask) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (w, o) in self.words.iter_mut().zip(other.words.iter()) {
            *w |= *o;
        }
    }

    pub fn intersect_with(&mut self, other: &RuleMask) {
        for (i, w) in self.words.iter_mut().enumerate() {
            *w &= other.words.get(i).copied().unwrap_or_default();
        }
    }

    /// The lowest rule id in the set, i.e. the rule that wins.
    pub fn lowest(&self) -> Option<u32> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i as u32 * 64 + w.trailing_zeros())
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64_u32)
                .filter(move |bit| w & (1_u64 << bit) != 0)
                .map(move |bit| i as u32 * 64 + bit)
        })
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Fixed size copy used by the dataplane maps. Returns None if any id
    /// doesn't fit.
    pub fn to_bitmap(&self) -> Option<RuleBitmap> {
        let mut bitmap = RuleBitmap::empty();
        for id in self.iter() {
            if !bitmap.set(id) {
                return None;
            }
        }
        Some(bitmap)
    }
}

impl PartialEq for RuleMask {
    fn eq(&self, other: &Self) -> bool {
        let len = self.words.len().max(other.words.len());
        (0..len).all(|i| {
            self.words.get(i).copied().unwrap_or_default()
                == other.words.get(i).copied().unwrap_or_default()
        })
    }
}

impl Eq for RuleMask {}

impl FromIterator<u32> for RuleMask {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut mask = Self::new();
        for id in iter {
            mask.set(id);
        }
        mask
    }
}

impl fmt::Debug for RuleMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for RuleMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ids = self.iter().map(|id| id.to_string()).collect::<Vec<_>>();
        write!(f, "{{{}}}", ids.join(","))
    }
}
