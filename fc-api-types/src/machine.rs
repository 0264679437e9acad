use std::fmt;
use std::sync::Arc;

/// Small integer index into the cluster roster.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct MachineId(pub u32);

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineId({})", self.0)
    }
}

/// An ordered, immutable set of [`MachineId`]s.
///
/// Implemented as a persistent bitset: `set_existence` never mutates the
/// receiver, it returns a new value sharing the old backing storage where
/// unchanged. This gives lock-free reads of any `ContentLocationEntry`
/// snapshot handed out by the CLDB, since no caller can ever observe a
/// `MachineIdSet` partially updated by another thread (Design Note
/// "Persistent MachineIdSet").
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MachineIdSet {
    words: Arc<[u64]>,
}

impl MachineIdSet {
    pub fn empty() -> Self {
        Self { words: Arc::from(Vec::<u64>::new()) }
    }

    pub fn from_ids(ids: impl IntoIterator<Item = MachineId>) -> Self {
        let mut set = Self::empty();
        for id in ids {
            set = set.set_existence(id, true);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn contains(&self, id: MachineId) -> bool {
        let (word, bit) = Self::coords(id);
        self.words.get(word).map(|w| w & (1 << bit) != 0).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = MachineId> + '_ {
        self.words.iter().enumerate().flat_map(|(word_idx, word)| {
            (0..64).filter_map(move |bit| {
                if word & (1 << bit) != 0 {
                    Some(MachineId((word_idx * 64 + bit) as u32))
                } else {
                    None
                }
            })
        })
    }

    /// Returns a new set with `id` present or absent, per `exists`.
    /// Does not mutate `self`.
    #[must_use]
    pub fn set_existence(&self, id: MachineId, exists: bool) -> Self {
        let (word, bit) = Self::coords(id);
        let needed_len = word + 1;
        let mut words: Vec<u64> = if self.words.len() >= needed_len {
            self.words.to_vec()
        } else {
            let mut v = self.words.to_vec();
            v.resize(needed_len, 0);
            v
        };
        if exists {
            words[word] |= 1 << bit;
        } else if word < words.len() {
            words[word] &= !(1 << bit);
        }
        Self { words: Arc::from(words) }
    }

    /// Returns a new set with inactive machines (per `is_active`) filtered
    /// out, along with whether anything was actually removed.
    #[must_use]
    pub fn retain_active(&self, mut is_active: impl FnMut(MachineId) -> bool) -> (Self, bool) {
        let mut changed = false;
        let mut result = self.clone();
        for id in self.iter() {
            if !is_active(id) {
                result = result.set_existence(id, false);
                changed = true;
            }
        }
        (result, changed)
    }

    fn coords(id: MachineId) -> (usize, usize) {
        ((id.0 / 64) as usize, (id.0 % 64) as usize)
    }
}

impl fmt::Debug for MachineIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl Default for MachineIdSet {
    fn default() -> Self {
        Self::empty()
    }
}
