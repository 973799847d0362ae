//! Index-stable arena with generation-checked keys
//!
//! A removed slot bumps its generation, so a stale [`ArenaKey`] never
//! resolves to whatever later reuses the slot.

/// Handle to a value stored in an [`Arena`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ArenaKey {
    index: u32,
    generation: u32,
}

impl ArenaKey {
    /// Slot index
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation at insertion time
    pub fn generation(self) -> u32 {
        self.generation
    }
}

enum Slot<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Generation-checked slot arena
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    /// Create an empty arena
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Store `value`, reusing a vacant slot when one exists
    pub fn insert(&mut self, value: T) -> ArenaKey {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => *generation,
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *slot = Slot::Occupied { generation, value };
            return ArenaKey { index, generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied {
            generation: 0,
            value,
        });
        ArenaKey {
            index,
            generation: 0,
        }
    }

    /// Look up a live value
    pub fn get(&self, key: ArenaKey) -> Option<&T> {
        match self.slots.get(key.index as usize) {
            Some(Slot::Occupied { generation, value }) if *generation == key.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Whether `key` still refers to a live value
    pub fn contains(&self, key: ArenaKey) -> bool {
        self.get(key).is_some()
    }

    /// Remove a live value; stale keys return `None`
    pub fn remove(&mut self, key: ArenaKey) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        let generation = match slot {
            Slot::Occupied { generation, .. } if *generation == key.generation => *generation,
            _ => return None,
        };
        let old = std::mem::replace(
            slot,
            Slot::Vacant {
                generation: generation.wrapping_add(1),
            },
        );
        self.free.push(key.index);
        self.len -= 1;
        match old {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    /// Remove every live value, in slot order
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let generation = match slot {
                Slot::Occupied { generation, .. } => *generation,
                Slot::Vacant { .. } => continue,
            };
            let old = std::mem::replace(
                slot,
                Slot::Vacant {
                    generation: generation.wrapping_add(1),
                },
            );
            if let Slot::Occupied { value, .. } = old {
                out.push(value);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
        out
    }

    /// Live values
    pub fn len(&self) -> usize {
        self.len
    }

    /// No live values
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}
