/// Reserved token for the poller's internal wake-up eventfd. Slab indexes are bounded well below
/// `u32::MAX` so this can never collide with a real registration.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// Represents the metadata the [super::Poller] packs into each epoll registration so that it can
/// map a readiness event back to the operator that asked for it.
///
/// The index is the operator's slot in the registration slab and lives in the lower 32 bits. The
/// generation lives in the upper 32 bits and changes on every registration, so an event that was
/// queued for a descriptor that has since been detached (and whose number the kernel may already
/// have handed out again) no longer matches its slot and gets dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Token {
    index: u32,
    generation: u32,
}

impl Token {
    pub(crate) fn new(index: usize, generation: u32) -> Token {
        Token {
            index: index as u32,
            generation,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn to_u64(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub(crate) fn from_u64(value: u64) -> Token {
        Token {
            index: value as u32,
            generation: (value >> 32) as u32,
        }
    }
}
