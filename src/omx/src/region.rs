//! Registration ids handed out for rendezvous transfers.
use std::sync::Arc;

use omx_api::cmd::RegionDescriptor;
use omx_api::Error;

use crate::segments::Segments;

/// Memory of a registered region, shared with the lower layer while registered.
pub type RegionMemory = Arc<spin::Mutex<Segments>>;

/// A registered region owned by one large request.
#[derive(Debug, Clone)]
pub struct Region {
    pub desc: RegionDescriptor,
    pub memory: RegionMemory,
}

#[derive(Debug, Clone, Copy, Default)]
struct RegionSlot {
    seqnum: u8,
    in_use: bool,
}

#[derive(Debug)]
pub struct RegionRegistry {
    slots: Vec<RegionSlot>,
    free: Vec<u8>,
}

impl RegionRegistry {
    pub fn new(max: usize) -> Self {
        assert!(max <= u8::MAX as usize + 1);
        RegionRegistry {
            slots: vec![RegionSlot::default(); max],
            // lowest ids first
            free: (0..max).rev().map(|id| id as u8).collect(),
        }
    }

    /// Takes a free id and bumps its generation.
    pub fn acquire(&mut self) -> Result<RegionDescriptor, Error> {
        let id = self.free.pop().ok_or(Error::NoResources)?;
        let slot = &mut self.slots[id as usize];
        assert!(!slot.in_use, "region {} handed out twice", id);
        slot.in_use = true;
        slot.seqnum = slot.seqnum.wrapping_add(1);
        Ok(RegionDescriptor {
            id,
            seqnum: slot.seqnum,
            offset: 0,
        })
    }

    pub fn release(&mut self, desc: RegionDescriptor) {
        let slot = &mut self.slots[desc.id as usize];
        assert!(
            slot.in_use && slot.seqnum == desc.seqnum,
            "releasing stale region {:?}",
            desc
        );
        slot.in_use = false;
        self.free.push(desc.id);
    }

    /// Whether `desc` names the current registration of its id.
    pub fn is_current(&self, desc: &RegionDescriptor) -> bool {
        self.slots
            .get(desc.id as usize)
            .map_or(false, |slot| slot.in_use && slot.seqnum == desc.seqnum)
    }

    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_detect_stale_descriptors() {
        let mut reg = RegionRegistry::new(2);
        let a = reg.acquire().unwrap();
        assert_eq!(a.id, 0);
        assert!(reg.is_current(&a));
        reg.release(a);
        assert!(!reg.is_current(&a));

        let b = reg.acquire().unwrap();
        assert_eq!(b.id, 1);
        let c = reg.acquire().unwrap();
        assert_eq!(c.id, 0);
        assert_ne!(c.seqnum, a.seqnum);
        assert!(!reg.is_current(&a));
        assert_eq!(reg.acquire(), Err(Error::NoResources));
        assert_eq!(reg.in_use(), 2);
        reg.release(b);
        reg.release(c);
        assert_eq!(reg.in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "stale region")]
    fn double_release_is_fatal() {
        let mut reg = RegionRegistry::new(1);
        let a = reg.acquire().unwrap();
        reg.release(a);
        reg.release(a);
    }
}
