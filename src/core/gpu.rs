/// A single GPU device slot.
///
/// `reserved` devices are excluded from allocation for the lifetime of the
/// server (set from configuration at startup, e.g. devices kept aside for
/// interactive use). `allocated` tracks logical occupancy by a running job.
#[derive(Debug)]
struct DeviceSlot {
    id: u32,
    reserved: bool,
    allocated: bool,
}

impl DeviceSlot {
    fn allocatable(&self) -> bool {
        !self.reserved && !self.allocated
    }
}

/// The node's fixed collection of GPU devices.
#[derive(Debug)]
pub struct GpuDeviceSet {
    // Sorted by id so allocation order is deterministic (lowest id first).
    slots: Vec<DeviceSlot>,
}

impl GpuDeviceSet {
    pub fn new(device_ids: &[u32], reserved_ids: &[u32]) -> Self {
        let mut ids: Vec<u32> = device_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        let slots = ids
            .into_iter()
            .map(|id| DeviceSlot {
                id,
                reserved: reserved_ids.contains(&id),
                allocated: false,
            })
            .collect();
        Self { slots }
    }

    /// All devices, including reserved ones.
    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn reserved_count(&self) -> usize {
        self.slots.iter().filter(|s| s.reserved).count()
    }

    pub fn allocated_count(&self) -> usize {
        self.slots.iter().filter(|s| s.allocated).count()
    }

    pub fn allocatable_count(&self) -> usize {
        self.slots.iter().filter(|s| s.allocatable()).count()
    }

    /// Allocate `n` devices, lowest ids first. Returns `None` without
    /// touching any slot when fewer than `n` are allocatable.
    pub fn try_allocate(&mut self, n: u32) -> Option<Vec<u32>> {
        let n = n as usize;
        if self.allocatable_count() < n {
            return None;
        }
        let mut picked = Vec::with_capacity(n);
        for slot in self.slots.iter_mut().filter(|s| s.allocatable()) {
            if picked.len() == n {
                break;
            }
            slot.allocated = true;
            picked.push(slot.id);
        }
        Some(picked)
    }

    /// Release devices previously handed out by `try_allocate`.
    ///
    /// Releasing an id that is not currently allocated is a caller bug and
    /// aborts: the device accounting can no longer be trusted.
    pub fn release(&mut self, device_ids: &[u32]) {
        for &id in device_ids {
            let slot = self
                .slots
                .iter_mut()
                .find(|s| s.id == id && s.allocated)
                .unwrap_or_else(|| panic!("release of unallocated GPU device {id}"));
            slot.allocated = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_lowest_ids_first() {
        let mut gpus = GpuDeviceSet::new(&[3, 0, 2, 1], &[]);
        assert_eq!(gpus.try_allocate(2), Some(vec![0, 1]));
        assert_eq!(gpus.allocatable_count(), 2);
        assert_eq!(gpus.try_allocate(1), Some(vec![2]));
    }

    #[test]
    fn test_allocate_insufficient_is_untouched() {
        let mut gpus = GpuDeviceSet::new(&[0, 1], &[]);
        assert_eq!(gpus.try_allocate(3), None);
        assert_eq!(gpus.allocatable_count(), 2);
        assert_eq!(gpus.allocated_count(), 0);
    }

    #[test]
    fn test_reserved_devices_are_skipped() {
        let mut gpus = GpuDeviceSet::new(&[0, 1, 2, 3], &[0, 2]);
        assert_eq!(gpus.total(), 4);
        assert_eq!(gpus.reserved_count(), 2);
        assert_eq!(gpus.allocatable_count(), 2);
        assert_eq!(gpus.try_allocate(2), Some(vec![1, 3]));
        assert_eq!(gpus.try_allocate(1), None);
    }

    #[test]
    fn test_release_restores_allocatable() {
        let mut gpus = GpuDeviceSet::new(&[0, 1, 2], &[]);
        let ids = gpus.try_allocate(2).unwrap();
        gpus.release(&ids);
        assert_eq!(gpus.allocatable_count(), 3);
        // Counts always partition the device set.
        assert_eq!(
            gpus.allocatable_count() + gpus.reserved_count() + gpus.allocated_count(),
            gpus.total()
        );
    }

    #[test]
    fn test_zero_allocation_succeeds() {
        let mut gpus = GpuDeviceSet::new(&[], &[]);
        assert_eq!(gpus.try_allocate(0), Some(vec![]));
    }

    #[test]
    #[should_panic(expected = "unallocated GPU device")]
    fn test_release_unallocated_is_fatal() {
        let mut gpus = GpuDeviceSet::new(&[0, 1], &[]);
        gpus.release(&[1]);
    }
}
