//! Heap bring-up from the boot memory map.

#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// How much of the largest usable region we claim for ourselves.
#[cfg(target_os = "none")]
const HEAP_SIZE: u64 = 64 * 1024 * 1024;

#[cfg(target_os = "none")]
pub fn init(hhdm_offset: u64, map: Option<&limine::response::MemoryMapResponse>) {
    use limine::memory_map::EntryType;

    let map = match map {
        Some(m) => m,
        None => panic!("boot protocol provided no memory map"),
    };

    let mut best_base = 0u64;
    let mut best_len = 0u64;
    for entry in map.entries() {
        if entry.entry_type != EntryType::USABLE {
            continue;
        }
        if entry.length > best_len {
            best_base = entry.base;
            best_len = entry.length;
        }
    }
    if best_len == 0 {
        panic!("no usable memory region for the heap");
    }

    let len = best_len.min(HEAP_SIZE);
    unsafe {
        ALLOCATOR
            .lock()
            .init((best_base + hhdm_offset) as *mut u8, len as usize);
    }

    // The heap region belongs to the hypervisor; the guest must never see
    // its contents through stage-2.
    super::set_vmm_range(best_base, len);

    log!(
        "heap at 0x{:x} + 0x{:x} ({} MiB)",
        best_base,
        len,
        len / (1024 * 1024)
    );
}
