#![no_main]
use libfuzzer_sys::fuzz_target;
use slotmalloc_core::{Heap, Mode};

const SLOTS: usize = 32;

fuzz_target!(|data: &[u8]| {
    // Membership is checked before any header read, so the arbitrary-address
    // frees below are sound in either mode.
    let mode = if data.first().is_some_and(|b| b & 1 == 1) {
        Mode::Hardened
    } else {
        Mode::Strict
    };
    let heap = Heap::new().with_mode(mode);
    let mut slots: [Option<(*mut u8, usize)>; SLOTS] = [None; SLOTS];

    for chunk in data.chunks(4) {
        if chunk.len() < 4 {
            break;
        }
        let idx = chunk[1] as usize % SLOTS;
        let size = u16::from_le_bytes([chunk[2], chunk[3]]) as usize;
        match chunk[0] % 6 {
            0 if slots[idx].is_none() => {
                if let Some(p) = heap.allocate(size) {
                    assert_eq!(p.as_ptr() as usize % 16, 0);
                    unsafe { p.as_ptr().write_bytes(idx as u8, size) };
                    slots[idx] = Some((p.as_ptr(), size));
                }
            }
            1 if slots[idx].is_none() => {
                let count = 1 + (chunk[1] as usize & 7);
                if let Some(p) = heap.allocate_zeroed(count, size / count) {
                    let total = count * (size / count);
                    let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), total) };
                    assert!(bytes.iter().all(|&b| b == 0));
                    unsafe { p.as_ptr().write_bytes(idx as u8, total) };
                    slots[idx] = Some((p.as_ptr(), total));
                }
            }
            2 => {
                if let Some((p, old)) = slots[idx].take() {
                    let bytes = unsafe { std::slice::from_raw_parts(p, old) };
                    assert!(bytes.iter().all(|&b| b == idx as u8));
                    unsafe { heap.deallocate(p) };
                }
            }
            3 => {
                if let Some((p, old)) = slots[idx] {
                    match unsafe { heap.resize(p, size) } {
                        Some(q) => {
                            let kept = old.min(size);
                            let bytes = unsafe { std::slice::from_raw_parts(q.as_ptr(), kept) };
                            assert!(bytes.iter().all(|&b| b == idx as u8));
                            unsafe { q.as_ptr().write_bytes(idx as u8, size) };
                            slots[idx] = Some((q.as_ptr(), size));
                        }
                        None if size == 0 => slots[idx] = None,
                        None => {}
                    }
                }
            }
            4 => {
                // Misuse: interior or stale pointer near a tracked slot.
                if let Some((p, _)) = slots[idx] {
                    let offset = size % 4096;
                    if offset != 0 {
                        let outcome = unsafe { heap.deallocate(p.wrapping_add(offset)) };
                        assert!(!outcome.is_release() || offset % 16 == 0);
                        // A slot-aligned offset may have freed a neighbour we
                        // track; forget whichever slot that was.
                        if outcome.is_release() {
                            let freed = p.wrapping_add(offset);
                            for s in slots.iter_mut() {
                                if s.is_some_and(|(q, _)| q == freed) {
                                    *s = None;
                                }
                            }
                        }
                    }
                }
            }
            5 => {
                let addr = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize;
                if !slots.iter().flatten().any(|&(p, _)| p as usize == addr) {
                    let _ = unsafe { heap.deallocate(addr as *mut u8) };
                }
            }
            _ => {}
        }
    }

    let audit = heap.audit().expect("audit");
    assert_eq!(audit.violations, 0);
    assert_eq!(audit.live_slots, slots.iter().flatten().count());
    for (p, _) in slots.iter().flatten() {
        unsafe { heap.deallocate(*p) };
    }
    assert_eq!(heap.region_count(), 0);
});
