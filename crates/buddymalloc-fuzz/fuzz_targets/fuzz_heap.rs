#![no_main]
use libfuzzer_sys::fuzz_target;

use buddymalloc_heap::global;

// Each chunk: op, size (u16 le), extra.
fuzz_target!(|data: &[u8]| {
    // (address, requested size, fill byte)
    let mut live: Vec<(usize, usize, u8)> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let op = chunk[0] % 5;
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let extra = chunk[3];

        match op {
            0 | 1 => {
                let block = if op == 0 {
                    global::allocate(size)
                } else {
                    let alignment = 8usize << (extra % 10);
                    global::allocate_aligned(alignment, size).inspect(|p| {
                        assert_eq!(p.as_ptr() as usize % alignment, 0);
                    })
                };
                let Ok(p) = block else { continue };
                let addr = p.as_ptr() as usize;
                let granted = global::usable_size(p.as_ptr()).expect("fresh block is live");
                assert!(granted >= size.max(1));
                for &(other, other_size, _) in &live {
                    assert!(addr + size <= other || other + other_size <= addr, "overlap");
                }
                // SAFETY: fresh block of at least `size` bytes.
                unsafe { std::ptr::write_bytes(p.as_ptr(), extra, size) };
                live.push((addr, size, extra));
            }
            2 => {
                if live.is_empty() {
                    continue;
                }
                let (addr, size, fill) = live.swap_remove(extra as usize % live.len());
                // SAFETY: block still live with `size` initialized bytes.
                let bytes = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
                assert!(bytes.iter().all(|&b| b == fill), "block clobbered");
                assert!(global::release(addr as *mut u8).freed_bytes().is_some());
                assert!(global::release(addr as *mut u8).freed_bytes().is_none(), "double release");
            }
            3 => {
                if live.is_empty() {
                    continue;
                }
                let idx = extra as usize % live.len();
                let (addr, old_size, fill) = live[idx];
                // SAFETY: live block owned by this thread.
                match unsafe { global::reallocate(addr as *mut u8, size) } {
                    Ok(Some(p)) => {
                        let keep = old_size.min(size);
                        // SAFETY: new block holds at least `size` bytes.
                        let bytes = unsafe { std::slice::from_raw_parts(p.as_ptr(), keep) };
                        assert!(bytes.iter().all(|&b| b == fill), "prefix lost in realloc");
                        // SAFETY: extend the fill over the grown tail.
                        unsafe { std::ptr::write_bytes(p.as_ptr(), fill, size) };
                        live[idx] = (p.as_ptr() as usize, size, fill);
                    }
                    Ok(None) => {
                        live.swap_remove(idx);
                    }
                    Err(_) => {}
                }
            }
            _ => {
                // Interior pointers are never released.
                if let Some(&(addr, size, _)) = live.last() {
                    if size > 1 {
                        let interior = addr + 1 + (extra as usize % (size - 1));
                        assert!(global::release(interior as *mut u8).freed_bytes().is_none());
                    }
                }
            }
        }
    }

    for (addr, _, _) in live {
        assert!(global::release(addr as *mut u8).freed_bytes().is_some());
    }
});
