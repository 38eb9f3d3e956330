#![no_main]
use libfuzzer_sys::fuzz_target;

use buddymalloc_core::{BuddyTree, NodeState, NodeStates, ReleaseResult};

const BIN: usize = 1 << 16;
const LEAF: usize = 8;
const BASE: usize = 0x4000_0000;

fuzz_target!(|data: &[u8]| {
    let mut meta = vec![0u8; BuddyTree::metadata_len(BIN, LEAF)];
    let mut tree = BuddyTree::new(NodeStates::new(&mut meta), BASE, BIN, LEAF);
    // (address, granted size)
    let mut live: Vec<(usize, usize)> = Vec::new();

    for chunk in data.chunks_exact(3) {
        let arg = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        if chunk[0] % 2 == 0 {
            let request = arg.max(1);
            let min_block = LEAF << (chunk[0] % 4);
            match tree.allocate(request, min_block) {
                Some(grant) => {
                    assert!(grant.size >= request.max(min_block));
                    assert!(grant.size.is_power_of_two());
                    assert_eq!((grant.addr - BASE) % grant.size, 0, "block not naturally aligned");
                    for &(addr, size) in &live {
                        assert!(grant.addr + grant.size <= addr || addr + size <= grant.addr);
                    }
                    assert_eq!(tree.block_size(grant.addr), Some(grant.size));
                    live.push((grant.addr, grant.size));
                }
                None => assert!(
                    request.max(min_block) > BIN || !live.is_empty(),
                    "empty tree refused a fitting request"
                ),
            }
        } else if !live.is_empty() {
            let (addr, size) = live.swap_remove(arg % live.len());
            assert_eq!(tree.release(addr), ReleaseResult::Freed(size));
            assert_eq!(tree.release(addr), ReleaseResult::NotFound);
        }
    }

    for (addr, size) in live {
        assert_eq!(tree.release(addr), ReleaseResult::Freed(size));
    }
    assert_eq!(tree.root_state(), NodeState::Free);
});
