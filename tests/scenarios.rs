use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use vtlb::cache::CacheModel;
use vtlb::{
    AddressSpace, AddressSpaceConfig, Bus, CacheOp, GuestException, HardwareHandlers, MemoryHandler, Protection,
    StandardLayout, TlbEntry,
};

const MAIN_RAM: u32 = 0x0200_0000;

fn space(config: AddressSpaceConfig) -> AddressSpace {
    AddressSpace::new(config).expect("address space")
}

#[test]
fn test_ram_visible_through_every_segment() {
    let mut space = space(AddressSpaceConfig::default());
    let ram = space.allocate("main ram", MAIN_RAM as usize, Protection::ReadWrite).unwrap();
    space.map_block(ram, 0, MAIN_RAM, 0).unwrap();
    for vbase in [0x0000_0000, 0x2000_0000, 0x3000_0000, 0x8000_0000, 0xA000_0000] {
        space.vmap(vbase, 0, MAIN_RAM).unwrap();
    }

    space.write::<u32>(0x1000, 0xDEAD_BEEF);
    for alias in [0x2000_1000, 0x8000_1000, 0xA000_1000] {
        assert_eq!(space.read::<u32>(alias), 0xDEAD_BEEF, "alias 0x{:08X}", alias);
    }
    assert_eq!(&space.block(ram)[0x1000..0x1004], &0xDEAD_BEEFu32.to_le_bytes());
    assert_eq!(space.take_exception(), None);
}

struct Counter {
    next: u32,
    seen: Arc<Mutex<Vec<u32>>>,
}

impl MemoryHandler for Counter {
    fn read8(&mut self, _paddr: u32) -> u8 {
        panic!("only 32-bit reads are expected");
    }

    fn write8(&mut self, _paddr: u32, _value: u8) {}

    fn read32(&mut self, paddr: u32) -> u32 {
        self.seen.lock().unwrap().push(paddr);
        self.next += 1;
        self.next
    }
}

#[test]
fn test_counter_handler_sees_each_read_once() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut space = space(AddressSpaceConfig::default());
    let id = space
        .register_handler(Box::new(Counter {
            next: 0,
            seen: seen.clone(),
        }))
        .unwrap();
    space.map_handler(id, 0x1000_3000, 0x1000).unwrap();
    space.vmap(0x1000_3000, 0x1000_3000, 0x1000).unwrap();
    space.vmap(0xB000_3000, 0x1000_3000, 0x1000).unwrap();

    let mut last = 0;
    for i in 0..16 {
        let value = space.read32(0x1000_3000 + i * 4);
        assert!(value > last);
        last = value;
    }
    let expected: Vec<u32> = (0..16).map(|i| 0x1000_3000 + i * 4).collect();
    assert_eq!(*seen.lock().unwrap(), expected);

    // kseg1 alias reaches the handler with the physical address
    space.read32(0xB000_3040);
    assert_eq!(seen.lock().unwrap().last(), Some(&0x1000_3040));
}

#[test]
fn test_reassigned_handler_takes_over_existing_pages() {
    static READS: AtomicU32 = AtomicU32::new(0);

    struct Probe;
    impl MemoryHandler for Probe {
        fn read8(&mut self, _paddr: u32) -> u8 {
            READS.fetch_add(1, Ordering::Relaxed);
            0xAB
        }
        fn write8(&mut self, _paddr: u32, _value: u8) {}
    }

    let mut space = space(AddressSpaceConfig::default());
    let id = space.register_handler(Box::new(vtlb::NullHandler)).unwrap();
    space.map_handler(id, 0x1200_0000, 0x2000).unwrap();
    space.vmap(0xB200_0000, 0x1200_0000, 0x2000).unwrap();
    assert_eq!(space.read8(0xB200_1000), 0);

    space.reassign_handler(id, Box::new(Probe)).unwrap();
    assert_eq!(space.read8(0xB200_1000), 0xAB);
    assert_eq!(space.read16(0xB200_0000), 0xABAB);
    assert_eq!(READS.load(Ordering::Relaxed), 3);
}

fn cached_space() -> (AddressSpace, vtlb::ArenaBlock) {
    let mut space = space(AddressSpaceConfig {
        cache_emulation: true,
        arena_size: 0x10_0000,
        ..AddressSpaceConfig::default()
    });
    let ram = space.allocate("ram", 0x10000, Protection::ReadWrite).unwrap();
    space.map_block(ram, 0, 0x10000, 0).unwrap();
    space.vmap(0x0000_0000, 0, 0x10000).unwrap();
    space.vmap(0x2000_0000, 0, 0x10000).unwrap();

    let control = space.cache_control_mut();
    control.set_config(1 << 16);
    // one 64KB-per-half entry, both halves cached write-back, covering [0, 0x20000)
    control.set_tlb_entry(
        0,
        TlbEntry {
            page_mask: 0x1E000,
            entry_hi: 0,
            entry_lo0: 3 << 3,
            entry_lo1: 3 << 3,
        },
    );
    (space, ram)
}

fn backing_u32(space: &AddressSpace, ram: vtlb::ArenaBlock, offset: usize) -> u32 {
    u32::from_le_bytes(space.block(ram)[offset..offset + 4].try_into().unwrap())
}

#[test]
fn test_cache_shadows_backing_until_eviction() {
    let (mut space, ram) = cached_space();

    for value in 1..=5u32 {
        space.write::<u32>(0x0040, value);
    }
    assert_eq!(space.read::<u32>(0x0040), 5);
    assert_eq!(backing_u32(&space, ram, 0x40), 0);
    // the uncached alias sees the stale backing store
    assert_eq!(space.read::<u32>(0x2000_0040), 0);

    // two more lines mapping to the same set evict the dirty one
    space.read::<u32>(0x1040);
    space.read::<u32>(0x2040);
    assert_eq!(backing_u32(&space, ram, 0x40), 5);
    assert_eq!(space.read::<u32>(0x2000_0040), 5);
    assert!(space.cache().stats().writebacks >= 1);
}

#[test]
fn test_victim_follows_lrf_xor() {
    let (mut space, _ram) = cached_space();
    let set = CacheModel::set_index(0x80);

    for page in [0u32, 1, 2, 3, 0, 4, 2, 2, 5] {
        let vaddr = page * 0x1000 + 0x80;
        let host = space.virtual_map().resolve(vaddr);
        let vtlb::memory::Resolved::Host(ptr) = host else {
            panic!("ram page expected");
        };
        let tags = space.cache().set(set).tags;
        let hit = space.cache().find_in_cache(set, ptr as usize);
        let predicted = (tags[0].lrf ^ tags[1].lrf) as usize;

        space.read::<u32>(vaddr);

        let after = space.cache().set(set).tags;
        match hit {
            Some(way) => assert_eq!(after, tags, "hit in way {} must not touch the tags", way),
            None => {
                assert_eq!(space.cache().find_in_cache(set, ptr as usize), Some(predicted));
                assert_eq!(after[predicted].lrf, !tags[predicted].lrf);
                assert_eq!(after[1 - predicted], tags[1 - predicted]);
            }
        }
    }
}

#[test]
fn test_guest_cache_ops() {
    let (mut space, ram) = cached_space();
    space.write::<u32>(0x0100, 0x1234);

    // index load tag reports the physical page with dirty and valid set
    let set_way = 0x0100; // way 0
    let tag = space.cache_op(CacheOp::IndexLoadTag, set_way, 0).unwrap();
    let decoded = vtlb::CacheTag::from_packed(tag);
    assert!(decoded.valid && decoded.dirty);
    assert_eq!(decoded.phys_page(), 0);

    space.cache_op(CacheOp::IndexWritebackInvalidate, set_way, 0);
    assert_eq!(backing_u32(&space, ram, 0x100), 0x1234);

    space.write::<u32>(0x0100, 0x5678);
    space.cache_op(CacheOp::HitInvalidate, 0x0100, 0);
    assert_eq!(space.read::<u32>(0x0100), 0x1234);
}

#[test]
fn test_standard_layout_boots() {
    let mut space = space(AddressSpaceConfig::default());
    let layout = StandardLayout::install(&mut space, &HardwareHandlers::default()).unwrap();

    space.block_mut(layout.rom)[..4].copy_from_slice(&[0x00, 0x00, 0x08, 0x3C]);
    assert_eq!(space.read32(0xBFC0_0000), 0x3C08_0000);

    space.write64(0x8000_2000, 0x0123_4567_89AB_CDEF);
    assert_eq!(space.read64(0x2000), 0x0123_4567_89AB_CDEF);
    assert_eq!(space.ram_read::<u64>(0xA000_2000), Some(0x0123_4567_89AB_CDEF));

    space.write128(0x7000_0010, u128::MAX);
    assert_eq!(space.read128(0x7000_0010), u128::MAX);

    assert_eq!(space.read32(0x4000_0000), 0);
    assert_eq!(
        space.take_exception(),
        Some(GuestException::TlbMiss {
            vaddr: 0x4000_0000,
            write: false
        })
    );
}
