//! The six end-to-end scenarios, run as integration tests against a
//! `SimulatedHostMapper` rather than as a human-driven CLI walkthrough.

use vm_core::{AccessRequest, Config, Error, Permissions, SimulatedHostMapper, System, VirtPageNum};

fn system(physical_frames: usize, pagefile_slots: usize) -> System {
    let config = Config {
        physical_frames,
        pagefile_slots,
        vm_multiplier: 4,
        num_threads: 1,
        pages_per_lock: 8,
        min_available: 2,
        ..Default::default()
    };
    let host = Box::new(SimulatedHostMapper::new(physical_frames + 32));
    System::new(config, host).unwrap()
}

#[test]
fn commit_access_trim_access_round_trip() {
    let system = system(8, 16);
    let vad = system
        .create_vad(Some(VirtPageNum::new(0)), 1, Permissions::RW, true)
        .unwrap();

    system.fault(vad.start, AccessRequest::WRITE).unwrap();
    assert_eq!(system.available_pages(), 7);

    // A dirty page that's trimmed parks on the Modified list (not yet
    // written back), so it isn't counted as "available" until a modified
    // writer drains it; no worker thread runs in this test.
    system.trim_va(vad.start).unwrap();
    assert_eq!(system.available_pages(), 7);

    system.fault(vad.start, AccessRequest::READ).unwrap();
    assert_eq!(system.committed_pages(), 1);
}

#[test]
fn pagefile_eviction_preserves_every_page() {
    // Only 4 physical frames back a 16-page VAD, so most pages must round
    // trip through the pagefile. Faulting alone (no explicit trim_va from
    // the test) forces `fault::handle`'s obtain_frame to block on the
    // new-page events until the background ager/trimmer and modified
    // writer evict enough pages to make room, exercising the full
    // automatic reclaim pipeline rather than a hand-driven one.
    let system = system(4, 32);
    let vad = system
        .create_vad(Some(VirtPageNum::new(0)), 16, Permissions::RW, true)
        .unwrap();

    std::thread::scope(|scope| {
        let _workers = system.spawn_workers(scope);

        for i in 0..16 {
            let vpn = vad.start.offset(i);
            system.fault(vpn, AccessRequest::WRITE).unwrap();
        }

        for i in 0..16 {
            let vpn = vad.start.offset(i);
            system.fault(vpn, AccessRequest::READ).unwrap();
        }

        assert_eq!(system.committed_pages(), 16);
        system.request_shutdown();
    });
}

#[test]
fn decommit_after_read_does_not_double_free() {
    let system = system(4, 16);
    let vad = system
        .create_vad(Some(VirtPageNum::new(0)), 4, Permissions::RW, true)
        .unwrap();

    for i in 0..4 {
        let vpn = vad.start.offset(i);
        system.fault(vpn, AccessRequest::WRITE).unwrap();
        system.trim_va(vpn).unwrap();
    }

    system.fault(vad.start, AccessRequest::READ).unwrap();
    system.decommit_va(vad.start, 4).unwrap();

    assert_eq!(system.committed_pages(), 0);
    // A second decommit of the same, already-decommitted range must be a
    // true no-op rather than releasing commit it doesn't hold.
    system.decommit_va(vad.start, 4).unwrap();
    assert_eq!(system.committed_pages(), 0);
}

#[test]
fn protect_to_readonly_while_trimmed_blocks_writes() {
    let system = system(4, 16);
    let vad = system
        .create_vad(Some(VirtPageNum::new(0)), 1, Permissions::RWX, true)
        .unwrap();

    system.fault(vad.start, AccessRequest::WRITE).unwrap();
    system.trim_va(vad.start).unwrap();
    system.protect_va(vad.start, Permissions::R, 1).unwrap();

    system.fault(vad.start, AccessRequest::READ).unwrap();
    let result = system.fault(vad.start, AccessRequest::WRITE);
    assert!(matches!(result, Err(Error::AccessViolation(_))));
}

#[test]
fn overcommit_is_rejected_without_side_effects() {
    let system = system(32, 0);
    let before = system.committed_pages();

    let result = system.create_vad(Some(VirtPageNum::new(0)), 40, Permissions::RW, true);

    assert!(result.is_err());
    assert_eq!(system.committed_pages(), before);
}

#[test]
fn overlapping_vad_is_rejected_without_side_effects() {
    let system = system(16, 16);
    let first = system
        .create_vad(Some(VirtPageNum::new(0)), 8, Permissions::RW, true)
        .unwrap();
    let before = system.committed_pages();

    let result = system.create_vad(Some(VirtPageNum::new(4)), 8, Permissions::RW, true);

    assert!(result.is_err());
    assert_eq!(system.committed_pages(), before);
    assert_eq!(first.page_count, 8);
}
