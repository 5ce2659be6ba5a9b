// SPDX-License-Identifier: MIT
#![cfg(feature = "mem")]

mod common;

use std::{
    sync::{Arc, Weak, mpsc},
    thread,
    time::Duration,
};

use common::*;
use parking_lot::Mutex;
use volscan::{
    DeviceEvent, EventDispatcher, EventReport, FilesystemInstance, Superblock,
    error::DeviceResult,
    mem::{HostEvent, MemDisk, MemHost},
};

const PART: (u64, u64) = (MIB, 8 * MIB);

/// One-partition disk holding device `dev` of filesystem `fs`.
fn member_disk(path: &str, number: u32, fs: u128, dev: u128, num_devices: u64) -> Arc<MemDisk> {
    let mut image = mbr_image(16 * MIB, &[PART]);
    let sb = Superblock::new(fsid(fs), dev_uuid(dev), dev as u64, 1).with_num_devices(num_devices);
    put_superblock(&mut image, PART.0, &sb, 0);
    MemDisk::builder(path, number, image).build()
}

fn volume_name(fs: u128) -> String {
    format!(r"\Device\Btrfs{{{}}}", fsid(fs))
}

#[test]
fn arrival_then_removal_leaves_nothing_behind() {
    let host = Arc::new(MemHost::new());
    host.add_disk(member_disk("part", 1, 1, 1, 1));
    host.add_disk(whole_disk("raw", 2, 2, 1));
    let d = dispatcher(&host);

    for path in ["part", "raw"] {
        d.arrival(path).unwrap();
    }
    assert_eq!(d.registry().volumes().len(), 2);
    assert_eq!(d.manager().published().len(), 2);
    assert!(host.outstanding_refs("part") > 0);
    assert!(host.outstanding_refs("raw") > 0);

    for path in ["part", "raw"] {
        let report = d.removal(path);
        assert!(report.known);
        assert_eq!(report.children_detached, 1);
        assert_eq!(report.volumes_dropped, 1);
        assert!(report.dismounted.is_empty());
    }

    assert!(d.registry().volumes().is_empty());
    assert!(d.registry().pending_disks().is_empty());
    assert!(d.manager().published().is_empty());
    assert!(host.child_names().is_empty());
    assert_eq!(host.outstanding_refs("part"), 0);
    assert_eq!(host.outstanding_refs("raw"), 0);
}

#[test]
fn published_volume_holds_the_disk_until_removal() {
    let host = Arc::new(MemHost::new());
    host.add_disk(member_disk("disk", 1, 1, 1, 1));
    let d = dispatcher(&host);

    d.arrival("disk").unwrap();
    // One for the child, one for the volume device stacked on it.
    assert_eq!(host.outstanding_refs("disk"), 2);
    assert!(host.has_device(&volume_name(1)));

    d.removal("disk");
    assert_eq!(host.outstanding_refs("disk"), 0);
    assert!(!host.has_device(&volume_name(1)));
}

#[test]
fn multi_device_filesystem_is_published_once() {
    let host = Arc::new(MemHost::new());
    host.add_disk(member_disk("a", 1, 7, 1, 2));
    host.add_disk(member_disk("b", 2, 7, 2, 2));
    let d = dispatcher(&host);

    d.arrival("a").unwrap();
    let pv = d.manager().find_by_fsid(fsid(7)).unwrap();
    assert_eq!(pv.name(), volume_name(7));
    assert_eq!((pv.loaded(), pv.expected_children()), (1, 2));
    assert!(!pv.is_complete());

    d.arrival("b").unwrap();
    assert!(pv.is_complete());
    assert_eq!(d.manager().published().len(), 1);
    let mut children = pv.children();
    children.sort();
    assert_eq!(
        children,
        vec![("a".to_string(), dev_uuid(1)), ("b".to_string(), dev_uuid(2))]
    );
    assert_eq!(host.outstanding_refs("b"), 1);
}

#[test]
fn losing_one_device_dismounts_but_keeps_the_volume() {
    let host = Arc::new(MemHost::new());
    host.add_disk(member_disk("a", 1, 7, 1, 2));
    host.add_disk(member_disk("b", 2, 7, 2, 2));
    let d = dispatcher(&host);
    d.rescan(["a", "b"]);

    let name = volume_name(7);
    d.manager().attach_mount(&name, host.mount_instance("fs")).unwrap();
    host.clear_events();

    let report = d.removal("a");
    assert_eq!(report.dismounted, vec![name.clone()]);
    assert!(report.unpublished.is_empty());
    assert_eq!(
        host.events(),
        vec![
            HostEvent::Dismount("fs".into()),
            HostEvent::SurpriseRemoval("fs".into())
        ]
    );

    let pv = d.manager().find(&name).unwrap();
    assert_eq!(pv.loaded(), 1);
    assert_eq!(d.registry().volumes().len(), 1);
    assert_eq!(host.outstanding_refs("b"), 1);
}

#[test]
fn removing_last_device_of_mounted_volume_dismounts_then_unpublishes() {
    let host = Arc::new(MemHost::new());
    host.add_disk(member_disk("disk", 1, 3, 1, 1));
    let d = dispatcher(&host);
    d.arrival("disk").unwrap();

    let name = volume_name(3);
    d.manager().attach_mount(&name, host.mount_instance("fs")).unwrap();
    host.assign_mount_point(&name, r"\DosDevices\G:");
    host.clear_events();

    let report = d.removal("disk");
    assert_eq!(report.dismounted, vec![name.clone()]);
    assert_eq!(report.unpublished, vec![name.clone()]);
    assert_eq!(
        host.events(),
        vec![
            HostEvent::Dismount("fs".into()),
            HostEvent::SurpriseRemoval("fs".into()),
            HostEvent::MountPointsDeleted {
                name: name.clone(),
                count: 1
            },
            HostEvent::DeviceDeleted(name.clone()),
        ]
    );
    // Undersized first answer, then the retry.
    assert_eq!(host.registrar_calls().len(), 2);
}

#[test]
fn unmounted_volume_is_unpublished_without_dismount() {
    let host = Arc::new(MemHost::new());
    host.add_disk(member_disk("disk", 1, 3, 1, 1));
    let d = dispatcher(&host);
    d.arrival("disk").unwrap();
    host.clear_events();

    let report = d.removal("disk");
    assert!(report.dismounted.is_empty());
    assert_eq!(report.unpublished, vec![volume_name(3)]);
    assert!(
        !host
            .events()
            .iter()
            .any(|e| matches!(e, HostEvent::Dismount(_) | HostEvent::SurpriseRemoval(_)))
    );
}

#[test]
fn removal_only_drops_volumes_of_that_disk() {
    let host = Arc::new(MemHost::new());
    host.add_disk(member_disk("a", 1, 1, 1, 1));
    host.add_disk(member_disk("b", 2, 2, 1, 1));
    let d = dispatcher(&host);
    d.rescan(["a", "b"]);

    d.removal("a");
    let left = d.registry().volumes();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].disk_number, 2);
    assert_eq!(d.registry().pending_disks().len(), 1);
    assert!(d.manager().find_by_fsid(fsid(2)).is_some());
    assert!(d.manager().find_by_fsid(fsid(1)).is_none());
}

#[test]
fn whole_disk_shim_is_removed_with_its_volume() {
    let host = Arc::new(MemHost::new());
    host.add_disk(whole_disk("raw", 4, 1, 1));
    let d = dispatcher(&host);
    let shim = r"\Device\Harddisk4\Partition0Btrfs";

    d.arrival("raw").unwrap();
    assert!(host.has_device(shim));
    d.removal("raw");
    assert!(!host.has_device(shim));

    // Same disk number again: no stale name in the way.
    d.arrival("raw").unwrap();
    assert!(host.has_device(shim));
    assert_eq!(d.registry().volumes().len(), 1);
}

#[test]
fn disks_on_separate_threads_do_not_interfere() {
    let host = Arc::new(MemHost::new());
    let paths: Vec<String> = (0..4).map(|i| format!("disk{i}")).collect();
    for (i, path) in paths.iter().enumerate() {
        host.add_disk(member_disk(path, i as u32, 10 + i as u128, 1, 1));
    }
    let d = dispatcher(&host);

    thread::scope(|s| {
        for path in &paths {
            let d = &d;
            s.spawn(move || d.arrival(path).unwrap());
        }
    });
    assert_eq!(d.registry().volumes().len(), 4);
    assert_eq!(d.registry().pending_disks().len(), 4);
    assert_eq!(d.manager().published().len(), 4);

    thread::scope(|s| {
        for path in &paths {
            let d = &d;
            s.spawn(move || assert!(d.removal(path).known));
        }
    });
    assert!(d.registry().volumes().is_empty());
    assert!(d.registry().pending_disks().is_empty());
    assert!(d.manager().published().is_empty());
}

#[test]
fn events_are_routed_by_kind() {
    let host = Arc::new(MemHost::new());
    host.add_disk(member_disk("disk", 1, 1, 1, 1));
    let d = dispatcher(&host);

    match d.handle(&DeviceEvent::Arrival("disk".into())) {
        Some(EventReport::Arrival(r)) => assert_eq!(r.volumes_registered, 1),
        other => panic!("unexpected report: {other:?}"),
    }
    match d.handle(&DeviceEvent::Removal("elsewhere".into())) {
        Some(EventReport::Removal(r)) => assert!(!r.known),
        other => panic!("unexpected report: {other:?}"),
    }
    assert!(d.handle(&DeviceEvent::Arrival("missing".into())).is_none());
    assert_eq!(d.registry().volumes().len(), 1);
}

#[test]
fn rescan_skips_devices_that_fail_to_open() {
    let host = Arc::new(MemHost::new());
    host.add_disk(member_disk("a", 1, 1, 1, 1));
    host.add_disk(whole_disk("b", 2, 2, 1));
    let d = dispatcher(&host);

    let reports = d.rescan(["a", "gone", "b"]);
    assert_eq!(reports.len(), 2);
    assert_eq!(reports.iter().map(|r| r.volumes_registered).sum::<usize>(), 2);
}

/// Filesystem whose dismount path looks the volume up again.
struct ReentrantFs {
    dispatcher: Weak<EventDispatcher>,
    seen: Mutex<Vec<usize>>,
}

impl ReentrantFs {
    fn observe(&self) {
        if let Some(d) = self.dispatcher.upgrade() {
            self.seen.lock().push(d.manager().published().len());
        }
    }
}

impl FilesystemInstance for ReentrantFs {
    fn notify_volume_dismount(&self) -> DeviceResult {
        self.observe();
        Ok(())
    }

    fn trigger_surprise_removal(&self) -> DeviceResult {
        self.observe();
        Ok(())
    }
}

#[test]
fn dismount_callbacks_may_call_back_into_the_manager() {
    let host = Arc::new(MemHost::new());
    host.add_disk(whole_disk("raw", 1, 5, 1));
    let d = Arc::new(dispatcher(&host));
    d.arrival("raw").unwrap();

    let fs = Arc::new(ReentrantFs {
        dispatcher: Arc::downgrade(&d),
        seen: Mutex::new(Vec::new()),
    });
    d.manager().attach_mount(&volume_name(5), fs.clone()).unwrap();

    let (tx, rx) = mpsc::channel();
    let worker = Arc::clone(&d);
    thread::spawn(move || {
        let _ = tx.send(worker.removal("raw"));
    });
    let report = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("removal did not return");

    assert_eq!(report.unpublished, vec![volume_name(5)]);
    // The emptied volume is already out of the published set.
    assert_eq!(*fs.seen.lock(), vec![0, 0]);
    assert!(d.manager().published().is_empty());
}
