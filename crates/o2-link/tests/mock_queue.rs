use std::time::Duration;

use crossbeam_channel as cb;
use o2_core::alttp::{TRAMPOLINE, UPDATE_SLOT_A};
use o2_core::mirror::{PAK_WRAM, bus_to_pak};
use o2_link::{DeviceError, DeviceQueue, DriverRegistry, MockDevice, Request, Response};

const WAIT: Duration = Duration::from_secs(2);

#[test]
fn routine_write_then_check_through_the_queue() {
    let device = MockDevice::new();
    let handle = device.handle();
    handle.set_auto_execute(true);
    let mut queue = DeviceQueue::spawn("mock", device).unwrap();
    let (tx, rx) = cb::unbounded();

    let base = bus_to_pak(UPDATE_SLOT_A);
    let done = tx.clone();
    queue
        .submit(
            vec![
                Request::Write {
                    address: base,
                    data: vec![0x80, 0x01, 0x00, 0x60],
                },
                Request::Write {
                    address: bus_to_pak(TRAMPOLINE),
                    data: vec![0x7D],
                },
            ],
            move |r| done.send(r).unwrap(),
        )
        .unwrap();
    queue
        .submit(vec![Request::Read { address: base, size: 3 }], move |r| {
            tx.send(r).unwrap()
        })
        .unwrap();

    assert_eq!(
        rx.recv_timeout(WAIT).unwrap().unwrap(),
        vec![
            Response::Written { address: base },
            Response::Written {
                address: bus_to_pak(TRAMPOLINE)
            },
        ]
    );
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap().unwrap(),
        vec![Response::Read {
            address: base,
            data: vec![0x60, 0x01, 0x01],
        }]
    );
    queue.close();
    assert!(handle.is_closed());
}

#[test]
fn rejected_wram_write_fails_only_its_batch() {
    let registry = DriverRegistry::default();
    let device = registry.open("mock", "").unwrap();
    let queue = DeviceQueue::spawn("mock", device).unwrap();
    let (tx, rx) = cb::unbounded();

    let done = tx.clone();
    queue
        .submit(
            vec![Request::Write {
                address: PAK_WRAM + 0xF340,
                data: vec![1],
            }],
            move |r| done.send(r).unwrap(),
        )
        .unwrap();
    queue
        .submit(
            vec![Request::Read {
                address: PAK_WRAM,
                size: 2,
            }],
            move |r| tx.send(r).unwrap(),
        )
        .unwrap();

    assert!(matches!(
        rx.recv_timeout(WAIT).unwrap(),
        Err(DeviceError::NotPermitted(_))
    ));
    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    assert!(!queue.is_closed());
}
