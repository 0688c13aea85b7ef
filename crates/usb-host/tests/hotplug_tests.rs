//! Hotplug gate integration tests: refcounted enable/disable and event
//! fan-out.

use std::sync::Arc;

use usb_host::mock::{MockDevice, MockEngine, build_device_descriptor};
use usb_host::{DeviceIdent, HostContext, HotplugEvent};

fn setup() -> (Arc<MockEngine>, HostContext) {
    let engine = Arc::new(MockEngine::new());
    engine.add_device(MockDevice::new(
        1,
        5,
        build_device_descriptor(0x1234, 0x5678, 0x0200),
    ));
    let context = HostContext::with_engine(engine.clone());
    (engine, context)
}

fn sample_ident() -> DeviceIdent {
    DeviceIdent {
        bus_number: 2,
        address: 9,
        port_numbers: vec![3, 1],
    }
}

#[tokio::test]
async fn first_watcher_enables_last_drop_disables() {
    let (engine, context) = setup();
    assert!(!engine.hotplug_enabled());

    let first = context.watch_hotplug().unwrap();
    assert!(engine.hotplug_enabled());
    assert_eq!(engine.hotplug_transitions(), (1, 0));

    // A second watcher reuses the enabled channel.
    let second = context.watch_hotplug().unwrap();
    assert_eq!(engine.hotplug_transitions(), (1, 0));

    drop(first);
    assert!(engine.hotplug_enabled());

    drop(second);
    assert!(!engine.hotplug_enabled());
    assert_eq!(engine.hotplug_transitions(), (1, 1));

    // A later watcher re-enables from scratch.
    let third = context.watch_hotplug().unwrap();
    assert_eq!(engine.hotplug_transitions(), (2, 1));
    drop(third);
}

#[tokio::test]
async fn watcher_receives_injected_events() {
    let (engine, context) = setup();
    let mut watcher = context.watch_hotplug().unwrap();

    let ident = sample_ident();
    engine.inject_hotplug(HotplugEvent::Attached(ident.clone()));
    engine.inject_hotplug(HotplugEvent::Detached(ident.clone()));

    assert_eq!(
        watcher.next().await,
        Some(HotplugEvent::Attached(ident.clone()))
    );
    assert_eq!(watcher.next().await, Some(HotplugEvent::Detached(ident)));
}

#[tokio::test]
async fn events_fan_out_to_every_watcher() {
    let (engine, context) = setup();
    let mut first = context.watch_hotplug().unwrap();
    let mut second = context.watch_hotplug().unwrap();

    let ident = sample_ident();
    engine.inject_hotplug(HotplugEvent::Attached(ident.clone()));

    assert_eq!(
        first.next().await,
        Some(HotplugEvent::Attached(ident.clone()))
    );
    assert_eq!(second.next().await, Some(HotplugEvent::Attached(ident)));
}

#[tokio::test]
async fn lagged_watcher_skips_ahead() {
    let (engine, context) = setup();
    let mut watcher = context.watch_hotplug().unwrap();

    // Flood well past the broadcast capacity without reading.
    for address in 0..100u8 {
        engine.inject_hotplug(HotplugEvent::Attached(DeviceIdent {
            bus_number: 1,
            address,
            port_numbers: vec![address],
        }));
    }

    // The watcher lost the oldest events but still receives, and the last
    // injected event is reachable.
    let mut last = None;
    while let Some(event) = watcher.next().await {
        let HotplugEvent::Attached(ident) = &event else {
            panic!("unexpected event {:?}", event);
        };
        let address = ident.address;
        last = Some(event);
        if address == 99 {
            break;
        }
    }
    assert_eq!(
        last,
        Some(HotplugEvent::Attached(DeviceIdent {
            bus_number: 1,
            address: 99,
            port_numbers: vec![99],
        }))
    );
}
