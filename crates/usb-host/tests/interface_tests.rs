//! Interface integration tests: claiming, alternate settings, endpoint
//! rebuilds, release gating.

use std::sync::Arc;

use usb_host::mock::{
    AltSpec, EndpointSpec, MockDevice, MockEngine, build_config_descriptor,
    build_device_descriptor,
};
use usb_host::{Device, Error, HostContext, Interface, UsageError};

/// Interface 0 with two alternate settings: alt 0 has one bulk IN endpoint,
/// alt 1 has an interrupt IN and a bulk OUT endpoint.
fn two_alt_config() -> Vec<u8> {
    build_config_descriptor(
        1,
        0,
        &[
            AltSpec {
                alt: 0,
                endpoints: vec![EndpointSpec {
                    address: 0x81,
                    attributes: 0x02,
                    max_packet_size: 64,
                }],
            },
            AltSpec {
                alt: 1,
                endpoints: vec![
                    EndpointSpec {
                        address: 0x82,
                        attributes: 0x03,
                        max_packet_size: 16,
                    },
                    EndpointSpec {
                        address: 0x02,
                        attributes: 0x02,
                        max_packet_size: 64,
                    },
                ],
            },
        ],
    )
}

fn setup() -> (Arc<MockEngine>, Arc<Device>, Arc<Interface>) {
    let engine = Arc::new(MockEngine::new());
    engine.add_device(
        MockDevice::new(1, 5, build_device_descriptor(0x1234, 0x5678, 0x0200))
            .with_config(two_alt_config()),
    );

    let context = HostContext::with_engine(engine.clone());
    let device = context.devices().unwrap().remove(0);
    device.open().unwrap();
    let interface = device.interface(0).unwrap().unwrap();
    (engine, device, interface)
}

#[test]
fn endpoint_list_matches_alt_setting() {
    let (engine, _device, interface) = setup();

    assert_eq!(interface.current_alt_setting(), 0);
    let endpoints = interface.endpoints();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].address(), 0x81);

    interface.set_alt_setting(1).unwrap();
    assert_eq!(interface.current_alt_setting(), 1);
    let endpoints = interface.endpoints();
    assert_eq!(endpoints.len(), 2);
    assert!(interface.endpoint(0x81).is_none());
    assert!(interface.endpoint(0x82).is_some());
    assert!(interface.endpoint(0x02).is_some());
    assert_eq!(engine.alt_settings_activated(), vec![(0, 1)]);
}

#[test]
fn unknown_alt_setting_is_synchronous() {
    let (engine, _device, interface) = setup();

    let err = interface.set_alt_setting(5).unwrap_err();
    assert_eq!(
        err,
        Error::Usage(UsageError::UnknownAltSetting {
            interface: 0,
            alt: 5
        })
    );
    assert!(engine.alt_settings_activated().is_empty());
    assert_eq!(interface.current_alt_setting(), 0);
}

#[test]
fn claim_and_release() {
    let (engine, device, interface) = setup();

    assert!(!interface.is_claimed());
    interface.claim().unwrap();
    assert!(interface.is_claimed());
    assert!(engine.is_claimed(device.ident(), 0));

    interface.release().unwrap();
    assert!(!interface.is_claimed());
    assert!(!engine.is_claimed(device.ident(), 0));
}

#[test]
fn release_with_live_stream_is_rejected() {
    let (_engine, _device, interface) = setup();
    interface.claim().unwrap();

    let endpoint = interface.endpoint(0x81).unwrap();
    let _stream = endpoint.start_poll(Some(2), Some(64)).unwrap();

    let err = interface.release().unwrap_err();
    assert_eq!(err, Error::Usage(UsageError::StreamsActive));
    assert!(interface.is_claimed());
}

#[tokio::test]
async fn release_and_drain_stops_streams_first() {
    let (engine, device, interface) = setup();
    interface.claim().unwrap();

    let endpoint = interface.endpoint(0x81).unwrap();
    let mut stream = endpoint.start_poll(Some(2), Some(64)).unwrap();
    assert_eq!(engine.in_flight(), 2);

    // Deliver the cancelled completions once the drain is underway.
    let completer = engine.clone();
    tokio::spawn(async move {
        completer.complete_cancelled();
    });

    interface.release_and_drain().await.unwrap();
    assert!(!interface.is_claimed());
    assert!(!engine.is_claimed(device.ident(), 0));
    assert_eq!(engine.in_flight(), 0);

    // The stream observed a clean shutdown.
    assert_eq!(stream.next().await, Some(usb_host::StreamEvent::End));
}

#[test]
fn alt_switch_with_live_stream_is_rejected() {
    let (engine, _device, interface) = setup();

    let endpoint = interface.endpoint(0x81).unwrap();
    let _stream = endpoint.start_poll(None, None).unwrap();

    let err = interface.set_alt_setting(1).unwrap_err();
    assert_eq!(err, Error::Usage(UsageError::StreamsActive));
    assert!(engine.alt_settings_activated().is_empty());
}

#[test]
fn kernel_driver_passthrough() {
    let (engine, device, interface) = setup();

    assert!(!interface.kernel_driver_active().unwrap());
    engine.set_kernel_driver(device.ident(), 0, true);
    assert!(interface.kernel_driver_active().unwrap());

    interface.detach_kernel_driver().unwrap();
    assert!(!interface.kernel_driver_active().unwrap());
    interface.attach_kernel_driver().unwrap();
    assert!(interface.kernel_driver_active().unwrap());
}

#[test]
fn endpoint_properties_from_descriptor() {
    let (_engine, _device, interface) = setup();

    let endpoint = interface.endpoint(0x81).unwrap();
    assert_eq!(endpoint.number(), 1);
    assert_eq!(endpoint.direction(), usb_wire::Direction::In);
    assert_eq!(endpoint.transfer_kind(), usb_wire::TransferKind::Bulk);
    assert_eq!(endpoint.max_packet_size(), 64);
    assert_eq!(endpoint.timeout(), 0);
    endpoint.set_timeout(250);
    assert_eq!(endpoint.timeout(), 250);
}

#[test]
fn clear_halt_reaches_engine() {
    let (engine, _device, interface) = setup();

    let endpoint = interface.endpoint(0x81).unwrap();
    endpoint.clear_halt().unwrap();
    assert_eq!(engine.cleared_halts(), vec![0x81]);
}
