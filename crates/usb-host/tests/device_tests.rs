//! Device model integration tests: descriptor caching, control transfers,
//! BOS fetching, configuration changes.

use std::sync::Arc;

use usb_host::mock::{
    AltSpec, EndpointSpec, MockDevice, MockEngine, build_config_descriptor,
    build_device_descriptor,
};
use usb_host::{ControlData, Device, Error, HostContext, TransferError, UsageError};
use usb_wire::SetupPacket;

fn bulk_in_config(value: u8) -> Vec<u8> {
    build_config_descriptor(
        value,
        0,
        &[AltSpec {
            alt: 0,
            endpoints: vec![EndpointSpec {
                address: 0x81,
                attributes: 0x02,
                max_packet_size: 64,
            }],
        }],
    )
}

fn setup(bcd_usb: u16) -> (Arc<MockEngine>, Arc<Device>) {
    let engine = Arc::new(MockEngine::new());
    engine.add_device(
        MockDevice::new(1, 5, build_device_descriptor(0x1234, 0x5678, bcd_usb))
            .with_config(bulk_in_config(1)),
    );

    let context = HostContext::with_engine(engine.clone());
    let device = context.devices().unwrap().remove(0);
    (engine, device)
}

/// A minimal BOS block: 5-byte header plus capability records of 7 and 10
/// bytes, wTotalLength 22.
fn two_capability_bos() -> Vec<u8> {
    let mut bytes = vec![0x05, 0x0f, 22, 0x00, 0x02];
    bytes.extend_from_slice(&[0x07, 0x10, 0x02, 1, 2, 3, 4]);
    bytes.extend_from_slice(&[0x0a, 0x10, 0x03, 5, 6, 7, 8, 9, 10, 11]);
    bytes
}

#[test]
fn config_descriptor_computed_at_most_once() {
    let (engine, device) = setup(0x0200);
    device.open().unwrap();
    assert_eq!(engine.active_config_reads(), 1);

    let first = device.config_descriptor().unwrap().unwrap();
    let second = device.config_descriptor().unwrap().unwrap();
    assert_eq!(first, second);
    assert_eq!(engine.active_config_reads(), 1);
}

#[test]
fn unconfigured_device_reports_absent_configurations() {
    let engine = Arc::new(MockEngine::new());
    engine.add_device(MockDevice::new(
        1,
        7,
        build_device_descriptor(0x1234, 0x5678, 0x0200),
    ));
    let context = HostContext::with_engine(engine.clone());
    let device = context.devices().unwrap().remove(0);
    device.open().unwrap();

    // No active configuration is an absence, not an error.
    assert_eq!(device.config_descriptor().unwrap(), None);
    assert!(device.all_config_descriptors().unwrap().is_empty());
    assert!(device.interfaces().unwrap().is_empty());

    // The absence is cached the same way a present configuration is.
    assert_eq!(device.config_descriptor().unwrap(), None);
    assert!(device.all_config_descriptors().unwrap().is_empty());
    assert_eq!(engine.active_config_reads(), 1);
    assert_eq!(engine.config_list_reads(), 1);
}

#[test]
fn all_config_descriptors_lists_every_configuration() {
    let engine = Arc::new(MockEngine::new());
    engine.add_device(
        MockDevice::new(1, 5, build_device_descriptor(0x1234, 0x5678, 0x0200))
            .with_config(bulk_in_config(1))
            .with_config(bulk_in_config(2)),
    );
    let context = HostContext::with_engine(engine.clone());
    let device = context.devices().unwrap().remove(0);

    let configs = device.all_config_descriptors().unwrap();
    assert_eq!(configs.len(), 2);
    assert_eq!(configs[0].configuration_value, 1);
    assert_eq!(configs[1].configuration_value, 2);

    device.all_config_descriptors().unwrap();
    assert_eq!(engine.config_list_reads(), 1);
}

#[test]
fn enumeration_and_lookup() {
    let engine = Arc::new(MockEngine::new());
    engine.add_device(MockDevice::new(
        1,
        1,
        build_device_descriptor(0xaaaa, 0x0001, 0x0200),
    ));
    engine.add_device(MockDevice::new(
        1,
        2,
        build_device_descriptor(0xbbbb, 0x0002, 0x0200),
    ));

    let context = HostContext::with_engine(engine);
    assert_eq!(context.devices().unwrap().len(), 2);

    let found = context.find_device(0xbbbb, 0x0002).unwrap().unwrap();
    assert_eq!(found.address(), 2);
    assert!(context.find_device(0xcccc, 0x0003).unwrap().is_none());
}

#[tokio::test]
async fn control_out_carries_payload_length() {
    let (engine, device) = setup(0x0200);
    device.open().unwrap();
    engine.script_control(Ok(Vec::new()));

    let payload = vec![0xde, 0xad, 0xbe, 0xef, 0x55];
    let result = device
        .control_transfer(0x40, 0x01, 0x0002, 0x0003, ControlData::Out(payload.clone()))
        .await
        .unwrap();
    assert!(result.is_empty());

    let submissions = engine.submissions();
    assert_eq!(submissions.len(), 1);
    let setup = SetupPacket::decode(&submissions[0].buffer[..8]).unwrap();
    assert_eq!(setup.request_type, 0x40);
    assert_eq!(setup.request, 0x01);
    assert_eq!(setup.value, 0x0002);
    assert_eq!(setup.index, 0x0003);
    assert_eq!(usize::from(setup.length), payload.len());
    assert_eq!(&submissions[0].buffer[8..], payload.as_slice());
}

#[tokio::test]
async fn control_in_bounded_by_device_response() {
    let (engine, device) = setup(0x0200);
    device.open().unwrap();
    engine.script_control(Ok(vec![0x11, 0x22, 0x33]));

    let result = device
        .control_transfer(0xc0, 0x10, 0, 0, ControlData::In(16))
        .await
        .unwrap();
    assert_eq!(result, vec![0x11, 0x22, 0x33]);

    let setup = SetupPacket::decode(&engine.submissions()[0].buffer[..8]).unwrap();
    assert_eq!(setup.length, 16);
}

#[tokio::test]
async fn control_direction_mismatch_is_synchronous() {
    let (engine, device) = setup(0x0200);
    device.open().unwrap();

    // OUT request_type with IN data: rejected before any submission.
    let err = device
        .control_transfer(0x40, 0x01, 0, 0, ControlData::In(4))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Usage(UsageError::ControlDirectionMismatch));

    let err = device
        .control_transfer(0xc0, 0x01, 0, 0, ControlData::Out(vec![1]))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Usage(UsageError::ControlDirectionMismatch));

    assert!(engine.submissions().is_empty());
}

#[tokio::test]
async fn control_requires_open_device() {
    let (engine, device) = setup(0x0200);

    let err = device
        .control_transfer(0xc0, 0x10, 0, 0, ControlData::In(4))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Usage(UsageError::DeviceNotOpen));
    assert!(engine.submissions().is_empty());
}

#[tokio::test]
async fn control_transport_error_propagates() {
    let (engine, device) = setup(0x0200);
    device.open().unwrap();
    engine.script_control(Err(TransferError::Timeout));

    let err = device
        .control_transfer(0xc0, 0x10, 0, 0, ControlData::In(4))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Transfer(TransferError::Timeout));
}

#[tokio::test]
async fn bos_short_circuits_below_usb_201() {
    let (engine, device) = setup(0x0200);
    device.open().unwrap();

    assert!(device.bos_descriptor().await.unwrap().is_none());
    assert!(device.capabilities().await.unwrap().is_empty());
    // No transfer ever reached the bus.
    assert!(engine.submissions().is_empty());
}

#[tokio::test]
async fn bos_two_phase_fetch_and_cache() {
    let (engine, device) = setup(0x0210);
    device.open().unwrap();

    let bos = two_capability_bos();
    engine.script_control(Ok(bos[..5].to_vec()));
    engine.script_control(Ok(bos.clone()));

    let parsed = device.bos_descriptor().await.unwrap().unwrap();
    assert_eq!(parsed.total_length, 22);
    assert_eq!(parsed.capabilities.len(), 2);
    assert_eq!(parsed.capabilities[0].capability_type, 0x02);
    assert_eq!(parsed.capabilities[1].data.len(), 7);

    let submissions = engine.submissions();
    assert_eq!(submissions.len(), 2);
    let probe = SetupPacket::decode(&submissions[0].buffer[..8]).unwrap();
    assert_eq!(probe.length, 5);
    let full = SetupPacket::decode(&submissions[1].buffer[..8]).unwrap();
    assert_eq!(full.length, 22);

    // Cached for the rest of the open session.
    device.bos_descriptor().await.unwrap().unwrap();
    assert_eq!(engine.submissions().len(), 2);
}

#[tokio::test]
async fn bos_stall_means_no_bos() {
    let (engine, device) = setup(0x0210);
    device.open().unwrap();
    engine.script_control(Err(TransferError::Pipe));

    assert!(device.bos_descriptor().await.unwrap().is_none());
    assert_eq!(engine.submissions().len(), 1);

    // The absence is cached too.
    assert!(device.bos_descriptor().await.unwrap().is_none());
    assert_eq!(engine.submissions().len(), 1);
}

#[tokio::test]
async fn bos_cache_cleared_on_close() {
    let (engine, device) = setup(0x0210);
    device.open().unwrap();
    engine.script_control(Err(TransferError::Pipe));
    assert!(device.bos_descriptor().await.unwrap().is_none());

    device.close();
    device.open().unwrap();
    engine.script_control(Err(TransferError::Pipe));
    assert!(device.bos_descriptor().await.unwrap().is_none());
    assert_eq!(engine.submissions().len(), 2);
}

#[tokio::test]
async fn string_descriptor_decodes_utf16() {
    let (engine, device) = setup(0x0200);
    device.open().unwrap();

    // bLength 10, type STRING, then "Acme" in UTF-16LE
    engine.script_control(Ok(vec![
        0x0a, 0x03, b'A', 0x00, b'c', 0x00, b'm', 0x00, b'e', 0x00,
    ]));

    let name = device.string_descriptor(2).await.unwrap();
    assert_eq!(name.as_deref(), Some("Acme"));

    let setup = SetupPacket::decode(&engine.submissions()[0].buffer[..8]).unwrap();
    assert_eq!(setup.value, 0x0302);
    assert_eq!(setup.index, 0x0409);
}

#[tokio::test]
async fn string_index_zero_is_absent() {
    let (engine, device) = setup(0x0200);
    device.open().unwrap();

    assert!(device.string_descriptor(0).await.unwrap().is_none());
    assert!(engine.submissions().is_empty());
}

#[test]
fn set_configuration_rebuilds_interfaces() {
    let engine = Arc::new(MockEngine::new());
    let second_config = build_config_descriptor(
        2,
        3,
        &[AltSpec {
            alt: 0,
            endpoints: vec![EndpointSpec {
                address: 0x02,
                attributes: 0x02,
                max_packet_size: 512,
            }],
        }],
    );
    engine.add_device(
        MockDevice::new(1, 5, build_device_descriptor(0x1234, 0x5678, 0x0200))
            .with_config(bulk_in_config(1))
            .with_config(second_config),
    );

    let context = HostContext::with_engine(engine.clone());
    let device = context.devices().unwrap().remove(0);
    device.open().unwrap();
    assert!(device.interface(0).unwrap().is_some());

    device.set_configuration(2).unwrap();
    assert!(device.interface(0).unwrap().is_none());
    let interface = device.interface(3).unwrap().unwrap();
    assert_eq!(interface.endpoints()[0].address(), 0x02);
    // One read for the original configuration, one after the switch.
    assert_eq!(engine.active_config_reads(), 2);
}

#[test]
fn set_configuration_failure_keeps_state() {
    let (engine, device) = setup(0x0200);
    device.open().unwrap();

    // Value 9 matches no configuration block.
    assert!(device.set_configuration(9).is_err());
    assert!(device.interface(0).unwrap().is_some());
    assert_eq!(engine.active_config_reads(), 1);
}

#[test]
fn reset_requires_open_device() {
    let (engine, device) = setup(0x0200);

    assert!(matches!(
        device.reset(),
        Err(Error::Usage(UsageError::DeviceNotOpen))
    ));
    assert_eq!(engine.resets(), 0);

    device.open().unwrap();
    device.reset().unwrap();
    assert_eq!(engine.resets(), 1);
}

#[test]
fn closed_device_rejects_interface_access() {
    let (engine, device) = setup(0x0200);

    assert!(matches!(
        device.interface(0),
        Err(Error::Usage(UsageError::DeviceNotOpen))
    ));

    device.open().unwrap();
    assert!(device.is_open());
    assert!(engine.is_open(device.ident()));
    assert!(device.interface(0).unwrap().is_some());

    device.close();
    assert!(!device.is_open());
    assert!(!engine.is_open(device.ident()));
    assert!(matches!(
        device.interface(0),
        Err(Error::Usage(UsageError::DeviceNotOpen))
    ));
}

#[test]
fn parent_identity_is_cached() {
    let engine = Arc::new(MockEngine::new());
    let hub = MockDevice::new(1, 1, build_device_descriptor(0x0409, 0x005a, 0x0200));
    let hub_ident = hub.ident.clone();
    let mut leaf = MockDevice::new(1, 5, build_device_descriptor(0x1234, 0x5678, 0x0200));
    leaf.parent = Some(hub_ident.clone());
    engine.add_device(hub);
    engine.add_device(leaf);

    let context = HostContext::with_engine(engine);
    let device = context.find_device(0x1234, 0x5678).unwrap().unwrap();
    assert_eq!(device.parent(), Some(hub_ident));
}

#[tokio::test]
async fn device_info_resolves_strings() {
    let (engine, device) = setup(0x0200);
    device.open().unwrap();

    // Indexes 1, 2, 3 from the descriptor builder, fetched in that order.
    engine.script_control(Ok(vec![0x06, 0x03, b'V', 0x00, b'n', 0x00]));
    engine.script_control(Ok(vec![0x06, 0x03, b'P', 0x00, b'd', 0x00]));
    engine.script_control(Ok(vec![0x06, 0x03, b'0', 0x00, b'1', 0x00]));

    let info = device.info().await.unwrap();
    assert_eq!(info.vendor_id, 0x1234);
    assert_eq!(info.product_id, 0x5678);
    assert_eq!(info.manufacturer.as_deref(), Some("Vn"));
    assert_eq!(info.product.as_deref(), Some("Pd"));
    assert_eq!(info.serial_number.as_deref(), Some("01"));
}
