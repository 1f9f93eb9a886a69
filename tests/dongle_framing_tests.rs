//! Dongle serial framing: the iM871A HCI stream and the AMB8465 command
//! stream, exercised through the device structs end to end using an in
//! memory duplex stream.

use tokio::io::{duplex, AsyncWriteExt};
use tokio::sync::mpsc;

use wmeters::bus::amb8465::{amb8465_rssi_dbm, Amb8465};
use wmeters::bus::im871a::{
    build_request, im871a_rssi_dbm, Im871a, Im871aDeframer, DEVMGMT_ID, DEVMGMT_MSG_PING_REQ,
    RADIOLINK_ID, RADIOLINK_MSG_WMBUSMSG_IND,
};
use wmeters::bus::BusDevice;
use wmeters::telegram::FrameType;

#[test]
fn test_im871a_radiolink_indication() {
    // A5 82 03 10 ...: ctrl=0x8? no - ctrl nibble 0x4 means rssi attached.
    // Endpoint 2 (radiolink), msgid 3 (telegram indication), 16 bytes of
    // payload and a trailing rssi byte.
    let payload: Vec<u8> = (0x40u8..0x50).collect();
    let mut stream = vec![0xa5, 0x42, 0x03, 0x10];
    stream.extend_from_slice(&payload);
    stream.push(125);

    let mut d = Im871aDeframer::new();
    d.add_bytes(&stream);
    let frame = d.try_frame().expect("exactly one frame");
    assert_eq!(frame.endpoint, RADIOLINK_ID);
    assert_eq!(frame.msgid, RADIOLINK_MSG_WMBUSMSG_IND);
    assert_eq!(frame.payload, payload);
    assert_eq!(frame.rssi_dbm, Some(im871a_rssi_dbm(125)));
    assert!(d.try_frame().is_none());
}

#[test]
fn test_im871a_indication_split_across_reads() {
    let payload: Vec<u8> = (0u8..8).collect();
    let mut stream = vec![0xa5, 0x42, 0x03, 0x08];
    stream.extend_from_slice(&payload);
    stream.push(100);

    let mut d = Im871aDeframer::new();
    d.add_bytes(&stream[..5]);
    assert!(d.try_frame().is_none());
    d.add_bytes(&stream[5..]);
    assert!(d.try_frame().is_some());
}

#[tokio::test]
async fn test_im871a_device_forwards_telegrams() {
    let (client, mut server) = duplex(1024);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut dev = Im871a::new("bus1", "/dev/null", client, tx);

    // A received wmbus message with rssi.
    let wmbus: Vec<u8> = vec![
        0x44, 0x2d, 0x2c, 0x67, 0x67, 0x67, 0x67, 0x30, 0x04, 0x78, 0x02, 0xff, 0x20, 0x00, 0x00,
    ];
    let mut ind = vec![0xa5, 0x42, 0x03, wmbus.len() as u8];
    ind.extend_from_slice(&wmbus);
    ind.push(180);
    server.write_all(&ind).await.unwrap();

    dev.read_and_process().await.unwrap();
    let (about, frame) = rx.try_recv().expect("telegram forwarded");
    assert_eq!(about.frame_type, FrameType::WMBus);
    assert_eq!(about.rssi_dbm, im871a_rssi_dbm(180));
    // The device prepends the length byte the parser wants.
    assert_eq!(frame[0] as usize, wmbus.len());
    assert_eq!(&frame[1..], &wmbus[..]);
}

#[tokio::test]
async fn test_im871a_ping_request_response() {
    let (client, mut server) = duplex(1024);
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut dev = Im871a::new("bus1", "/dev/null", client, tx);

    // Queue the response before issuing the request; the duplex stream
    // buffers it.
    server
        .write_all(&[0xa5, DEVMGMT_ID, 0x02, 0x00])
        .await
        .unwrap();
    dev.ping().await.expect("ping answered");

    // The request went out on the wire.
    let mut buf = [0u8; 16];
    use tokio::io::AsyncReadExt;
    let n = server.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &build_request(DEVMGMT_ID, DEVMGMT_MSG_PING_REQ, &[])[..]);
}

#[tokio::test]
async fn test_amb8465_device_forwards_bare_telegrams() {
    let (client, mut server) = duplex(1024);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut dev = Amb8465::new("bus2", "/dev/null", client, tx);

    let mut telegram = vec![0x0e, 0x44, 0x2d, 0x2c];
    telegram.extend_from_slice(&[0u8; 11]);
    let mut stream = telegram.clone();
    stream.push(90); // rssi byte

    server.write_all(&stream).await.unwrap();
    dev.read_and_process().await.unwrap();

    let (about, frame) = rx.try_recv().expect("telegram forwarded");
    assert_eq!(frame, telegram);
    assert_eq!(about.rssi_dbm, amb8465_rssi_dbm(90));
}

#[test]
fn test_amb8465_rssi_formula() {
    assert_eq!(amb8465_rssi_dbm(200), (200 - 256) / 2 - 74);
    assert_eq!(amb8465_rssi_dbm(100), 100 / 2 - 74);
}
