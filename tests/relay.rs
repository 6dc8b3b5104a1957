//! Config relay against a fake device socket.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::UdpSocket;

use nm_monitor::codec::Record;
use nm_monitor::registry::DeviceRegistry;
use nm_monitor::relay::ConfigRelay;

fn relay_for(device: &UdpSocket) -> ConfigRelay {
    let registry = Arc::new(DeviceRegistry::new(Duration::from_secs(300), Duration::from_secs(10)));
    ConfigRelay::new(registry, device.local_addr().unwrap().port())
}

#[tokio::test]
async fn request_gets_the_device_reply() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay = relay_for(&device);

    let fake = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        let (len, from) = device.recv_from(&mut buf).await.unwrap();
        let request: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(request, json!({"command": "get_config"}));
        let reply = json!({"WiFiSSID": "farm", "PoolUrl": "stratum+tcp://pool:3333"});
        device.send_to(reply.to_string().as_bytes(), from).await.unwrap();
    });

    let config = relay
        .request_config_from_device("127.0.0.1".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(config["WiFiSSID"], "farm");
    fake.await.unwrap();
}

#[tokio::test]
async fn send_repeats_the_config_three_times() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay = relay_for(&device);

    let mut config = Record::new();
    config.insert("Brightness".into(), json!(80));
    relay
        .send_config_to_device("127.0.0.1".parse().unwrap(), &config)
        .await
        .unwrap();

    let mut buf = [0u8; 512];
    for _ in 0..3 {
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), device.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let received: Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(received, json!({"Brightness": 80}));
    }
}

#[tokio::test]
async fn request_ignores_replies_from_other_hosts() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay = relay_for(&device);

    let fake = tokio::spawn(async move {
        let mut buf = [0u8; 512];
        let (_, from) = device.recv_from(&mut buf).await.unwrap();

        // another loopback address answers first
        let stranger = UdpSocket::bind("127.0.0.2:0").await.unwrap();
        let spoofed = json!({"WiFiSSID": "spoofed"});
        stranger.send_to(spoofed.to_string().as_bytes(), from).await.unwrap();

        let reply = json!({"WiFiSSID": "farm"});
        device.send_to(reply.to_string().as_bytes(), from).await.unwrap();
    });

    let config = relay
        .request_config_from_device("127.0.0.1".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(config["WiFiSSID"], "farm");
    fake.await.unwrap();
}
