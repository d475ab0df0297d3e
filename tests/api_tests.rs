use std::sync::Arc;

use serde_json::json;
use senz_sync::protocol::{ApiMode, decode_record};
use senz_sync::{
    Error, MessageLogMode, SenzClient, StaticCredentials, ThermostatApi, WireCommand,
};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> SenzClient {
    SenzClient::builder(Arc::new(StaticCredentials::new("token")))
        .base_url(server.uri())
        .build()
        .expect("client should build")
}

#[tokio::test]
async fn fetch_devices_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/Thermostat"))
        .and(header("authorization", "Bearer token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "serialNumber": "A1",
                "name": "Hall",
                "online": true,
                "currentTemperature": 2137,
                "setPointTemperature": 2100,
                "isHeating": true,
                "mode": 1
            },
            { "serialNumber": "B2", "online": false }
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let devices: Vec<_> = client(&server)
        .fetch_devices()
        .await
        .unwrap()
        .iter()
        .map(|v| decode_record(v).unwrap())
        .collect();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].serial_number, "A1");
    assert_eq!(devices[0].name.as_deref(), Some("Hall"));
    assert_eq!(devices[0].current_temperature, Some(2137));
    assert_eq!(devices[1].online, Some(false));
    assert_eq!(devices[1].mode, None);
}

#[tokio::test]
async fn bad_element_does_not_fail_the_list() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/Thermostat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "serialNumber": "A1", "currentTemperature": 2050, "mode": 1 },
            { "serialNumber": "B2", "currentTemperature": 2050.5 },
            { "serialNumber": "C3", "mode": "3" }
        ])))
        .mount(&server)
        .await;

    let elements = client(&server).fetch_devices().await.unwrap();
    assert_eq!(elements.len(), 3);

    let a1 = decode_record(&elements[0]).unwrap();
    assert_eq!(a1.current_temperature, Some(2050));
    for (element, serial) in elements[1..].iter().zip(["B2", "C3"]) {
        let invalid = decode_record(element).unwrap_err();
        assert_eq!(invalid.serial_number.as_deref(), Some(serial));
        assert!(matches!(invalid.error, Error::Json(_)));
    }
}

#[tokio::test]
async fn empty_body_is_an_empty_list() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/Thermostat"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    assert!(client(&server).fetch_devices().await.unwrap().is_empty());
}

#[tokio::test]
async fn fetch_device_reads_one_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/Thermostat/A1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "serialNumber": "A1",
            "mode": 3,
            "setPointTemperature": 500
        })))
        .mount(&server)
        .await;

    let record = client(&server).fetch_device("A1").await.unwrap();
    assert_eq!(record.mode, Some(3));
    assert_eq!(record.set_point_temperature, Some(500));
}

#[tokio::test]
async fn write_command_puts_to_mode_path() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/Mode/manual"))
        .and(header("authorization", "Bearer token"))
        .and(body_json(json!({
            "serialNumber": "A1",
            "temperature": 2150,
            "temperatureType": 0
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let command = WireCommand {
        mode: ApiMode::Manual,
        serial_number: "A1".into(),
        temperature: Some(2150),
        temperature_type: Some(senz_sync::protocol::TemperatureType::Absolute),
    };
    client(&server).write_command(&command).await.unwrap();
}

#[tokio::test]
async fn status_codes_map_to_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/Thermostat"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/Thermostat/GONE"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/Thermostat/BUSY"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/Mode/hold"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({ "Messages": ["Temperature out of range"] })),
        )
        .mount(&server)
        .await;

    let client = client(&server);
    assert!(matches!(
        client.fetch_devices().await,
        Err(Error::Unauthorized)
    ));
    match client.fetch_device("GONE").await {
        Err(Error::NotFound(p)) => assert_eq!(p, "/api/v1/Thermostat/GONE"),
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert!(matches!(
        client.fetch_device("BUSY").await,
        Err(Error::Server(503))
    ));

    let command = WireCommand {
        mode: ApiMode::Hold,
        serial_number: "A1".into(),
        temperature: Some(9900),
        temperature_type: None,
    };
    match client.write_command(&command).await {
        Err(Error::Status { status, message }) => {
            assert_eq!(status, 400);
            assert_eq!(message.as_deref(), Some("Temperature out of range"));
        }
        other => panic!("expected Status, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_bodies_are_protocol_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/Thermostat"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/Thermostat/A1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2])))
        .mount(&server)
        .await;

    let client = client(&server);
    assert!(matches!(
        client.fetch_devices().await,
        Err(Error::Protocol(_))
    ));
    assert!(matches!(
        client.fetch_device("A1").await,
        Err(Error::Protocol(_))
    ));
}

#[tokio::test]
async fn missing_token_fails_without_a_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let client = SenzClient::builder(Arc::new(StaticCredentials::empty()))
        .base_url(server.uri())
        .build()
        .unwrap();
    assert!(matches!(
        client.fetch_devices().await,
        Err(Error::NoCredentials)
    ));
}

#[tokio::test]
async fn message_log_records_traffic() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/Thermostat"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!([{ "serialNumber": "A1", "mode": 1 }])),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/Mode/auto"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let tmp = tempfile::NamedTempFile::new().unwrap();
    let client = SenzClient::builder(Arc::new(StaticCredentials::new("token")))
        .base_url(server.uri())
        .message_log(MessageLogMode::Full, tmp.path().to_string_lossy())
        .build()
        .unwrap();

    client.fetch_devices().await.unwrap();
    let command = WireCommand {
        mode: ApiMode::Auto,
        serial_number: "A1".into(),
        temperature: None,
        temperature_type: None,
    };
    assert!(client.write_command(&command).await.is_err());

    let lines: Vec<serde_json::Value> = std::fs::read_to_string(tmp.path())
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    let dirs: Vec<&str> = lines.iter().map(|l| l["dir"].as_str().unwrap()).collect();
    assert_eq!(dirs, vec!["req", "devices", "cmd", "err"]);
    assert_eq!(lines[1]["body"][0]["serialNumber"], "A1");
    assert_eq!(lines[2]["body"]["serialNumber"], "A1");
    assert_eq!(lines[3]["status"], 500);
}
