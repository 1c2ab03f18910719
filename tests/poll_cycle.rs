//! Full poll cycles against loopback servers speaking Modbus RTU-over-TCP and Modbus TCP.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use energy_collector::modbus::encode_request;
use energy_collector::output::MeasurementSink;
use energy_collector::{Config, DataService, ModbusError, SensorValue, TemplateStore};

/// Register contents served by both fake servers.
fn register_value(unit: u8, address: u16) -> u16 {
    address + unit as u16 * 1000
}

fn register_bytes(unit: u8, address: u16, count: u16) -> Vec<u8> {
    (address..address + count)
        .flat_map(|a| register_value(unit, a).to_be_bytes())
        .collect()
}

/// Transparent RS-485 gateway: raw RTU frames over TCP.
async fn spawn_rtu_gateway(connections: Arc<AtomicUsize>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut request = [0u8; 8];
                while socket.read_exact(&mut request).await.is_ok() {
                    let unit = request[0];
                    let address = u16::from_be_bytes([request[2], request[3]]);
                    let count = u16::from_be_bytes([request[4], request[5]]);

                    let mut payload = vec![(count * 2) as u8];
                    payload.extend(register_bytes(unit, address, count));
                    let response = encode_request(unit, 0x03, &payload);
                    if socket.write_all(&response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// Modbus TCP server answering read holding registers.
async fn spawn_mbap_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let mut request = [0u8; 12];
                while socket.read_exact(&mut request).await.is_ok() {
                    let unit = request[6];
                    let address = u16::from_be_bytes([request[8], request[9]]);
                    let count = u16::from_be_bytes([request[10], request[11]]);

                    let data = register_bytes(unit, address, count);
                    let mut response = Vec::new();
                    response.extend_from_slice(&request[0..4]);
                    response.extend_from_slice(&(3 + data.len() as u16).to_be_bytes());
                    response.push(unit);
                    response.push(0x03);
                    response.push(data.len() as u8);
                    response.extend(data);
                    if socket.write_all(&response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

#[derive(Default)]
struct CaptureSink {
    readings: Mutex<BTreeMap<String, (String, BTreeMap<String, SensorValue>)>>,
}

#[async_trait]
impl MeasurementSink for CaptureSink {
    async fn publish(
        &self,
        equipment: &str,
        manufacturer: &str,
        values: &BTreeMap<String, SensorValue>,
    ) -> Result<(), ModbusError> {
        self.readings
            .lock()
            .unwrap()
            .insert(equipment.to_string(), (manufacturer.to_string(), values.clone()));
        Ok(())
    }

    async fn publish_offline(&self, _equipment: &str, _manufacturer: &str) -> Result<(), ModbusError> {
        Ok(())
    }
}

const INVERTER_TEMPLATE: &str = r#"
[metadata]
manufacturer = "Deye"
model = "SUN-12K"

[sensors.battery_voltage]
name = "Battery Voltage"
address = 587
kind = "uint16"
factor = 0.01
unit = "V"

[sensors.battery_current]
name = "Battery Current"
address = 591
kind = "int16"
factor = 0.01
unit = "A"
"#;

const METER_TEMPLATE: &str = r#"
[metadata]
manufacturer = "Eastron"
model = "SDM630"

[connection]
default_batch_size = 8

[sensors.grid_power]
name = "Grid Power"
address = 10
kind = "int16"
unit = "W"

[sensors.frequency]
name = "Frequency"
address = 40
kind = "uint16"
factor = 0.01
unit = "Hz"
"#;

#[tokio::test]
async fn test_one_cycle_across_shared_gateway_and_tcp_server() {
    let connections = Arc::new(AtomicUsize::new(0));
    let gateway_port = spawn_rtu_gateway(Arc::clone(&connections)).await;
    let tcp_port = spawn_mbap_server().await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("deye.toml"), INVERTER_TEMPLATE).unwrap();
    std::fs::write(dir.path().join("meter.toml"), METER_TEMPLATE).unwrap();

    let config = Config::from_toml(&format!(
        r#"
        collector_name = "Loopback"
        templates_dir = "{dir}"

        [[equipment]]
        name = "Inverter"
        template = "deye"
        driver = "raw_tcp_rtu"
        path = "127.0.0.1:{gateway}"
        unit_id = 1

        [[equipment]]
        name = "Meter"
        template = "meter"
        driver = "raw_tcp_rtu"
        path = "127.0.0.1:{gateway}"
        unit_id = 2

        [[equipment]]
        name = "Grid Meter"
        template = "meter"
        driver = "modbus_tcp"
        path = "127.0.0.1:{tcp}"
        unit_id = 3

        [[equipment]]
        name = "Spare"
        template = "meter"
        driver = "modbus_tcp"
        path = "127.0.0.1:1"
        enabled = false
        "#,
        dir = dir.path().display(),
        gateway = gateway_port,
        tcp = tcp_port,
    ))
    .unwrap();

    let store = TemplateStore::new(&config.templates_dir);
    let sink = Arc::new(CaptureSink::default());
    let mut service = DataService::new(config, &store, sink.clone()).unwrap();
    assert_eq!(service.equipment().len(), 3);
    assert_eq!(service.equipment()[1].batches().len(), 2);

    assert_eq!(service.read_all_once().await.unwrap(), 3);
    assert_eq!(service.pool().len().await, 2);
    service.pool().close_all().await;

    let readings = sink.readings.lock().unwrap();
    let (manufacturer, inverter) = &readings["Inverter"];
    assert_eq!(manufacturer, "Deye");
    assert_eq!(inverter["battery_voltage"], SensorValue::Number(15.87));
    assert_eq!(inverter["battery_current"], SensorValue::Number(15.91));

    let (_, meter) = &readings["Meter"];
    assert_eq!(meter["grid_power"], SensorValue::Number(2010.0));
    assert_eq!(meter["frequency"], SensorValue::Number(20.4));

    let (manufacturer, grid) = &readings["Grid Meter"];
    assert_eq!(manufacturer, "Eastron");
    assert_eq!(grid["grid_power"], SensorValue::Number(3010.0));
    assert_eq!(grid["frequency"], SensorValue::Number(30.4));

    // Both gateway devices went through one pooled connection.
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}
