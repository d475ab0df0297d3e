use std::env;
use std::sync::Arc;

use senz_sync::{
    Event, SenzClient, SignalRTransport, StaticCredentials, Synchronizer, Thermostat,
};

#[tokio::main]
async fn main() -> senz_sync::Result<()> {
    tracing_subscriber::fmt::init();

    let token = env::var("SENZ_ACCESS_TOKEN").expect("SENZ_ACCESS_TOKEN must be set");
    let serials: Vec<String> = env::args().skip(1).collect();
    if serials.is_empty() {
        eprintln!("usage: monitor <serial> [<serial>...]");
        std::process::exit(2);
    }

    let credentials = Arc::new(StaticCredentials::new(token));
    let client = Arc::new(SenzClient::builder(credentials.clone()).build()?);
    let sync = Synchronizer::builder(client, credentials, Arc::new(SignalRTransport::default()))
        .build()?;

    let mut events = sync.subscribe();
    let mut thermostats = Vec::new();
    for serial in &serials {
        println!("Attaching {serial}...");
        thermostats.push(Thermostat::attach(&sync, serial.as_str()).await);
    }
    println!("Push channel: {}", sync.connection_state());

    while let Ok(event) = events.recv().await {
        match event {
            Event::DeviceUpdated { serial, state } => {
                let temp = state
                    .measure_temperature
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "?".into());
                let target = state
                    .target_temperature
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "?".into());
                println!(
                    "[{serial}] {temp} -> {target} | mode: {} | {}{}",
                    state.operating_mode.map(|m| m.as_capability_str()).unwrap_or("?"),
                    state.settable_mode.map(|m| m.as_capability_str()).unwrap_or("?"),
                    if state.heating { " | HEATING" } else { "" },
                );
            }
            Event::DeviceUnavailable { serial, reason } => {
                println!("[{serial}] unavailable: {reason}");
            }
            Event::ConnectionStateChanged(state) => println!("Push channel: {state}"),
            other => tracing::debug!(?other, "event"),
        }
    }
    Ok(())
}
