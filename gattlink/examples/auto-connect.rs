use std::time::Duration;

use futures::StreamExt;
use log::{info, warn};

use gattlink::connection::ConnectOptions;
use gattlink::fake::{self, FakeRadio, HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID};
use gattlink::session::SessionConfig;
use gattlink::GattStatus;

// The first byte holds flags; bit 0 says whether the value is 8 or 16 bits wide
fn parse_heart_rate(value: &[u8]) -> Option<u16> {
    let flags = *value.first()?;
    if flags & 0x1 == 0 {
        value.get(1).map(|bpm| *bpm as u16)
    } else {
        Some(u16::from_le_bytes([*value.get(1)?, *value.get(2)?]))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::formatted_builder().filter_level(log::LevelFilter::Info) // Default Log Level
                                          .parse_default_env()
                                          .init();

    let radio = FakeRadio::new();
    radio.add_advertiser(fake::sample_device());
    radio.set_services(fake::sample_services());

    let session = radio.start_session(SessionConfig::new()).await?;
    let connection = session.auto_connect(HEART_RATE_SERVICE_UUID, ConnectOptions::new().mtu(185))
                            .await?;
    info!("Connected to {} (mtu = {})", connection.device().address, connection.mtu());

    let measurement = connection.get_characteristic(HEART_RATE_SERVICE_UUID,
                                                    HEART_RATE_MEASUREMENT_UUID)
                                .await?;
    let observer = connection.enable_notification(&measurement, None).await?;

    // Play the part of the remote: a few measurements and then it wanders off
    let remote = radio.clone();
    let link_id = connection.link_id();
    let handle = measurement.handle;
    tokio::spawn(async move {
        for bpm in 62u8..72 {
            tokio::time::sleep(Duration::from_millis(250)).await;
            remote.notify(link_id, handle, &[0x00, bpm]);
        }
        remote.drop_link(link_id, GattStatus(0x08));
    });

    let values = observer.into_stream();
    futures::pin_mut!(values);
    while let Some(value) = values.next().await {
        match parse_heart_rate(&value) {
            Some(bpm) => info!("Heart rate: {} bpm", bpm),
            None => warn!("Malformed heart rate measurement: {:?}", value),
        }
    }

    info!("Connection closed");
    Ok(())
}
