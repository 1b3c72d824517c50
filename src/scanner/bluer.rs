//! BlueZ D-Bus radio facility.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{
    EVENT_CHANNEL_BUFFER_SIZE, PowerState, Radio, RadioError, RadioEvent, RawAdvertisement,
};
use crate::decoder::RUUVI_MANUFACTURER_ID;
use crate::logger::Logger;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::StreamExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

impl From<bluer::Error> for RadioError {
    fn from(err: bluer::Error) -> Self {
        RadioError(err.to_string())
    }
}

/// Default adapter of the local BlueZ daemon.
///
/// Power changes and advertisements are pushed into the channel returned by
/// [`BluerRadio::open`]; discovery only produces advertisements between
/// `start_discovery` and `stop_discovery`.
pub struct BluerRadio {
    _session: Session,
    adapter: Adapter,
    events: mpsc::Sender<RadioEvent>,
    discovery: Mutex<Option<JoinHandle<()>>>,
    log: Logger,
}

impl BluerRadio {
    /// Connect to BlueZ and start watching the adapter's power state.
    ///
    /// The current power state is sent as the first event so a scanner
    /// attached to an already powered adapter starts right away.
    pub async fn open(
        log: &Logger,
    ) -> Result<(Arc<Self>, mpsc::Receiver<RadioEvent>), RadioError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        let log = log.for_target("ruuvi_station::scanner::bluer");
        log.info(format_args!("using Bluetooth adapter {}", adapter.name()));

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);

        let powered = adapter.is_powered().await?;
        let adapter_events = adapter.events().await?;
        let power_tx = tx.clone();
        tokio::spawn(async move {
            if power_tx
                .send(RadioEvent::Power(PowerState::from(powered)))
                .await
                .is_err()
            {
                return;
            }
            let mut adapter_events = Box::pin(adapter_events);
            while let Some(event) = adapter_events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) = event
                    && power_tx
                        .send(RadioEvent::Power(PowerState::from(on)))
                        .await
                        .is_err()
                {
                    break;
                }
            }
        });

        let radio = BluerRadio {
            _session: session,
            adapter,
            events: tx,
            discovery: Mutex::new(None),
            log,
        };
        Ok((Arc::new(radio), rx))
    }

    async fn begin(&self) -> Result<(), RadioError> {
        // Every advertisement counts, so BlueZ must not collapse duplicates.
        let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
        };
        if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            self.log
                .warn(format_args!("Failed to set discovery filter: {e}"));
        }

        let discovery = self.adapter.discover_devices_with_changes().await?;
        let adapter = self.adapter.clone();
        let tx = self.events.clone();
        let log = self.log.clone();

        let task = tokio::spawn(async move {
            let mut discovery = Box::pin(discovery);
            while let Some(event) = discovery.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                match read_advertisement(&adapter, address).await {
                    Ok(Some(advertisement)) => {
                        if tx
                            .send(RadioEvent::Advertisement(advertisement))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => log.debug(format_args!("skipping {address}: {e}")),
                }
            }
        });

        if let Ok(mut slot) = self.discovery.lock()
            && let Some(previous) = slot.replace(task)
        {
            previous.abort();
        }
        Ok(())
    }

    fn end(&self) -> Result<(), RadioError> {
        let task = self
            .discovery
            .lock()
            .map_err(|_| RadioError("discovery handle poisoned".to_string()))?
            .take();
        // Dropping the discovery stream ends the BlueZ discovery session.
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }
}

impl Radio for BluerRadio {
    fn start_discovery(&self) -> BoxFuture<'_, Result<(), RadioError>> {
        Box::pin(self.begin())
    }

    fn stop_discovery(&self) -> BoxFuture<'_, Result<(), RadioError>> {
        Box::pin(async move { self.end() })
    }
}

/// Read name, signal strength and manufacturer data of a discovered device.
///
/// Devices without manufacturer data are skipped.
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> Result<Option<RawAdvertisement>, RadioError> {
    let device = adapter.device(address)?;

    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(None);
    };
    let Some(payload) = manufacturer_payload(&manufacturer_data) else {
        return Ok(None);
    };

    let device_name = device
        .name()
        .await?
        .unwrap_or_else(|| address.to_string());
    let rssi = device.rssi().await?.unwrap_or_default();

    Ok(Some(RawAdvertisement {
        device_name,
        rssi,
        payload,
    }))
}

/// BlueZ strips the company identifier; put it back in front so offsets match
/// the over-the-air layout. Ruuvi data wins when a device advertises several.
fn manufacturer_payload(manufacturer_data: &HashMap<u16, Vec<u8>>) -> Option<Vec<u8>> {
    let (id, data) = manufacturer_data
        .get_key_value(&RUUVI_MANUFACTURER_ID)
        .or_else(|| manufacturer_data.iter().min_by_key(|(id, _)| **id))?;

    let mut payload = Vec::with_capacity(data.len() + 2);
    payload.extend_from_slice(&id.to_le_bytes());
    payload.extend_from_slice(data);
    Some(payload)
}
