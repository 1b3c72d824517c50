//! Turns raw advertisements from the target tag into stored readings.

use crate::decoder::{self, DecodeError};
use crate::logger::Logger;
use crate::reading::{DecodedReading, SensorReading};
use crate::scanner::{RawAdvertisement, Scanner};
use crate::store::{ReadingSink, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// What happened to one advertisement.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Not from the target device
    Ignored,
    /// From the target device but not decodable; dropped
    Rejected(DecodeError),
    Stored,
    /// Decoded, but the sink failed or timed out; dropped
    StoreFailed,
}

pub struct IngestionPipeline {
    target_name: String,
    sink: Arc<dyn ReadingSink>,
    store_timeout: Duration,
    log: Logger,
}

impl IngestionPipeline {
    /// `target_name` is compared exactly (case-sensitive) against the
    /// advertised device name.
    pub fn new(
        target_name: impl Into<String>,
        sink: Arc<dyn ReadingSink>,
        store_timeout: Duration,
        log: &Logger,
    ) -> Self {
        IngestionPipeline {
            target_name: target_name.into(),
            sink,
            store_timeout,
            log: log.for_target("ruuvi_station::pipeline"),
        }
    }

    /// Register this pipeline as an observer of `scanner`.
    pub fn attach(self: &Arc<Self>, scanner: &Scanner) {
        let pipeline = self.clone();
        scanner.on_discovery(move |advertisement| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                pipeline.handle(&advertisement).await;
            })
        });
    }

    /// Filter, decode, timestamp and store one advertisement.
    ///
    /// Never fails: every problem is logged and the event dropped, so the
    /// next advertisement is handled independently.
    pub async fn handle(&self, advertisement: &RawAdvertisement) -> IngestOutcome {
        if advertisement.device_name != self.target_name {
            return IngestOutcome::Ignored;
        }

        let decoded = match decoder::ensure_v5(&advertisement.payload)
            .and_then(|()| decoder::decode(&advertisement.payload))
        {
            Ok(decoded) => decoded,
            Err(error) => {
                self.log.warn(format_args!(
                    "dropping frame from {}: {error}",
                    advertisement.device_name
                ));
                return IngestOutcome::Rejected(error);
            }
        };

        self.log_summary(&advertisement.device_name, &decoded);

        let reading = SensorReading {
            device_name: advertisement.device_name.clone(),
            received_at: Utc::now(),
            rssi: advertisement.rssi,
            decoded,
            raw: advertisement.payload.clone(),
        };

        let result = tokio::time::timeout(self.store_timeout, self.sink.insert(reading))
            .await
            .unwrap_or(Err(StoreError::Timeout(self.store_timeout)));
        match result {
            Ok(()) => {
                self.log.debug(format_args!("reading saved"));
                IngestOutcome::Stored
            }
            Err(error) => {
                self.log
                    .error(format_args!("Error saving sensor reading: {error}"));
                IngestOutcome::StoreFailed
            }
        }
    }

    fn log_summary(&self, device_name: &str, d: &DecodedReading) {
        let optional = |value: Option<String>| value.unwrap_or_else(|| "n/a".to_string());
        self.log.info(format_args!(
            "New data from {device_name} ({}): temperature={}°C humidity={}% pressure={} Pa \
             acceleration=({}, {}, {}) mg movements={} battery={} mV txPower={} dBm sequence={}",
            d.mac,
            d.temperature,
            optional(d.humidity.map(|v| v.to_string())),
            optional(d.pressure.map(|v| v.to_string())),
            optional(d.acceleration_x.map(|v| v.to_string())),
            optional(d.acceleration_y.map(|v| v.to_string())),
            optional(d.acceleration_z.map(|v| v.to_string())),
            d.movement_counter,
            d.battery_mv,
            d.tx_power,
            d.measurement_sequence,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::CapturedLog;
    use crate::scanner::{PowerState, ScanState};
    use crate::store::MemoryStore;
    use crate::test_utils::{
        FailingSink, FakeRadio, KNOWN_PAYLOAD, StallingSink, advertisement, payload_with,
    };
    use log::Level;

    const TARGET: &str = "Ruuvi C2A9";

    fn pipeline(sink: Arc<dyn ReadingSink>) -> (IngestionPipeline, Arc<CapturedLog>) {
        let (log, captured) = Logger::capture();
        (
            IngestionPipeline::new(TARGET, sink, Duration::from_secs(5), &log),
            captured,
        )
    }

    #[tokio::test]
    async fn stores_matching_frames_with_context() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, captured) = pipeline(store.clone());

        let before = Utc::now();
        let outcome = pipeline.handle(&advertisement(TARGET)).await;
        assert_eq!(outcome, IngestOutcome::Stored);

        let readings = store.readings();
        assert_eq!(readings.len(), 1);
        let reading = &readings[0];
        assert_eq!(reading.device_name, TARGET);
        assert_eq!(reading.rssi, -74);
        assert_eq!(reading.raw, KNOWN_PAYLOAD.to_vec());
        assert_eq!(reading.decoded, decoder::decode(&KNOWN_PAYLOAD).unwrap());
        assert!(reading.received_at >= before);
        assert!(captured.contains("New data from Ruuvi C2A9 (F3:30:FE:2F:C2:A9)"));
    }

    #[tokio::test]
    async fn other_devices_are_ignored_silently() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, captured) = pipeline(store.clone());

        assert_eq!(
            pipeline.handle(&advertisement("ruuvi c2a9")).await,
            IngestOutcome::Ignored
        );
        assert_eq!(
            pipeline.handle(&advertisement("Ruuvi C2A9 ")).await,
            IngestOutcome::Ignored
        );
        assert!(store.is_empty());
        assert!(captured.lines().is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_logged() {
        let store = Arc::new(MemoryStore::new());
        let (pipeline, captured) = pipeline(store.clone());

        let mut short = advertisement(TARGET);
        short.payload.truncate(20);
        assert_eq!(
            pipeline.handle(&short).await,
            IngestOutcome::Rejected(DecodeError::TooShort { len: 20 })
        );

        let mut v3 = advertisement(TARGET);
        v3.payload = payload_with(&[(2, 3)]);
        assert_eq!(
            pipeline.handle(&v3).await,
            IngestOutcome::Rejected(DecodeError::UnsupportedFormat(3))
        );

        assert!(store.is_empty());
        assert_eq!(captured.count_at(Level::Warn), 2);

        // the next good frame is still processed
        assert_eq!(
            pipeline.handle(&advertisement(TARGET)).await,
            IngestOutcome::Stored
        );
    }

    #[tokio::test]
    async fn storage_failure_does_not_block_later_events() {
        let (pipeline, captured) = pipeline(Arc::new(FailingSink));

        assert_eq!(
            pipeline.handle(&advertisement(TARGET)).await,
            IngestOutcome::StoreFailed
        );
        assert_eq!(
            pipeline.handle(&advertisement(TARGET)).await,
            IngestOutcome::StoreFailed
        );
        assert!(captured.contains("Error saving sensor reading"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_storage_times_out() {
        let (pipeline, captured) = pipeline(Arc::new(StallingSink));

        assert_eq!(
            pipeline.handle(&advertisement(TARGET)).await,
            IngestOutcome::StoreFailed
        );
        assert!(captured.contains("timed out after 5s"));
    }

    #[tokio::test]
    async fn attached_pipeline_receives_scanner_events() {
        let store = Arc::new(MemoryStore::new());
        let (log, _) = Logger::capture();
        let pipeline = Arc::new(IngestionPipeline::new(
            TARGET,
            store.clone(),
            Duration::from_secs(5),
            &log,
        ));
        let radio = Arc::new(FakeRadio::default());
        let scanner = Scanner::new(radio, &log);
        pipeline.attach(&scanner);

        scanner.on_power(PowerState::Powered).await.unwrap();
        assert_eq!(scanner.state().await, ScanState::Scanning);
        scanner.dispatch(advertisement(TARGET)).await;
        scanner.dispatch(advertisement("Ruuvi 0000")).await;

        assert_eq!(store.len(), 1);
    }
}
