use crate::actuator::{Clock, Switch, SwitchCommand, SwitchError};
use crate::decoder;
use crate::reading::SensorReading;
use crate::scanner::{Radio, RadioError, RawAdvertisement};
use crate::scheduler::Job;
use crate::store::{ReadingSink, StoreError};
use chrono::DateTime;
use futures::future::BoxFuture;
use reqwest::StatusCode;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Manufacturer data captured from a real tag ("Ruuvi C2A9"), company id included.
pub const KNOWN_PAYLOAD: [u8; 26] = [
    153, 4, 5, 13, 211, 112, 113, 195, 37, 254, 136, 252, 56, 255, 112, 172, 86, 174, 10, 239,
    243, 48, 254, 47, 194, 169,
];

/// [`KNOWN_PAYLOAD`] with individual bytes overwritten.
pub fn payload_with(edits: &[(usize, u8)]) -> Vec<u8> {
    let mut payload = KNOWN_PAYLOAD.to_vec();
    for &(offset, value) in edits {
        payload[offset] = value;
    }
    payload
}

pub fn advertisement(device_name: &str) -> RawAdvertisement {
    RawAdvertisement {
        device_name: device_name.to_string(),
        rssi: -74,
        payload: KNOWN_PAYLOAD.to_vec(),
    }
}

/// A stored reading decoded from `payload`, received at `millis` since the epoch.
pub fn reading_at(device_name: &str, millis: i64, payload: &[u8]) -> SensorReading {
    SensorReading {
        device_name: device_name.to_string(),
        received_at: DateTime::from_timestamp_millis(millis).unwrap(),
        rssi: -74,
        decoded: decoder::decode(payload).unwrap(),
        raw: payload.to_vec(),
    }
}

/// Radio that records commands and can be told to fail the next one.
#[derive(Debug, Default)]
pub struct FakeRadio {
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
}

impl FakeRadio {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fail_next_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }
}

impl Radio for FakeRadio {
    fn start_discovery(&self) -> BoxFuture<'_, Result<(), RadioError>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail_start.swap(false, Ordering::SeqCst);
        Box::pin(async move {
            if fail {
                Err(RadioError("adapter not ready".to_string()))
            } else {
                Ok(())
            }
        })
    }

    fn stop_discovery(&self) -> BoxFuture<'_, Result<(), RadioError>> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail_stop.swap(false, Ordering::SeqCst);
        Box::pin(async move {
            if fail {
                Err(RadioError("adapter gone".to_string()))
            } else {
                Ok(())
            }
        })
    }
}

/// Switch that records every command it is asked to send.
#[derive(Debug, Default)]
pub struct FakeSwitch {
    sent: Mutex<Vec<(String, SwitchCommand)>>,
    failure: Mutex<Option<StatusCode>>,
}

impl FakeSwitch {
    pub fn commands(&self) -> Vec<(String, SwitchCommand)> {
        self.sent.lock().unwrap().clone()
    }

    /// Answer every following command with `status`.
    pub fn fail_with(&self, status: StatusCode) {
        *self.failure.lock().unwrap() = Some(status);
    }
}

impl Switch for FakeSwitch {
    fn send<'a>(
        &'a self,
        address: &'a str,
        command: SwitchCommand,
    ) -> BoxFuture<'a, Result<(), SwitchError>> {
        self.sent
            .lock()
            .unwrap()
            .push((address.to_string(), command));
        let failure = *self.failure.lock().unwrap();
        Box::pin(async move {
            match failure {
                Some(status) => Err(SwitchError::Status(status)),
                None => Ok(()),
            }
        })
    }
}

pub struct FixedClock(pub u32);

impl Clock for FixedClock {
    fn local_hour(&self) -> u32 {
        self.0
    }
}

pub struct FailingSink;

impl ReadingSink for FailingSink {
    fn insert(&self, _reading: SensorReading) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async { Err(StoreError::Task("disk full".to_string())) })
    }
}

/// Sink whose writes never complete.
pub struct StallingSink;

impl ReadingSink for StallingSink {
    fn insert(&self, _reading: SensorReading) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(futures::future::pending())
    }
}

/// Job that counts runs and tracks how many overlap.
#[derive(Debug, Default)]
pub struct CountingJob {
    delay: Duration,
    started: AtomicUsize,
    finished: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl CountingJob {
    pub fn with_delay(delay: Duration) -> Self {
        CountingJob {
            delay,
            ..Default::default()
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Job for CountingJob {
    fn run(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
        })
    }
}
