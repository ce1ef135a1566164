//! In-memory simulated controller
//!
//! Implements `ProtocolChannel` over a device memory map with fault injection.
//! Used by the demo binary and by the tests; there is no wire encoding here.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use errors::{CommunicationFault, FaultKind};
use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;

use super::channel::{protocol_max, ProtocolChannel};
use super::config::SimulatorConfig;
use super::types::{DeviceAddress, DeviceCode, DeviceKind, TargetIdentity};

/// One block read seen by the simulator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCall {
    pub code: DeviceCode,
    pub address: u32,
    pub count: usize,
}

impl ReadCall {
    pub fn end(&self) -> u32 {
        self.address + self.count as u32 - 1
    }
}

#[derive(Default)]
struct SimState {
    connected: bool,
    identity: Option<TargetIdentity>,
    fail_identification: bool,
    drop_on_identify: bool,
    bits: HashMap<DeviceAddress, bool>,
    words: HashMap<DeviceAddress, u16>,
    faulty: HashSet<DeviceAddress>,
    read_log: Vec<ReadCall>,
}

/// Simulated controller memory reachable through `ProtocolChannel`
pub struct SimulatedChannel {
    name: String,
    state: Mutex<SimState>,
    latency: Duration,
    fail_every_nth: Option<u64>,
    fault_probability: f64,
    read_calls: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedChannel {
    pub fn new(identity: TargetIdentity) -> Self {
        Self {
            name: format!("sim:{}", identity.display_name),
            state: Mutex::new(SimState {
                identity: Some(identity),
                ..Default::default()
            }),
            latency: Duration::ZERO,
            fail_every_nth: None,
            fault_probability: 0.0,
            read_calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Build a simulator from the `simulator` configuration section
    pub fn from_config(config: &SimulatorConfig) -> Self {
        let identity = TargetIdentity {
            display_name: config.display_name.clone(),
            type_code: config.type_code,
        };
        let sim = Self::new(identity)
            .with_latency(Duration::from_millis(config.latency_ms))
            .with_fault_probability(config.fault_probability);
        let sim = match config.fail_every_nth {
            Some(n) => sim.with_fail_every_nth(n),
            None => sim,
        };

        for seed in &config.bits {
            sim.set_bit(seed.code, seed.address, seed.value);
        }
        for seed in &config.words {
            sim.set_word(seed.code, seed.address, seed.value);
        }
        if config.fail_identification {
            sim.fail_identification(true);
        }
        sim
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every n-th block read (n >= 1)
    pub fn with_fail_every_nth(mut self, n: u64) -> Self {
        self.fail_every_nth = (n > 0).then_some(n);
        self
    }

    pub fn with_fault_probability(mut self, probability: f64) -> Self {
        self.fault_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn set_bit(&self, code: DeviceCode, address: u32, value: bool) {
        self.state
            .lock()
            .bits
            .insert(DeviceAddress::new(code, address), value);
    }

    pub fn set_word(&self, code: DeviceCode, address: u32, value: u16) {
        self.state
            .lock()
            .words
            .insert(DeviceAddress::new(code, address), value);
    }

    /// Any block read covering this address fails with a timeout
    pub fn inject_fault(&self, code: DeviceCode, address: u32) {
        self.state
            .lock()
            .faulty
            .insert(DeviceAddress::new(code, address));
    }

    pub fn fail_identification(&self, fail: bool) {
        self.state.lock().fail_identification = fail;
    }

    /// The link goes down while the CPU model is being read
    pub fn drop_on_identify(&self, enabled: bool) {
        self.state.lock().drop_on_identify = enabled;
    }

    pub fn read_log(&self) -> Vec<ReadCall> {
        self.state.lock().read_log.clone()
    }

    pub fn read_call_count(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    /// Highest number of block reads observed in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    async fn begin_read(
        &self,
        code: DeviceCode,
        address: u32,
        count: usize,
        expected: DeviceKind,
    ) -> Result<(), CommunicationFault> {
        if code.kind() != expected {
            return Err(CommunicationFault::new(
                FaultKind::Other,
                format!("{} is not a {} device", code, expected),
            ));
        }
        if count == 0 || count > protocol_max(expected) {
            return Err(CommunicationFault::new(
                FaultKind::Other,
                format!("block size {} outside 1..={}", count, protocol_max(expected)),
            ));
        }

        let call_no = self.read_calls.fetch_add(1, Ordering::Relaxed) + 1;
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let call = ReadCall {
            code,
            address,
            count,
        };
        let covers_fault = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(CommunicationFault::disconnected("channel is not connected"));
            }
            state.read_log.push(call);
            let end = call.end();
            state
                .faulty
                .iter()
                .any(|a| a.code == code && a.address >= address && a.address <= end)
        };
        trace!("sim read {}{} x{}", code, address, count);

        if covers_fault {
            return Err(CommunicationFault::timeout(format!(
                "no reply for {}{} x{}",
                code, address, count
            )));
        }
        if let Some(n) = self.fail_every_nth {
            if call_no % n == 0 {
                return Err(CommunicationFault::busy(format!(
                    "target busy on call {}",
                    call_no
                )));
            }
        }
        if self.fault_probability > 0.0 && rand::thread_rng().gen_bool(self.fault_probability) {
            return Err(CommunicationFault::malformed("corrupted reply"));
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolChannel for SimulatedChannel {
    async fn connect(&self) -> Result<(), CommunicationFault> {
        self.state.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), CommunicationFault> {
        self.state.lock().connected = false;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.state.lock().connected
    }

    async fn identify_target(&self) -> Result<TargetIdentity, CommunicationFault> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(CommunicationFault::disconnected("channel is not connected"));
        }
        if state.drop_on_identify {
            state.connected = false;
            return Err(CommunicationFault::disconnected(
                "connection lost while reading CPU model",
            ));
        }
        if state.fail_identification {
            return Err(CommunicationFault::new(
                FaultKind::MalformedReply,
                "CPU model reply could not be decoded",
            ));
        }
        state
            .identity
            .clone()
            .ok_or_else(|| CommunicationFault::malformed("no identity configured"))
    }

    async fn read_bits(
        &self,
        code: DeviceCode,
        address: u32,
        count: usize,
    ) -> Result<Vec<bool>, CommunicationFault> {
        self.begin_read(code, address, count, DeviceKind::Bit).await?;
        let state = self.state.lock();
        Ok((0..count as u32)
            .map(|i| {
                state
                    .bits
                    .get(&DeviceAddress::new(code, address + i))
                    .copied()
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn read_words(
        &self,
        code: DeviceCode,
        address: u32,
        count: usize,
    ) -> Result<Vec<u16>, CommunicationFault> {
        self.begin_read(code, address, count, DeviceKind::Word).await?;
        let state = self.state.lock();
        Ok((0..count as u32)
            .map(|i| {
                state
                    .words
                    .get(&DeviceAddress::new(code, address + i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
