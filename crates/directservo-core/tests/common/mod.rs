//! In-memory servo bus used by the integration tests

#![allow(dead_code)]

use directservo_core::bus::ConnectionRegistry;
use directservo_core::config::BusConfig;
use directservo_core::protocol::{decode_frame, Address, CommunicationChannel, FrameParams};
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A controller living on the simulated bus
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub angle_counts: i16,
    pub accel: u8,
    /// Answer every command with `error`
    pub failing: bool,
    /// Last torque magnitude received, signed
    pub torque: Option<i16>,
}

impl SimDevice {
    pub fn at(angle_counts: i16) -> Self {
        Self {
            angle_counts,
            accel: 0,
            failing: false,
            torque: None,
        }
    }

    fn reply(&self, id: u8) -> String {
        if self.failing {
            format!("{:02X}error\n", id)
        } else {
            format!("{:02X}{:02X}{:04X}\n", id, self.accel, self.angle_counts as u16)
        }
    }
}

#[derive(Default)]
struct BusState {
    written: Vec<u8>,
    partial: Vec<u8>,
    to_host: VecDeque<u8>,
    devices: BTreeMap<u8, SimDevice>,
    input_clears: usize,
    fail_writes: bool,
    fail_clone: bool,
    applied_read_timeout: Option<Duration>,
}

struct Shared {
    state: Mutex<BusState>,
    readable: Condvar,
}

/// Duplex byte stream with optional simulated controllers answering frames
#[derive(Clone)]
pub struct SimulatedBus {
    shared: Arc<Shared>,
    read_timeout: Duration,
}

impl SimulatedBus {
    /// A bus with no controllers: nothing ever answers
    pub fn silent() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                readable: Condvar::new(),
            }),
            read_timeout: Duration::from_millis(20),
        }
    }

    pub fn with_devices(devices: &[(u8, SimDevice)]) -> Self {
        let bus = Self::silent();
        {
            let mut state = bus.shared.state.lock().unwrap();
            for (id, device) in devices {
                state.devices.insert(*id, device.clone());
            }
        }
        bus
    }

    /// Queue bytes for the host to read
    pub fn inject(&self, bytes: &[u8]) {
        let mut state = self.shared.state.lock().unwrap();
        state.to_host.extend(bytes.iter().copied());
        self.shared.readable.notify_all();
    }

    /// Every complete frame written by the host, without newlines
    pub fn frames(&self) -> Vec<String> {
        let state = self.shared.state.lock().unwrap();
        String::from_utf8_lossy(&state.written)
            .split_terminator('\n')
            .map(str::to_string)
            .collect()
    }

    pub fn written_len(&self) -> usize {
        self.shared.state.lock().unwrap().written.len()
    }

    pub fn input_clears(&self) -> usize {
        self.shared.state.lock().unwrap().input_clears
    }

    pub fn device(&self, id: u8) -> Option<SimDevice> {
        self.shared.state.lock().unwrap().devices.get(&id).cloned()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.state.lock().unwrap().fail_writes = fail;
    }

    /// Make `try_clone` fail, as a port that cannot be opened twice would
    pub fn set_fail_clone(&self, fail: bool) {
        self.shared.state.lock().unwrap().fail_clone = fail;
    }

    /// Read timeout last applied through the channel
    pub fn applied_read_timeout(&self) -> Option<Duration> {
        self.shared.state.lock().unwrap().applied_read_timeout
    }

    /// Poll `condition` until it holds or `timeout` elapses
    pub fn wait_until(&self, timeout: Duration, condition: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition(self)
    }
}

fn answer(state: &mut BusState, line: &[u8]) {
    let Ok(frame) = decode_frame(line) else {
        return;
    };
    let targets: Vec<u8> = if frame.destination == Address::BROADCAST {
        state.devices.keys().copied().collect()
    } else if state.devices.contains_key(&frame.destination.value()) {
        vec![frame.destination.value()]
    } else {
        Vec::new()
    };

    for id in targets {
        let mut reply_id = id;
        if let FrameParams::SetId { new_address } = frame.params {
            if let Some(device) = state.devices.remove(&id) {
                state.devices.insert(new_address, device);
                reply_id = new_address;
            }
        }
        let Some(device) = state.devices.get_mut(&reply_id) else {
            continue;
        };
        if let FrameParams::Torque {
            negative,
            magnitude,
        } = frame.params
        {
            let value = magnitude as i16;
            device.torque = Some(if negative { -value } else { value });
        }
        let reply = device.reply(reply_id);
        state.to_host.extend(reply.bytes());
    }
}

impl Read for SimulatedBus {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.shared.state.lock().unwrap();
        let (mut state, _) = self
            .shared
            .readable
            .wait_timeout_while(state, self.read_timeout, |s| s.to_host.is_empty())
            .unwrap();

        if state.to_host.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }
        let n = buf.len().min(state.to_host.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.to_host.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for SimulatedBus {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock().unwrap();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "bus unplugged"));
        }
        state.written.extend_from_slice(buf);
        for &b in buf {
            if b == b'\n' {
                let line = std::mem::take(&mut state.partial);
                answer(&mut state, &line);
            } else {
                state.partial.push(b);
            }
        }
        self.shared.readable.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for SimulatedBus {
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.read_timeout = timeout;
        self.shared.state.lock().unwrap().applied_read_timeout = Some(timeout);
        Ok(())
    }

    fn discard_input(&mut self) -> io::Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        state.to_host.clear();
        state.input_clears += 1;
        Ok(())
    }

    fn discard_output(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        if self.shared.state.lock().unwrap().fail_clone {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "port cannot be shared"));
        }
        Ok(Box::new(self.clone()))
    }
}

/// Route library logs to the test harness; set `RUST_LOG` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Quick reply timeouts so failing paths do not slow the suite down
pub fn test_config() -> BusConfig {
    BusConfig {
        read_timeout_ms: 20,
        response_timeout_ms: 200,
        ..BusConfig::default()
    }
}

/// Registry whose transports are the given simulated buses, keyed by port name.
/// Returns the open counter alongside.
pub fn registry_with(buses: &[(&str, SimulatedBus)]) -> (ConnectionRegistry, Arc<AtomicUsize>) {
    init_tracing();
    let buses: BTreeMap<String, SimulatedBus> = buses
        .iter()
        .map(|(name, bus)| (name.to_string(), bus.clone()))
        .collect();
    let opens = Arc::new(AtomicUsize::new(0));
    let counter = opens.clone();

    let registry = ConnectionRegistry::with_opener(test_config(), move |name, _baud| {
        counter.fetch_add(1, Ordering::SeqCst);
        match buses.get(name) {
            Some(bus) => Ok(Box::new(bus.clone()) as Box<dyn CommunicationChannel>),
            None => Err(directservo_core::protocol::ProtocolError::PortNotFound(
                name.to_string(),
            )),
        }
    });
    (registry, opens)
}
