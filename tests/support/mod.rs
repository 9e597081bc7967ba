//! A tiny in-process stand-in for a model process, used by the façade
//! integration tests in `tests/facade.rs`. Not a Python process (the real
//! model implementation is out of scope per spec §1), but it speaks the
//! identical wire protocol over a real `TcpListener`, so the tests exercise
//! the same transport code path a real model would.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use icd3_protocol::{Command, Message, ResultCode, MESSAGE_LEN};

type Key = (u32, u32);

#[derive(Default)]
struct State {
    registers: HashMap<Key, [u8; 8]>,
    canned_reads: HashMap<Key, [u8; 8]>,
    last_write: Option<Message>,
    by_device: HashMap<u32, TcpStream>,
}

/// An echo model: `WRITE(addr, v)` followed by `READ(addr)` returns `v`,
/// unless a canned response was programmed for that exact `(device_id,
/// address)` pair via [`Model::program_read`]. Accepts any number of
/// connections, so both the façade's eager default-endpoint connection and
/// each device's lazily-dialed transport land on the same model.
pub struct Model {
    pub addr: String,
    state: Arc<Mutex<State>>,
    _accept_thread: JoinHandle<()>,
}

impl Model {
    pub fn spawn() -> Model {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind model listener");
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(State::default()));

        let accept_state = Arc::clone(&state);
        let accept_thread = std::thread::Builder::new()
            .name("test-model-accept".into())
            .spawn(move || {
                for conn in listener.incoming() {
                    let Ok(sock) = conn else { break };
                    let state = Arc::clone(&accept_state);
                    std::thread::spawn(move || handle_connection(sock, state));
                }
            })
            .expect("spawning model accept thread");

        Model {
            addr,
            state,
            _accept_thread: accept_thread,
        }
    }

    /// Programs the response the model gives for `READ(device_id, address)`,
    /// overriding the default write-then-echo behavior. Used by S2, where
    /// the model needs to answer a load the test never wrote itself.
    pub fn program_read(&self, device_id: u32, address: u32, value: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .canned_reads
            .insert((device_id, address), value.to_le_bytes());
    }

    /// The most recent `WRITE` request the model has received, if any.
    pub fn last_write(&self) -> Option<Message> {
        self.state.lock().unwrap().last_write.clone()
    }

    /// Pushes `INTERRUPT(device_id, irq_id)` on the connection that last
    /// spoke as `device_id`. Returns `false` (and sends nothing) if the
    /// model has not yet seen a request from that device — a test must issue
    /// at least one read/write on a device before directing an interrupt at
    /// it, the same way a real model only knows which socket belongs to
    /// which device once the driver has transacted with it.
    pub fn push_interrupt(&self, device_id: u32, irq_id: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(sock) = state.by_device.get_mut(&device_id) else {
            return false;
        };
        let msg = Message::interrupt(device_id, irq_id);
        sock.write_all(&msg.encode()).is_ok()
    }
}

fn handle_connection(mut sock: TcpStream, state: Arc<Mutex<State>>) {
    let mut write_half = match sock.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut buf = [0u8; MESSAGE_LEN];
    loop {
        if sock.read_exact(&mut buf).is_err() {
            return;
        }
        let Ok(req) = Message::decode(&buf) else { continue };

        {
            let mut state = state.lock().unwrap();
            state
                .by_device
                .insert(req.device_id, write_half.try_clone().unwrap());
        }

        let response = match req.command {
            Command::Read => {
                let key = (req.device_id, req.address);
                let state = state.lock().unwrap();
                let bytes = state
                    .canned_reads
                    .get(&key)
                    .or_else(|| state.registers.get(&key))
                    .copied()
                    .unwrap_or([0u8; 8]);
                let len = (req.length as usize).min(bytes.len());
                Message {
                    device_id: req.device_id,
                    command: Command::Read,
                    address: req.address,
                    length: req.length,
                    result: ResultCode::Success,
                    data: {
                        let mut d = [0u8; icd3_protocol::MAX_DATA_LEN];
                        d[..len].copy_from_slice(&bytes[..len]);
                        d
                    },
                }
            }
            Command::Write => {
                let key = (req.device_id, req.address);
                let len = (req.length as usize).min(8);
                let mut stored = [0u8; 8];
                stored[..len].copy_from_slice(&req.data()[..len]);
                let mut state = state.lock().unwrap();
                state.registers.insert(key, stored);
                state.last_write = Some(req.clone());
                Message {
                    device_id: req.device_id,
                    command: Command::Write,
                    address: req.address,
                    length: req.length,
                    result: ResultCode::Success,
                    data: [0u8; icd3_protocol::MAX_DATA_LEN],
                }
            }
            _ => continue,
        };

        if write_half.write_all(&response.encode()).is_err() {
            return;
        }
    }
}
