//! Ordered, asynchronous access to a console's memory.
//!
//! A [`DeviceQueue`] owns one [`Device`] on a dedicated worker thread and runs
//! submitted batches strictly in order. Every batch completes exactly once
//! through its callback, with the responses or with the error that stopped it,
//! so callers never wait on an answer that will not come.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crossbeam_channel as cb;
use log::{debug, info, warn};

use crate::error::DeviceError;

/// Commands that may wait in the queue at once.
pub const QUEUE_CAPACITY: usize = 64;
/// Consecutive failed batches after which the queue closes itself.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Raw memory access in the device's own address space.
pub trait Device: Send {
    fn read(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DeviceError>;
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

impl Device for Box<dyn Device> {
    fn read(&mut self, address: u32, size: usize) -> Result<Vec<u8>, DeviceError> {
        (**self).read(address, size)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), DeviceError> {
        (**self).write(address, data)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        (**self).close()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read { address: u32, size: usize },
    Write { address: u32, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Read { address: u32, data: Vec<u8> },
    Written { address: u32 },
}

pub type Completion = Box<dyn FnOnce(Result<Vec<Response>, DeviceError>) + Send>;

enum Command {
    Batch {
        requests: Vec<Request>,
        generation: u64,
        done: Completion,
    },
    Close,
}

#[derive(Debug, Default)]
struct Shared {
    closed: AtomicBool,
    generation: AtomicU64,
}

/// Handle to the worker. Dropping it closes the queue after in-flight work.
#[derive(Debug)]
pub struct DeviceQueue {
    tx: cb::Sender<Command>,
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl DeviceQueue {
    pub fn spawn<D: Device + 'static>(name: &str, device: D) -> Result<Self, DeviceError> {
        let (tx, rx) = cb::bounded(QUEUE_CAPACITY);
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("device-{name}"))
            .spawn(move || worker_main(device, rx, worker_shared))?;
        info!("queue: started for device '{name}'");
        Ok(Self {
            tx,
            shared,
            worker: Some(worker),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Enqueues a batch. On error `done` is dropped without being called.
    pub fn submit(
        &self,
        requests: Vec<Request>,
        done: impl FnOnce(Result<Vec<Response>, DeviceError>) + Send + 'static,
    ) -> Result<(), DeviceError> {
        if self.is_closed() {
            return Err(DeviceError::Closed);
        }
        let cmd = Command::Batch {
            requests,
            generation: self.shared.generation.load(Ordering::Acquire),
            done: Box::new(done),
        };
        match self.tx.try_send(cmd) {
            Ok(()) => Ok(()),
            Err(cb::TrySendError::Full(_)) => Err(DeviceError::QueueFull),
            Err(cb::TrySendError::Disconnected(_)) => Err(DeviceError::Closed),
        }
    }

    /// Drops every batch submitted so far that has not started yet. Their
    /// callbacks see [`DeviceError::Drained`].
    pub fn drain(&self) {
        let g = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("queue: drain (generation {g})");
    }

    /// Stops accepting work, lets queued batches finish and closes the device.
    pub fn close(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = self.tx.send(Command::Close);
            let _ = worker.join();
        }
    }
}

impl Drop for DeviceQueue {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_batch<D: Device>(device: &mut D, requests: Vec<Request>) -> Result<Vec<Response>, DeviceError> {
    let mut out = Vec::with_capacity(requests.len());
    for req in requests {
        out.push(match req {
            Request::Read { address, size } => Response::Read {
                address,
                data: device.read(address, size)?,
            },
            Request::Write { address, data } => {
                device.write(address, &data)?;
                Response::Written { address }
            }
        });
    }
    Ok(out)
}

fn worker_main<D: Device>(mut device: D, rx: cb::Receiver<Command>, shared: Arc<Shared>) {
    let mut failures = 0;
    for cmd in rx.iter() {
        let (requests, generation, done) = match cmd {
            Command::Batch {
                requests,
                generation,
                done,
            } => (requests, generation, done),
            Command::Close => break,
        };

        if shared.closed.load(Ordering::Acquire) && failures >= MAX_CONSECUTIVE_FAILURES {
            done(Err(DeviceError::Closed));
            continue;
        }
        if generation < shared.generation.load(Ordering::Acquire) {
            done(Err(DeviceError::Drained));
            continue;
        }

        match run_batch(&mut device, requests) {
            Ok(responses) => {
                failures = 0;
                done(Ok(responses));
            }
            Err(e) => {
                failures += 1;
                warn!("queue: batch failed ({failures} in a row): {e}");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    warn!("queue: closing after {failures} consecutive failures");
                    shared.closed.store(true, Ordering::Release);
                }
                done(Err(e));
            }
        }
    }

    // fail anything still queued behind a close
    for cmd in rx.try_iter() {
        if let Command::Batch { done, .. } = cmd {
            done(Err(DeviceError::Closed));
        }
    }
    if let Err(e) = device.close() {
        warn!("queue: device close failed: {e}");
    }
    info!("queue: stopped");
}
