//! The reconciliation loop.
//!
//! A [`Session`] owns the [`Game`], the device queue and the relay client.
//! Everything that happens to it arrives as a [`SessionEvent`] on one channel:
//! device completions, relay traffic and heartbeat ticks. Only the loop thread
//! touches game state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as cb;
use log::{debug, error, info, trace, warn};
use o2_core::game::{FrameOutput, Game, ReadRequest, WriteRequest};
use o2_core::mirror::bus_to_pak;
use o2_core::notify::NotificationBus;
use o2_core::sync::SyncTableError;
use o2_link::protocol::Inbound;
use o2_link::relay::now_ns;
use o2_link::{
    DeviceError, DeviceQueue, DriverRegistry, RelayClient, RelayEvent, Request, Response,
};
use thiserror::Error;

use crate::config::ClientConfig;

/// Pace of the main read when the device answers immediately.
const READ_INTERVAL: Duration = Duration::from_millis(16);
const FAST_HEARTBEAT: Duration = Duration::from_millis(250);
const SLOW_HEARTBEAT: Duration = Duration::from_millis(1000);
/// A main read outstanding for longer than this is given up on.
const READ_STALL: Duration = Duration::from_millis(500);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("sync table: {0}")]
    SyncTable(#[from] SyncTableError),
    #[error("could not start heartbeat: {0}")]
    Timer(#[source] std::io::Error),
}

pub type ReadBatch = Vec<(ReadRequest, Vec<u8>)>;

#[derive(Debug)]
pub enum SessionEvent {
    ReadsDone(Result<ReadBatch, DeviceError>),
    WritesDone(Result<(), DeviceError>),
    Relay(RelayEvent),
    FastTick,
    SlowTick,
    Shutdown,
}

pub struct Session {
    config: ClientConfig,
    game: Game,
    bus: Arc<NotificationBus>,
    queue: DeviceQueue,
    relay: Option<RelayClient>,
    last_connect: Option<Instant>,
    tx: cb::Sender<SessionEvent>,
    rx: cb::Receiver<SessionEvent>,
    read_issued: Option<Instant>,
    next_read: Option<Instant>,
    timers_stop: Arc<AtomicBool>,
    timers: Vec<thread::JoinHandle<()>>,
}

fn spawn_timer(
    name: &str,
    period: Duration,
    tx: cb::Sender<SessionEvent>,
    stop: Arc<AtomicBool>,
    tick: fn() -> SessionEvent,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name(name.to_string()).spawn(move || {
        while !stop.load(Ordering::Acquire) {
            thread::sleep(period);
            if stop.load(Ordering::Acquire) || tx.send(tick()).is_err() {
                break;
            }
        }
    })
}

fn now_ms() -> u32 {
    (now_ns() / 1_000_000) as u32
}

impl Session {
    /// Opens the configured device. The relay is connected by [`Session::run`].
    pub fn open(
        config: ClientConfig,
        registry: &DriverRegistry,
        bus: Arc<NotificationBus>,
    ) -> Result<Self, SessionError> {
        let game = Game::new(&config.name, config.team, config.game_options(), Arc::clone(&bus))?;
        let device = registry.open(&config.driver, &config.device)?;
        let queue = DeviceQueue::spawn(&config.driver, device)?;
        let (tx, rx) = cb::unbounded();
        Ok(Self {
            config,
            game,
            bus,
            queue,
            relay: None,
            last_connect: None,
            tx,
            rx,
            read_issued: None,
            next_read: Some(Instant::now()),
            timers_stop: Arc::new(AtomicBool::new(false)),
            timers: Vec::new(),
        })
    }

    /// Handle for posting events, e.g. [`SessionEvent::Shutdown`], from elsewhere.
    pub fn sender(&self) -> cb::Sender<SessionEvent> {
        self.tx.clone()
    }

    /// Runs until shut down or until the device goes away.
    pub fn run(mut self) -> Result<(), SessionError> {
        let stop = Arc::clone(&self.timers_stop);
        self.timers.push(spawn_timer(
            "heartbeat-fast",
            FAST_HEARTBEAT,
            self.tx.clone(),
            Arc::clone(&stop),
            || SessionEvent::FastTick,
        )
        .map_err(SessionError::Timer)?);
        self.timers.push(spawn_timer(
            "heartbeat-slow",
            SLOW_HEARTBEAT,
            self.tx.clone(),
            stop,
            || SessionEvent::SlowTick,
        )
        .map_err(SessionError::Timer)?);
        self.connect();

        let result = self.event_loop();
        self.shutdown();
        result.map_err(SessionError::from)
    }

    fn event_loop(&mut self) -> Result<(), DeviceError> {
        loop {
            let event = match self.next_read {
                Some(at) => {
                    let wait = at.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(wait) {
                        Ok(ev) => Some(ev),
                        Err(cb::RecvTimeoutError::Timeout) => None,
                        Err(cb::RecvTimeoutError::Disconnected) => return Ok(()),
                    }
                }
                None => match self.rx.recv() {
                    Ok(ev) => Some(ev),
                    Err(_) => return Ok(()),
                },
            };

            match event {
                None => self.issue_reads()?,
                Some(SessionEvent::Shutdown) => {
                    info!("session: shutting down");
                    return Ok(());
                }
                Some(ev) => self.handle(ev)?,
            }
        }
    }

    fn handle(&mut self, event: SessionEvent) -> Result<(), DeviceError> {
        match event {
            SessionEvent::ReadsDone(result) => self.reads_done(result),
            SessionEvent::WritesDone(result) => {
                if let Err(e) = &result {
                    warn!("session: routine write failed: {e}");
                }
                self.game.routine_written(result.is_ok());
                Ok(())
            }
            SessionEvent::Relay(ev) => {
                self.relay_event(ev);
                Ok(())
            }
            SessionEvent::FastTick => {
                if let Some(issued) = self.read_issued
                    && issued.elapsed() >= READ_STALL
                {
                    warn!("session: main read stalled; issuing again");
                    self.read_issued = None;
                    self.issue_reads()?;
                }
                if !self.game.has_local_index()
                    && let Some(relay) = &self.relay
                {
                    relay.join(None, self.sector());
                }
                Ok(())
            }
            SessionEvent::SlowTick => {
                match &self.relay {
                    Some(relay) => {
                        relay.broadcast(
                            self.game.players().local_index(),
                            self.sector(),
                            &self.game.name_payload(),
                        );
                        relay.echo(self.game.players().local_index());
                    }
                    None => {
                        if self
                            .last_connect
                            .is_none_or(|t| t.elapsed() >= RECONNECT_INTERVAL)
                        {
                            self.connect();
                        }
                    }
                }
                Ok(())
            }
            SessionEvent::Shutdown => Ok(()),
        }
    }

    fn sector(&self) -> u64 {
        u64::from(self.game.players().local().state.location)
    }

    fn issue_reads(&mut self) -> Result<(), DeviceError> {
        self.next_read = None;
        if self.read_issued.is_some() {
            return Ok(());
        }
        let reads = self.game.main_reads();
        let requests = reads
            .iter()
            .map(|r| Request::Read {
                address: bus_to_pak(r.address),
                size: r.size,
            })
            .collect();
        let tx = self.tx.clone();
        let submitted = self.queue.submit(requests, move |result| {
            let batch = result.map(|responses| {
                reads
                    .into_iter()
                    .zip(responses)
                    .filter_map(|(req, resp)| match resp {
                        Response::Read { data, .. } => Some((req, data)),
                        Response::Written { .. } => None,
                    })
                    .collect()
            });
            let _ = tx.send(SessionEvent::ReadsDone(batch));
        });
        match submitted {
            Ok(()) => {
                self.read_issued = Some(Instant::now());
                Ok(())
            }
            Err(DeviceError::QueueFull) => {
                debug!("session: device queue full; read deferred");
                self.next_read = Some(Instant::now() + READ_INTERVAL);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn reads_done(&mut self, result: Result<ReadBatch, DeviceError>) -> Result<(), DeviceError> {
        self.read_issued = None;
        self.next_read = Some(Instant::now() + READ_INTERVAL);
        let batch = match result {
            Ok(batch) => batch,
            Err(DeviceError::Drained) => return Ok(()),
            Err(e) => {
                warn!("session: main read failed: {e}");
                if self.queue.is_closed() {
                    self.bus.publish("device disconnected");
                    return Err(DeviceError::Closed);
                }
                return Ok(());
            }
        };

        let FrameOutput { writes, payload } = self.game.complete_reads(&batch, now_ms());
        if !writes.is_empty() {
            self.submit_writes(writes);
        }
        if let Some(payload) = payload
            && let Some(relay) = &self.relay
        {
            trace!("session: broadcasting {} bytes", payload.len());
            relay.broadcast(self.game.players().local_index(), self.sector(), &payload);
        }
        Ok(())
    }

    fn submit_writes(&mut self, writes: Vec<WriteRequest>) {
        let requests = writes
            .into_iter()
            .map(|w| Request::Write {
                address: bus_to_pak(w.address),
                data: w.data,
            })
            .collect();
        let tx = self.tx.clone();
        let submitted = self.queue.submit(requests, move |result| {
            let _ = tx.send(SessionEvent::WritesDone(result.map(|_| ())));
        });
        if let Err(e) = submitted {
            warn!("session: could not queue routine: {e}");
            self.game.routine_written(false);
        }
    }

    fn connect(&mut self) {
        self.last_connect = Some(Instant::now());
        let settings = self.config.relay_settings();
        let tx = self.tx.clone();
        match RelayClient::connect(&settings, move |ev| {
            let _ = tx.send(SessionEvent::Relay(ev));
        }) {
            Ok(relay) => self.relay = Some(relay),
            Err(e) => {
                error!("session: relay connect failed: {e}");
                self.bus
                    .publish(&format!("could not connect to {}: {e}", settings.host));
            }
        }
    }

    fn relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected { peer } => {
                debug!("session: relay peer {peer}");
                self.bus
                    .publish(&format!("connected to {}", self.config.host));
                if let Some(relay) = &self.relay {
                    relay.join(self.game.players().local_index(), self.sector());
                }
            }
            RelayEvent::Message(Inbound::IndexAssigned(index)) => {
                self.game.assign_local_index(index)
            }
            RelayEvent::Message(Inbound::Payload { index, data }) => {
                self.game.handle_payload(index, &data)
            }
            RelayEvent::Message(Inbound::Echo { server_time_ns }) => {
                let lag_ms = (now_ns() - server_time_ns) / 1_000_000;
                trace!("session: echo, server clock {lag_ms} ms behind");
            }
            RelayEvent::Message(Inbound::Hello { group, name, .. }) => {
                debug!("session: ignoring legacy hello from {name} in {group}");
            }
            RelayEvent::Closed(reason) => {
                debug!("session: relay closed: {reason}");
                self.relay = None;
                self.bus.publish("disconnected from relay");
                self.reset();
            }
        }
    }

    fn reset(&mut self) {
        self.queue.drain();
        self.game.reset();
    }

    fn shutdown(&mut self) {
        self.timers_stop.store(true, Ordering::Release);
        if let Some(mut relay) = self.relay.take() {
            relay.disconnect();
        }
        self.queue.close();
        for timer in self.timers.drain(..) {
            let _ = timer.join();
        }
    }
}
