use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::PollError;
use crate::connection::{Connection, ConnectionConfig, Connector};
use crate::unit::{ConfigurationError, FunctionCode, ReadSpec};

/// Emitted by the worker: one `Data` per successful cycle, one `Failed` when a run dies.
#[derive(Debug)]
pub enum PollEvent {
    Data { quantity: u16, values: Vec<u16> },
    Failed(PollError),
}

/// Receives every [`PollEvent`] of a session, on the worker thread.
pub type EventSink = Arc<dyn Fn(PollEvent) + Send + Sync>;

/// Sink reporting events through the `log` facade.
pub fn log_sink() -> EventSink {
    Arc::new(|event: PollEvent| match event {
        PollEvent::Data { quantity, values } => info!("read {} values: {:?}", quantity, values),
        PollEvent::Failed(err) => error!("polling stopped: {}", err),
    })
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Cannot spawn poll worker: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    /// The flag is cleared but the worker has not exited yet.
    Stopping,
}

/// Polls one device from a background thread until stopped or until a read fails.
///
/// At most one worker exists per session. The worker owns the connection for
/// the whole run; the only state shared with the caller is the `running` flag.
pub struct PollingSession<C: Connector> {
    config: ConnectionConfig,
    connector: Arc<C>,
    sink: EventSink,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl<C: Connector> PollingSession<C> {
    pub fn new(config: ConnectionConfig, connector: C, sink: EventSink) -> Self {
        PollingSession {
            config,
            connector: Arc::new(connector),
            sink,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        match &self.worker {
            Some(handle) if !handle.is_finished() => {
                if self.running.load(Ordering::Acquire) {
                    SessionState::Running
                } else {
                    SessionState::Stopping
                }
            }
            _ => SessionState::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    /// Starts polling `quantity` items with `function` every `cycle`.
    ///
    /// Returns without waiting for the connection. Does nothing if a worker is
    /// already running. A worker that failed but is still exiting is joined
    /// first, so a slow sink handling its `Failed` event delays this call.
    pub fn start(
        &mut self,
        cycle: Duration,
        function: FunctionCode,
        quantity: u16,
    ) -> Result<(), SessionError> {
        if cycle.is_zero() {
            return Err(ConfigurationError::InvalidCycle.into());
        }
        let spec = ReadSpec::new(function, quantity)?;

        if self.is_running() {
            debug!("poll worker for {} already running", self.config);
            return Ok(());
        }
        // A previous run may have ended on its own; reap it first
        self.join_worker();

        self.running.store(true, Ordering::Release);
        let worker = Worker {
            config: self.config.clone(),
            connector: Arc::clone(&self.connector),
            sink: Arc::clone(&self.sink),
            running: Arc::clone(&self.running),
            cycle,
            spec,
        };
        let spawned = thread::Builder::new()
            .name(format!("modbus-poll-{}", self.config))
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e.into());
            }
        }

        info!(
            "polling {} {} from {} every {:?}",
            quantity, function, self.config, cycle
        );
        Ok(())
    }

    /// Stops the worker and waits until it has exited and closed its connection.
    pub fn stop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        self.running.store(false, Ordering::Release);
        if let Some(handle) = &self.worker {
            handle.thread().unpark();
        }
        self.join_worker();
        info!("polling {} stopped", self.config);
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("poll worker for {} panicked", self.config);
            }
        }
    }
}

impl<C: Connector> Drop for PollingSession<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<C: Connector> {
    config: ConnectionConfig,
    connector: Arc<C>,
    sink: EventSink,
    running: Arc<AtomicBool>,
    cycle: Duration,
    spec: ReadSpec,
}

impl<C: Connector> Worker<C> {
    fn run(self) {
        let result = match self.connector.open(&self.config) {
            Ok(conn) => {
                let mut guard = ConnectionGuard(conn);
                let result = self.poll(&mut guard.0);
                if result.is_err() {
                    self.running.store(false, Ordering::Release);
                }
                result
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(e.into())
            }
        };

        // The connection is closed by now
        if let Err(err) = result {
            warn!("poll worker for {} failed: {}", self.config, err);
            (self.sink)(PollEvent::Failed(err));
        }
        debug!("poll worker for {} exited", self.config);
    }

    fn poll(&self, conn: &mut C::Conn) -> Result<(), PollError> {
        while self.running.load(Ordering::Acquire) {
            let values = conn.execute(
                self.spec.unit_id(),
                self.spec.function(),
                self.spec.start_addr(),
                self.spec.quantity(),
            )?;
            (self.sink)(PollEvent::Data {
                quantity: self.spec.quantity(),
                values,
            });
            self.wait_cycle();
        }
        Ok(())
    }

    /// Sleeps for one cycle, returning early once the flag is cleared.
    fn wait_cycle(&self) {
        let deadline = Instant::now() + self.cycle;
        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }
}

/// Closes the connection exactly once, including on unwind.
struct ConnectionGuard<T: Connection>(T);

impl<T: Connection> Drop for ConnectionGuard<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}
