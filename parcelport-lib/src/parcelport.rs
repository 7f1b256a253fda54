use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering::SeqCst},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use thread_lib::{pin_cpu, yield_k};
use tracing::{debug, error, info, warn};

use crate::{
    api::{FabricAddr, Locality},
    config::ParcelportConfig,
    controller::Controller,
    error::{ParcelportError, Result},
    interface::{ParcelDecoder, SendBuffer, SendCallback},
    memory_pool::MemoryPool,
    provider::FabricEndpoint,
    sender::Connection,
    stats::ParcelportStats,
};

struct PollingThreads {
    stop_signal: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl PollingThreads {
    fn shutdown(self) {
        self.stop_signal.store(true, SeqCst);
        for thread in self.threads {
            if let Err(error) = thread.join() {
                error!(?error, "failed to join polling thread");
            }
        }
    }
}

/// RDMA parcel transport over one fabric endpoint.
pub struct Parcelport {
    controller: Arc<Controller>,
    polling: Mutex<Option<PollingThreads>>,
}

impl Parcelport {
    /// Creates the memory pool and sender pool, posts every receive buffer
    /// and starts the configured polling threads.
    pub fn startup(
        config: ParcelportConfig,
        endpoint: Arc<dyn FabricEndpoint>,
        decoder: Arc<dyn ParcelDecoder>,
    ) -> Result<Self> {
        let controller = Controller::new(config, endpoint, decoder)?;
        controller.post_initial_receives()?;
        let polling = spawn_polling_threads(&controller)?;
        info!(
            locality = %controller.endpoint.locality(),
            domain = controller.pool.domain().name(),
            polling_threads = polling.threads.len(),
            "parcelport started"
        );
        Ok(Self { controller, polling: Mutex::new(Some(polling)) })
    }

    pub fn here(&self) -> Locality {
        self.controller.endpoint.locality()
    }

    pub fn insert_address(&self, locality: &Locality) -> Result<FabricAddr> {
        self.controller.insert_address(locality)
    }

    /// Inserts the address table produced by bootstrap discovery.
    pub fn initialize_localities(&self, localities: &[Locality]) -> Result<()> {
        for locality in localities {
            let addr = self.controller.insert_address(locality)?;
            debug!(%locality, ?addr, "peer inserted");
        }
        Ok(())
    }

    /// Reserves a sender for one message to `locality`. `None` means every
    /// sender is busy (or the parcelport is stopping); retry later.
    pub fn get_connection(&self, locality: &Locality) -> Result<Option<Connection>> {
        self.controller.get_connection(locality)
    }

    pub fn async_write(
        &self,
        conn: Connection,
        buffer: SendBuffer,
        callback: SendCallback,
    ) -> Result<()> {
        let result = self.controller.async_write(conn, buffer, callback);
        self.controller.background_work();
        result
    }

    /// Drains both completion queues. Returns the number of events handled.
    pub fn background_work(&self) -> usize {
        self.controller.background_work()
    }

    /// Stops accepting connections, waits for every in-flight message and
    /// joins the polling threads. Idempotent.
    pub fn stop(&self) {
        if self.controller.stopped.swap(true, SeqCst) {
            return;
        }
        let timeout = Duration::from_millis(self.controller.config.stop_timeout_ms);
        let deadline = Instant::now() + timeout;
        let mut abandoned = false;
        let mut k = 0;
        while self.controller.disconnect_all() > 0 {
            if self.controller.background_work() > 0 {
                k = 0;
            } else {
                yield_k(k);
                k = k.saturating_add(1);
            }
            if !abandoned && Instant::now() >= deadline {
                abandoned = true;
                let n = self.controller.abandon_senders();
                warn!(
                    senders = n,
                    rma_active = self.controller.rma_active.load(SeqCst),
                    "stop timed out waiting for in-flight messages"
                );
            }
        }
        if let Some(polling) = self.polling.lock().take() {
            polling.shutdown();
        }
        info!(locality = %self.here(), stats = ?self.stats(), "parcelport stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.controller.is_stopped()
    }

    pub fn stats(&self) -> ParcelportStats {
        self.controller.stats.snapshot()
    }

    pub fn memory_pool(&self) -> &MemoryPool {
        &self.controller.pool
    }

    /// Copies `data` into a pool region ready to be sent.
    pub fn send_buffer(&self, data: &[u8]) -> Result<SendBuffer> {
        SendBuffer::from_slice(&self.controller.pool, data)
    }

    pub fn senders_in_use(&self) -> usize {
        self.controller.senders.in_use()
    }

    pub fn posted_receives(&self) -> usize {
        self.controller.posted_receives()
    }
}

impl Drop for Parcelport {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_polling_threads(controller: &Arc<Controller>) -> Result<PollingThreads> {
    let num_threads = controller.config.polling_threads;
    let mut polling = PollingThreads {
        stop_signal: Arc::new(AtomicBool::new(false)),
        threads: Vec::with_capacity(num_threads),
    };
    let mut inits = Vec::with_capacity(num_threads);
    for index in 0..num_threads {
        let (init_tx, init_rx) = oneshot::channel();
        let pin = if index == 0 { controller.config.pin_poller_cpu } else { None };
        let thread_controller = controller.clone();
        let thread_stop = polling.stop_signal.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("parcelport-poll-{}", index))
            .spawn(move || polling_thread(thread_controller, pin, thread_stop, init_tx));
        match spawned {
            Ok(thread) => polling.threads.push(thread),
            Err(_) => {
                polling.shutdown();
                return Err(ParcelportError::Custom("Failed to spawn polling thread"));
            }
        }
        inits.push(init_rx);
    }

    for init_rx in inits {
        let init = init_rx
            .recv()
            .map_err(|_| ParcelportError::Custom("Polling thread exited during startup"))
            .and_then(|r| r);
        if let Err(e) = init {
            polling.shutdown();
            return Err(e);
        }
    }
    Ok(polling)
}

fn polling_thread(
    controller: Arc<Controller>,
    maybe_pin_cpu: Option<u16>,
    stop_signal: Arc<AtomicBool>,
    init_tx: oneshot::Sender<Result<()>>,
) {
    if let Some(cpu) = maybe_pin_cpu {
        debug!("Pin polling thread to CPU {}", cpu);
        if let Err(e) = pin_cpu(cpu as usize) {
            let _ = init_tx.send(Err(ParcelportError::Errno(e)));
            return;
        }
    }
    if init_tx.send(Ok(())).is_err() {
        return;
    }

    let mut k = 0;
    while !stop_signal.load(SeqCst) {
        if controller.background_work() > 0 {
            k = 0;
        } else {
            yield_k(k);
            k = k.saturating_add(1);
        }
    }
}
