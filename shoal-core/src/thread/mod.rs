//! Network event thread.
//!
//! A single cooperative execution context: each tick drains the deferred
//! callback queue, flushes finished name lookups, drains the queue again
//! and then runs due timers. State touched by callbacks (the handshake
//! manager among it) lives in the host value `S`, owned by the thread, so
//! it needs no locking. Waiting happens on a tokio current-thread runtime
//! which also drives the resolver's lookups.

pub mod callbacks;
pub mod instrumentation;
pub mod resolver;
pub mod scheduler;

use std::convert::Infallible;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tracing::{debug, error, info};

pub use callbacks::{CallbackQueue, CallbackTarget};
pub use instrumentation::{PollingSlot, PollingStats};
pub use resolver::{ResolveFamily, Resolver};
pub use scheduler::{Scheduler, TimerId};

use crate::config::ThreadConfig;
use resolver::ResolverQueue;

/// Deferred work item run on the network thread.
pub type Callback<S> = Box<dyn FnOnce(&mut S, &mut Scheduler<S>) + Send>;

/// Shutdown has been requested.
pub const FLAG_DO_SHUTDOWN: u32 = 1 << 0;
/// Shutdown has been observed by a tick.
pub const FLAG_DID_SHUTDOWN: u32 = 1 << 1;
/// The thread is waiting for events.
pub const FLAG_POLLING: u32 = 1 << 2;

/// Errors from the event thread lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    /// Terminates the event loop; not a failure.
    #[error("Thread shutdown requested")]
    Shutdown,

    #[error("Already triggered shutdown")]
    AlreadyShutdown,

    #[error("{operation} called on a thread in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: ThreadState,
    },

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed to build runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("Thread panicked")]
    Panicked,
}

impl ThreadError {
    /// Returns true for everything except the shutdown signal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ThreadError::Shutdown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    Uninitialized = 0,
    Initialized = 1,
    Active = 2,
    Inactive = 3,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ThreadState::Initialized,
            2 => ThreadState::Active,
            3 => ThreadState::Inactive,
            _ => ThreadState::Uninitialized,
        }
    }
}

/// State visible to both the thread and its handle.
struct Shared {
    flags: AtomicU32,
    state: AtomicU8,
    interrupt: Arc<Notify>,
}

impl Shared {
    fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(
        &self,
        from: ThreadState,
        to: ThreadState,
        operation: &'static str,
    ) -> Result<(), ThreadError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| ThreadError::InvalidState {
                operation,
                state: ThreadState::from_u8(actual),
            })
    }

    fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    fn request_shutdown(&self) {
        self.set_flag(FLAG_DO_SHUTDOWN);
        self.interrupt.notify_one();
    }
}

/// The network event thread before it is started.
///
/// Lifecycle: [`create`](Self::create) → [`init_thread`](Self::init_thread)
/// → [`start_thread`](Self::start_thread) → [`NetThreadHandle::stop_thread_wait`].
/// Ticks can also be driven synchronously with
/// [`process_events`](Self::process_events).
pub struct NetThread<S> {
    name: String,
    idle_timeout: Duration,
    shared: Arc<Shared>,
    callbacks: CallbackQueue<S>,
    scheduler: Scheduler<S>,
    resolver: Resolver<S>,
    resolver_queue: ResolverQueue<S>,
    stats: Arc<PollingStats>,
    slot: PollingSlot,
    runtime: Runtime,
}

impl<S: 'static> NetThread<S> {
    /// # Errors
    ///
    /// - `ThreadError::Runtime` - If the tokio runtime cannot be built
    pub fn create(config: &ThreadConfig) -> Result<Self, ThreadError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ThreadError::Runtime)?;

        let interrupt = Arc::new(Notify::new());
        let (resolver, resolver_queue) =
            Resolver::new(runtime.handle().clone(), Arc::clone(&interrupt));

        Ok(Self {
            name: config.name.clone(),
            idle_timeout: config.idle_timeout,
            shared: Arc::new(Shared {
                flags: AtomicU32::new(0),
                state: AtomicU8::new(ThreadState::Uninitialized as u8),
                interrupt: Arc::clone(&interrupt),
            }),
            callbacks: CallbackQueue::new(interrupt),
            scheduler: Scheduler::new(),
            resolver,
            resolver_queue,
            stats: Arc::new(PollingStats::new()),
            slot: PollingSlot::Others,
            runtime,
        })
    }

    /// Marks the thread initialized and claims the net polling slot.
    ///
    /// # Errors
    ///
    /// - `ThreadError::InvalidState` - If already initialized
    pub fn init_thread(&mut self) -> Result<(), ThreadError> {
        self.shared.transition(
            ThreadState::Uninitialized,
            ThreadState::Initialized,
            "init_thread",
        )?;
        self.slot = PollingSlot::Net;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.shared.state()
    }

    pub fn flags(&self) -> u32 {
        self.shared.flags.load(Ordering::Acquire)
    }

    pub fn is_polling(&self) -> bool {
        self.shared.has_flag(FLAG_POLLING)
    }

    pub fn callbacks(&self) -> &CallbackQueue<S> {
        &self.callbacks
    }

    pub fn resolver(&self) -> &Resolver<S> {
        &self.resolver
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler<S> {
        &mut self.scheduler
    }

    pub fn stats(&self) -> &Arc<PollingStats> {
        &self.stats
    }

    /// Queues `callback` to run on the next tick.
    pub fn callback(
        &self,
        target: CallbackTarget,
        callback: impl FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    ) {
        self.callbacks.push(target, callback);
    }

    /// Asks the next tick to stop the loop.
    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Default wait horizon when no timer is due sooner.
    pub fn next_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Runs one tick's event processing.
    ///
    /// # Errors
    ///
    /// - `ThreadError::Shutdown` - The first time a requested shutdown is
    ///   observed; the loop must stop
    /// - `ThreadError::AlreadyShutdown` - If called again after that
    pub fn call_events(&mut self, host: &mut S) -> Result<(), ThreadError> {
        if self.shared.has_flag(FLAG_DO_SHUTDOWN) {
            if self.shared.has_flag(FLAG_DID_SHUTDOWN) {
                return Err(ThreadError::AlreadyShutdown);
            }

            self.shared.set_flag(FLAG_DID_SHUTDOWN);
            return Err(ThreadError::Shutdown);
        }

        self.callbacks.process(host, &mut self.scheduler);
        self.resolver_queue.flush(&self.callbacks);
        self.callbacks.process(host, &mut self.scheduler);

        Ok(())
    }

    /// Runs [`call_events`](Self::call_events) followed by due timers.
    ///
    /// # Errors
    ///
    /// - `ThreadError` - See [`call_events`](Self::call_events)
    pub fn process_events(&mut self, host: &mut S) -> Result<(), ThreadError> {
        self.call_events(host)?;
        self.scheduler.perform(Instant::now(), host);
        Ok(())
    }

    fn run(&mut self, host: &mut S) -> Result<Infallible, ThreadError> {
        loop {
            self.process_events(host)?;

            self.shared.set_flag(FLAG_POLLING);

            // Catches work queued while the flag was being set
            self.process_events(host)?;

            self.stats.record_poll(self.slot);

            let mut timeout = self.next_timeout();
            if let Some(next) = self.scheduler.next_timeout(Instant::now()) {
                timeout = timeout.min(next);
            }

            let interrupt = Arc::clone(&self.shared.interrupt);
            let woken = self.runtime.block_on(async move {
                tokio::select! {
                    _ = interrupt.notified() => true,
                    _ = tokio::time::sleep(timeout) => false,
                }
            });

            self.stats.record_events(self.slot, u64::from(woken));
            self.shared.clear_flag(FLAG_POLLING);
        }
    }

    fn event_loop(mut self, mut host: S, started: mpsc::SyncSender<()>) -> Result<S, ThreadError> {
        self.shared
            .transition(ThreadState::Initialized, ThreadState::Active, "event_loop")?;
        let _ = started.send(());

        info!("{}: starting thread event loop", self.name);

        let result = self.run(&mut host);
        self.shared.clear_flag(FLAG_POLLING);

        match result {
            Err(ThreadError::Shutdown) => info!("{}: shutting down thread", self.name),
            Err(e) => {
                error!("{}: event loop failed: {e}", self.name);
                self.shared
                    .state
                    .store(ThreadState::Inactive as u8, Ordering::Release);
                return Err(e);
            }
            Ok(never) => match never {},
        }

        self.shared
            .transition(ThreadState::Active, ThreadState::Inactive, "event_loop")?;

        debug!("{}: cleaning up thread local data", self.name);
        Ok(host)
    }
}

impl<S: Send + 'static> NetThread<S> {
    /// Moves the thread and `host` onto a new OS thread and runs the
    /// event loop there. Returns once the loop is active, or has exited
    /// without becoming active.
    ///
    /// # Errors
    ///
    /// - `ThreadError::InvalidState` - If the thread is not initialized
    /// - `ThreadError::Spawn` - If the OS thread cannot be created
    pub fn start_thread(self, host: S) -> Result<NetThreadHandle<S>, ThreadError> {
        let state = self.state();
        if state != ThreadState::Initialized {
            return Err(ThreadError::InvalidState {
                operation: "start_thread",
                state,
            });
        }

        let name = self.name.clone();
        let shared = Arc::clone(&self.shared);
        let callbacks = self.callbacks.clone();
        let resolver = self.resolver.clone();
        let stats = Arc::clone(&self.stats);

        let (started, wait_started) = mpsc::sync_channel(1);
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.event_loop(host, started))
            .map_err(ThreadError::Spawn)?;

        // Disconnects instead if the loop never starts
        let _ = wait_started.recv();

        Ok(NetThreadHandle {
            name,
            shared,
            callbacks,
            resolver,
            stats,
            join: Some(join),
        })
    }
}

impl<S> fmt::Debug for NetThread<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetThread")
            .field("name", &self.name)
            .field("state", &self.shared.state())
            .field("callbacks", &self.callbacks)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Handle to a running network thread.
///
/// Dropping the handle stops the thread and discards the host state.
pub struct NetThreadHandle<S> {
    name: String,
    shared: Arc<Shared>,
    callbacks: CallbackQueue<S>,
    resolver: Resolver<S>,
    stats: Arc<PollingStats>,
    join: Option<JoinHandle<Result<S, ThreadError>>>,
}

impl<S> NetThreadHandle<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.shared.state()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.has_flag(FLAG_POLLING)
    }

    /// Queue for handing work to the thread from any thread.
    pub fn callbacks(&self) -> &CallbackQueue<S> {
        &self.callbacks
    }

    pub fn resolver(&self) -> &Resolver<S> {
        &self.resolver
    }

    pub fn stats(&self) -> &PollingStats {
        &self.stats
    }

    /// Requests shutdown, wakes the thread and waits for it to exit.
    ///
    /// Returns the host state.
    ///
    /// # Errors
    ///
    /// - `ThreadError::Panicked` - If the thread panicked
    /// - `ThreadError` - Whatever fault ended the event loop
    pub fn stop_thread_wait(mut self) -> Result<S, ThreadError> {
        let join = self.join.take().ok_or(ThreadError::InvalidState {
            operation: "stop_thread_wait",
            state: self.shared.state(),
        })?;

        self.shared.request_shutdown();

        let host = join.join().map_err(|_| ThreadError::Panicked)??;
        debug!("{}: thread stopped", self.name);
        Ok(host)
    }
}

impl<S> Drop for NetThreadHandle<S> {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.shared.request_shutdown();
            let _ = join.join();
        }
    }
}

impl<S> fmt::Debug for NetThreadHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetThreadHandle")
            .field("name", &self.name)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}
