// src/reactor.rs
//
// The reactor owns one epoll instance shared by a pool of worker threads.
// Every fd is registered edge-triggered and one-shot, so at most one worker
// handles a given fd at a time; owners re-arm explicitly after each event.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::ReactorError;
use crate::syscalls::{self, Epoll, EventFd, RawFd, TimerFd, epoll_event};

/// What kind of fd a registration covers. Timers and wakeups get dedicated
/// dispatch paths; sockets go straight to their owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    Socket,
    Timer,
    Wakeup,
}

/// Readiness interest for a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// Events delivered to an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

/// Opaque identity of one registration. The generation field detects use of
/// a handle after its slot was unregistered and reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationHandle {
    index: u32,
    generation: u32,
}

impl RegistrationHandle {
    fn token(self) -> u64 {
        ((self.index as u64) << 32) | self.generation as u64
    }

    fn from_token(token: u64) -> Self {
        RegistrationHandle {
            index: (token >> 32) as u32,
            generation: token as u32,
        }
    }
}

/// Implemented by components that own fds registered with the reactor.
///
/// `on_event` runs on a worker thread. The return value is the interest to
/// re-arm with; `None` leaves the fd disarmed (the owner must call
/// [`Reactor::rearm`] itself, or has already unregistered). Panics in
/// `on_event` are caught by the worker and routed to `on_panic`.
pub trait EventOwner: Send + Sync {
    fn on_event(
        &self,
        reactor: &Reactor,
        handle: RegistrationHandle,
        readiness: Readiness,
    ) -> Option<Interest>;

    fn on_panic(&self, handle: RegistrationHandle, message: String) {
        tracing::error!("handler panic on registration {:?}: {}", handle, message);
    }
}

type TimerCallback = Box<dyn FnMut(u64) + Send>;

struct Registration {
    fd: RawFd,
    kind: FdKind,
    generation: u32,
    owner: Option<Arc<dyn EventOwner>>,
    timer: Option<Arc<Mutex<TimerCallback>>>,
    /// Timer fd owned by the reactor (add_periodic / add_timeout).
    owned_timer: Option<TimerFd>,
    repeating: bool,
}

#[derive(Default)]
struct Table {
    slots: Vec<Option<Registration>>,
    free: Vec<u32>,
    generations: Vec<u32>,
    by_fd: HashMap<RawFd, u32>,
}

impl Table {
    fn insert(&mut self, reg: Registration) -> Result<RegistrationHandle, ReactorError> {
        if self.by_fd.contains_key(&reg.fd) {
            return Err(ReactorError::FdAlreadyRegistered(reg.fd));
        }
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(None);
                self.generations.push(0);
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.generations[index as usize];
        let fd = reg.fd;
        self.slots[index as usize] = Some(Registration { generation, ..reg });
        self.by_fd.insert(fd, index);
        Ok(RegistrationHandle { index, generation })
    }

    fn get(&self, handle: RegistrationHandle) -> Option<&Registration> {
        self.slots
            .get(handle.index as usize)?
            .as_ref()
            .filter(|r| r.generation == handle.generation)
    }

    fn remove(&mut self, handle: RegistrationHandle) -> Option<Registration> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.as_ref().map(|r| r.generation) != Some(handle.generation) {
            return None;
        }
        let reg = slot.take()?;
        self.by_fd.remove(&reg.fd);
        self.generations[handle.index as usize] = self.generations[handle.index as usize].wrapping_add(1);
        self.free.push(handle.index);
        Some(reg)
    }
}

/// Reactor configuration, builder style.
#[derive(Clone)]
pub struct ReactorConfig {
    pub threads: usize,
    pub pin_workers: bool,
    pub poll_timeout_ms: i32,
    pub max_events: usize,
    pub name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            pin_workers: false,
            poll_timeout_ms: 100,
            max_events: 1024,
            name: "ostinato".to_string(),
        }
    }
}

impl ReactorConfig {
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn pin_workers(mut self, pin: bool) -> Self {
        self.pin_workers = pin;
        self
    }

    pub fn poll_timeout_ms(mut self, ms: i32) -> Self {
        self.poll_timeout_ms = ms;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }
}

struct ReactorInner {
    epoll: Epoll,
    table: Mutex<Table>,
    wakeup: EventFd,
    shutdown: AtomicBool,
    timers_allowed: AtomicBool,
    config: ReactorConfig,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Cloneable handle to the shared reactor.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

impl Reactor {
    pub fn new(config: ReactorConfig) -> Result<Reactor, ReactorError> {
        let threads = if config.threads == 0 {
            num_cpus::get()
        } else {
            config.threads
        };

        let inner = Arc::new(ReactorInner {
            epoll: Epoll::new()?,
            table: Mutex::new(Table::default()),
            wakeup: EventFd::new()?,
            shutdown: AtomicBool::new(false),
            timers_allowed: AtomicBool::new(true),
            config: ReactorConfig { threads, ..config },
            workers: Mutex::new(Vec::new()),
        });

        let reactor = Reactor { inner };

        // Internal wakeup fd: owner-less, drained and re-armed by whichever
        // worker receives it.
        {
            let mut table = reactor.inner.table.lock().unwrap();
            let handle = table.insert(Registration {
                fd: reactor.inner.wakeup.fd(),
                kind: FdKind::Wakeup,
                generation: 0,
                owner: None,
                timer: None,
                owned_timer: None,
                repeating: true,
            })?;
            reactor
                .inner
                .epoll
                .add(reactor.inner.wakeup.fd(), handle.token(), true, false)?;
        }

        let core_ids = if reactor.inner.config.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut workers = reactor.inner.workers.lock().unwrap();
        for i in 0..threads {
            let worker = reactor.clone();
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", reactor.inner.config.name, i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    worker.worker_loop(i);
                })
                .map_err(ReactorError::Io)?;
            workers.push(handle);
        }
        drop(workers);

        Ok(reactor)
    }

    /// Register an fd. Fails if the fd is already in the table. The fd is
    /// armed immediately with the given interest.
    pub fn register(
        &self,
        fd: RawFd,
        kind: FdKind,
        interest: Interest,
        owner: Arc<dyn EventOwner>,
    ) -> Result<RegistrationHandle, ReactorError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(ReactorError::ShuttingDown);
        }
        let mut table = self.inner.table.lock().unwrap();
        let handle = table.insert(Registration {
            fd,
            kind,
            generation: 0,
            owner: Some(owner),
            timer: None,
            owned_timer: None,
            repeating: true,
        })?;
        if let Err(e) = self
            .inner
            .epoll
            .add(fd, handle.token(), interest.readable, interest.writable)
        {
            table.remove(handle);
            return Err(ReactorError::Io(e));
        }
        Ok(handle)
    }

    /// Re-enable a one-shot registration for its next event.
    pub fn rearm(&self, handle: RegistrationHandle, interest: Interest) -> Result<(), ReactorError> {
        let table = self.inner.table.lock().unwrap();
        let reg = table.get(handle).ok_or(ReactorError::StaleHandle)?;
        self.inner
            .epoll
            .modify(reg.fd, handle.token(), interest.readable, interest.writable)?;
        Ok(())
    }

    /// Remove an fd from the multiplexer. Must be called before the fd is
    /// closed. Legal from within the owner's handler.
    pub fn unregister(&self, handle: RegistrationHandle) -> Result<(), ReactorError> {
        let mut table = self.inner.table.lock().unwrap();
        let reg = table.remove(handle).ok_or(ReactorError::StaleHandle)?;
        self.inner.epoll.delete(reg.fd)?;
        // reg drops here; an owned timer fd closes with it.
        Ok(())
    }

    /// Create an internal timer firing every `interval`. The callback
    /// receives the expiration count since last delivery, so slippage under
    /// load is observable.
    pub fn add_periodic(
        &self,
        interval: Duration,
        callback: impl FnMut(u64) + Send + 'static,
    ) -> Result<RegistrationHandle, ReactorError> {
        self.add_timer(interval, callback, true)
    }

    /// One-shot timer: fires once after `delay`, then unregisters itself.
    pub fn add_timeout(
        &self,
        delay: Duration,
        callback: impl FnMut(u64) + Send + 'static,
    ) -> Result<RegistrationHandle, ReactorError> {
        self.add_timer(delay, callback, false)
    }

    fn add_timer(
        &self,
        period: Duration,
        callback: impl FnMut(u64) + Send + 'static,
        repeating: bool,
    ) -> Result<RegistrationHandle, ReactorError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(ReactorError::ShuttingDown);
        }
        let timer = TimerFd::new()?;
        if repeating {
            timer.set_interval(period)?;
        } else {
            timer.set_oneshot(period)?;
        }
        let fd = timer.fd();
        let mut table = self.inner.table.lock().unwrap();
        let handle = table.insert(Registration {
            fd,
            kind: FdKind::Timer,
            generation: 0,
            owner: None,
            timer: Some(Arc::new(Mutex::new(Box::new(callback)))),
            owned_timer: Some(timer),
            repeating,
        })?;
        if let Err(e) = self.inner.epoll.add(fd, handle.token(), true, false) {
            table.remove(handle);
            return Err(ReactorError::Io(e));
        }
        Ok(handle)
    }

    /// Post a cross-thread wakeup to the worker pool.
    pub fn wake(&self) {
        self.inner.wakeup.signal();
    }

    /// Block all timer re-arm from this point on, so late expirations cannot
    /// resurrect work during shutdown.
    pub fn disallow_timers(&self) {
        self.inner.timers_allowed.store(false, Ordering::Release);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Signal workers to drain and exit, then join them. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.disallow_timers();
        self.wake();

        let workers = {
            let mut guard = self.inner.workers.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            // A worker joining itself would deadlock; shutdown from a
            // handler is not supported.
            if thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }

        // Drop remaining timer registrations so their fds close.
        let mut table = self.inner.table.lock().unwrap();
        let Table { slots, by_fd, .. } = &mut *table;
        for slot in slots.iter_mut() {
            if let Some(reg) = slot
                && reg.kind == FdKind::Timer
            {
                let _ = self.inner.epoll.delete(reg.fd);
                by_fd.remove(&reg.fd);
                *slot = None;
            }
        }
        tracing::debug!("reactor {} shut down", self.inner.config.name);
    }

    fn worker_loop(&self, worker_id: usize) {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; self.inner.config.max_events];
        tracing::debug!("worker {} entering event loop", worker_id);

        while !self.inner.shutdown.load(Ordering::Acquire) {
            let n = match self
                .inner
                .epoll
                .wait(&mut events, self.inner.config.poll_timeout_ms)
            {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("epoll_wait failed: {}", e);
                    break;
                }
            };

            for ev in events.iter().take(n) {
                let handle = RegistrationHandle::from_token(ev.u64);
                let readiness = Readiness {
                    readable: ev.events & syscalls::EPOLLIN != 0,
                    writable: ev.events & syscalls::EPOLLOUT != 0,
                    hangup: ev.events & syscalls::EPOLLHUP != 0,
                    error: ev.events & syscalls::EPOLLERR != 0,
                };
                self.dispatch(handle, readiness);
            }
        }
        tracing::debug!("worker {} exiting", worker_id);
    }

    fn dispatch(&self, handle: RegistrationHandle, readiness: Readiness) {
        // Snapshot what the handler needs, then release the table lock so
        // handlers can register/unregister freely.
        let (kind, fd, owner) = {
            let table = self.inner.table.lock().unwrap();
            let Some(reg) = table.get(handle) else {
                return; // unregistered between wait and dispatch
            };
            (reg.kind, reg.fd, reg.owner.clone())
        };

        match kind {
            // Internal timers (add_periodic / add_timeout). A timer fd
            // registered by a component with its own owner is dispatched
            // like any other fd.
            FdKind::Timer if owner.is_none() => self.dispatch_timer(handle, fd),
            FdKind::Wakeup if owner.is_none() => {
                // The reactor's own wakeup: drain and re-arm.
                self.inner.wakeup.drain();
                if !self.inner.shutdown.load(Ordering::Acquire) {
                    let _ = self.rearm(handle, Interest::READABLE);
                }
            }
            _ => {
                let Some(owner) = owner else { return };
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    owner.on_event(self, handle, readiness)
                }));
                match result {
                    Ok(Some(interest)) => {
                        // Owner may have unregistered concurrently; a stale
                        // handle here is not an error.
                        match self.rearm(handle, interest) {
                            Ok(()) | Err(ReactorError::StaleHandle) => {}
                            Err(e) => tracing::error!("rearm failed: {}", e),
                        }
                    }
                    Ok(None) => {}
                    Err(payload) => {
                        owner.on_panic(handle, panic_message(payload));
                    }
                }
            }
        }
    }

    fn dispatch_timer(&self, handle: RegistrationHandle, _fd: RawFd) {
        // Read the expiration count while the registration is provably
        // alive: unregistering closes the fd, and that requires the table
        // lock we hold here. The callback itself runs without the lock so
        // it can re-enter the reactor.
        let (ticks, callback, repeating) = {
            let table = self.inner.table.lock().unwrap();
            match table.get(handle) {
                Some(reg) => {
                    let ticks = reg
                        .owned_timer
                        .as_ref()
                        .and_then(|t| t.read_ticks().ok())
                        .unwrap_or(0);
                    (ticks, reg.timer.clone(), reg.repeating)
                }
                None => return,
            }
        };

        if let Some(cb) = callback {
            let mut cb = cb.lock().unwrap();
            let result = panic::catch_unwind(AssertUnwindSafe(|| (*cb)(ticks.max(1))));
            if let Err(payload) = result {
                tracing::error!("timer callback panic: {}", panic_message(payload));
            }
        }

        if repeating && self.inner.timers_allowed.load(Ordering::Acquire) {
            match self.rearm(handle, Interest::READABLE) {
                Ok(()) | Err(ReactorError::StaleHandle) => {}
                Err(e) => tracing::error!("timer rearm failed: {}", e),
            }
        } else if !repeating {
            let _ = self.unregister(handle);
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
