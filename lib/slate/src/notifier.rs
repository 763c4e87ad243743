use crate::net::connection::ConnectionInfo;
use crate::value::Value;
use basalt::logging::{self, Logger};
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Synthetic replay event generated for a freshly added listener.
pub const NOTIFY_IMMEDIATE: u32 = 0x01;
/// The change originated from a user API call on this process.
pub const NOTIFY_LOCAL: u32 = 0x02;
/// A new entry came into existence.
pub const NOTIFY_NEW: u32 = 0x04;
/// The entry was deleted.
pub const NOTIFY_DELETE: u32 = 0x08;
/// The entry's value changed.
pub const NOTIFY_UPDATE: u32 = 0x10;
/// The entry's flags changed.
pub const NOTIFY_FLAGS: u32 = 0x20;

pub type EntryCallback = dyn Fn(usize, &str, &Arc<Value>, u32) + Send + Sync;
pub type ConnectionCallback = dyn Fn(usize, bool, &ConnectionInfo) + Send + Sync;

struct EntryListener {
    prefix: String,
    callback: Arc<EntryCallback>,
    flags: u32,
}

impl EntryListener {
    /// Event kinds must fall within the requested set, with one twist: an
    /// assign carries both UPDATE and FLAGS, and a listener interested in
    /// either alone still gets the combined event.
    fn matches(&self, name: &str, event_flags: u32) -> bool {
        let assign_both = NOTIFY_UPDATE | NOTIFY_FLAGS;
        let mut listen_flags = self.flags;
        let mut flags = event_flags;

        if flags & assign_both == assign_both {
            if listen_flags & assign_both == 0 {
                return false;
            }
            listen_flags &= !assign_both;
            flags &= !assign_both;
        }

        if flags & !listen_flags != 0 {
            return false;
        }

        name.starts_with(&self.prefix)
    }
}

struct EntryNotification {
    name: String,
    value: Arc<Value>,
    flags: u32,
    only: Option<Arc<EntryCallback>>,
}

struct ConnNotification {
    connected: bool,
    info: ConnectionInfo,
    only: Option<Arc<ConnectionCallback>>,
}

struct State {
    active: bool,
    started: bool,
    shutdown: bool,
    next_entry_uid: usize,
    next_conn_uid: usize,
    entry_listeners: IndexMap<usize, EntryListener>,
    conn_listeners: IndexMap<usize, Arc<ConnectionCallback>>,
    entry_queue: VecDeque<EntryNotification>,
    conn_queue: VecDeque<ConnNotification>,
}

/// Fans entry and connection events out to user callbacks on a dedicated
/// worker thread. Callbacks never run under any engine lock, so they are
/// free to call back into the public API.
pub struct Notifier {
    state: Mutex<State>,
    cond: Condvar,
    local_notifiers: AtomicBool,
    log: Logger,
}

impl Notifier {
    pub fn new(log: Option<&Logger>) -> Notifier {
        let log = match log {
            Some(log) => log.new(logging::o!("component" => "notifier")),
            None => logging::discard(),
        };

        Notifier {
            state: Mutex::new(State {
                active: false,
                started: false,
                shutdown: false,
                next_entry_uid: 0,
                next_conn_uid: 0,
                entry_listeners: IndexMap::new(),
                conn_listeners: IndexMap::new(),
                entry_queue: VecDeque::new(),
                conn_queue: VecDeque::new(),
            }),
            cond: Condvar::new(),
            local_notifiers: AtomicBool::new(false),
            log,
        }
    }

    /// True if any registered entry listener asked for LOCAL events. Storage
    /// checks this before generating local-only notifications at all.
    #[inline]
    pub fn local_notifiers(&self) -> bool {
        self.local_notifiers.load(Ordering::Relaxed)
    }

    fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.started {
            return;
        }

        state.started = true;
        state.active = true;
        state.shutdown = false;

        let this = self.clone();
        thread::Builder::new()
            .name("slate-notifier".to_owned())
            .spawn(move || this.worker())
            .expect("failed to spawn notifier thread");
    }

    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if !state.started {
                return;
            }
            state.active = false;
        }
        self.cond.notify_all();

        // Bounded wait for the worker to drain out; a stuck user callback
        // leaves it detached.
        let deadline = Duration::from_millis(250);
        let state = self.state.lock().unwrap();
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, deadline, |s| !s.shutdown)
            .unwrap();

        if !state.shutdown {
            logging::warn!(self.log, "notifier thread did not stop in time");
        }
        state.started = false;
    }

    pub fn add_entry_listener(
        self: &Arc<Self>,
        prefix: &str,
        callback: Arc<EntryCallback>,
        flags: u32,
    ) -> usize {
        self.start();

        if flags & NOTIFY_LOCAL != 0 {
            self.local_notifiers.store(true, Ordering::Relaxed);
        }

        let mut state = self.state.lock().unwrap();
        state.next_entry_uid += 1;
        let uid = state.next_entry_uid;
        state.entry_listeners.insert(
            uid,
            EntryListener {
                prefix: prefix.to_owned(),
                callback,
                flags,
            },
        );
        uid
    }

    pub fn remove_entry_listener(&self, uid: usize) {
        let mut state = self.state.lock().unwrap();
        state.entry_listeners.shift_remove(&uid);
    }

    pub fn add_connection_listener(self: &Arc<Self>, callback: Arc<ConnectionCallback>) -> usize {
        self.start();

        let mut state = self.state.lock().unwrap();
        state.next_conn_uid += 1;
        let uid = state.next_conn_uid;
        state.conn_listeners.insert(uid, callback);
        uid
    }

    pub fn remove_connection_listener(&self, uid: usize) {
        let mut state = self.state.lock().unwrap();
        state.conn_listeners.shift_remove(&uid);
    }

    /// Enqueues an entry event for asynchronous delivery. When `only` is
    /// given, the event goes to that callback alone instead of fanning out.
    pub fn notify_entry(
        &self,
        name: &str,
        value: &Arc<Value>,
        flags: u32,
        only: Option<Arc<EntryCallback>>,
    ) {
        // Local-only events are pointless with no local listeners; skip the
        // queue traffic entirely.
        if flags & NOTIFY_LOCAL != 0 && !self.local_notifiers() {
            return;
        }

        let mut state = self.state.lock().unwrap();
        if !state.started {
            return;
        }

        state.entry_queue.push_back(EntryNotification {
            name: name.to_owned(),
            value: value.clone(),
            flags,
            only,
        });
        drop(state);
        self.cond.notify_one();
    }

    /// Enqueues a connection up/down event.
    pub fn notify_connection(
        &self,
        connected: bool,
        info: ConnectionInfo,
        only: Option<Arc<ConnectionCallback>>,
    ) {
        let mut state = self.state.lock().unwrap();
        if !state.started {
            return;
        }

        state.conn_queue.push_back(ConnNotification {
            connected,
            info,
            only,
        });
        drop(state);
        self.cond.notify_one();
    }

    fn worker(self: Arc<Self>) {
        logging::debug!(self.log, "notifier thread running");

        let mut state = self.state.lock().unwrap();
        'outer: loop {
            while state.active && state.entry_queue.is_empty() && state.conn_queue.is_empty() {
                state = self.cond.wait(state).unwrap();
            }
            if !state.active {
                break;
            }

            while let Some(item) = state.entry_queue.pop_front() {
                if !state.active {
                    break 'outer;
                }

                let targets: Vec<(usize, Arc<EntryCallback>)> = match item.only {
                    Some(callback) => vec![(0, callback)],
                    None => state
                        .entry_listeners
                        .iter()
                        .filter(|(_, listener)| listener.matches(&item.name, item.flags))
                        .map(|(uid, listener)| (*uid, listener.callback.clone()))
                        .collect(),
                };

                // Never hold the lock during callback execution.
                drop(state);
                for (uid, callback) in targets {
                    callback(uid, &item.name, &item.value, item.flags);
                }
                state = self.state.lock().unwrap();
            }

            while let Some(item) = state.conn_queue.pop_front() {
                if !state.active {
                    break 'outer;
                }

                let targets: Vec<(usize, Arc<ConnectionCallback>)> = match item.only {
                    Some(callback) => vec![(0, callback)],
                    None => state
                        .conn_listeners
                        .iter()
                        .map(|(uid, callback)| (*uid, callback.clone()))
                        .collect(),
                };

                drop(state);
                for (uid, callback) in targets {
                    callback(uid, item.connected, &item.info);
                }
                state = self.state.lock().unwrap();
            }
        }

        logging::debug!(self.log, "notifier thread exiting");
        state.shutdown = true;
        drop(state);
        self.cond.notify_all();
    }
}
