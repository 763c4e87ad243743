use crate::message::Message;
use crate::net::connection::{ConnState, Connection, ConnectionInfo, Role};
use crate::net::ConnHandle;
use crate::notifier::{ConnectionCallback, Notifier};
use crate::storage::Storage;
use crate::{PROTO_REV_2, PROTO_REV_3};
use basalt::logging::{self, Logger};
use hashbrown::HashSet;
use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const MIN_UPDATE_RATE: Duration = Duration::from_millis(10);
const MAX_UPDATE_RATE: Duration = Duration::from_secs(1);
const DEFAULT_UPDATE_RATE: Duration = Duration::from_millis(100);

const FLUSH_MIN_INTERVAL: Duration = Duration::from_millis(10);
const SAVE_INTERVAL: Duration = Duration::from_secs(1);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_JOIN_TIMEOUT: Duration = Duration::from_millis(250);

struct ConnSlot {
    generation: u32,
    conn: Option<Arc<Connection>>,
}

struct UserState {
    connections: Vec<ConnSlot>,
    identity: String,
    client_connectors: Vec<(String, u16)>,
    next_generation: u32,
    do_reconnect: bool,
    reconnect_proto_rev: u16,
    /// Client identities this server has completed a handshake with, used
    /// to flag reconnects in the server hello.
    seen_clients: HashSet<String>,
}

struct FlushState {
    do_flush: bool,
    last_flush: Instant,
}

/// Owns the connection arena and the background threads: the periodic
/// dispatch loop, and either the server accept loop or the client connect
/// loop. A single dispatcher serves one process-side of one namespace.
pub struct Dispatcher {
    storage: Arc<Storage>,
    notifier: Arc<Notifier>,

    active: AtomicBool,
    server: AtomicBool,
    local_port: AtomicU16,

    update_rate: Mutex<Duration>,
    persist_filename: Mutex<Option<PathBuf>>,

    user: Mutex<UserState>,
    reconnect_cond: Condvar,

    flush: Mutex<FlushState>,
    flush_cond: Condvar,

    running_threads: Mutex<usize>,
    threads_cond: Condvar,

    log: Logger,
}

impl Dispatcher {
    pub fn new(storage: Arc<Storage>, notifier: Arc<Notifier>, log: Option<&Logger>) -> Dispatcher {
        let log = match log {
            Some(log) => log.new(logging::o!("component" => "dispatcher")),
            None => logging::discard(),
        };

        Dispatcher {
            storage,
            notifier,
            active: AtomicBool::new(false),
            server: AtomicBool::new(false),
            local_port: AtomicU16::new(0),
            update_rate: Mutex::new(DEFAULT_UPDATE_RATE),
            persist_filename: Mutex::new(None),
            user: Mutex::new(UserState {
                connections: Vec::new(),
                identity: String::new(),
                client_connectors: Vec::new(),
                next_generation: 0,
                do_reconnect: true,
                reconnect_proto_rev: PROTO_REV_3,
                seen_clients: HashSet::new(),
            }),
            reconnect_cond: Condvar::new(),
            flush: Mutex::new(FlushState {
                do_flush: false,
                last_flush: Instant::now(),
            }),
            flush_cond: Condvar::new(),
            running_threads: Mutex::new(0),
            threads_cond: Condvar::new(),
            log,
        }
    }

    /// Binds the listen socket and starts the server threads. Fails when
    /// already running or when the socket cannot be bound.
    pub fn start_server(
        self: &Arc<Self>,
        persist_filename: Option<PathBuf>,
        listen_address: &str,
        port: u16,
    ) -> io::Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "dispatcher already running",
            ));
        }

        self.server.store(true, Ordering::SeqCst);

        let listener = match TcpListener::bind((listen_address, port)) {
            Ok(listener) => listener,
            Err(err) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        // Nonblocking so the accept loop can observe shutdown instead of
        // depending on a socket close to unblock it.
        listener.set_nonblocking(true)?;
        if let Ok(addr) = listener.local_addr() {
            self.local_port.store(addr.port(), Ordering::SeqCst);
        }

        if let Some(path) = &persist_filename {
            if let Err(err) = self.storage.load_persistent(path) {
                logging::warn!(self.log, "could not load persistent file";
                               "path" => %path.display(), "err" => %err);
            }
        }
        *self.persist_filename.lock().unwrap() = persist_filename;

        self.install_outgoing(true);

        let this = self.clone();
        self.spawn_tracked("slate-dispatch", move || this.dispatch_thread_main());
        let this = self.clone();
        self.spawn_tracked("slate-server", move || this.server_thread_main(listener));

        logging::info!(self.log, "server listening"; "address" => %listen_address, "port" => self.local_port.load(Ordering::SeqCst));
        Ok(())
    }

    /// Starts the client threads with a round-robin list of servers to try.
    pub fn start_client(self: &Arc<Self>, servers: Vec<(String, u16)>) -> io::Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "dispatcher already running",
            ));
        }

        self.server.store(false, Ordering::SeqCst);
        self.user.lock().unwrap().client_connectors = servers;

        self.install_outgoing(false);

        let this = self.clone();
        self.spawn_tracked("slate-dispatch", move || this.dispatch_thread_main());
        let this = self.clone();
        self.spawn_tracked("slate-client", move || this.client_thread_main());

        Ok(())
    }

    fn install_outgoing(self: &Arc<Self>, server: bool) {
        let weak = Arc::downgrade(self);
        self.storage.set_outgoing(
            Arc::new(move |msg, only, except| {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.queue_outgoing(msg, only, except);
                }
            }),
            server,
        );
    }

    fn spawn_tracked<F: FnOnce() + Send + 'static>(self: &Arc<Self>, name: &str, f: F) {
        *self.running_threads.lock().unwrap() += 1;

        let this = self.clone();
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                f();
                *this.running_threads.lock().unwrap() -= 1;
                this.threads_cond.notify_all();
            })
            .expect("failed to spawn dispatcher thread");
    }

    /// Stops the background threads and every connection. Threads are given
    /// a bounded window to exit and detached otherwise.
    pub fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        self.storage.clear_outgoing();

        // Wake the dispatch thread through a flush and the client thread
        // through a reconnect.
        {
            let mut flush = self.flush.lock().unwrap();
            flush.do_flush = true;
        }
        self.flush_cond.notify_all();
        {
            let mut user = self.user.lock().unwrap();
            user.client_connectors.clear();
            user.do_reconnect = true;
        }
        self.reconnect_cond.notify_all();

        let running = self.running_threads.lock().unwrap();
        let (running, _) = self
            .threads_cond
            .wait_timeout_while(running, STOP_JOIN_TIMEOUT, |count| *count > 0)
            .unwrap();
        if *running > 0 {
            logging::warn!(self.log, "dispatcher threads did not stop in time";
                           "remaining" => *running);
        }
        drop(running);

        let conns: Vec<Arc<Connection>> = {
            let mut user = self.user.lock().unwrap();
            user.connections
                .iter_mut()
                .filter_map(|slot| slot.conn.take())
                .collect()
        };
        for conn in conns {
            conn.stop();
        }
    }

    /// Periodic dispatch rate, clamped to [10 ms, 1 s].
    pub fn set_update_rate(&self, seconds: f64) {
        let rate = Duration::from_secs_f64(seconds.max(0.0));
        let rate = rate.max(MIN_UPDATE_RATE).min(MAX_UPDATE_RATE);
        *self.update_rate.lock().unwrap() = rate;
    }

    pub fn set_identity(&self, name: &str) {
        self.user.lock().unwrap().identity = name.to_owned();
    }

    /// The port actually bound, useful when the configured port was 0.
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::SeqCst)
    }

    /// Requests an immediate dispatch wakeup. Rate-limited to one flush per
    /// 10 ms.
    pub fn flush(&self) {
        let now = Instant::now();
        {
            let mut flush = self.flush.lock().unwrap();
            if now.duration_since(flush.last_flush) < FLUSH_MIN_INTERVAL {
                return;
            }
            flush.last_flush = now;
            flush.do_flush = true;
        }
        self.flush_cond.notify_one();
    }

    /// Info snapshots of the currently active connections.
    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        if !self.active.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let user = self.user.lock().unwrap();
        user.connections
            .iter()
            .filter_map(|slot| slot.conn.as_ref())
            .filter(|conn| conn.state() == ConnState::Active)
            .map(|conn| conn.info())
            .collect()
    }

    /// Synthesizes a connected event per live connection for a freshly
    /// added connection listener.
    pub fn notify_connections(&self, callback: Arc<ConnectionCallback>) {
        let user = self.user.lock().unwrap();
        for slot in &user.connections {
            if let Some(conn) = &slot.conn {
                if conn.state() == ConnState::Active {
                    self.notifier
                        .notify_connection(true, conn.info(), Some(callback.clone()));
                }
            }
        }
    }

    /// Fans a message out to eligible connections: those past handshake
    /// synchronization, minus `except`, or exactly `only` when given.
    pub(crate) fn queue_outgoing(
        &self,
        msg: Message,
        only: Option<ConnHandle>,
        except: Option<ConnHandle>,
    ) {
        let user = self.user.lock().unwrap();
        for slot in &user.connections {
            let conn = match &slot.conn {
                Some(conn) => conn,
                None => continue,
            };
            let handle = conn.handle();

            if Some(handle) == except {
                continue;
            }
            if let Some(only) = only {
                if handle != only {
                    continue;
                }
            }

            match conn.state() {
                ConnState::Synchronized | ConnState::Active => conn.queue_outgoing(msg.clone()),
                _ => {}
            }
        }
    }

    fn dispatch_thread_main(self: Arc<Self>) {
        let mut timeout_time = Instant::now();
        let mut next_save = timeout_time + SAVE_INTERVAL;

        let mut flush = self.flush.lock().unwrap();
        while self.active.load(Ordering::SeqCst) {
            let start = Instant::now();
            if start > timeout_time {
                timeout_time = start;
            }
            timeout_time += *self.update_rate.lock().unwrap();

            // Wait for the periodic deadline or an explicit flush.
            while !flush.do_flush && self.active.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= timeout_time {
                    break;
                }
                let (guard, _) = self
                    .flush_cond
                    .wait_timeout(flush, timeout_time - now)
                    .unwrap();
                flush = guard;
            }
            flush.do_flush = false;

            if !self.active.load(Ordering::SeqCst) {
                break;
            }
            drop(flush);

            // Periodic persistent save; failures are logged and retried on
            // a later tick through the re-armed dirty flag.
            if self.server.load(Ordering::SeqCst) && start >= next_save {
                next_save += SAVE_INTERVAL;
                if start > next_save {
                    next_save = start + SAVE_INTERVAL;
                }

                let path = self.persist_filename.lock().unwrap().clone();
                if let Some(path) = path {
                    if let Err(err) = self.storage.save_persistent(&path, true) {
                        logging::warn!(self.log, "periodic persistent save failed"; "err" => %err);
                    }
                }
            }

            let is_server = self.server.load(Ordering::SeqCst);
            let mut reconnect = false;
            {
                let mut user = self.user.lock().unwrap();
                for slot in &user.connections {
                    if let Some(conn) = &slot.conn {
                        let state = conn.state();
                        if state == ConnState::Active {
                            // Only clients send keep-alives.
                            conn.post_outgoing(!is_server);
                        }
                        if !is_server && state == ConnState::Dead {
                            reconnect = true;
                        }
                    }
                }

                // Kick the client thread unless a reconnect is already in
                // progress. A fresh attempt always starts at the highest
                // revision; only a proto-unsupported reply lowers it.
                if reconnect && !user.do_reconnect {
                    user.do_reconnect = true;
                    user.reconnect_proto_rev = PROTO_REV_3;
                    drop(user);
                    self.reconnect_cond.notify_one();
                }
            }

            flush = self.flush.lock().unwrap();
        }

        logging::debug!(self.log, "dispatch thread exiting");
    }

    fn server_thread_main(self: Arc<Self>, listener: TcpListener) {
        while self.active.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, addr)) => {
                    if !self.active.load(Ordering::SeqCst) {
                        break;
                    }
                    logging::debug!(self.log, "server: client connection";
                                    "peer_ip" => %addr.ip(), "peer_port" => addr.port());
                    self.add_server_connection(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "err" => %err);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        logging::debug!(self.log, "server thread exiting");
    }

    fn add_server_connection(self: &Arc<Self>, stream: TcpStream) {
        let (conn, old) = {
            let mut user = self.user.lock().unwrap();

            // Reuse the first dead slot, bumping its generation so stale
            // handles stop matching.
            let slot_idx = user
                .connections
                .iter()
                .position(|slot| match &slot.conn {
                    Some(conn) => conn.state() == ConnState::Dead,
                    None => true,
                })
                .unwrap_or_else(|| {
                    user.connections.push(ConnSlot {
                        generation: 0,
                        conn: None,
                    });
                    user.connections.len() - 1
                });

            user.next_generation += 1;
            let generation = user.next_generation;
            let handle = ConnHandle::new(slot_idx, generation);

            let conn = match Connection::new(
                stream,
                handle,
                Role::Server,
                self.storage.clone(),
                self.notifier.clone(),
                Arc::downgrade(self),
                &self.log,
            ) {
                Ok(conn) => conn,
                Err(err) => {
                    logging::debug!(self.log, "failed to set up connection"; "err" => %err);
                    return;
                }
            };

            let slot = &mut user.connections[slot_idx];
            slot.generation = generation;
            let old = slot.conn.replace(conn.clone());
            (conn, old)
        };

        if let Some(old) = old {
            old.stop();
        }
        conn.start();
    }

    fn client_thread_main(self: Arc<Self>) {
        let mut next_connector = 0usize;

        while self.active.load(Ordering::SeqCst) {
            thread::sleep(CONNECT_RETRY_INTERVAL);

            let target = {
                let user = self.user.lock().unwrap();
                if user.client_connectors.is_empty() {
                    continue;
                }
                if next_connector >= user.client_connectors.len() {
                    next_connector = 0;
                }
                let target = user.client_connectors[next_connector].clone();
                next_connector += 1;
                target
            };

            logging::debug!(self.log, "client trying to connect";
                            "host" => %target.0, "port" => target.1);
            let stream = match connect_with_timeout(&target.0, target.1) {
                Some(stream) => stream,
                None => continue,
            };
            logging::debug!(self.log, "client connected");

            let (conn, old) = {
                let mut user = self.user.lock().unwrap();
                if !self.active.load(Ordering::SeqCst) {
                    break;
                }

                user.next_generation += 1;
                let generation = user.next_generation;
                let handle = ConnHandle::new(0, generation);

                let conn = match Connection::new(
                    stream,
                    handle,
                    Role::Client,
                    self.storage.clone(),
                    self.notifier.clone(),
                    Arc::downgrade(&self),
                    &self.log,
                ) {
                    Ok(conn) => conn,
                    Err(err) => {
                        logging::debug!(self.log, "failed to set up connection"; "err" => %err);
                        continue;
                    }
                };

                // The new link replaces whatever is there.
                let old: Vec<Arc<Connection>> = user
                    .connections
                    .drain(..)
                    .filter_map(|slot| slot.conn)
                    .collect();

                conn.set_proto_rev(user.reconnect_proto_rev);
                user.connections.push(ConnSlot {
                    generation,
                    conn: Some(conn.clone()),
                });
                user.do_reconnect = false;
                (conn, old)
            };

            for stale in old {
                stale.stop();
            }
            conn.start();

            // Block until a reconnect is requested.
            let mut user = self.user.lock().unwrap();
            while self.active.load(Ordering::SeqCst) && !user.do_reconnect {
                user = self.reconnect_cond.wait(user).unwrap();
            }
        }

        logging::debug!(self.log, "client thread exiting");
    }

    /// Requests the client thread to drop the current connection and dial
    /// again announcing `proto_rev`.
    pub(crate) fn client_reconnect(&self, proto_rev: u16) {
        if self.server.load(Ordering::SeqCst) {
            return;
        }

        {
            let mut user = self.user.lock().unwrap();
            user.reconnect_proto_rev = proto_rev;
            user.do_reconnect = true;
        }
        self.reconnect_cond.notify_all();
    }

    /// Client side of the handshake: hello, server snapshot, reconcile.
    pub(crate) fn client_handshake(
        &self,
        conn: &Arc<Connection>,
        get_msg: &mut dyn FnMut() -> Option<Message>,
        send_msgs: &mut dyn FnMut(Vec<Message>),
    ) -> bool {
        let identity = self.user.lock().unwrap().identity.clone();

        logging::debug!(self.log, "client: sending hello"; "proto_rev" => conn.proto_rev());
        send_msgs(vec![Message::ClientHello {
            proto_rev: conn.proto_rev(),
            identity,
        }]);

        let mut msg = match get_msg() {
            Some(msg) => msg,
            None => {
                logging::debug!(self.log, "client: server disconnected before first response");
                return false;
            }
        };

        if let Message::ProtoUnsup { proto_rev } = msg {
            // The server told us the highest revision it speaks; try again
            // there.
            let next = proto_rev.min(PROTO_REV_3).max(PROTO_REV_2);
            logging::debug!(self.log, "client: server requested downgrade"; "proto_rev" => next);
            self.client_reconnect(next);
            return false;
        }

        let mut new_server = true;
        if conn.proto_rev() >= PROTO_REV_3 {
            match msg {
                Message::ServerHello { flags, identity } => {
                    conn.set_remote_id(&identity);
                    if flags & 1 != 0 {
                        new_server = false;
                    }
                }
                _ => return false,
            }

            msg = match get_msg() {
                Some(msg) => msg,
                None => return false,
            };
        }

        // The server's snapshot: entry assigns up to server-hello-done.
        let mut incoming = Vec::new();
        loop {
            if matches!(msg, Message::ServerHelloDone) {
                break;
            }
            if !matches!(msg, Message::EntryAssign { .. }) {
                logging::debug!(self.log,
                    "client: received unexpected message during initial handshake";
                    "kind" => msg.kind());
                return false;
            }
            incoming.push(msg);

            msg = match get_msg() {
                Some(msg) => msg,
                None => {
                    logging::debug!(self.log, "client: server disconnected during initial entries");
                    return false;
                }
            };
        }

        let mut outgoing = self
            .storage
            .apply_initial_assignments(conn, incoming, new_server);

        if conn.proto_rev() >= PROTO_REV_3 {
            outgoing.push(Message::ClientHelloDone);
        }
        if !outgoing.is_empty() {
            send_msgs(outgoing);
        }

        logging::info!(self.log, "client: connected to server";
                       "remote_ip" => %conn.info().remote_ip,
                       "remote_port" => conn.info().remote_port);
        true
    }

    /// Server side of the handshake: negotiate the revision downward, send
    /// the snapshot, then absorb the client's entries.
    pub(crate) fn server_handshake(
        &self,
        conn: &Arc<Connection>,
        get_msg: &mut dyn FnMut() -> Option<Message>,
        send_msgs: &mut dyn FnMut(Vec<Message>),
    ) -> bool {
        let msg = match get_msg() {
            Some(msg) => msg,
            None => {
                logging::debug!(self.log, "server: client disconnected before sending hello");
                return false;
            }
        };

        let (proto_rev, client_identity) = match msg {
            Message::ClientHello {
                proto_rev,
                identity,
            } => (proto_rev, identity),
            other => {
                logging::debug!(self.log, "server: client initial message was not client hello";
                                "kind" => other.kind());
                return false;
            }
        };

        if proto_rev > PROTO_REV_3 {
            logging::debug!(self.log, "server: client requested unsupported revision";
                            "proto_rev" => proto_rev);
            send_msgs(vec![Message::ProtoUnsup {
                proto_rev: PROTO_REV_3,
            }]);
            return false;
        }

        if proto_rev >= PROTO_REV_3 {
            conn.set_remote_id(&client_identity);
        }

        logging::debug!(self.log, "server: client protocol"; "proto_rev" => proto_rev);
        conn.set_proto_rev(proto_rev);

        let mut outgoing = Vec::new();

        if proto_rev >= PROTO_REV_3 {
            let mut user = self.user.lock().unwrap();
            // Flag bit 0 tells the client whether we have synchronized with
            // it before, which decides its reconnect reconciliation.
            let seen = !client_identity.is_empty()
                && !user.seen_clients.insert(client_identity.clone());
            outgoing.push(Message::ServerHello {
                flags: seen as u8,
                identity: user.identity.clone(),
            });
        }

        outgoing.extend(self.storage.get_initial_assignments(conn));
        outgoing.push(Message::ServerHelloDone);

        logging::debug!(self.log, "server: sending initial assignments";
                        "count" => outgoing.len());
        send_msgs(outgoing);

        // From 3.0 on the handshake closes with client-hello-done and the
        // client's own entries arrive as a batch; at 2.0 the connection goes
        // active immediately and they arrive through the reader loop.
        if proto_rev >= PROTO_REV_3 {
            let mut incoming = Vec::new();
            loop {
                let msg = match get_msg() {
                    Some(msg) => msg,
                    None => {
                        logging::debug!(self.log, "server: disconnected waiting for initial entries");
                        return false;
                    }
                };

                if matches!(msg, Message::ClientHelloDone) {
                    break;
                }
                if !matches!(msg, Message::EntryAssign { .. }) {
                    logging::debug!(self.log,
                        "server: received unexpected message during initial handshake";
                        "kind" => msg.kind());
                    return false;
                }
                incoming.push(msg);
            }

            for msg in incoming {
                self.storage.process_incoming(msg, conn);
            }
        }

        logging::info!(self.log, "server: client connected";
                       "remote_ip" => %conn.info().remote_ip,
                       "remote_port" => conn.info().remote_port);
        true
    }
}

fn connect_with_timeout(host: &str, port: u16) -> Option<TcpStream> {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(_) => return None,
    };

    for addr in addrs {
        if let Ok(stream) = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            return Some(stream);
        }
    }

    None
}
