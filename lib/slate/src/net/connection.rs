use crate::message::Message;
use crate::net::dispatcher::Dispatcher;
use crate::net::ConnHandle;
use crate::notifier::Notifier;
use crate::storage::Storage;
use crate::wire::{WireDecoder, WireEncoder};
use crate::{PROTO_REV_3, UNASSIGNED_ID};
use basalt::logging::{self, Logger};
use basalt::time::timestamp_secs;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

static NEXT_UID: AtomicUsize = AtomicUsize::new(0);

const HANDSHAKE_RECV_TIMEOUT: Duration = Duration::from_secs(1);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Which side of the handshake this connection runs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Server,
    Client,
}

/// Per-peer lifecycle. Transitions are one-way and Dead is terminal; a dead
/// slot is reused by building a fresh connection in its place.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnState {
    Created,
    Init,
    Handshake,
    Synchronized,
    Active,
    Dead,
}

/// Snapshot of a connection handed to connection listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub remote_id: String,
    pub remote_ip: String,
    pub remote_port: u16,
    /// Unix timestamp of the last inbound message.
    pub last_update: u64,
    pub protocol_version: u16,
}

#[derive(Default)]
struct PendingIndex {
    value_pos: Option<usize>,
    flags_pos: Option<usize>,
}

/// Outgoing messages accumulated between dispatch ticks, coalesced by entry
/// id so a burst of writes to one entry leaves a single message representing
/// the final state.
struct Pending {
    list: Vec<Option<Message>>,
    index: HashMap<u16, PendingIndex>,
    last_post: Instant,
}

impl Pending {
    fn new() -> Pending {
        Pending {
            list: Vec::new(),
            index: HashMap::new(),
            last_post: Instant::now(),
        }
    }

    fn queue(&mut self, msg: Message) {
        match &msg {
            Message::EntryAssign { id, .. } | Message::EntryUpdate { id, .. } => {
                let id = *id;
                // Unassigned ids carry no identity to merge on.
                if id == UNASSIGNED_ID {
                    self.list.push(Some(msg));
                    return;
                }

                let slot = self.index.entry(id).or_default();
                if let Some(pos) = slot.value_pos {
                    let old = &mut self.list[pos];
                    match (&mut *old, &msg) {
                        (
                            Some(Message::EntryAssign { seq_num, value, .. }),
                            Message::EntryUpdate {
                                seq_num: new_seq,
                                value: new_value,
                                ..
                            },
                        ) => {
                            // An assign followed by an update stays an
                            // assign carrying the newest seq_num and value.
                            *seq_num = *new_seq;
                            *value = new_value.clone();
                        }
                        _ => *old = Some(msg),
                    }
                } else {
                    slot.value_pos = Some(self.list.len());
                    self.list.push(Some(msg));
                }
            }
            Message::EntryDelete { id } => {
                let id = *id;
                if id == UNASSIGNED_ID {
                    self.list.push(Some(msg));
                    return;
                }

                // A delete wipes anything still pending for the id.
                if let Some(slot) = self.index.get_mut(&id) {
                    if let Some(pos) = slot.value_pos.take() {
                        self.list[pos] = None;
                    }
                    if let Some(pos) = slot.flags_pos.take() {
                        self.list[pos] = None;
                    }
                }
                self.list.push(Some(msg));
            }
            Message::FlagsUpdate { id, .. } => {
                let id = *id;
                if id == UNASSIGNED_ID {
                    self.list.push(Some(msg));
                    return;
                }

                let slot = self.index.entry(id).or_default();
                if let Some(pos) = slot.flags_pos {
                    self.list[pos] = Some(msg);
                } else {
                    slot.flags_pos = Some(self.list.len());
                    self.list.push(Some(msg));
                }
            }
            Message::ClearEntries => {
                // A clear makes every pending entry operation moot.
                for slot in self.list.iter_mut() {
                    if let Some(
                        Message::EntryAssign { .. }
                        | Message::EntryUpdate { .. }
                        | Message::FlagsUpdate { .. }
                        | Message::EntryDelete { .. }
                        | Message::ClearEntries,
                    ) = slot
                    {
                        *slot = None;
                    }
                }
                self.index.clear();
                self.list.push(Some(msg));
            }
            _ => self.list.push(Some(msg)),
        }
    }

    /// Takes the coalesced batch, or a lone keep-alive when nothing is
    /// pending, keep-alives were requested and the link has been quiet for
    /// more than a second.
    fn post(&mut self, keep_alive: bool, now: Instant) -> Option<Vec<Message>> {
        if self.list.is_empty() {
            if !keep_alive {
                return None;
            }
            if now.duration_since(self.last_post) < KEEPALIVE_INTERVAL {
                return None;
            }

            self.last_post = now;
            return Some(vec![Message::KeepAlive]);
        }

        let batch: Vec<Message> = self.list.drain(..).flatten().collect();
        self.index.clear();
        self.last_post = now;
        Some(batch)
    }
}

/// A live peer link. Owns a reader thread (decode + hand off to storage) and
/// a writer thread (batch encode + send); all outbound traffic funnels
/// through the pending list until the dispatcher posts it.
pub struct Connection {
    uid: usize,
    handle: ConnHandle,
    role: Role,
    stream: TcpStream,
    remote_ip: String,
    remote_port: u16,

    active: AtomicBool,
    started: AtomicBool,
    proto_rev: AtomicU16,
    state: Mutex<ConnState>,
    last_update: AtomicU64,
    remote_id: Mutex<String>,

    outgoing: Mutex<VecDeque<Vec<Message>>>,
    outgoing_cond: Condvar,

    pending: Mutex<Pending>,

    shutdown: Mutex<ShutdownFlags>,
    shutdown_cond: Condvar,

    storage: Arc<Storage>,
    notifier: Arc<Notifier>,
    dispatcher: Weak<Dispatcher>,

    log: Logger,
}

#[derive(Default)]
struct ShutdownFlags {
    read_done: bool,
    write_done: bool,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        handle: ConnHandle,
        role: Role,
        storage: Arc<Storage>,
        notifier: Arc<Notifier>,
        dispatcher: Weak<Dispatcher>,
        log: &Logger,
    ) -> io::Result<Arc<Connection>> {
        let uid = NEXT_UID.fetch_add(1, Ordering::Relaxed);

        // Messages are bundled per flush; Nagle only adds latency on top.
        stream.set_nodelay(true)?;

        let (remote_ip, remote_port) = match stream.peer_addr() {
            Ok(addr) => (addr.ip().to_string(), addr.port()),
            Err(_) => (String::new(), 0),
        };

        Ok(Arc::new(Connection {
            uid,
            handle,
            role,
            stream,
            remote_ip,
            remote_port,
            active: AtomicBool::new(false),
            started: AtomicBool::new(false),
            proto_rev: AtomicU16::new(PROTO_REV_3),
            state: Mutex::new(ConnState::Created),
            last_update: AtomicU64::new(0),
            remote_id: Mutex::new(String::new()),
            outgoing: Mutex::new(VecDeque::new()),
            outgoing_cond: Condvar::new(),
            pending: Mutex::new(Pending::new()),
            shutdown: Mutex::new(ShutdownFlags::default()),
            shutdown_cond: Condvar::new(),
            storage,
            notifier,
            dispatcher,
            log: log.new(logging::o!("conn_uid" => uid)),
        }))
    }

    #[inline]
    pub fn uid(&self) -> usize {
        self.uid
    }

    #[inline]
    pub(crate) fn handle(&self) -> ConnHandle {
        self.handle
    }

    #[inline]
    pub fn proto_rev(&self) -> u16 {
        self.proto_rev.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_proto_rev(&self, proto_rev: u16) {
        self.proto_rev.store(proto_rev, Ordering::Release);
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        *self.state.lock().unwrap()
    }

    /// Dead is terminal; any other transition just records the new state.
    pub(crate) fn set_state(&self, new_state: ConnState) {
        let mut state = self.state.lock().unwrap();
        if *state != ConnState::Dead {
            *state = new_state;
        }
    }

    pub(crate) fn set_remote_id(&self, remote_id: &str) {
        *self.remote_id.lock().unwrap() = remote_id.to_owned();
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            remote_id: self.remote_id.lock().unwrap().clone(),
            remote_ip: self.remote_ip.clone(),
            remote_port: self.remote_port,
            last_update: self.last_update.load(Ordering::Relaxed),
            protocol_version: self.proto_rev(),
        }
    }

    /// Spawns the reader and writer threads. The reader runs the handshake
    /// before entering its decode loop.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }

        self.started.store(true, Ordering::SeqCst);
        self.set_state(ConnState::Init);
        self.outgoing.lock().unwrap().clear();
        *self.shutdown.lock().unwrap() = ShutdownFlags::default();

        let writer = self.clone();
        thread::Builder::new()
            .name("slate-conn-write".to_owned())
            .spawn(move || writer.write_thread_main())
            .expect("failed to spawn connection writer");

        let reader = self.clone();
        thread::Builder::new()
            .name("slate-conn-read".to_owned())
            .spawn(move || reader.read_thread_main())
            .expect("failed to spawn connection reader");
    }

    /// Moves the connection to Dead, closes the socket and gives both
    /// threads a bounded window to wind down before they are left detached.
    pub(crate) fn stop(&self) {
        logging::debug!(self.log, "connection stopping");

        self.set_state(ConnState::Dead);
        self.active.store(false, Ordering::SeqCst);
        self.shutdown_stream();

        // An empty batch unparks the writer.
        self.push_outgoing(Vec::new());

        if self.started.load(Ordering::SeqCst) {
            let flags = self.shutdown.lock().unwrap();
            let (flags, timeout) = self
                .shutdown_cond
                .wait_timeout_while(flags, SHUTDOWN_JOIN_TIMEOUT, |f| {
                    !f.read_done || !f.write_done
                })
                .unwrap();
            if timeout.timed_out() {
                logging::warn!(self.log, "connection threads did not stop in time";
                               "read_done" => flags.read_done,
                               "write_done" => flags.write_done);
            }
        }

        self.outgoing.lock().unwrap().clear();
    }

    #[inline]
    fn shutdown_stream(&self) {
        drop(self.stream.shutdown(Shutdown::Both));
    }

    /// Adds a message to the pending list, coalescing against what is
    /// already queued for the same entry id.
    pub(crate) fn queue_outgoing(&self, msg: Message) {
        self.pending.lock().unwrap().queue(msg);
    }

    /// Hands the coalesced pending batch to the writer thread. Called from
    /// the dispatch thread on every tick and on explicit flushes.
    pub(crate) fn post_outgoing(&self, keep_alive: bool) {
        let batch = self.pending.lock().unwrap().post(keep_alive, Instant::now());

        if let Some(batch) = batch {
            if !batch.is_empty() {
                self.push_outgoing(batch);
            }
        }
    }

    /// Queues a batch directly for the writer, bypassing coalescing. Used by
    /// the handshake and by `post_outgoing`.
    pub(crate) fn push_outgoing(&self, batch: Vec<Message>) {
        self.outgoing.lock().unwrap().push_back(batch);
        self.outgoing_cond.notify_one();
    }

    fn pop_outgoing(&self) -> Vec<Message> {
        let mut queue = self.outgoing.lock().unwrap();
        loop {
            if let Some(batch) = queue.pop_front() {
                return batch;
            }
            if !self.active.load(Ordering::SeqCst) {
                return Vec::new();
            }
            queue = self.outgoing_cond.wait(queue).unwrap();
        }
    }

    fn read_thread_main(self: Arc<Self>) {
        let reader = match self.stream.try_clone() {
            Ok(stream) => stream,
            Err(err) => {
                logging::debug!(self.log, "failed to clone stream for reader"; "err" => %err);
                self.finish_read_thread(false);
                return;
            }
        };
        let mut decoder = WireDecoder::new(io::BufReader::new(reader), self.proto_rev());

        self.set_state(ConnState::Handshake);
        // The handshake is the only phase with a hard expectation of
        // timeliness from the peer.
        drop(self.stream.set_read_timeout(Some(HANDSHAKE_RECV_TIMEOUT)));

        let ok = match self.dispatcher.upgrade() {
            Some(dispatcher) => {
                let storage = self.storage.clone();
                let conn = self.clone();
                let log = self.log.clone();

                let mut get_msg = || {
                    decoder.set_proto_rev(conn.proto_rev());
                    match Message::read(&mut decoder, &|id| storage.get_entry_type(id)) {
                        Ok(msg) => Some(msg),
                        Err(err) => {
                            logging::debug!(log, "error reading in handshake"; "err" => %err);
                            None
                        }
                    }
                };

                let sender = self.clone();
                let mut send_msgs = |batch: Vec<Message>| sender.push_outgoing(batch);

                match self.role {
                    Role::Server => dispatcher.server_handshake(&self, &mut get_msg, &mut send_msgs),
                    Role::Client => dispatcher.client_handshake(&self, &mut get_msg, &mut send_msgs),
                }
            }
            None => false,
        };

        if !ok {
            self.finish_read_thread(false);
            return;
        }

        drop(self.stream.set_read_timeout(None));
        self.set_state(ConnState::Active);
        self.notifier.notify_connection(true, self.info(), None);

        while self.active.load(Ordering::SeqCst) {
            decoder.set_proto_rev(self.proto_rev());

            let msg = match Message::read(&mut decoder, &|id| self.storage.get_entry_type(id)) {
                Ok(msg) => msg,
                Err(err) => {
                    logging::debug!(self.log, "read error, closing connection"; "err" => %err);
                    break;
                }
            };

            logging::trace!(self.log, "received message"; "kind" => msg.kind());
            self.last_update.store(timestamp_secs(), Ordering::Relaxed);
            self.storage.process_incoming(msg, &self);
        }

        self.finish_read_thread(true);
    }

    fn finish_read_thread(&self, notify: bool) {
        logging::debug!(self.log, "read thread died");

        if notify && self.state() != ConnState::Dead {
            self.notifier.notify_connection(false, self.info(), None);
        }

        self.set_state(ConnState::Dead);
        self.active.store(false, Ordering::SeqCst);
        // The writer drains what is already queued (a proto-unsupported
        // reply, say) and closes the socket on its way out.
        self.push_outgoing(Vec::new());

        self.shutdown.lock().unwrap().read_done = true;
        self.shutdown_cond.notify_all();
    }

    fn write_thread_main(self: Arc<Self>) {
        let mut stream = match self.stream.try_clone() {
            Ok(stream) => stream,
            Err(err) => {
                logging::debug!(self.log, "failed to clone stream for writer"; "err" => %err);
                self.finish_write_thread(false);
                return;
            }
        };
        let mut encoder = WireEncoder::new(self.proto_rev());

        loop {
            // Keep draining after deactivation so already-queued batches
            // still reach the peer before the socket closes.
            let batch = self.pop_outgoing();
            if batch.is_empty() {
                if !self.active.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            }

            encoder.set_proto_rev(self.proto_rev());
            encoder.reset();

            for msg in &batch {
                let mark = encoder.len();
                if let Err(err) = msg.write(&mut encoder) {
                    // The message cannot exist at this revision; drop it and
                    // roll back its partial bytes.
                    encoder.truncate(mark);
                    logging::debug!(self.log, "skipping unencodable message";
                                    "kind" => msg.kind(), "err" => %err);
                }
            }

            if encoder.len() == 0 {
                continue;
            }

            if let Err(err) = stream.write_all(encoder.data()) {
                logging::debug!(self.log, "write error, closing connection"; "err" => %err);
                break;
            }

            logging::trace!(self.log, "sent batch";
                            "messages" => batch.len(), "bytes" => encoder.len());
        }

        self.finish_write_thread(true);
    }

    fn finish_write_thread(&self, notify: bool) {
        logging::debug!(self.log, "write thread died");

        if notify && self.state() != ConnState::Dead {
            self.notifier.notify_connection(false, self.info(), None);
        }

        self.set_state(ConnState::Dead);
        self.active.store(false, Ordering::SeqCst);
        // Unblocks the reader.
        self.shutdown_stream();

        self.shutdown.lock().unwrap().write_done = true;
        self.shutdown_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn assign(id: u16, seq: u16, v: f64) -> Message {
        Message::entry_assign(format!("/e{}", id), id, seq, Arc::new(Value::Double(v)), 0)
    }

    fn update(id: u16, seq: u16, v: f64) -> Message {
        Message::entry_update(id, seq, Arc::new(Value::Double(v)))
    }

    fn post_all(pending: &mut Pending) -> Vec<Message> {
        pending
            .post(false, Instant::now())
            .unwrap_or_default()
    }

    #[test]
    fn test_assign_then_update_keeps_assign() {
        let mut pending = Pending::new();

        pending.queue(assign(3, 0, 1.0));
        pending.queue(update(3, 1, 2.0));

        let batch = post_all(&mut pending);
        assert_eq!(
            batch,
            vec![Message::entry_assign(
                "/e3",
                3,
                1,
                Arc::new(Value::Double(2.0)),
                0
            )]
        );
    }

    #[test]
    fn test_update_then_update_replaces() {
        let mut pending = Pending::new();

        pending.queue(update(3, 1, 1.0));
        pending.queue(update(3, 2, 2.0));
        pending.queue(update(3, 3, 3.0));

        assert_eq!(post_all(&mut pending), vec![update(3, 3, 3.0)]);
    }

    #[test]
    fn test_delete_drops_earlier_messages() {
        let mut pending = Pending::new();

        pending.queue(assign(3, 0, 1.0));
        pending.queue(Message::FlagsUpdate { id: 3, flags: 1 });
        pending.queue(update(4, 1, 4.0));
        pending.queue(Message::EntryDelete { id: 3 });

        assert_eq!(
            post_all(&mut pending),
            vec![update(4, 1, 4.0), Message::EntryDelete { id: 3 }]
        );
    }

    #[test]
    fn test_assign_after_delete_preserved_in_order() {
        let mut pending = Pending::new();

        pending.queue(Message::EntryDelete { id: 3 });
        pending.queue(assign(3, 0, 1.0));

        assert_eq!(
            post_all(&mut pending),
            vec![Message::EntryDelete { id: 3 }, assign(3, 0, 1.0)]
        );
    }

    #[test]
    fn test_flags_updates_last_writer_wins() {
        let mut pending = Pending::new();

        pending.queue(Message::FlagsUpdate { id: 3, flags: 1 });
        pending.queue(Message::FlagsUpdate { id: 3, flags: 0 });

        assert_eq!(
            post_all(&mut pending),
            vec![Message::FlagsUpdate { id: 3, flags: 0 }]
        );
    }

    #[test]
    fn test_flags_and_value_coalesce_independently() {
        let mut pending = Pending::new();

        pending.queue(update(3, 1, 1.0));
        pending.queue(Message::FlagsUpdate { id: 3, flags: 1 });
        pending.queue(update(3, 2, 2.0));

        assert_eq!(
            post_all(&mut pending),
            vec![update(3, 2, 2.0), Message::FlagsUpdate { id: 3, flags: 1 }]
        );
    }

    #[test]
    fn test_clear_entries_wipes_pending() {
        let mut pending = Pending::new();

        pending.queue(assign(1, 0, 1.0));
        pending.queue(update(2, 1, 2.0));
        pending.queue(Message::FlagsUpdate { id: 1, flags: 1 });
        pending.queue(Message::EntryDelete { id: 2 });
        pending.queue(Message::KeepAlive);
        pending.queue(Message::ClearEntries);

        assert_eq!(
            post_all(&mut pending),
            vec![Message::KeepAlive, Message::ClearEntries]
        );
    }

    #[test]
    fn test_unassigned_ids_kept_in_insertion_order() {
        let mut pending = Pending::new();

        let first = Message::entry_assign_request("/a", 0, Arc::new(Value::Double(1.0)), 0);
        let second = Message::entry_assign_request("/b", 0, Arc::new(Value::Double(2.0)), 0);

        pending.queue(first.clone());
        pending.queue(second.clone());

        assert_eq!(post_all(&mut pending), vec![first, second]);
    }

    #[test]
    fn test_keepalive_pacing() {
        let mut pending = Pending::new();
        let start = pending.last_post;

        // Quiet link, but not for long enough.
        assert_eq!(pending.post(true, start + Duration::from_millis(500)), None);

        // Past the interval a keep-alive goes out once.
        assert_eq!(
            pending.post(true, start + Duration::from_millis(1500)),
            Some(vec![Message::KeepAlive])
        );
        assert_eq!(
            pending.post(true, start + Duration::from_millis(1600)),
            None
        );

        // Without the keep-alive request nothing is sent at all.
        assert_eq!(pending.post(false, start + Duration::from_secs(10)), None);
    }

    #[test]
    fn test_post_clears_index() {
        let mut pending = Pending::new();

        pending.queue(update(3, 1, 1.0));
        post_all(&mut pending);

        // A new update for the same id after a post starts a fresh batch.
        pending.queue(update(3, 2, 2.0));
        assert_eq!(post_all(&mut pending), vec![update(3, 2, 2.0)]);
    }
}
