use crate::message::Message;
use crate::net::connection::Connection;
use crate::net::ConnHandle;
use crate::notifier::{
    EntryCallback, Notifier, NOTIFY_DELETE, NOTIFY_FLAGS, NOTIFY_IMMEDIATE, NOTIFY_LOCAL,
    NOTIFY_NEW, NOTIFY_UPDATE,
};
use crate::persist::{self, PersistError};
use crate::rpc::{RpcCallback, RpcServer};
use crate::seqnum::SequenceNumber;
use crate::value::{Value, ValueType};
use crate::{PROTO_REV_3, UNASSIGNED_ID};
use basalt::logging::{self, Logger};
use basalt::time::timestamp_millis;
use hashbrown::{HashMap, HashSet};
use std::cmp::Ordering as CmpOrdering;
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Entry flag bit 0: the entry survives restarts through the persistent
/// file. Remaining bits are reserved.
pub const PERSISTENT: u32 = 0x01;

/// Listing record returned by prefix/type-mask queries.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub name: String,
    pub entry_type: ValueType,
    pub flags: u32,
    /// Unix milliseconds of the last accepted value change.
    pub last_change: u64,
}

struct Entry {
    name: String,
    value: Option<Arc<Value>>,
    flags: u32,
    id: u16,
    seq_num: SequenceNumber,
    last_change: u64,
    rpc_callback: Option<Arc<RpcCallback>>,
    rpc_call_uid: u16,
}

impl Entry {
    fn new(name: &str) -> Entry {
        Entry {
            name: name.to_owned(),
            value: None,
            flags: 0,
            id: UNASSIGNED_ID,
            seq_num: SequenceNumber::default(),
            last_change: 0,
            rpc_callback: None,
            rpc_call_uid: 0,
        }
    }

    #[inline]
    fn is_persistent(&self) -> bool {
        self.flags & PERSISTENT != 0
    }
}

/// Callback installed by the dispatcher: fan a message out to connections,
/// optionally to a single one (`only`) or to all but one (`except`).
pub type QueueOutgoingFn = dyn Fn(Message, Option<ConnHandle>, Option<ConnHandle>) + Send + Sync;

type OutgoingSend = (Message, Option<ConnHandle>, Option<ConnHandle>);

struct Inner {
    entries: HashMap<String, Entry>,
    id_map: Vec<Option<String>>,
    persistent_dirty: bool,
    queue_outgoing: Option<Arc<QueueOutgoingFn>>,
    server: bool,
}

struct RpcResults {
    terminating: bool,
    results: HashMap<u32, Vec<u8>>,
    blocking_calls: HashSet<u32>,
}

/// The authoritative entry map. One mutex guards all of it; messages and
/// the installed queue-outgoing callback are only ever invoked after the
/// guard is dropped.
pub struct Storage {
    inner: Mutex<Inner>,
    notifier: Arc<Notifier>,
    rpc_server: Arc<RpcServer>,
    rpc_results: Mutex<RpcResults>,
    rpc_results_cond: Condvar,
    log: Logger,
}

impl Storage {
    pub fn new(notifier: Arc<Notifier>, rpc_server: Arc<RpcServer>, log: Option<&Logger>) -> Storage {
        let log = match log {
            Some(log) => log.new(logging::o!("component" => "storage")),
            None => logging::discard(),
        };

        Storage {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                id_map: Vec::new(),
                persistent_dirty: false,
                queue_outgoing: None,
                server: true,
            }),
            notifier,
            rpc_server,
            rpc_results: Mutex::new(RpcResults {
                terminating: false,
                results: HashMap::new(),
                blocking_calls: HashSet::new(),
            }),
            rpc_results_cond: Condvar::new(),
            log,
        }
    }

    /// Installed by the dispatcher at startup; the role decides whether this
    /// process allocates network ids.
    pub fn set_outgoing(&self, queue_outgoing: Arc<QueueOutgoingFn>, server: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue_outgoing = Some(queue_outgoing);
        inner.server = server;
    }

    pub fn clear_outgoing(&self) {
        self.inner.lock().unwrap().queue_outgoing = None;
    }

    /// Unblocks pending RPC waiters on shutdown.
    pub fn stop(&self) {
        self.rpc_results.lock().unwrap().terminating = true;
        self.rpc_results_cond.notify_all();
    }

    /// Value type of the entry owning `id`, used to decode 2.0 updates.
    pub fn get_entry_type(&self, id: u16) -> Option<ValueType> {
        let inner = self.inner.lock().unwrap();
        let name = inner.id_map.get(id as usize)?.as_ref()?;
        let entry = inner.entries.get(name)?;
        entry.value.as_ref().map(|v| v.value_type())
    }

    pub fn get_entry_value(&self, name: &str) -> Option<Arc<Value>> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(name).and_then(|entry| entry.value.clone())
    }

    /// Creates and assigns the entry iff absent. Present with a matching
    /// type is a no-op returning true; present with a different type is a
    /// rejection.
    pub fn set_default_entry_value(&self, name: &str, value: Value) -> bool {
        if name.is_empty() {
            return false;
        }

        let value = Arc::new(value);
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if let Some(entry) = inner.entries.get(name) {
            return match &entry.value {
                Some(old) => old.value_type() == value.value_type(),
                None => false,
            };
        }

        let mut entry = Entry::new(name);
        entry.value = Some(value.clone());
        entry.last_change = timestamp_millis();
        if inner.server {
            entry.id = inner.id_map.len() as u16;
            inner.id_map.push(Some(name.to_owned()));
        }
        let msg = Message::entry_assign(
            name,
            entry.id,
            entry.seq_num.value(),
            value.clone(),
            entry.flags,
        );
        inner.entries.insert(name.to_owned(), entry);

        self.notifier
            .notify_entry(name, &value, NOTIFY_NEW | NOTIFY_LOCAL, None);

        let outgoing = inner.queue_outgoing.clone();
        drop(guard);
        if let Some(outgoing) = outgoing {
            outgoing(msg, None, None);
        }
        true
    }

    /// Writes an entry, creating it on first write. Returns false without
    /// touching anything when the entry already holds a value of another
    /// type. The sequence number advances only when the stored value
    /// actually changes.
    pub fn set_entry_value(&self, name: &str, value: Value) -> bool {
        if name.is_empty() {
            return true;
        }

        let value = Arc::new(value);
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let entry = inner
            .entries
            .entry(name.to_owned())
            .or_insert_with(|| Entry::new(name));

        let old_value = entry.value.clone();
        if let Some(old) = &old_value {
            if old.value_type() != value.value_type() {
                return false;
            }
        }

        entry.value = Some(value.clone());

        if inner.server && entry.id == UNASSIGNED_ID {
            entry.id = inner.id_map.len() as u16;
            inner.id_map.push(Some(name.to_owned()));
        }

        let changed = match &old_value {
            None => true,
            Some(old) => **old != *value,
        };
        if changed {
            entry.last_change = timestamp_millis();
        }
        if entry.is_persistent() && old_value.is_some() && changed {
            inner.persistent_dirty = true;
        }

        if self.notifier.local_notifiers() {
            if old_value.is_none() {
                self.notifier
                    .notify_entry(name, &value, NOTIFY_NEW | NOTIFY_LOCAL, None);
            } else if changed {
                self.notifier
                    .notify_entry(name, &value, NOTIFY_UPDATE | NOTIFY_LOCAL, None);
            }
        }

        let msg = if old_value.is_none() {
            Some(Message::entry_assign(
                name,
                entry.id,
                entry.seq_num.value(),
                value,
                entry.flags,
            ))
        } else if changed {
            entry.seq_num.increment();
            if entry.id != UNASSIGNED_ID {
                Some(Message::entry_update(entry.id, entry.seq_num.value(), value))
            } else {
                None
            }
        } else {
            None
        };

        let outgoing = inner.queue_outgoing.clone();
        drop(guard);
        if let (Some(msg), Some(outgoing)) = (msg, outgoing) {
            outgoing(msg, None, None);
        }
        true
    }

    /// Like [`set_entry_value`] but forces a type change through a fresh
    /// entry-assign with a bumped sequence number.
    pub fn set_entry_type_value(&self, name: &str, value: Value) {
        if name.is_empty() {
            return;
        }

        let value = Arc::new(value);
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let entry = inner
            .entries
            .entry(name.to_owned())
            .or_insert_with(|| Entry::new(name));

        let old_value = entry.value.clone();
        entry.value = Some(value.clone());
        if let Some(old) = &old_value {
            if **old == *value {
                return;
            }
        }
        entry.last_change = timestamp_millis();

        if inner.server && entry.id == UNASSIGNED_ID {
            entry.id = inner.id_map.len() as u16;
            inner.id_map.push(Some(name.to_owned()));
        }

        if entry.is_persistent() {
            inner.persistent_dirty = true;
        }

        if self.notifier.local_notifiers() {
            let kind = if old_value.is_none() { NOTIFY_NEW } else { NOTIFY_UPDATE };
            self.notifier
                .notify_entry(name, &value, kind | NOTIFY_LOCAL, None);
        }

        entry.seq_num.increment();
        let type_changed = match &old_value {
            None => true,
            Some(old) => old.value_type() != value.value_type(),
        };
        let msg = if type_changed {
            Some(Message::entry_assign(
                name,
                entry.id,
                entry.seq_num.value(),
                value,
                entry.flags,
            ))
        } else if entry.id != UNASSIGNED_ID {
            Some(Message::entry_update(entry.id, entry.seq_num.value(), value))
        } else {
            None
        };

        let outgoing = inner.queue_outgoing.clone();
        drop(guard);
        if let (Some(msg), Some(outgoing)) = (msg, outgoing) {
            outgoing(msg, None, None);
        }
    }

    pub fn set_entry_flags(&self, name: &str, flags: u32) {
        if name.is_empty() {
            return;
        }

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let entry = match inner.entries.get_mut(name) {
            Some(entry) => entry,
            None => return,
        };

        if entry.flags == flags {
            return;
        }

        if (entry.flags ^ flags) & PERSISTENT != 0 {
            inner.persistent_dirty = true;
        }
        entry.flags = flags;

        if let Some(value) = &entry.value {
            self.notifier
                .notify_entry(name, value, NOTIFY_FLAGS | NOTIFY_LOCAL, None);
        }

        let msg = if entry.id != UNASSIGNED_ID {
            Some(Message::FlagsUpdate { id: entry.id, flags })
        } else {
            None
        };

        let outgoing = inner.queue_outgoing.clone();
        drop(guard);
        if let (Some(msg), Some(outgoing)) = (msg, outgoing) {
            outgoing(msg, None, None);
        }
    }

    pub fn get_entry_flags(&self, name: &str) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(name).map(|entry| entry.flags).unwrap_or(0)
    }

    pub fn delete_entry(&self, name: &str) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let entry = match inner.entries.remove(name) {
            Some(entry) => entry,
            None => return,
        };

        if entry.is_persistent() {
            inner.persistent_dirty = true;
        }

        if entry.id != UNASSIGNED_ID {
            if let Some(slot) = inner.id_map.get_mut(entry.id as usize) {
                *slot = None;
            }
        }

        let value = match entry.value {
            Some(value) => value,
            None => return,
        };

        self.notifier
            .notify_entry(name, &value, NOTIFY_DELETE | NOTIFY_LOCAL, None);

        let outgoing = inner.queue_outgoing.clone();
        drop(guard);
        if entry.id != UNASSIGNED_ID {
            if let Some(outgoing) = outgoing {
                outgoing(Message::EntryDelete { id: entry.id }, None, None);
            }
        }
    }

    /// Removes every non-persistent entry; persistent entries keep their
    /// value, flags and sequence number.
    fn delete_all_impl(&self, inner: &mut Inner, notify_flags: u32) {
        let mut removed: Vec<(String, Option<Arc<Value>>, u16)> = Vec::new();

        inner.entries.retain(|name, entry| {
            if entry.is_persistent() {
                true
            } else {
                removed.push((name.clone(), entry.value.clone(), entry.id));
                false
            }
        });

        for (name, value, id) in removed {
            if id != UNASSIGNED_ID {
                if let Some(slot) = inner.id_map.get_mut(id as usize) {
                    *slot = None;
                }
            }
            if let Some(value) = value {
                self.notifier.notify_entry(&name, &value, notify_flags, None);
            }
        }
    }

    pub fn delete_all_entries(&self) {
        let mut guard = self.inner.lock().unwrap();
        if guard.entries.is_empty() {
            return;
        }

        let inner = &mut *guard;
        self.delete_all_impl(inner, NOTIFY_DELETE | NOTIFY_LOCAL);

        let outgoing = inner.queue_outgoing.clone();
        drop(guard);
        if let Some(outgoing) = outgoing {
            outgoing(Message::ClearEntries, None, None);
        }
    }

    /// Entries whose name starts with `prefix`, optionally restricted to a
    /// bitmask over value types.
    pub fn get_entry_info(&self, prefix: &str, types: u32) -> Vec<EntryInfo> {
        let inner = self.inner.lock().unwrap();
        let mut infos = Vec::new();

        for (name, entry) in inner.entries.iter() {
            if !name.starts_with(prefix) {
                continue;
            }
            let value = match &entry.value {
                Some(value) => value,
                None => continue,
            };
            if types != 0 && types & value.value_type().mask() == 0 {
                continue;
            }
            infos.push(EntryInfo {
                name: name.clone(),
                entry_type: value.value_type(),
                flags: entry.flags,
                last_change: entry.last_change,
            });
        }

        infos
    }

    /// Synthesizes an immediate-replay event per matching entry for a newly
    /// registered listener.
    pub fn notify_entries(&self, prefix: &str, only: &Arc<EntryCallback>) {
        let inner = self.inner.lock().unwrap();
        for (name, entry) in inner.entries.iter() {
            if !name.starts_with(prefix) {
                continue;
            }
            if let Some(value) = &entry.value {
                self.notifier
                    .notify_entry(name, value, NOTIFY_IMMEDIATE, Some(only.clone()));
            }
        }
    }

    // ---------------------------------------------------------------------
    // Incoming message processing
    // ---------------------------------------------------------------------

    /// Applies one message received from a peer. Any messages generated in
    /// response are fanned out after the storage lock is released.
    pub fn process_incoming(self: &Arc<Self>, msg: Message, conn: &Arc<Connection>) {
        let mut sends: Vec<OutgoingSend> = Vec::new();

        let outgoing = {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;

            match msg {
                Message::EntryAssign {
                    name,
                    id,
                    seq_num,
                    value,
                    flags,
                } => self.incoming_entry_assign(inner, &mut sends, conn, name, id, seq_num, value, flags),
                Message::EntryUpdate { id, seq_num, value } => {
                    self.incoming_entry_update(inner, &mut sends, conn, id, seq_num, value)
                }
                Message::FlagsUpdate { id, flags } => {
                    self.incoming_flags_update(inner, &mut sends, conn, id, flags)
                }
                Message::EntryDelete { id } => {
                    self.incoming_entry_delete(inner, &mut sends, conn, id)
                }
                Message::ClearEntries => {
                    self.delete_all_impl(inner, NOTIFY_DELETE);
                    if inner.server {
                        sends.push((Message::ClearEntries, None, Some(conn.handle())));
                    }
                }
                Message::ExecuteRpc { id, uid, params } => {
                    self.incoming_execute_rpc(inner, conn, id, uid, params)
                }
                Message::RpcResponse { id, uid, result } => {
                    if !inner.server {
                        let mut results = self.rpc_results.lock().unwrap();
                        results.results.insert(rpc_call_uid(id, uid), result);
                        self.rpc_results_cond.notify_all();
                    }
                }
                // Handshake and keep-alive traffic carries no entry state.
                _ => {}
            }

            inner.queue_outgoing.clone()
        };

        if let Some(outgoing) = outgoing {
            for (msg, only, except) in sends {
                outgoing(msg, only, except);
            }
        }
    }

    fn incoming_entry_assign(
        &self,
        inner: &mut Inner,
        sends: &mut Vec<OutgoingSend>,
        conn: &Arc<Connection>,
        name: String,
        id: u16,
        seq_num: u16,
        value: Arc<Value>,
        flags: u32,
    ) {
        let mut may_need_update = false;

        if inner.server {
            // id 0xffff is a request for an id to be assigned; send the
            // assignment back to the requester along with everyone else.
            if id == UNASSIGNED_ID {
                if inner.entries.contains_key(&name) {
                    return;
                }

                let new_id = inner.id_map.len() as u16;
                let mut entry = Entry::new(&name);
                entry.value = Some(value.clone());
                entry.flags = flags;
                entry.id = new_id;
                entry.seq_num = SequenceNumber::new(seq_num);
                entry.last_change = timestamp_millis();
                let persistent = entry.is_persistent();

                inner.id_map.push(Some(name.clone()));
                inner.entries.insert(name.clone(), entry);
                if persistent {
                    inner.persistent_dirty = true;
                }

                self.notifier.notify_entry(&name, &value, NOTIFY_NEW, None);
                sends.push((
                    Message::entry_assign(name, new_id, seq_num, value, flags),
                    None,
                    None,
                ));
                return;
            }
        } else {
            if id == UNASSIGNED_ID {
                logging::debug!(self.log, "client: received entry assignment request?");
                return;
            }

            if id as usize >= inner.id_map.len() {
                inner.id_map.resize(id as usize + 1, None);
            }

            if inner.id_map[id as usize].is_none() {
                if !inner.entries.contains_key(&name) {
                    // Did not exist at all, accept as a brand new entry.
                    let mut entry = Entry::new(&name);
                    entry.value = Some(value.clone());
                    entry.flags = flags;
                    entry.id = id;
                    entry.seq_num = SequenceNumber::new(seq_num);
                    entry.last_change = timestamp_millis();

                    inner.id_map[id as usize] = Some(name.clone());
                    inner.entries.insert(name.clone(), entry);

                    self.notifier.notify_entry(&name, &value, NOTIFY_NEW, None);
                    return;
                }

                // Response to our own id request.
                may_need_update = true;
                let entry = inner.entries.get_mut(&name).expect("entry just checked");
                entry.id = id;
                inner.id_map[id as usize] = Some(name.clone());

                // Flags may have moved locally in the meantime; reassert.
                if flags != entry.flags {
                    sends.push((
                        Message::FlagsUpdate {
                            id,
                            flags: entry.flags,
                        },
                        None,
                        None,
                    ));
                }
            }
        }

        // Common server/client path: the slot must resolve to a live entry.
        let entry_name = match inner.id_map.get(id as usize).and_then(|slot| slot.clone()) {
            Some(entry_name) => entry_name,
            None => {
                logging::debug!(self.log, "received assignment to unknown entry"; "id" => id);
                return;
            }
        };
        let entry = match inner.entries.get_mut(&entry_name) {
            Some(entry) => entry,
            None => return,
        };

        // This is an authoritative update; reject stale sequence numbers,
        // reconciling our own newer value back when this was the response
        // to an id request.
        let seq = SequenceNumber::new(seq_num);
        let accepted = matches!(
            seq.partial_cmp(&entry.seq_num),
            Some(CmpOrdering::Greater) | Some(CmpOrdering::Equal)
        );
        if !accepted {
            if may_need_update {
                if let Some(local) = entry.value.clone() {
                    sends.push((
                        Message::entry_update(entry.id, entry.seq_num.value(), local),
                        None,
                        None,
                    ));
                }
            }
            return;
        }

        if name != entry.name {
            logging::debug!(self.log, "entry assignment for same id with different name?";
                            "id" => id, "name" => %name, "entry" => %entry.name);
            return;
        }

        let had_value = entry.value.is_some();
        let mut notify_flags = if had_value { NOTIFY_UPDATE } else { NOTIFY_NEW };

        // Flags are not part of the message before 3.0, and a server
        // response to an id request carries the server's stale flags.
        if !may_need_update && conn.proto_rev() >= PROTO_REV_3 {
            if (entry.flags ^ flags) & PERSISTENT != 0 {
                inner.persistent_dirty = true;
            }
            if entry.flags != flags {
                notify_flags |= NOTIFY_FLAGS;
            }
            entry.flags = flags;
        }

        let changed = entry.value.as_deref() != Some(&*value);
        if entry.is_persistent() && changed {
            inner.persistent_dirty = true;
        }

        entry.value = Some(value.clone());
        entry.seq_num = seq;
        if changed {
            entry.last_change = timestamp_millis();
        }
        let out_flags = entry.flags;

        self.notifier
            .notify_entry(&entry_name, &value, notify_flags, None);

        if inner.server {
            sends.push((
                Message::entry_assign(entry_name, id, seq_num, value, out_flags),
                None,
                Some(conn.handle()),
            ));
        }
    }

    fn incoming_entry_update(
        &self,
        inner: &mut Inner,
        sends: &mut Vec<OutgoingSend>,
        conn: &Arc<Connection>,
        id: u16,
        seq_num: u16,
        value: Arc<Value>,
    ) {
        let entry_name = match inner.id_map.get(id as usize).and_then(|slot| slot.clone()) {
            Some(entry_name) => entry_name,
            None => {
                logging::debug!(self.log, "received update to unknown entry"; "id" => id);
                return;
            }
        };
        let entry = match inner.entries.get_mut(&entry_name) {
            Some(entry) => entry,
            None => return,
        };

        // Updates must be strictly newer.
        let seq = SequenceNumber::new(seq_num);
        if seq.partial_cmp(&entry.seq_num) != Some(CmpOrdering::Greater) {
            return;
        }

        entry.value = Some(value.clone());
        entry.seq_num = seq;
        entry.last_change = timestamp_millis();

        if entry.is_persistent() {
            inner.persistent_dirty = true;
        }

        self.notifier
            .notify_entry(&entry_name, &value, NOTIFY_UPDATE, None);

        if inner.server {
            sends.push((
                Message::entry_update(id, seq_num, value),
                None,
                Some(conn.handle()),
            ));
        }
    }

    fn incoming_flags_update(
        &self,
        inner: &mut Inner,
        sends: &mut Vec<OutgoingSend>,
        conn: &Arc<Connection>,
        id: u16,
        flags: u32,
    ) {
        let entry_name = match inner.id_map.get(id as usize).and_then(|slot| slot.clone()) {
            Some(entry_name) => entry_name,
            None => {
                logging::debug!(self.log, "received flags update to unknown entry"; "id" => id);
                return;
            }
        };
        let entry = match inner.entries.get_mut(&entry_name) {
            Some(entry) => entry,
            None => return,
        };

        if entry.flags == flags {
            return;
        }

        if (entry.flags ^ flags) & PERSISTENT != 0 {
            inner.persistent_dirty = true;
        }
        entry.flags = flags;

        if let Some(value) = &entry.value {
            self.notifier.notify_entry(&entry_name, value, NOTIFY_FLAGS, None);
        }

        if inner.server {
            sends.push((
                Message::FlagsUpdate { id, flags },
                None,
                Some(conn.handle()),
            ));
        }
    }

    fn incoming_entry_delete(
        &self,
        inner: &mut Inner,
        sends: &mut Vec<OutgoingSend>,
        conn: &Arc<Connection>,
        id: u16,
    ) {
        let entry_name = match inner.id_map.get(id as usize).and_then(|slot| slot.clone()) {
            Some(entry_name) => entry_name,
            None => {
                logging::debug!(self.log, "received delete to unknown entry"; "id" => id);
                return;
            }
        };

        if let Some(slot) = inner.id_map.get_mut(id as usize) {
            *slot = None;
        }

        if let Some(entry) = inner.entries.remove(&entry_name) {
            if entry.is_persistent() {
                inner.persistent_dirty = true;
            }
            if let Some(value) = entry.value {
                self.notifier
                    .notify_entry(&entry_name, &value, NOTIFY_DELETE, None);
            }
        }

        if inner.server {
            sends.push((Message::EntryDelete { id }, None, Some(conn.handle())));
        }
    }

    fn incoming_execute_rpc(
        &self,
        inner: &mut Inner,
        conn: &Arc<Connection>,
        id: u16,
        uid: u16,
        params: Vec<u8>,
    ) {
        if !inner.server {
            return;
        }

        let entry_name = match inner.id_map.get(id as usize).and_then(|slot| slot.clone()) {
            Some(entry_name) => entry_name,
            None => {
                logging::debug!(self.log, "received RPC call to unknown entry"; "id" => id);
                return;
            }
        };
        let entry = match inner.entries.get(&entry_name) {
            Some(entry) => entry,
            None => return,
        };

        if !entry.value.as_ref().map(|v| v.is_rpc()).unwrap_or(false) {
            logging::debug!(self.log, "received RPC call to non-RPC entry"; "id" => id);
            return;
        }

        let callback = match &entry.rpc_callback {
            Some(callback) => callback.clone(),
            None => return,
        };

        // Route the response back by handle; a vanished connection drops it.
        let target = Arc::downgrade(conn);
        self.rpc_server.process_rpc(
            &entry_name,
            id,
            uid,
            params,
            callback,
            Box::new(move |response| {
                if let Some(conn) = target.upgrade() {
                    conn.queue_outgoing(response);
                }
            }),
        );
    }

    // ---------------------------------------------------------------------
    // Initial-assignment exchange
    // ---------------------------------------------------------------------

    /// Server side of handshake synchronization: one assign per entry.
    pub fn get_initial_assignments(&self, conn: &Arc<Connection>) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();
        conn.set_state(crate::net::connection::ConnState::Synchronized);

        inner
            .entries
            .iter()
            .filter_map(|(name, entry)| {
                entry.value.clone().map(|value| {
                    Message::entry_assign(
                        name.clone(),
                        entry.id,
                        entry.seq_num.value(),
                        value,
                        entry.flags,
                    )
                })
            })
            .collect()
    }

    /// Client side of handshake synchronization. Local ids are wiped and
    /// re-learned from the server's snapshot. On a reconnect to the same
    /// server, locally newer values win and are queued back as updates; the
    /// returned messages are id requests for entries the server has never
    /// seen.
    pub fn apply_initial_assignments(
        &self,
        conn: &Arc<Connection>,
        msgs: Vec<Message>,
        new_server: bool,
    ) -> Vec<Message> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if inner.server {
            return Vec::new();
        }

        conn.set_state(crate::net::connection::ConnState::Synchronized);

        for entry in inner.entries.values_mut() {
            entry.id = UNASSIGNED_ID;
        }
        inner.id_map.clear();

        let mut reconcile: Vec<String> = Vec::new();

        for msg in msgs {
            let (name, id, seq_num, value, flags) = match msg {
                Message::EntryAssign {
                    name,
                    id,
                    seq_num,
                    value,
                    flags,
                } => (name, id, seq_num, value, flags),
                other => {
                    logging::debug!(self.log, "client: received non-entry assignment?";
                                    "kind" => other.kind());
                    continue;
                }
            };

            if id == UNASSIGNED_ID {
                logging::debug!(self.log, "client: received entry assignment request?");
                continue;
            }

            let seq = SequenceNumber::new(seq_num);

            if !inner.entries.contains_key(&name) {
                let mut entry = Entry::new(&name);
                entry.value = Some(value.clone());
                entry.flags = flags;
                entry.seq_num = seq;
                entry.id = id;
                entry.last_change = timestamp_millis();
                inner.entries.insert(name.clone(), entry);

                self.notifier.notify_entry(&name, &value, NOTIFY_NEW, None);
            } else {
                let entry = inner.entries.get_mut(&name).expect("entry just checked");
                entry.id = id;

                let remote_newer = seq.partial_cmp(&entry.seq_num) == Some(CmpOrdering::Greater);
                if !new_server && !remote_newer {
                    // Same server, our value is at least as recent; keep it
                    // and push it back as an update.
                    reconcile.push(name.clone());
                } else {
                    let mut notify_flags = NOTIFY_UPDATE;
                    if conn.proto_rev() >= PROTO_REV_3 {
                        if entry.flags != flags {
                            notify_flags |= NOTIFY_FLAGS;
                        }
                        entry.flags = flags;
                    }
                    entry.value = Some(value.clone());
                    entry.seq_num = seq;
                    entry.last_change = timestamp_millis();

                    self.notifier.notify_entry(&name, &value, notify_flags, None);
                }
            }

            if id as usize >= inner.id_map.len() {
                inner.id_map.resize(id as usize + 1, None);
            }
            inner.id_map[id as usize] = Some(name);
        }

        // Entries the server does not know yet become id requests.
        let mut out_msgs: Vec<Message> = inner
            .entries
            .values()
            .filter(|entry| entry.id == UNASSIGNED_ID)
            .filter_map(|entry| {
                entry.value.clone().map(|value| {
                    Message::entry_assign_request(
                        entry.name.clone(),
                        entry.seq_num.value(),
                        value,
                        entry.flags,
                    )
                })
            })
            .collect();
        out_msgs.sort_by(|a, b| entry_assign_name(a).cmp(&entry_assign_name(b)));

        // The reconcile updates carry the ids learned above.
        let mut update_msgs = Vec::new();
        for name in reconcile {
            if let Some(entry) = inner.entries.get(&name) {
                if let Some(value) = entry.value.clone() {
                    update_msgs.push(Message::entry_update(
                        entry.id,
                        entry.seq_num.value(),
                        value,
                    ));
                }
            }
        }

        let outgoing = inner.queue_outgoing.clone();
        drop(guard);
        if let Some(outgoing) = outgoing {
            for msg in update_msgs {
                outgoing(msg, None, None);
            }
        }

        out_msgs
    }

    // ---------------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------------

    /// Snapshot of persistent entries, name-sorted. For periodic saves the
    /// snapshot is skipped (and `None` returned) unless something changed;
    /// the dirty flag is cleared optimistically and re-armed on failure.
    fn get_persistent_entries(&self, periodic: bool) -> Option<Vec<(String, Arc<Value>)>> {
        let mut entries: Vec<(String, Arc<Value>)> = {
            let mut inner = self.inner.lock().unwrap();
            if periodic && !inner.persistent_dirty {
                return None;
            }
            inner.persistent_dirty = false;

            inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_persistent())
                .filter_map(|(name, entry)| {
                    entry.value.clone().map(|value| (name.clone(), value))
                })
                .collect()
        };

        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Some(entries)
    }

    fn rearm_dirty(&self) {
        self.inner.lock().unwrap().persistent_dirty = true;
    }

    /// Writes the persistent entries to a stream (always, dirty or not).
    pub fn save_persistent_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let entries = self
            .get_persistent_entries(false)
            .expect("non-periodic snapshot always produced");
        persist::save(w, &entries)
    }

    /// Atomically saves the persistent entries: write to `.tmp`, keep the
    /// previous file as `.bak`, rename into place. A failed periodic save
    /// re-arms the dirty flag so the next tick retries.
    pub fn save_persistent(&self, filename: &Path, periodic: bool) -> Result<(), PersistError> {
        let entries = match self.get_persistent_entries(periodic) {
            Some(entries) => entries,
            None => return Ok(()),
        };

        let tmp = path_with_suffix(filename, ".tmp");
        let bak = path_with_suffix(filename, ".bak");

        logging::debug!(self.log, "saving persistent file"; "path" => %filename.display());

        let result = (|| -> io::Result<()> {
            let file = fs::File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            persist::save(&mut writer, &entries)?;
            writer.flush()?;
            Ok(())
        })();

        if let Err(err) = result {
            drop(fs::remove_file(&tmp));
            if periodic {
                self.rearm_dirty();
            }
            return Err(err.into());
        }

        // Move into place, keeping the old file as a backup. Backup
        // housekeeping failures are ignored.
        drop(fs::remove_file(&bak));
        drop(fs::rename(filename, &bak));
        if let Err(err) = fs::rename(&tmp, filename) {
            drop(fs::rename(&bak, filename));
            if periodic {
                self.rearm_dirty();
            }
            return Err(err.into());
        }

        Ok(())
    }

    /// Loads persistent entries from a stream, applying them as local
    /// writes: persistent flag forced on, sequence bumped, reconciliation
    /// messages queued.
    pub fn load_persistent_from<R: io::BufRead>(
        &self,
        reader: R,
        warn: &mut dyn FnMut(usize, &str),
    ) -> Result<(), PersistError> {
        let loaded = persist::load(reader, warn)?;

        let mut msgs: Vec<Message> = Vec::new();
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        for (name, value) in loaded {
            let value = Arc::new(value);
            let entry = inner
                .entries
                .entry(name.clone())
                .or_insert_with(|| Entry::new(&name));

            let old_value = entry.value.clone();
            entry.value = Some(value.clone());
            let was_persistent = entry.is_persistent();
            if !was_persistent {
                entry.flags |= PERSISTENT;
            }

            if inner.server && entry.id == UNASSIGNED_ID {
                entry.id = inner.id_map.len() as u16;
                inner.id_map.push(Some(name.clone()));
            }

            let changed = match &old_value {
                None => true,
                Some(old) => **old != *value,
            };
            if changed {
                entry.last_change = timestamp_millis();
            }

            if self.notifier.local_notifiers() {
                if old_value.is_none() {
                    self.notifier
                        .notify_entry(&name, &value, NOTIFY_NEW | NOTIFY_LOCAL, None);
                } else if changed {
                    let mut notify_flags = NOTIFY_UPDATE | NOTIFY_LOCAL;
                    if !was_persistent {
                        notify_flags |= NOTIFY_FLAGS;
                    }
                    self.notifier.notify_entry(&name, &value, notify_flags, None);
                }
            }

            if inner.queue_outgoing.is_none() {
                continue;
            }

            entry.seq_num.increment();
            let type_changed = match &old_value {
                None => true,
                Some(old) => old.value_type() != value.value_type(),
            };
            if type_changed {
                msgs.push(Message::entry_assign(
                    name.clone(),
                    entry.id,
                    entry.seq_num.value(),
                    value,
                    entry.flags,
                ));
            } else if entry.id != UNASSIGNED_ID {
                if changed {
                    msgs.push(Message::entry_update(
                        entry.id,
                        entry.seq_num.value(),
                        value,
                    ));
                }
                if !was_persistent {
                    msgs.push(Message::FlagsUpdate {
                        id: entry.id,
                        flags: entry.flags,
                    });
                }
            }
        }

        let outgoing = inner.queue_outgoing.clone();
        drop(guard);
        if let Some(outgoing) = outgoing {
            for msg in msgs {
                outgoing(msg, None, None);
            }
        }

        Ok(())
    }

    /// Loads a persistent file; malformed lines are logged as warnings with
    /// their line number and skipped.
    pub fn load_persistent(&self, filename: &Path) -> Result<(), PersistError> {
        let file = fs::File::open(filename)?;
        let log = &self.log;
        let path = filename.display().to_string();

        self.load_persistent_from(BufReader::new(file), &mut |line, msg| {
            logging::warn!(log, "persistent load warning";
                           "path" => %path, "line" => line, "msg" => %msg);
        })
    }

    // ---------------------------------------------------------------------
    // RPC
    // ---------------------------------------------------------------------

    /// Registers a server-side RPC entry with its handler.
    pub fn create_rpc(&self, name: &str, defn: Vec<u8>, callback: Arc<RpcCallback>) {
        if name.is_empty() || defn.is_empty() {
            return;
        }

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if !inner.server {
            return;
        }

        let entry = inner
            .entries
            .entry(name.to_owned())
            .or_insert_with(|| Entry::new(name));

        let old_value = entry.value.clone();
        let value = Arc::new(Value::Rpc(defn));
        entry.value = Some(value.clone());
        entry.rpc_callback = Some(callback);

        self.rpc_server.start();

        if let Some(old) = &old_value {
            if **old == *value {
                return;
            }
        }

        if entry.id == UNASSIGNED_ID {
            entry.id = inner.id_map.len() as u16;
            inner.id_map.push(Some(name.to_owned()));
        }

        entry.seq_num.increment();
        let type_changed = match &old_value {
            None => true,
            Some(old) => old.value_type() != value.value_type(),
        };
        let msg = if type_changed {
            Message::entry_assign(name, entry.id, entry.seq_num.value(), value, entry.flags)
        } else {
            Message::entry_update(entry.id, entry.seq_num.value(), value)
        };

        let outgoing = inner.queue_outgoing.clone();
        drop(guard);
        if let Some(outgoing) = outgoing {
            outgoing(msg, None, None);
        }
    }

    /// Invokes an RPC entry. Returns a call uid to wait on, or 0 when the
    /// entry does not exist or is not an RPC.
    pub fn call_rpc(self: &Arc<Self>, name: &str, params: Vec<u8>) -> u32 {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let entry = match inner.entries.get_mut(name) {
            Some(entry) => entry,
            None => return 0,
        };
        if !entry.value.as_ref().map(|v| v.is_rpc()).unwrap_or(false) {
            return 0;
        }

        entry.rpc_call_uid = entry.rpc_call_uid.wrapping_add(1);
        let uid = entry.rpc_call_uid;
        let id = entry.id;
        let combined = rpc_call_uid(id, uid);

        if inner.server {
            // Local call on the server: execute through the RPC worker and
            // route the response straight into the results table.
            let callback = match &entry.rpc_callback {
                Some(callback) => callback.clone(),
                None => return 0,
            };
            let this = Arc::downgrade(self);
            drop(guard);

            self.rpc_server.process_rpc(
                name,
                id,
                uid,
                params,
                callback,
                Box::new(move |response| {
                    if let (Some(storage), Message::RpcResponse { id, uid, result }) =
                        (this.upgrade(), response)
                    {
                        let mut results = storage.rpc_results.lock().unwrap();
                        results.results.insert(rpc_call_uid(id, uid), result);
                        storage.rpc_results_cond.notify_all();
                    }
                }),
            );
        } else {
            let msg = Message::ExecuteRpc { id, uid, params };
            let outgoing = inner.queue_outgoing.clone();
            drop(guard);
            if let Some(outgoing) = outgoing {
                outgoing(msg, None, None);
            }
        }

        combined
    }

    /// Waits for an RPC result. Only one blocking waiter per call uid is
    /// allowed; cancellation and shutdown both wake the wait empty-handed.
    pub fn get_rpc_result(
        &self,
        blocking: bool,
        call_uid: u32,
        timeout: Option<Duration>,
    ) -> Option<Vec<u8>> {
        let mut results = self.rpc_results.lock().unwrap();

        if results.blocking_calls.contains(&call_uid) {
            return None;
        }
        results.blocking_calls.insert(call_uid);

        let deadline = timeout.map(|t| Instant::now() + t);
        let result = loop {
            if let Some(result) = results.results.remove(&call_uid) {
                break Some(result);
            }
            if !blocking || results.terminating {
                break None;
            }

            match deadline {
                None => results = self.rpc_results_cond.wait(results).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break None;
                    }
                    let (guard, wait) = self
                        .rpc_results_cond
                        .wait_timeout(results, deadline - now)
                        .unwrap();
                    results = guard;
                    if wait.timed_out() && !results.results.contains_key(&call_uid) {
                        break None;
                    }
                }
            }

            // Removed from the blocking set means the wait was canceled.
            if !results.blocking_calls.contains(&call_uid) {
                break None;
            }
            if results.terminating {
                break None;
            }
        };

        results.blocking_calls.remove(&call_uid);
        result
    }

    /// Cancels a blocking RPC wait, waking the waiter.
    pub fn cancel_blocking_rpc_result(&self, call_uid: u32) {
        let mut results = self.rpc_results.lock().unwrap();
        results.blocking_calls.remove(&call_uid);
        drop(results);
        self.rpc_results_cond.notify_all();
    }
}

#[inline]
fn rpc_call_uid(id: u16, uid: u16) -> u32 {
    (u32::from(id) << 16) | u32::from(uid)
}

fn entry_assign_name(msg: &Message) -> Option<&str> {
    match msg {
        Message::EntryAssign { name, .. } => Some(name),
        _ => None,
    }
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}
