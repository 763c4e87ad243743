use crate::net::connection::ConnectionInfo;
use crate::net::dispatcher::Dispatcher;
use crate::notifier::{ConnectionCallback, EntryCallback, Notifier, NOTIFY_IMMEDIATE};
use crate::persist::PersistError;
use crate::rpc::{RpcCallback, RpcServer};
use crate::storage::{EntryInfo, Storage};
use crate::value::Value;
use basalt::logging::Logger;
use lazy_static::lazy_static;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// One complete engine: storage, notifier, RPC worker and dispatcher wired
/// together. Instances are independent; a process can host several
/// namespaces side by side.
pub struct Instance {
    storage: Arc<Storage>,
    notifier: Arc<Notifier>,
    rpc_server: Arc<RpcServer>,
    dispatcher: Arc<Dispatcher>,
}

impl Instance {
    pub fn new(log: Option<&Logger>) -> Instance {
        let notifier = Arc::new(Notifier::new(log));
        let rpc_server = Arc::new(RpcServer::new(log));
        let storage = Arc::new(Storage::new(notifier.clone(), rpc_server.clone(), log));
        let dispatcher = Arc::new(Dispatcher::new(storage.clone(), notifier.clone(), log));

        Instance {
            storage,
            notifier,
            rpc_server,
            dispatcher,
        }
    }

    // -- entry operations -------------------------------------------------

    pub fn get_entry_value(&self, name: &str) -> Option<Arc<Value>> {
        self.storage.get_entry_value(name)
    }

    pub fn set_entry_value(&self, name: &str, value: Value) -> bool {
        self.storage.set_entry_value(name, value)
    }

    pub fn set_default_entry_value(&self, name: &str, value: Value) -> bool {
        self.storage.set_default_entry_value(name, value)
    }

    pub fn set_entry_type_value(&self, name: &str, value: Value) {
        self.storage.set_entry_type_value(name, value)
    }

    pub fn set_entry_flags(&self, name: &str, flags: u32) {
        self.storage.set_entry_flags(name, flags)
    }

    pub fn get_entry_flags(&self, name: &str) -> u32 {
        self.storage.get_entry_flags(name)
    }

    pub fn delete_entry(&self, name: &str) {
        self.storage.delete_entry(name)
    }

    pub fn delete_all_entries(&self) {
        self.storage.delete_all_entries()
    }

    pub fn get_entry_info(&self, prefix: &str, types: u32) -> Vec<EntryInfo> {
        self.storage.get_entry_info(prefix, types)
    }

    // -- listeners --------------------------------------------------------

    /// Registers an entry listener. With `NOTIFY_IMMEDIATE` in `flags`, one
    /// synthetic event per existing matching entry is delivered before any
    /// subsequent change.
    pub fn add_entry_listener(
        &self,
        prefix: &str,
        callback: Arc<EntryCallback>,
        flags: u32,
    ) -> usize {
        let uid = self.notifier.add_entry_listener(prefix, callback.clone(), flags);
        if flags & NOTIFY_IMMEDIATE != 0 {
            self.storage.notify_entries(prefix, &callback);
        }
        uid
    }

    pub fn remove_entry_listener(&self, uid: usize) {
        self.notifier.remove_entry_listener(uid)
    }

    pub fn add_connection_listener(
        &self,
        callback: Arc<ConnectionCallback>,
        immediate_notify: bool,
    ) -> usize {
        let uid = self.notifier.add_connection_listener(callback.clone());
        if immediate_notify {
            self.dispatcher.notify_connections(callback);
        }
        uid
    }

    pub fn remove_connection_listener(&self, uid: usize) {
        self.notifier.remove_connection_listener(uid)
    }

    // -- lifecycle --------------------------------------------------------

    pub fn start_server(
        &self,
        persist_filename: Option<&Path>,
        listen_address: &str,
        port: u16,
    ) -> io::Result<()> {
        self.dispatcher
            .start_server(persist_filename.map(|p| p.to_path_buf()), listen_address, port)
    }

    pub fn start_client(&self, servers: Vec<(String, u16)>) -> io::Result<()> {
        self.dispatcher.start_client(servers)
    }

    pub fn stop(&self) {
        self.dispatcher.stop();
        self.rpc_server.stop();
        self.notifier.stop();
        self.storage.stop();
    }

    pub fn set_update_rate(&self, seconds: f64) {
        self.dispatcher.set_update_rate(seconds)
    }

    pub fn set_identity(&self, name: &str) {
        self.dispatcher.set_identity(name)
    }

    pub fn flush(&self) {
        self.dispatcher.flush()
    }

    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.dispatcher.get_connections()
    }

    /// Port the server listener actually bound (relevant with port 0).
    pub fn local_port(&self) -> u16 {
        self.dispatcher.local_port()
    }

    // -- persistence ------------------------------------------------------

    pub fn save_persistent(&self, filename: &Path) -> Result<(), PersistError> {
        self.storage.save_persistent(filename, false)
    }

    pub fn load_persistent(&self, filename: &Path) -> Result<(), PersistError> {
        self.storage.load_persistent(filename)
    }

    // -- rpc --------------------------------------------------------------

    pub fn create_rpc(&self, name: &str, defn: Vec<u8>, callback: Arc<RpcCallback>) {
        self.storage.create_rpc(name, defn, callback)
    }

    pub fn call_rpc(&self, name: &str, params: Vec<u8>) -> u32 {
        self.storage.call_rpc(name, params)
    }

    pub fn get_rpc_result(
        &self,
        blocking: bool,
        call_uid: u32,
        timeout: Option<Duration>,
    ) -> Option<Vec<u8>> {
        self.storage.get_rpc_result(blocking, call_uid, timeout)
    }

    pub fn cancel_blocking_rpc_result(&self, call_uid: u32) {
        self.storage.cancel_blocking_rpc_result(call_uid)
    }
}

lazy_static! {
    static ref GLOBAL_INSTANCE: Instance = Instance::new(None);
}

/// Process-wide default instance for callers that want the traditional
/// singleton surface.
pub fn instance() -> &'static Instance {
    &GLOBAL_INSTANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::notifier::{NOTIFY_NEW, NOTIFY_UPDATE};
    use crate::storage::PERSISTENT;
    use crate::wire::{WireDecoder, WireEncoder};
    use crate::{PROTO_REV_2, UNASSIGNED_ID};
    use std::io::{BufReader, Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::time::Instant;

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("timed out waiting for {}", what);
    }

    fn double_is(instance: &Instance, name: &str, expected: f64) -> bool {
        instance
            .get_entry_value(name)
            .map(|v| *v == Value::Double(expected))
            .unwrap_or(false)
    }

    #[test]
    fn test_server_client_synchronization() {
        let server = Instance::new(None);
        server.set_identity("demo-server");
        server.set_update_rate(0.01);
        server.set_entry_value("/pre", Value::Double(1.0));
        server.start_server(None, "127.0.0.1", 0).unwrap();
        let port = server.local_port();
        assert_ne!(port, 0);

        let client = Instance::new(None);
        client.set_identity("demo-client");
        client.set_update_rate(0.01);
        client.set_entry_value("/from-client", Value::Double(2.0));
        client
            .start_client(vec![("127.0.0.1".to_owned(), port)])
            .unwrap();

        // The server's snapshot reaches the client during the handshake.
        wait_for("initial sync", || double_is(&client, "/pre", 1.0));

        // The client's pre-existing entry travels the other way as an id
        // request, comes back assigned, and both sides agree.
        wait_for("client entry on server", || {
            double_is(&server, "/from-client", 2.0)
        });

        // A server-side change propagates.
        server.set_entry_value("/pre", Value::Double(5.0));
        server.flush();
        wait_for("server update", || double_is(&client, "/pre", 5.0));

        // A client-side change propagates.
        client.set_entry_value("/from-client", Value::Double(7.0));
        client.flush();
        wait_for("client update", || double_is(&server, "/from-client", 7.0));

        // Both sides report an active connection.
        wait_for("connection info", || {
            !server.get_connections().is_empty() && !client.get_connections().is_empty()
        });
        assert_eq!(client.get_connections()[0].remote_id, "demo-server");

        client.stop();
        server.stop();
    }

    #[test]
    fn test_entry_listener_sees_remote_changes() {
        let server = Instance::new(None);
        server.set_update_rate(0.01);
        server.start_server(None, "127.0.0.1", 0).unwrap();
        let port = server.local_port();

        let (tx, rx) = mpsc::channel();
        let callback: Arc<EntryCallback> = Arc::new(move |_uid, name, value, flags| {
            tx.send((name.to_owned(), (**value).clone(), flags)).unwrap();
        });
        server.add_entry_listener("/watched/", callback, NOTIFY_NEW | NOTIFY_UPDATE);

        let client = Instance::new(None);
        client.set_update_rate(0.01);
        client
            .start_client(vec![("127.0.0.1".to_owned(), port)])
            .unwrap();

        client.set_entry_value("/watched/x", Value::Double(3.0));
        client.flush();

        let (name, value, flags) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(name, "/watched/x");
        assert_eq!(value, Value::Double(3.0));
        assert_eq!(flags & NOTIFY_NEW, NOTIFY_NEW);

        client.stop();
        server.stop();
    }

    #[test]
    fn test_remote_rpc_roundtrip() {
        let server = Instance::new(None);
        server.set_update_rate(0.01);
        let handler: Arc<RpcCallback> = Arc::new(|_name, params| {
            params.iter().map(|b| b.wrapping_add(1)).collect()
        });
        server.create_rpc("/adder", vec![0x01], handler);
        server.start_server(None, "127.0.0.1", 0).unwrap();
        let port = server.local_port();

        let client = Instance::new(None);
        client.set_update_rate(0.01);
        client
            .start_client(vec![("127.0.0.1".to_owned(), port)])
            .unwrap();

        // Wait until the RPC entry has synchronized over.
        wait_for("rpc entry", || client.get_entry_value("/adder").is_some());

        let call_uid = client.call_rpc("/adder", vec![1, 2, 3]);
        assert_ne!(call_uid, 0);
        client.flush();

        let result = client.get_rpc_result(true, call_uid, Some(Duration::from_secs(10)));
        assert_eq!(result, Some(vec![2, 3, 4]));

        client.stop();
        server.stop();
    }

    #[test]
    fn test_unsupported_revision_gets_downgrade_reply() {
        let server = Instance::new(None);
        server.set_update_rate(0.01);
        server.start_server(None, "127.0.0.1", 0).unwrap();
        let port = server.local_port();

        let mut raw = TcpStream::connect(("127.0.0.1", port)).unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        // A hello announcing revision 0x0400 with an empty identity.
        raw.write_all(&[0x01, 0x04, 0x00, 0x00]).unwrap();

        // The reply names the highest supported revision, then the server
        // hangs up.
        let mut response = [0u8; 3];
        raw.read_exact(&mut response).unwrap();
        assert_eq!(response, [0x02, 0x03, 0x00]);

        server.stop();
    }

    #[test]
    fn test_client_downgrades_after_proto_unsupported() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer = std::thread::spawn(move || {
            // First attempt: reject the 3.0 hello and demand 2.0.
            let (mut first, _) = listener.accept().unwrap();
            let mut scratch = [0u8; 16];
            let _ = first.read(&mut scratch);
            first.write_all(&[0x02, 0x02, 0x00]).unwrap();
            drop(first);

            // The retry announces 2.0; greet it with an empty snapshot and
            // keep the socket open.
            let (mut second, _) = listener.accept().unwrap();
            let mut hello = [0u8; 3];
            second.read_exact(&mut hello).unwrap();
            assert_eq!(hello, [0x01, 0x02, 0x00]);
            second.write_all(&[0x03]).unwrap();
            second
        });

        let client = Instance::new(None);
        client.set_update_rate(0.01);
        client
            .start_client(vec![("127.0.0.1".to_owned(), port)])
            .unwrap();

        wait_for("downgraded connection", || {
            client
                .get_connections()
                .iter()
                .any(|info| info.protocol_version == PROTO_REV_2)
        });

        let _held_open = peer.join().unwrap();
        client.stop();
    }

    #[test]
    fn test_legacy_revision_end_to_end() {
        let server = Instance::new(None);
        server.set_update_rate(0.01);
        server.set_entry_value("/pre", Value::Double(1.0));
        server.start_server(None, "127.0.0.1", 0).unwrap();
        let port = server.local_port();

        let raw = TcpStream::connect(("127.0.0.1", port)).unwrap();
        raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut writer = raw.try_clone().unwrap();

        // Hello at 0x0200 carries no identity string.
        writer.write_all(&[0x01, 0x02, 0x00]).unwrap();

        // No server hello at this revision: straight to the snapshot.
        let mut decoder = WireDecoder::new(BufReader::new(raw), PROTO_REV_2);
        let mut snapshot = Vec::new();
        loop {
            let msg = Message::read(&mut decoder, &|_| None).unwrap();
            if matches!(msg, Message::ServerHelloDone) {
                break;
            }
            snapshot.push(msg);
        }
        assert!(snapshot
            .iter()
            .any(|msg| matches!(msg, Message::EntryAssign { name, .. } if name == "/pre")));

        // Request an id with 2.0 framing; the assignment comes back with a
        // real id and lands in the server's map.
        let mut enc = WireEncoder::new(PROTO_REV_2);
        Message::entry_assign_request("/legacy", 0, Arc::new(Value::Boolean(true)), 0)
            .write(&mut enc)
            .unwrap();
        writer.write_all(enc.data()).unwrap();

        wait_for("legacy entry on server", || {
            server.get_entry_value("/legacy").is_some()
        });

        match Message::read(&mut decoder, &|_| None).unwrap() {
            Message::EntryAssign { name, id, value, .. } => {
                assert_eq!(name, "/legacy");
                assert_ne!(id, UNASSIGNED_ID);
                assert_eq!(*value, Value::Boolean(true));
            }
            other => panic!("unexpected message {:?}", other),
        }

        server.stop();
    }

    #[test]
    fn test_start_twice_fails() {
        let server = Instance::new(None);
        server.start_server(None, "127.0.0.1", 0).unwrap();

        let err = server.start_server(None, "127.0.0.1", 0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        server.stop();
    }

    #[test]
    fn test_persistent_file_survives_restart() {
        let path = std::env::temp_dir().join(format!(
            "slate-instance-test-{}.ini",
            std::process::id()
        ));
        drop(std::fs::remove_file(&path));

        {
            let server = Instance::new(None);
            server.set_entry_value("/cfg/gain", Value::Double(0.75));
            server.set_entry_flags("/cfg/gain", PERSISTENT);
            server.save_persistent(&path).unwrap();
        }

        let reborn = Instance::new(None);
        reborn.load_persistent(&path).unwrap();
        assert_eq!(
            *reborn.get_entry_value("/cfg/gain").unwrap(),
            Value::Double(0.75)
        );
        assert_eq!(reborn.get_entry_flags("/cfg/gain"), PERSISTENT);

        drop(std::fs::remove_file(&path));
        drop(std::fs::remove_file(std::env::temp_dir().join(format!(
            "slate-instance-test-{}.ini.bak",
            std::process::id()
        ))));
    }
}
