use crate::message::Message;
use basalt::logging::{self, Logger};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Server-side RPC handler: `(entry name, params) -> result bytes`.
pub type RpcCallback = dyn Fn(&str, &[u8]) -> Vec<u8> + Send + Sync;

/// Delivers a finished rpc-response back toward its caller. Routing to a
/// connection that has since died silently drops the response.
pub type SendResponseFn = dyn Fn(Message) + Send;

struct RpcCall {
    name: String,
    id: u16,
    uid: u16,
    params: Vec<u8>,
    callback: Arc<RpcCallback>,
    send_response: Box<SendResponseFn>,
}

struct State {
    active: bool,
    started: bool,
    shutdown: bool,
    queue: VecDeque<RpcCall>,
}

/// Executes RPC handlers on a dedicated worker so slow handlers never stall
/// the IO path.
pub struct RpcServer {
    state: Mutex<State>,
    cond: Condvar,
    log: Logger,
}

impl RpcServer {
    pub fn new(log: Option<&Logger>) -> RpcServer {
        let log = match log {
            Some(log) => log.new(logging::o!("component" => "rpc")),
            None => logging::discard(),
        };

        RpcServer {
            state: Mutex::new(State {
                active: false,
                started: false,
                shutdown: false,
                queue: VecDeque::new(),
            }),
            cond: Condvar::new(),
            log,
        }
    }

    /// Spawns the worker thread; registering the first RPC entry calls this.
    pub fn start(self: &Arc<Self>) {
        let mut state = self.state.lock().unwrap();
        if state.started {
            return;
        }

        state.started = true;
        state.active = true;
        state.shutdown = false;

        let this = self.clone();
        thread::Builder::new()
            .name("slate-rpc".to_owned())
            .spawn(move || this.worker())
            .expect("failed to spawn rpc thread");
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

        let deadline = Duration::from_millis(250);
        let state = self.state.lock().unwrap();
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, deadline, |s| !s.shutdown)
            .unwrap();

        if !state.shutdown {
            logging::warn!(self.log, "rpc thread did not stop in time");
        }
        state.started = false;
    }

    /// Queues one call for execution. The worker invokes `callback` and
    /// hands the response message to `send_response`.
    pub fn process_rpc(
        &self,
        name: &str,
        id: u16,
        uid: u16,
        params: Vec<u8>,
        callback: Arc<RpcCallback>,
        send_response: Box<SendResponseFn>,
    ) {
        let mut state = self.state.lock().unwrap();
        if !state.started {
            logging::debug!(self.log, "dropping rpc call, server not running"; "name" => name);
            return;
        }

        state.queue.push_back(RpcCall {
            name: name.to_owned(),
            id,
            uid,
            params,
            callback,
            send_response,
        });
        drop(state);
        self.cond.notify_one();
    }

    fn worker(self: Arc<Self>) {
        logging::debug!(self.log, "rpc thread running");

        let mut state = self.state.lock().unwrap();
        loop {
            while state.active && state.queue.is_empty() {
                state = self.cond.wait(state).unwrap();
            }
            if !state.active {
                break;
            }

            if let Some(call) = state.queue.pop_front() {
                // Handlers run without the queue lock held.
                drop(state);

                logging::trace!(self.log, "rpc calling"; "name" => %call.name);
                let result = (call.callback)(&call.name, &call.params);
                (call.send_response)(Message::RpcResponse {
                    id: call.id,
                    uid: call.uid,
                    result,
                });

                state = self.state.lock().unwrap();
            }
        }

        logging::debug!(self.log, "rpc thread exiting");
        state.shutdown = true;
        drop(state);
        self.cond.notify_all();
    }
}
