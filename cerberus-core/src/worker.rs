//! The per-thread reactor: one `Worker` owns one `mio::Poll`, one listening socket, and every
//! client/server/updater connection it has accepted or opened. Workers share no mutable state —
//! each binds the same port with `SO_REUSEPORT` and the kernel load-balances accepted
//! connections across them — so everything here runs single-threaded and lock-free, the same
//! shape as the teacher's `Endpoint::sync` loop in `net/endpoint.rs`, generalized from three
//! pools of `Channel` to three pools of `Client`/`Server`/`Updater`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Events, Poll, PollOpt, Ready, Token};
use slog::Logger;

use cerberus_net::listener::bind_mio_reuseport;
use cerberus_net::NetError;

use crate::arena::{Arena, Handle};
use crate::client::{Client, ClientHandle};
use crate::command::{CommandGroup, SplitOutcome, SubRef, Ticket};
use crate::pubsub;
use crate::response::{split_responses, Response};
use crate::server::{Server, ServerHandle};
use crate::slotmap::{RedisNode, SlotMap};
use crate::stats::Stats;
use crate::updater::{next_candidates, Updater, UpdaterOutcome};

type UpdaterHandle = Handle<Updater>;

const LISTENER_TOKEN: Token = Token(0);

/// Everything a worker thread needs to know to come up: where to listen, where to find the
/// cluster the first time, and the handful of cluster-wide flags that shape routing.
pub struct WorkerConfig {
    pub bind_addr: SocketAddr,
    pub seed_remote: SocketAddr,
    pub require_full_coverage: bool,
    pub read_slave: bool,
    /// Host prefix preferred when a master has more than one replica under `read_slave` mode.
    /// Empty means no preference.
    pub read_slave_filter: String,
    /// Shared across every worker thread the process spawns. Holds the seed addresses a refresh
    /// round should try; an administrative action can push new ones in from outside the reactor
    /// loop entirely, and each worker just picks them up the next time it decides to launch a
    /// round, rather than being pushed to synchronously.
    pub admin: Arc<AdminState>,
}

/// The one piece of state every worker thread shares. Everything else — slot map, retry queue,
/// in-flight updaters, connections — is worker-local, per the proxy's no-cross-thread-locking
/// design; this is the single deliberate exception, and it is read, not locked against, on the
/// hot path (only consulted when a refresh round is about to start).
pub struct AdminState {
    seed_candidates: Mutex<Vec<SocketAddr>>,
}

impl AdminState {
    pub fn new(seed: SocketAddr) -> AdminState {
        AdminState { seed_candidates: Mutex::new(vec![seed]) }
    }

    /// Replaces the seed candidate set. Workers do not observe this until their next refresh
    /// round starts; there is no notification path, by design.
    pub fn set_seed_candidates(&self, addrs: Vec<SocketAddr>) {
        *self.seed_candidates.lock().unwrap() = addrs;
    }

    fn seed_candidates(&self) -> Vec<SocketAddr> {
        self.seed_candidates.lock().unwrap().clone()
    }
}

#[derive(Clone, Copy)]
enum ConnId {
    Client(ClientHandle),
    Server(ServerHandle),
    Updater(UpdaterHandle),
}

/// One reactor thread's worth of connections and routing state.
pub struct Worker {
    log: Logger,
    stats: Arc<Stats>,

    poll: Poll,
    events: Events,
    listener: MioTcpListener,
    acceptor_registered: bool,

    tokens: HashMap<Token, ConnId>,
    next_token: usize,
    free_tokens: Vec<usize>,

    clients: Arena<Client>,
    servers: Arena<Server>,
    server_by_addr: HashMap<SocketAddr, ServerHandle>,
    updaters: Arena<Updater>,

    slot_map: SlotMap,
    /// Set whenever a command can't be routed, or a server tied to a now-stale slot owner is
    /// lost; cleared once a refresh cycle produces a fully-covering map with nothing left to
    /// retry. Drives whether `maybe_launch_updaters` starts a new round.
    slot_map_expired: bool,
    seed_remote: SocketAddr,
    admin: Arc<AdminState>,
    candidate_addrs: HashSet<SocketAddr>,
    attempted_addrs: HashSet<SocketAddr>,
    slot_map_updated_this_round: bool,
    require_full_coverage: bool,

    /// Tickets whose slot has no known owner right now, waiting on the next successful refresh.
    retry_queue: VecDeque<(Ticket, Vec<u8>)>,
}

impl Worker {
    pub fn new(config: WorkerConfig, stats: Arc<Stats>, log: Logger) -> io::Result<Worker> {
        let listener = bind_mio_reuseport(config.bind_addr, 1024)?;
        let poll = Poll::new()?;
        poll.register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::edge())?;

        Ok(Worker {
            log,
            stats,
            poll,
            events: Events::with_capacity(1024),
            listener,
            acceptor_registered: true,
            tokens: HashMap::new(),
            next_token: 1,
            free_tokens: Vec::new(),
            clients: Arena::new(),
            servers: Arena::new(),
            server_by_addr: HashMap::new(),
            updaters: Arena::new(),
            slot_map: SlotMap::with_read_slave_filter(config.read_slave, config.read_slave_filter),
            // Nothing is known about the cluster yet; the first tick kicks off a refresh round
            // against the seed address before blocking on any client I/O.
            slot_map_expired: true,
            seed_remote: config.seed_remote,
            admin: config.admin,
            candidate_addrs: HashSet::new(),
            attempted_addrs: HashSet::new(),
            slot_map_updated_this_round: false,
            require_full_coverage: config.require_full_coverage,
            retry_queue: VecDeque::new(),
        })
    }

    /// Runs the reactor loop forever. Only returns on an unrecoverable `mio::Poll` failure.
    pub fn run(mut self) -> io::Result<()> {
        self.maybe_launch_updaters();
        loop {
            self.tick()?;
        }
    }

    fn tick(&mut self) -> io::Result<()> {
        self.poll.poll(&mut self.events, None)?;

        let triggered: Vec<(Token, Ready)> = self.events.iter().map(|e| (e.token(), e.readiness())).collect();

        for (token, readiness) in triggered {
            if token == LISTENER_TOKEN {
                self.accept_loop();
                continue;
            }

            match self.tokens.get(&token).copied() {
                Some(ConnId::Client(handle)) => self.on_client_event(handle, readiness),
                Some(ConnId::Server(handle)) => self.on_server_event(handle, readiness),
                Some(ConnId::Updater(handle)) => self.on_updater_event(handle, readiness),
                None => {}
            }
        }

        self.maybe_launch_updaters();
        self.report_buffer_memory();
        Ok(())
    }

    /// Sums `Buffer::capacity()` across every live client, server, and updater connection and
    /// publishes the total to `Stats`. The source increments a single per-thread counter as
    /// buffers grow; this worker has no such hook threaded through `Buffer`, so it recomputes the
    /// total once per tick instead — cheap relative to the I/O already done this iteration, and
    /// it never drifts out of sync with connections closing.
    fn report_buffer_memory(&self) {
        let client_bytes: usize =
            self.clients.live_handles().filter_map(|h| self.clients.get(h)).map(Client::buffer_memory).sum();
        let server_bytes: usize =
            self.servers.live_handles().filter_map(|h| self.servers.get(h)).map(Server::buffer_memory).sum();
        let updater_bytes: usize =
            self.updaters.live_handles().filter_map(|h| self.updaters.get(h)).map(Updater::buffer_memory).sum();

        self.stats.set_buffer_memory_bytes((client_bytes + server_bytes + updater_bytes) as u64);
    }

    fn alloc_token(&mut self, conn: ConnId) -> Token {
        let id = self.free_tokens.pop().unwrap_or_else(|| {
            let id = self.next_token;
            self.next_token += 1;
            id
        });
        let token = Token(id);
        self.tokens.insert(token, conn);
        token
    }

    fn free_token(&mut self, token: Token) {
        self.tokens.remove(&token);
        self.free_tokens.push(token.0);
    }

    // ---- accept -----------------------------------------------------------------------------

    fn accept_loop(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let handle = self.clients.insert(Client::new(addr));
                    let token = self.alloc_token(ConnId::Client(handle));

                    if let Err(err) = self.poll.register(&stream, token, Ready::readable(), PollOpt::edge()) {
                        slog::warn!(self.log, "failed to register accepted client"; "error" => %err);
                        self.clients.remove(handle);
                        self.free_token(token);
                        continue;
                    }

                    if let Some(client) = self.clients.get_mut(handle) {
                        client.attach(stream, token);
                    }
                    self.stats.client_connected();
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    // Most likely EMFILE/ENFILE: pull the listener out of the poll set rather
                    // than spin on a hot error, and pick it back up once a connection frees up.
                    slog::warn!(self.log, "accept failed, pausing the acceptor"; "error" => %err);
                    let _ = self.poll.deregister(&self.listener);
                    self.acceptor_registered = false;
                    break;
                }
            }
        }
    }

    fn maybe_resume_acceptor(&mut self) {
        if !self.acceptor_registered
            && self.poll.register(&self.listener, LISTENER_TOKEN, Ready::readable(), PollOpt::edge()).is_ok()
        {
            self.acceptor_registered = true;
        }
    }

    // ---- clients ------------------------------------------------------------------------------

    fn on_client_event(&mut self, handle: ClientHandle, readiness: Ready) {
        if readiness.is_readable() {
            self.read_client(handle);
        }
        if self.clients.contains(handle) && readiness.is_writable() {
            self.flush_client(handle);
        }
    }

    fn read_client(&mut self, handle: ClientHandle) {
        match self.clients.get_mut(handle).map(|c| (c.is_handed_off(), c.receive())) {
            None => return,
            Some((true, _)) => return,
            Some((false, Ok(0))) => {
                self.close_client(handle);
                return;
            }
            Some((false, Ok(_))) => {}
            Some((false, Err(NetError::Wait))) => {}
            Some((false, Err(NetError::Fatal(_)))) => {
                self.close_client(handle);
                return;
            }
        }

        loop {
            let outcome = match self.clients.get_mut(handle) {
                Some(client) if !client.is_handed_off() => client.split_next(handle),
                _ => break,
            };

            match outcome {
                Ok(None) => break,
                Ok(Some(SplitOutcome::Group(group))) => self.dispatch_group(handle, group),
                Ok(Some(SplitOutcome::Handoff)) => {
                    self.handoff_client(handle);
                    return;
                }
                Err(_) => {
                    self.close_client(handle);
                    return;
                }
            }
        }

        self.flush_client(handle);
    }

    fn flush_client(&mut self, handle: ClientHandle) {
        let client = match self.clients.get_mut(handle) {
            Some(client) => client,
            None => return,
        };

        if client.has_egress() {
            match client.send() {
                Ok(_) => {}
                Err(NetError::Wait) => {}
                Err(NetError::Fatal(_)) => {
                    self.close_client(handle);
                    return;
                }
            }
        }

        self.arm_client(handle);
    }

    /// Re-registers a client's interest set: always readable, plus writable only while it still
    /// has bytes queued to send. Servers and updaters skip this — they register dual interest
    /// once and keep it, since they spend their whole life either writing a request or reading a
    /// reply — but a client idles on read far more often than not, so toggling here is worth it.
    fn arm_client(&mut self, handle: ClientHandle) {
        if let Some(client) = self.clients.get(handle) {
            if let (Some(token), Some(stream)) = (client.token(), client.stream()) {
                let mut ready = Ready::readable();
                if client.has_egress() {
                    ready |= Ready::writable();
                }
                let _ = self.poll.reregister(stream, token, ready, PollOpt::edge());
            }
        }
    }

    fn close_client(&mut self, handle: ClientHandle) {
        let token = self.clients.get(handle).and_then(|c| c.token());
        let removed = self.clients.remove(handle);
        if removed.is_none() {
            return;
        }
        if let Some(token) = token {
            self.free_token(token);
        }
        self.stats.client_disconnected();
        self.maybe_resume_acceptor();
    }

    /// Detaches a client's socket from the reactor and streams it off to `pubsub::bridge`; the
    /// client is then dropped from the arena entirely, same as any other closed connection.
    fn handoff_client(&mut self, handle: ClientHandle) {
        let token = self.clients.get(handle).and_then(|c| c.token());

        let stream = match self.clients.get_mut(handle) {
            Some(client) => {
                client.mark_handed_off();
                client.take_stream()
            }
            None => None,
        };

        if let Some(token) = token {
            self.free_token(token);
        }

        if let Some(stream) = stream {
            let _ = self.poll.deregister(&stream);
            let backend = self.pick_backend_for_handoff();
            if let Err(err) = pubsub::bridge(stream, backend, self.log.clone()) {
                slog::warn!(self.log, "pub/sub hand-off failed"; "error" => %err);
            }
        }

        self.clients.remove(handle);
        self.stats.client_disconnected();
        self.maybe_resume_acceptor();
    }

    fn pick_backend_for_handoff(&self) -> SocketAddr {
        self.slot_map.all_addresses().into_iter().next().unwrap_or(self.seed_remote)
    }

    fn settle_client(&mut self, handle: ClientHandle) {
        let timings = match self.clients.get_mut(handle) {
            Some(client) => client.flush_ready(),
            None => Vec::new(),
        };
        for (cmd_elapse, remote_cost) in timings {
            self.stats.record(cmd_elapse, remote_cost);
        }
        self.flush_client(handle);
    }

    // ---- command dispatch -----------------------------------------------------------------

    /// Enqueues a freshly split group on its client, then dispatches every sub-command that
    /// needs a server round trip (a `RENAME` stage machine, or any fan-out sub not already
    /// answered directly by the splitter).
    fn dispatch_group(&mut self, client_handle: ClientHandle, group: CommandGroup) {
        let group_seq = group.seq();
        let dispatches = initial_dispatch(&group);

        if let Some(client) = self.clients.get_mut(client_handle) {
            client.enqueue_group(group);
        }

        for (slot, request, sub) in dispatches {
            let ticket = Ticket { client: client_handle, group_seq, sub, key_slot: slot, sent_at: Instant::now() };
            self.route(ticket, request);
        }

        self.settle_client(client_handle);
    }

    /// Resolves `ticket.key_slot` against the current slot map and either queues the request on
    /// the owning server connection or, if the slot has no known owner, parks it on the retry
    /// queue for the next successful cluster refresh. Re-stamps `sent_at` right before handing
    /// the ticket to a server, so a ticket that spent time parked on the retry queue isn't
    /// charged for that wait when its reply's remote cost is measured.
    fn route(&mut self, mut ticket: Ticket, request: Vec<u8>) {
        let addr = match self.slot_map.get(ticket.key_slot) {
            Some(addr) => addr,
            None => {
                self.retry_queue.push_back((ticket, request));
                self.slot_map_expired = true;
                return;
            }
        };

        let server_handle = match self.ensure_server(addr) {
            Some(handle) => handle,
            None => {
                self.retry_queue.push_back((ticket, request));
                self.slot_map_expired = true;
                return;
            }
        };

        if let Some(client) = self.clients.get_mut(ticket.client) {
            client.note_peer(server_handle);
        }
        ticket.sent_at = Instant::now();
        if let Some(server) = self.servers.get_mut(server_handle) {
            server.queue(ticket, request);
        }
    }

    // ---- servers ------------------------------------------------------------------------------

    /// Returns the connection for `addr`, opening and registering a new one if none exists yet.
    /// The connect itself is non-blocking; the first writable event on the new socket both
    /// confirms it and flushes whatever was already queued, same pattern as `Updater`.
    fn ensure_server(&mut self, addr: SocketAddr) -> Option<ServerHandle> {
        if let Some(&handle) = self.server_by_addr.get(&addr) {
            return Some(handle);
        }

        let stream = match MioTcpStream::connect(&addr) {
            Ok(stream) => stream,
            Err(err) => {
                slog::warn!(self.log, "connect to backend failed"; "addr" => %addr, "error" => %err);
                return None;
            }
        };
        let _ = stream.set_nodelay(true);

        let handle = self.servers.insert(Server::new(addr));
        let token = self.alloc_token(ConnId::Server(handle));

        if let Err(err) = self.poll.register(&stream, token, Ready::readable() | Ready::writable(), PollOpt::edge()) {
            slog::warn!(self.log, "failed to register backend connection"; "addr" => %addr, "error" => %err);
            self.servers.remove(handle);
            self.free_token(token);
            return None;
        }

        if let Some(server) = self.servers.get_mut(handle) {
            server.attach(stream, token);
        }
        self.server_by_addr.insert(addr, handle);
        Some(handle)
    }

    fn on_server_event(&mut self, handle: ServerHandle, readiness: Ready) {
        if readiness.is_writable() {
            self.flush_server(handle);
        }
        if self.servers.contains(handle) && readiness.is_readable() {
            self.drain_server_responses(handle);
        }
    }

    fn flush_server(&mut self, handle: ServerHandle) {
        let server = match self.servers.get_mut(handle) {
            Some(server) => server,
            None => return,
        };

        server.flush_pending();
        match server.send() {
            Ok(_) => {}
            Err(NetError::Wait) => {}
            Err(NetError::Fatal(_)) => self.close_server(handle),
        }
    }

    fn drain_server_responses(&mut self, handle: ServerHandle) {
        match self.servers.get_mut(handle).map(|s| s.receive()) {
            None => return,
            Some(Ok(0)) => {
                self.close_server(handle);
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(NetError::Wait)) => {}
            Some(Err(NetError::Fatal(_))) => {
                self.close_server(handle);
                return;
            }
        }

        let server = match self.servers.get_mut(handle) {
            Some(server) => server,
            None => return,
        };

        let (responses, consumed) = match split_responses(server.read_slice()) {
            Ok(pair) => pair,
            Err(_) => {
                self.close_server(handle);
                return;
            }
        };
        server.consume_read(consumed);

        for response in responses {
            let popped = self.servers.get_mut(handle).and_then(|s| s.pop_sent());
            let (ticket, request) = match popped {
                Some(pair) => pair,
                None => continue,
            };

            match response {
                Response::Normal { bytes, .. } => self.deliver_reply(ticket, &bytes),
                Response::Retry => {
                    self.retry_queue.push_back((ticket, request));
                    self.slot_map_expired = true;
                }
            }
        }
    }

    /// Hands a server's reply back to the client ticket that requested it, advancing a `RENAME`
    /// stage machine to its next stage if the ticket was part of one. A ticket whose client has
    /// already disconnected is simply dropped — its handle no longer resolves to anything.
    fn deliver_reply(&mut self, ticket: Ticket, bytes: &[u8]) {
        let client_handle = ticket.client;
        let remote_cost = ticket.sent_at.elapsed();

        let matched = match self.clients.get_mut(client_handle) {
            Some(client) => client.apply_reply(&ticket, bytes, remote_cost),
            None => false,
        };
        if !matched {
            return;
        }

        if let SubRef::Rename = ticket.sub {
            let next = self.clients.get(client_handle).and_then(|c| c.rename_next_stage(ticket.group_seq));
            if let Some((slot, request)) = next {
                let next_ticket = Ticket {
                    client: client_handle,
                    group_seq: ticket.group_seq,
                    sub: SubRef::Rename,
                    key_slot: slot,
                    sent_at: Instant::now(),
                };
                self.route(next_ticket, request);
            }
        }

        self.settle_client(client_handle);
    }

    fn close_server(&mut self, handle: ServerHandle) {
        let token = self.servers.get(handle).and_then(|s| s.token());
        let addr = self.servers.get(handle).map(|s| s.addr);

        let outstanding = match self.servers.remove(handle) {
            Some(mut server) => server.close(),
            None => return,
        };

        if let Some(token) = token {
            self.free_token(token);
        }
        if let Some(addr) = addr {
            self.server_by_addr.remove(&addr);
        }

        if !outstanding.is_empty() {
            self.slot_map_expired = true;
        }
        for entry in outstanding {
            self.retry_queue.push_back(entry);
        }
    }

    // ---- cluster slot-map refresh -----------------------------------------------------------

    fn maybe_launch_updaters(&mut self) {
        if !self.updaters.is_empty() {
            return;
        }
        if self.retry_queue.is_empty() && !self.slot_map_expired {
            return;
        }

        let candidates: Vec<SocketAddr> = if self.candidate_addrs.is_empty() {
            let shared = self.admin.seed_candidates();
            if shared.is_empty() { vec![self.seed_remote] } else { shared }
        } else {
            self.candidate_addrs.iter().copied().collect()
        };

        self.attempted_addrs = candidates.iter().copied().collect();
        self.slot_map_updated_this_round = false;

        for addr in candidates {
            if let Err(err) = self.spawn_updater(addr) {
                slog::debug!(self.log, "updater connect failed"; "addr" => %addr, "error" => %err);
            }
        }

        // Every candidate failed to even start connecting: treat the round as lost immediately
        // rather than wait forever for events that will never arrive.
        if self.updaters.is_empty() {
            self.candidate_addrs = next_candidates(&self.slot_map.all_addresses(), &self.attempted_addrs, false);
            self.fail_retry_queue_with_clusterdown();
            self.slot_map_expired = false;
            self.attempted_addrs.clear();
        }
    }

    fn spawn_updater(&mut self, addr: SocketAddr) -> io::Result<()> {
        let stream = MioTcpStream::connect(&addr)?;
        let handle = self.updaters.insert(Updater::new(addr, self.require_full_coverage));
        let token = self.alloc_token(ConnId::Updater(handle));

        if let Err(err) = self.poll.register(&stream, token, Ready::readable() | Ready::writable(), PollOpt::edge()) {
            self.updaters.remove(handle);
            self.free_token(token);
            return Err(err);
        }

        if let Some(updater) = self.updaters.get_mut(handle) {
            updater.attach(stream, token);
        }
        Ok(())
    }

    fn on_updater_event(&mut self, handle: UpdaterHandle, readiness: Ready) {
        if readiness.is_writable() {
            let result = match self.updaters.get_mut(handle) {
                Some(updater) => updater.on_writable(),
                None => return,
            };
            if let Err(err) = result {
                if !err.is_wait() {
                    self.finish_updater(handle, None);
                    return;
                }
            }
        }

        if !self.updaters.contains(handle) || !readiness.is_readable() {
            return;
        }

        let outcome = match self.updaters.get_mut(handle) {
            Some(updater) => updater.on_readable(),
            None => return,
        };

        match outcome {
            Ok(Some(UpdaterOutcome::Parsed(nodes))) => self.finish_updater(handle, Some(nodes)),
            Ok(Some(UpdaterOutcome::Failed)) => self.finish_updater(handle, None),
            Ok(None) => {}
            Err(err) => {
                if !err.is_wait() {
                    self.finish_updater(handle, None);
                }
            }
        }
    }

    /// Retires one updater from the current refresh round. The first one to deliver a full
    /// node list wins: it commits the new slot map and cancels every other updater still racing.
    /// Once every updater in the round has finished, either the win is final or the whole round
    /// failed and the retry queue is failed back to its clients with `CLUSTERDOWN`.
    fn finish_updater(&mut self, handle: UpdaterHandle, nodes: Option<Vec<RedisNode>>) {
        if let Some(updater) = self.updaters.get(handle) {
            if let Some(stream) = updater.stream() {
                let _ = self.poll.deregister(stream);
            }
            if let Some(token) = updater.token() {
                self.free_token(token);
            }
        }
        self.updaters.remove(handle);

        if let Some(nodes) = nodes {
            if !self.slot_map_updated_this_round {
                self.slot_map_updated_this_round = true;
                self.apply_slot_map(&nodes);
            }
        }

        if self.updaters.is_empty() {
            if self.slot_map_updated_this_round {
                self.slot_map_expired = !self.slot_map.full_coverage();
            } else {
                self.candidate_addrs = next_candidates(&self.slot_map.all_addresses(), &self.attempted_addrs, false);
                self.fail_retry_queue_with_clusterdown();
                self.slot_map_expired = false;
            }
            self.slot_map_updated_this_round = false;
            self.attempted_addrs.clear();
        }
    }

    fn apply_slot_map(&mut self, nodes: &[RedisNode]) {
        let dropped = self.slot_map.replace_map(nodes);
        for addr in dropped {
            if let Some(&handle) = self.server_by_addr.get(&addr) {
                self.close_server(handle);
            }
        }

        self.candidate_addrs = next_candidates(&self.slot_map.all_addresses(), &self.attempted_addrs, true);
        self.cancel_remaining_updaters();
        self.retry_dispatch();
    }

    fn cancel_remaining_updaters(&mut self) {
        let handles: Vec<_> = self.updaters.live_handles().collect();
        for handle in handles {
            if let Some(updater) = self.updaters.get(handle) {
                if let Some(stream) = updater.stream() {
                    let _ = self.poll.deregister(stream);
                }
                if let Some(token) = updater.token() {
                    self.free_token(token);
                }
            }
            self.updaters.remove(handle);
        }
    }

    /// Re-routes every parked ticket against the freshly applied slot map. A ticket whose slot
    /// is still unresolved (the new map doesn't cover it either) lands right back on the retry
    /// queue and re-raises `slot_map_expired`.
    fn retry_dispatch(&mut self) {
        let queue: Vec<_> = self.retry_queue.drain(..).collect();
        for (ticket, request) in queue {
            self.route(ticket, request);
        }
    }

    fn fail_retry_queue_with_clusterdown(&mut self) {
        let queue: Vec<_> = self.retry_queue.drain(..).collect();
        for (ticket, _request) in queue {
            let client_handle = ticket.client;
            if let Some(client) = self.clients.get_mut(client_handle) {
                client.fail_ticket(&ticket, b"-CLUSTERDOWN The cluster is down\r\n");
            }
            self.settle_client(client_handle);
        }
    }
}

/// The sub-commands of a freshly split group that still need a server round trip, paired with
/// the slot to route them by and the `SubRef` a reply should be filed back under.
fn initial_dispatch(group: &CommandGroup) -> Vec<(u16, Vec<u8>, SubRef)> {
    match group {
        CommandGroup::Fanout(g) => g
            .subs
            .iter()
            .enumerate()
            .filter_map(|(i, sub)| {
                if sub.is_pending() {
                    sub.key_slot.map(|slot| (slot, sub.request.clone(), SubRef::Index(i)))
                } else {
                    None
                }
            })
            .collect(),
        CommandGroup::Rename(g) => {
            let (slot, request) = g.stage_request();
            vec![(slot, request, SubRef::Rename)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{FanoutGroup, RenameGroup, RenameStage, SubCommand};
    use crate::protocol;

    fn fake_client() -> ClientHandle {
        let mut arena: Arena<Client> = Arena::new();
        arena.insert(Client::for_test())
    }

    #[test]
    fn initial_dispatch_skips_already_answered_subs() {
        let client = fake_client();
        let group = CommandGroup::Fanout(FanoutGroup {
            seq: 0,
            client,
            prefix: None,
            forced_reply: None,
            subs: vec![
                SubCommand::direct(b"$-1\r\n".to_vec()),
                SubCommand::pending(7, protocol::encode_command(b"GET", &[b"k"])),
            ],
            awaiting: 1,
            created_at: std::time::Instant::now(),
            remote_elapsed: std::time::Duration::ZERO,
        });

        let dispatches = initial_dispatch(&group);
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].0, 7);
        assert!(matches!(dispatches[0].2, SubRef::Index(1)));
    }

    #[test]
    fn initial_dispatch_of_a_rename_group_is_its_first_stage() {
        let client = fake_client();
        let group = CommandGroup::Rename(RenameGroup {
            seq: 0,
            client,
            src: b"a".to_vec(),
            dst: b"b".to_vec(),
            src_slot: 1,
            dst_slot: 2,
            stage: RenameStage::Get,
            current: None,
            final_reply: None,
            created_at: std::time::Instant::now(),
            remote_elapsed: std::time::Duration::ZERO,
        });

        let dispatches = initial_dispatch(&group);
        assert_eq!(dispatches.len(), 1);
        assert_eq!(dispatches[0].0, 1);
        assert!(matches!(dispatches[0].2, SubRef::Rename));
    }
}
