//! A connection from one application client. Owns the command groups it has issued but not yet
//! fully answered, in submission order, so replies can be written back to the client in the
//! order the commands arrived even though their sub-commands may come back from different
//! servers in any order.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::TcpStream;
use mio::Token;

use cerberus_net::{Buffer, NetError, NetResult};

use crate::arena::Handle;
use crate::command::{self, CommandGroup, SplitOutcome, SubRef, Ticket};
use crate::protocol::ProtoError;
use crate::server::ServerHandle;

pub type ClientHandle = Handle<Client>;

const READ_BUF_INITIAL: usize = 16 * 1024;
const WRITE_BUF_INITIAL: usize = 16 * 1024;

pub struct Client {
    pub addr: SocketAddr,
    stream: Option<TcpStream>,
    token: Option<Token>,
    read_buf: Buffer,
    write_buf: Buffer,
    group_seq: u64,
    /// Groups issued but not yet fully answered, oldest first. The head is the next group
    /// eligible to be rendered to the write buffer, once it is ready.
    pending_groups: VecDeque<CommandGroup>,
    /// Servers this client currently has at least one outstanding sub-command with, so they can
    /// be told to drop this client's tickets if the connection closes early.
    peers: HashSet<ServerHandle>,
    /// Set once a `SUBSCRIBE`/`PSUBSCRIBE` has handed this connection off to the pub/sub bridge;
    /// the reactor stops routing frames through the command splitter for it.
    handed_off: bool,
    /// Rendered groups from the most recent `flush_ready()`, not yet copied into `write_buf` —
    /// handed to `send()`'s gather-write instead, so a fully-successful write skips the copy.
    ready_chunks: Vec<Vec<u8>>,
}

impl Client {
    pub fn new(addr: SocketAddr) -> Client {
        Client {
            addr,
            stream: None,
            token: None,
            read_buf: Buffer::with_capacity(READ_BUF_INITIAL),
            write_buf: Buffer::with_capacity(WRITE_BUF_INITIAL),
            group_seq: 0,
            pending_groups: VecDeque::new(),
            peers: HashSet::new(),
            handed_off: false,
            ready_chunks: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn for_test() -> Client {
        Client::new("127.0.0.1:0".parse().unwrap())
    }

    pub fn attach(&mut self, stream: TcpStream, token: Token) {
        self.stream = Some(stream);
        self.token = Some(token);
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn is_handed_off(&self) -> bool {
        self.handed_off
    }

    pub fn mark_handed_off(&mut self) {
        self.handed_off = true;
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Takes the socket out of this client for a pub/sub hand-off. The caller is responsible for
    /// deregistering it from the reactor first; the core stops tracking the connection afterward.
    pub fn take_stream(&mut self) -> Option<TcpStream> {
        self.token = None;
        self.stream.take()
    }

    pub fn receive(&mut self) -> NetResult<usize> {
        let stream = self.stream.as_mut().ok_or(NetError::Wait)?;
        Ok(self.read_buf.ingress(stream)?)
    }

    /// Flushes the write backlog together with whatever `flush_ready()` rendered since the last
    /// call, as a single gather-write. Anything not covered by this write is folded back into
    /// the backlog by `Buffer::egress_vectored`, so the caller never needs to track partial
    /// progress through `ready_chunks` itself.
    pub fn send(&mut self) -> NetResult<usize> {
        let stream = self.stream.as_mut().ok_or(NetError::Wait)?;
        let slices: Vec<&[u8]> = self.ready_chunks.iter().map(Vec::as_slice).collect();
        let written = self.write_buf.egress_vectored(stream, &slices)?;
        self.ready_chunks.clear();
        Ok(written)
    }

    pub fn has_egress(&self) -> bool {
        !self.write_buf.is_empty() || !self.ready_chunks.is_empty()
    }

    /// Total backing capacity of this connection's read and write buffers, for the worker's
    /// per-tick memory-usage tally.
    pub fn buffer_memory(&self) -> usize {
        self.read_buf.capacity() + self.write_buf.capacity()
    }

    pub fn has_unanswered_groups(&self) -> bool {
        !self.pending_groups.is_empty()
    }

    /// Concatenates whatever `flush_ready()` has queued for the next `send()`, for tests that
    /// don't drive a real socket.
    #[cfg(test)]
    pub fn rendered_for_test(&self) -> Vec<u8> {
        self.ready_chunks.concat()
    }

    /// Splits one complete command off the front of the read buffer. `handle` is this client's
    /// own handle, stamped into every `Ticket` the command produces so replies route back here.
    pub fn split_next(&mut self, handle: ClientHandle) -> Result<Option<SplitOutcome>, ProtoError> {
        let outcome = {
            let slice = self.read_buf.read_slice();
            command::split_one(slice, handle, &mut self.group_seq)?
        };

        match outcome {
            None => Ok(None),
            Some((outcome, consumed)) => {
                self.read_buf.consume(consumed);
                Ok(Some(outcome))
            }
        }
    }

    pub fn enqueue_group(&mut self, group: CommandGroup) {
        self.pending_groups.push_back(group);
    }

    pub fn note_peer(&mut self, server: ServerHandle) {
        self.peers.insert(server);
    }

    pub fn peers(&self) -> impl Iterator<Item = ServerHandle> + '_ {
        self.peers.iter().copied()
    }

    /// Applies a server reply to the sub-slot named by `ticket`, folding `remote_cost` (the time
    /// that one round trip took) into the group's running total. Returns `true` if a matching,
    /// still-pending group was found (whether or not that group is now fully ready — a caller
    /// should follow up with `flush_ready`).
    pub fn apply_reply(&mut self, ticket: &Ticket, reply: &[u8], remote_cost: Duration) -> bool {
        for group in self.pending_groups.iter_mut() {
            if group.seq() != ticket.group_seq {
                continue;
            }

            group.add_remote_cost(remote_cost);

            match (group, ticket.sub) {
                (CommandGroup::Fanout(g), SubRef::Index(i)) => {
                    if let Some(sub) = g.subs.get_mut(i) {
                        sub.response = Some(reply.to_vec());
                        g.awaiting = g.awaiting.saturating_sub(1);
                    }
                }
                (CommandGroup::Rename(g), SubRef::Rename) => {
                    g.advance(reply);
                }
                _ => {}
            }

            return true;
        }

        false
    }

    /// Forces the sub-slot named by `ticket` straight to a fixed error reply, bypassing the normal
    /// stage/fan-out bookkeeping `apply_reply` does. Used when a command's slot can't be resolved
    /// after a cluster-down refresh cycle and the ticket must be failed back to its client instead
    /// of retried forever.
    pub fn fail_ticket(&mut self, ticket: &Ticket, message: &[u8]) -> bool {
        for group in self.pending_groups.iter_mut() {
            if group.seq() != ticket.group_seq {
                continue;
            }

            match (group, ticket.sub) {
                (CommandGroup::Fanout(g), SubRef::Index(i)) => {
                    if let Some(sub) = g.subs.get_mut(i) {
                        sub.response = Some(message.to_vec());
                        g.awaiting = g.awaiting.saturating_sub(1);
                    }
                }
                (CommandGroup::Rename(g), SubRef::Rename) => {
                    g.current = None;
                    g.final_reply = Some(message.to_vec());
                }
                _ => {}
            }

            return true;
        }

        false
    }

    /// If `group_seq` names a still-outstanding `RENAME` stage machine, returns the slot and
    /// request bytes for its next stage so the caller can dispatch it.
    pub fn rename_next_stage(&self, group_seq: u64) -> Option<(u16, Vec<u8>)> {
        self.pending_groups.iter().find_map(|group| match group {
            CommandGroup::Rename(g) if g.seq == group_seq && g.final_reply.is_none() => {
                Some(g.stage_request())
            }
            _ => None,
        })
    }

    /// Renders every group at the front of the queue that has become fully ready, in submission
    /// order, queuing each as a chunk for `send()`'s gather-write and removing it. Stops at the
    /// first group still waiting on a reply, so ordering towards the client is preserved even
    /// though replies can arrive out of order underneath. Returns one `(cmd_elapse, remote_cost)`
    /// pair per group rendered, for the caller to fold into `Stats`.
    pub fn flush_ready(&mut self) -> Vec<(Duration, Duration)> {
        let mut timings = Vec::new();
        while let Some(front) = self.pending_groups.front() {
            if !front.is_ready() {
                break;
            }
            let group = self.pending_groups.pop_front().expect("front checked above");
            timings.push((group.created_at().elapsed(), group.remote_elapsed()));
            self.ready_chunks.push(group.render());
        }
        timings
    }

    /// Tears down the connection, returning the set of servers that should be told to forget
    /// this client's outstanding tickets.
    pub fn close(&mut self) -> Vec<ServerHandle> {
        self.stream = None;
        self.token = None;
        self.read_buf.clear();
        self.write_buf.clear();
        self.ready_chunks.clear();
        self.pending_groups.clear();
        self.peers.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::command::{FanoutGroup, SubCommand};

    fn fake_handle() -> ClientHandle {
        let mut arena: Arena<Client> = Arena::new();
        arena.insert(Client::for_test())
    }

    fn fanout_of(seq: u64, client: ClientHandle, key_count: usize) -> CommandGroup {
        let subs = (0..key_count).map(|_| SubCommand::pending(0, b"GET\r\n".to_vec())).collect();
        CommandGroup::Fanout(FanoutGroup {
            seq,
            client,
            prefix: None,
            forced_reply: None,
            subs,
            awaiting: key_count,
            created_at: std::time::Instant::now(),
            remote_elapsed: Duration::ZERO,
        })
    }

    fn test_ticket(client: ClientHandle, group_seq: u64, sub: SubRef) -> Ticket {
        Ticket { client, group_seq, sub, key_slot: 0, sent_at: std::time::Instant::now() }
    }

    #[test]
    fn split_next_consumes_one_command_and_stamps_the_handle() {
        let mut client = Client::for_test();
        let handle = fake_handle();
        client.read_buf.extend(b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n");

        let outcome = client.split_next(handle).unwrap().unwrap();
        match outcome {
            SplitOutcome::Group(group) => assert_eq!(group.client(), handle),
            _ => panic!("expected a group"),
        }
        // exactly one PING was consumed, the second is still in the buffer
        assert_eq!(client.read_buf.len(), "*1\r\n$4\r\nPING\r\n".len());
    }

    #[test]
    fn split_next_surfaces_a_nested_array_as_an_error_instead_of_a_reply() {
        let mut client = Client::for_test();
        let handle = fake_handle();
        client.read_buf.extend(b"*2\r\n*1\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");

        // The caller (the worker's read loop) maps this Err straight to closing the connection,
        // never dispatching a group or queuing a reply.
        assert_eq!(client.split_next(handle).unwrap_err(), crate::protocol::ProtoError::NestedArray);
    }

    #[test]
    fn flush_ready_preserves_submission_order_across_out_of_order_replies() {
        let handle = fake_handle();
        let mut client = Client::for_test();

        let first = fanout_of(0, handle, 1);
        let second = fanout_of(1, handle, 1);
        client.enqueue_group(first);
        client.enqueue_group(second);

        // answer the second group before the first
        let ticket_b = test_ticket(handle, 1, SubRef::Index(0));
        assert!(client.apply_reply(&ticket_b, b"$1\r\nb\r\n", Duration::from_millis(1)));
        client.flush_ready();
        assert!(!client.has_egress(), "first group still outstanding, nothing should flush");

        let ticket_a = test_ticket(handle, 0, SubRef::Index(0));
        assert!(client.apply_reply(&ticket_a, b"$1\r\na\r\n", Duration::from_millis(1)));
        client.flush_ready();

        assert_eq!(client.rendered_for_test(), b"$1\r\na\r\n$1\r\nb\r\n");
        assert!(!client.has_unanswered_groups());
    }

    #[test]
    fn close_returns_and_clears_peer_set() {
        let handle = fake_handle();
        let mut client = Client::for_test();
        let mut servers: Arena<crate::server::Server> = Arena::new();
        let server = servers.insert(crate::server::Server::for_test("127.0.0.1:7000".parse().unwrap()));
        client.note_peer(server);
        client.enqueue_group(fanout_of(0, handle, 1));

        let peers = client.close();
        assert_eq!(peers, vec![server]);
        assert!(!client.has_unanswered_groups());
    }

    #[test]
    fn fail_ticket_forces_a_fanout_sub_to_an_error_without_awaiting_a_server() {
        let handle = fake_handle();
        let mut client = Client::for_test();
        client.enqueue_group(fanout_of(0, handle, 1));

        let ticket = test_ticket(handle, 0, SubRef::Index(0));
        assert!(client.fail_ticket(&ticket, b"-CLUSTERDOWN The cluster is down\r\n"));
        client.flush_ready();

        assert_eq!(client.rendered_for_test(), b"-CLUSTERDOWN The cluster is down\r\n");
    }

    #[test]
    fn rename_next_stage_reports_the_in_flight_stage_request() {
        use crate::command::{RenameGroup, RenameStage};

        let handle = fake_handle();
        let mut client = Client::for_test();
        client.enqueue_group(CommandGroup::Rename(RenameGroup {
            seq: 0,
            client: handle,
            src: b"a".to_vec(),
            dst: b"b".to_vec(),
            src_slot: 1,
            dst_slot: 2,
            stage: RenameStage::Get,
            current: None,
            final_reply: None,
            created_at: std::time::Instant::now(),
            remote_elapsed: Duration::ZERO,
        }));

        let (slot, request) = client.rename_next_stage(0).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(request, crate::protocol::encode_command(b"GET", &[b"a"]));
    }
}
