//! A connection to one Redis cluster node: the write side of the proxy's fan-out. Tracks which
//! client ticket each in-flight request belongs to so a reply can be routed back without the
//! server holding a direct reference to the client.

use std::collections::VecDeque;
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Token;

use cerberus_net::{Buffer, NetError, NetResult};

use crate::arena::Handle;
use crate::command::Ticket;

pub type ServerHandle = Handle<Server>;

const READ_BUF_INITIAL: usize = 16 * 1024;
const WRITE_BUF_INITIAL: usize = 16 * 1024;

pub struct Server {
    pub addr: SocketAddr,
    stream: Option<TcpStream>,
    token: Option<Token>,
    read_buf: Buffer,
    write_buf: Buffer,
    /// Requests that have been queued for this server but not yet copied into `write_buf`.
    pending: VecDeque<(Ticket, Vec<u8>)>,
    /// Requests already written to the wire, in the order replies are expected back — RESP
    /// connections are strictly pipelined, so the head of this queue always names the ticket for
    /// the next complete reply `response::split_responses` yields.
    sent: VecDeque<(Ticket, Vec<u8>)>,
}

impl Server {
    pub fn new(addr: SocketAddr) -> Server {
        Server {
            addr,
            stream: None,
            token: None,
            read_buf: Buffer::with_capacity(READ_BUF_INITIAL),
            write_buf: Buffer::with_capacity(WRITE_BUF_INITIAL),
            pending: VecDeque::new(),
            sent: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub fn for_test(addr: SocketAddr) -> Server {
        Server::new(addr)
    }

    pub fn attach(&mut self, stream: TcpStream, token: Token) {
        self.stream = Some(stream);
        self.token = Some(token);
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub fn queue(&mut self, ticket: Ticket, request: Vec<u8>) {
        self.pending.push_back((ticket, request));
    }

    /// Puts previously dispatched requests back at the front of the queue, ahead of anything
    /// already pending. Used when a `MOVED`/`ASK` retry resubmits a ticket to a (possibly
    /// different) server connection and its ordering relative to brand-new commands doesn't
    /// matter, but its relative order to other retried tickets does.
    pub fn requeue_front(&mut self, items: Vec<(Ticket, Vec<u8>)>) {
        for item in items.into_iter().rev() {
            self.pending.push_front(item);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_egress(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Total backing capacity of this connection's read and write buffers, for the worker's
    /// per-tick memory-usage tally.
    pub fn buffer_memory(&self) -> usize {
        self.read_buf.capacity() + self.write_buf.capacity()
    }

    /// Copies every queued request into the write buffer and records its ticket as sent, in
    /// order, so replies can be paired back to their ticket as they arrive.
    pub fn flush_pending(&mut self) {
        while let Some((ticket, request)) = self.pending.pop_front() {
            self.write_buf.extend(&request);
            self.sent.push_back((ticket, request));
        }
    }

    /// Pops the ticket owning the oldest in-flight request, to pair with the next parsed reply.
    pub fn pop_sent(&mut self) -> Option<(Ticket, Vec<u8>)> {
        self.sent.pop_front()
    }

    /// Drains every ticket still owed a reply by this server, whether already written to the
    /// wire or still queued. Used when the connection is abandoned — closed by the peer, or
    /// dropped from the slot map on a refresh — so its outstanding work can be resubmitted
    /// elsewhere instead of silently vanishing.
    pub fn drain_outstanding(&mut self) -> Vec<(Ticket, Vec<u8>)> {
        let mut all: Vec<_> = self.sent.drain(..).collect();
        all.extend(self.pending.drain(..));
        all
    }

    pub fn receive(&mut self) -> NetResult<usize> {
        let stream = self.stream.as_mut().ok_or(NetError::Wait)?;
        Ok(self.read_buf.ingress(stream)?)
    }

    pub fn send(&mut self) -> NetResult<usize> {
        let stream = self.stream.as_mut().ok_or(NetError::Wait)?;
        Ok(self.write_buf.egress(stream)?)
    }

    pub fn read_slice(&self) -> &[u8] {
        self.read_buf.read_slice()
    }

    pub fn consume_read(&mut self, n: usize) {
        self.read_buf.consume(n);
    }

    /// Tears down the connection, returning every ticket this server still owed a reply to.
    pub fn close(&mut self) -> Vec<(Ticket, Vec<u8>)> {
        self.stream = None;
        self.token = None;
        self.read_buf.clear();
        self.write_buf.clear();
        self.drain_outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::command::SubRef;

    fn fake_ticket(seq: u64) -> Ticket {
        let mut clients: Arena<crate::client::Client> = Arena::new();
        let client = clients.insert(crate::client::Client::for_test());
        Ticket { client, group_seq: seq, sub: SubRef::Index(0), key_slot: 0, sent_at: std::time::Instant::now() }
    }

    #[test]
    fn flush_pending_moves_requests_into_write_buf_and_sent_queue() {
        let mut server = Server::for_test("127.0.0.1:7000".parse().unwrap());
        server.queue(fake_ticket(1), b"*1\r\n$4\r\nPING\r\n".to_vec());
        server.queue(fake_ticket(2), b"*1\r\n$4\r\nPING\r\n".to_vec());

        assert!(server.has_pending());
        server.flush_pending();
        assert!(!server.has_pending());

        let (first, _) = server.pop_sent().unwrap();
        assert_eq!(first.group_seq, 1);
        let (second, _) = server.pop_sent().unwrap();
        assert_eq!(second.group_seq, 2);
        assert!(server.pop_sent().is_none());
    }

    #[test]
    fn requeue_front_preserves_relative_order() {
        let mut server = Server::for_test("127.0.0.1:7000".parse().unwrap());
        server.queue(fake_ticket(3), b"c".to_vec());

        server.requeue_front(vec![(fake_ticket(1), b"a".to_vec()), (fake_ticket(2), b"b".to_vec())]);
        server.flush_pending();

        let order: Vec<u64> = std::iter::from_fn(|| server.pop_sent().map(|(t, _)| t.group_seq)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn close_drains_sent_and_pending_tickets() {
        let mut server = Server::for_test("127.0.0.1:7000".parse().unwrap());
        server.queue(fake_ticket(1), b"a".to_vec());
        server.flush_pending();
        server.queue(fake_ticket(2), b"b".to_vec());

        let outstanding = server.close();
        assert_eq!(outstanding.len(), 2);
        assert_eq!(outstanding[0].0.group_seq, 1);
        assert_eq!(outstanding[1].0.group_seq, 2);
    }
}
