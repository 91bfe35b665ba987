//! The ephemeral connection a worker opens against a candidate cluster node to refresh its slot
//! map: `Created → Connecting → WritingQuery → Reading → Parsed | Failed`.

use std::collections::HashSet;
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Token;

use cerberus_net::{Buffer, NetError, NetResult};

use crate::protocol;
use crate::response::{split_responses, Response};
use crate::slotmap::{covers_all_slots, parse_slot_map, RedisNode};

/// `*2\r\n$7\r\ncluster\r\n$5\r\nnodes\r\n` — the fixed query every updater sends once connected.
const QUERY: &[u8] = b"*2\r\n$7\r\ncluster\r\n$5\r\nnodes\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterState {
    Created,
    Connecting,
    WritingQuery,
    Reading,
}

pub enum UpdaterOutcome {
    Parsed(Vec<RedisNode>),
    Failed,
}

pub struct Updater {
    pub addr: SocketAddr,
    stream: Option<TcpStream>,
    token: Option<Token>,
    state: UpdaterState,
    write_buf: Buffer,
    read_buf: Buffer,
    require_full_coverage: bool,
}

impl Updater {
    pub fn new(addr: SocketAddr, require_full_coverage: bool) -> Updater {
        let mut write_buf = Buffer::with_capacity(QUERY.len());
        write_buf.extend(QUERY);

        Updater {
            addr,
            stream: None,
            token: None,
            state: UpdaterState::Created,
            write_buf,
            read_buf: Buffer::new(),
            require_full_coverage,
        }
    }

    pub fn attach(&mut self, stream: TcpStream, token: Token) {
        self.stream = Some(stream);
        self.token = Some(token);
        self.state = UpdaterState::Connecting;
    }

    pub fn token(&self) -> Option<Token> {
        self.token
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    pub fn state(&self) -> UpdaterState {
        self.state
    }

    /// Total backing capacity of this updater's read and write buffers, for the worker's
    /// per-tick memory-usage tally.
    pub fn buffer_memory(&self) -> usize {
        self.read_buf.capacity() + self.write_buf.capacity()
    }

    /// Drives the write side: the first writable event after connecting means the non-blocking
    /// connect finished, so this both confirms the connection and flushes the query.
    pub fn on_writable(&mut self) -> NetResult<()> {
        if self.state == UpdaterState::Created {
            return Ok(());
        }

        self.state = UpdaterState::WritingQuery;
        let stream = self.stream.as_mut().ok_or(NetError::Wait)?;
        self.write_buf.egress(stream)?;

        if self.write_buf.is_empty() {
            self.state = UpdaterState::Reading;
        }

        Ok(())
    }

    /// Drains the socket and, once a complete `CLUSTER NODES` reply has arrived, parses it.
    /// Returns `None` while still waiting on more bytes.
    pub fn on_readable(&mut self) -> NetResult<Option<UpdaterOutcome>> {
        let stream = self.stream.as_mut().ok_or(NetError::Wait)?;
        let read = self.read_buf.ingress(stream)?;

        if read == 0 {
            return Ok(Some(UpdaterOutcome::Failed));
        }

        let default_host = self.addr.ip().to_string();
        Ok(parse_cluster_nodes_frame(
            self.read_buf.read_slice(),
            &default_host,
            self.require_full_coverage,
        ))
    }

    pub fn close(&mut self) {
        self.stream = None;
        self.token = None;
    }
}

/// Parses a buffered `CLUSTER NODES` reply, pure of any socket I/O so it can be exercised without
/// a live connection. `None` means the buffer doesn't hold a complete reply yet (the caller
/// should wait for more bytes); exactly one response is expected, more is treated as failure.
fn parse_cluster_nodes_frame(buf: &[u8], default_host: &str, require_full_coverage: bool) -> Option<UpdaterOutcome> {
    let (responses, _) = match split_responses(buf) {
        Ok(pair) => pair,
        Err(_) => return Some(UpdaterOutcome::Failed),
    };

    if responses.is_empty() {
        return None;
    }
    if responses.len() > 1 {
        return Some(UpdaterOutcome::Failed);
    }

    match &responses[0] {
        Response::Retry => Some(UpdaterOutcome::Failed),
        Response::Normal { bytes, is_error } => {
            if *is_error {
                return Some(UpdaterOutcome::Failed);
            }

            let body = match protocol::parse(bytes) {
                Ok(Some((value, _))) => value,
                _ => return Some(UpdaterOutcome::Failed),
            };

            let text = match body.as_bulk() {
                Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                None => return Some(UpdaterOutcome::Failed),
            };

            let nodes = parse_slot_map(&text, default_host);

            if require_full_coverage && !covers_all_slots(&nodes) {
                return Some(UpdaterOutcome::Failed);
            }

            Some(UpdaterOutcome::Parsed(nodes))
        }
    }
}

/// Computes the candidate address set for the *next* refresh round, given whether this round
/// produced a winning updater. A successful round clears the candidate set back to every address
/// currently in the slot map; an all-failed round retries against whatever was just attempted.
pub fn next_candidates(
    current_servers: &HashSet<SocketAddr>,
    attempted: &HashSet<SocketAddr>,
    succeeded: bool,
) -> HashSet<SocketAddr> {
    if succeeded {
        current_servers.clone()
    } else {
        attempted.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_nodes_reply(body: &str) -> Vec<u8> {
        let mut out = Vec::new();
        protocol::encode_bulk(&mut out, Some(body.as_bytes()));
        out
    }

    #[test]
    fn incomplete_reply_yields_none() {
        let full = cluster_nodes_reply("abc 127.0.0.1:7000 myself,master - 0 0 1 connected 0-16383\n");
        assert!(parse_cluster_nodes_frame(&full[..full.len() - 2], "127.0.0.1", true).is_none());
    }

    #[test]
    fn full_coverage_reply_parses_to_a_node_list() {
        let body = "abc 127.0.0.1:7000 myself,master - 0 0 1 connected 0-16383\n";
        let frame = cluster_nodes_reply(body);
        match parse_cluster_nodes_frame(&frame, "127.0.0.1", true) {
            Some(UpdaterOutcome::Parsed(nodes)) => assert_eq!(nodes.len(), 1),
            _ => panic!("expected a parsed node list"),
        }
    }

    #[test]
    fn partial_coverage_fails_when_full_coverage_required() {
        let body = "abc 127.0.0.1:7000 myself,master - 0 0 1 connected 0-100\n";
        let frame = cluster_nodes_reply(body);
        assert!(matches!(
            parse_cluster_nodes_frame(&frame, "127.0.0.1", true),
            Some(UpdaterOutcome::Failed)
        ));
    }

    #[test]
    fn partial_coverage_accepted_when_full_coverage_not_required() {
        let body = "abc 127.0.0.1:7000 myself,master - 0 0 1 connected 0-100\n";
        let frame = cluster_nodes_reply(body);
        assert!(matches!(
            parse_cluster_nodes_frame(&frame, "127.0.0.1", false),
            Some(UpdaterOutcome::Parsed(_))
        ));
    }

    #[test]
    fn more_than_one_response_is_a_failure() {
        let mut frame = cluster_nodes_reply("abc 127.0.0.1:7000 myself,master - 0 0 1 connected 0-16383\n");
        frame.extend_from_slice(b"+unexpected extra reply\r\n");
        assert!(matches!(parse_cluster_nodes_frame(&frame, "127.0.0.1", true), Some(UpdaterOutcome::Failed)));
    }

    #[test]
    fn clusterdown_reply_is_a_failure() {
        let frame = b"-CLUSTERDOWN The cluster is down\r\n".to_vec();
        assert!(matches!(parse_cluster_nodes_frame(&frame, "127.0.0.1", true), Some(UpdaterOutcome::Failed)));
    }

    #[test]
    fn successful_round_resets_candidates_to_current_servers() {
        let current: HashSet<SocketAddr> = ["127.0.0.1:7000".parse().unwrap()].into_iter().collect();
        let attempted: HashSet<SocketAddr> = ["10.0.0.1:9999".parse().unwrap()].into_iter().collect();
        assert_eq!(next_candidates(&current, &attempted, true), current);
    }

    #[test]
    fn failed_round_retries_attempted_addresses() {
        let current: HashSet<SocketAddr> = ["127.0.0.1:7000".parse().unwrap()].into_iter().collect();
        let attempted: HashSet<SocketAddr> = ["10.0.0.1:9999".parse().unwrap()].into_iter().collect();
        assert_eq!(next_candidates(&current, &attempted, false), attempted);
    }
}
