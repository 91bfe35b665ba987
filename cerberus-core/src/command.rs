//! Command splitting: turns a client's RESP byte stream into zero-or-more `CommandGroup`s, one
//! per client-visible reply. This is the re-expression of the source's `on_byte`/`on_element`
//! mutable-function-pointer state machine as a straightforward match over a parsed `Value` plus
//! one builder function per special command, which is what the design notes call for.

use std::time::{Duration, Instant};

use crate::arena::Handle;
use crate::protocol::{self, ProtoError, Value};
use crate::slot::key_slot;
use rand::Rng;

pub type ClientHandle = Handle<crate::client::Client>;

/// Which sub-slot of a group a server reply belongs to.
#[derive(Debug, Clone, Copy)]
pub enum SubRef {
    Index(usize),
    Rename,
}

/// Routing information a server keeps alongside a dispatched command, so that once a reply
/// arrives it can be handed back to the right client without the server holding a direct
/// reference to it.
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    pub client: ClientHandle,
    pub group_seq: u64,
    pub sub: SubRef,
    /// The slot this ticket's request was routed by, carried along so a `MOVED`/`ASK` retry or a
    /// cluster-down failure can be resolved against the slot map without re-parsing the request.
    pub key_slot: u16,
    /// Stamped (or re-stamped) the moment the request is actually handed to a server connection,
    /// so the reply side can measure how long that one round trip took. A ticket that sat on the
    /// retry queue for a while doesn't get charged for that wait.
    pub sent_at: Instant,
}

/// A single unit of work a `CommandGroup` fans out to a server, or a pre-baked reply that never
/// touches the network.
pub struct SubCommand {
    pub key_slot: Option<u16>,
    pub request: Vec<u8>,
    pub response: Option<Vec<u8>>,
}

impl SubCommand {
    pub fn pending(key_slot: u16, request: Vec<u8>) -> SubCommand {
        SubCommand { key_slot: Some(key_slot), request, response: None }
    }

    pub fn direct(response: Vec<u8>) -> SubCommand {
        SubCommand { key_slot: None, request: Vec::new(), response: Some(response) }
    }

    pub fn is_pending(&self) -> bool {
        self.key_slot.is_some() && self.response.is_none()
    }
}

/// The `GET a -> SET b value -> DEL a` dance used for a cross-slot `RENAME`.
pub enum RenameStage {
    Get,
    Set { value: Vec<u8> },
    Del,
}

pub struct RenameGroup {
    pub seq: u64,
    pub client: ClientHandle,
    pub src: Vec<u8>,
    pub dst: Vec<u8>,
    pub src_slot: u16,
    pub dst_slot: u16,
    pub stage: RenameStage,
    /// The single in-flight stage command. `None` once `final_reply` is set.
    pub current: Option<SubCommand>,
    pub final_reply: Option<Vec<u8>>,
    pub created_at: Instant,
    pub remote_elapsed: Duration,
}

impl RenameGroup {
    /// Builds the request bytes for the current stage, to be (re)dispatched by key_slot.
    pub fn stage_request(&self) -> (u16, Vec<u8>) {
        match &self.stage {
            RenameStage::Get => (self.src_slot, protocol::encode_command(b"GET", &[&self.src])),
            RenameStage::Set { value } => {
                (self.dst_slot, protocol::encode_command(b"SET", &[&self.dst, value]))
            }
            RenameStage::Del => (self.src_slot, protocol::encode_command(b"DEL", &[&self.src])),
        }
    }

    /// Advances the stage machine given the raw reply bytes for the stage that just completed.
    /// Returns `true` if the group is now finished (has a `final_reply`).
    pub fn advance(&mut self, reply: &[u8]) -> bool {
        match self.stage {
            RenameStage::Get => {
                if reply.starts_with(b"$-1\r\n") {
                    self.final_reply = Some(b"-ERR no such key\r\n".to_vec());
                    return true;
                }
                match protocol::parse(reply) {
                    Ok(Some((Value::Bulk(Some(value)), _))) => {
                        self.stage = RenameStage::Set { value };
                        false
                    }
                    _ => {
                        self.final_reply = Some(b"-ERR source key was not a string\r\n".to_vec());
                        true
                    }
                }
            }
            RenameStage::Set { .. } => {
                self.stage = RenameStage::Del;
                false
            }
            RenameStage::Del => {
                self.final_reply = Some(b"+OK\r\n".to_vec());
                true
            }
        }
    }
}

pub struct FanoutGroup {
    pub seq: u64,
    pub client: ClientHandle,
    pub prefix: Option<Vec<u8>>,
    pub forced_reply: Option<Vec<u8>>,
    pub subs: Vec<SubCommand>,
    pub awaiting: usize,
    pub created_at: Instant,
    pub remote_elapsed: Duration,
}

pub enum CommandGroup {
    Fanout(FanoutGroup),
    Rename(RenameGroup),
}

impl CommandGroup {
    pub fn seq(&self) -> u64 {
        match self {
            CommandGroup::Fanout(g) => g.seq,
            CommandGroup::Rename(g) => g.seq,
        }
    }

    pub fn client(&self) -> ClientHandle {
        match self {
            CommandGroup::Fanout(g) => g.client,
            CommandGroup::Rename(g) => g.client,
        }
    }

    pub fn is_ready(&self) -> bool {
        match self {
            CommandGroup::Fanout(g) => g.awaiting == 0,
            CommandGroup::Rename(g) => g.final_reply.is_some(),
        }
    }

    pub fn created_at(&self) -> Instant {
        match self {
            CommandGroup::Fanout(g) => g.created_at,
            CommandGroup::Rename(g) => g.created_at,
        }
    }

    /// Folds one server round trip's duration into this group's running total, so that once the
    /// group is rendered the worker can report how much of its total time was spent waiting on
    /// the backing Redis node(s) versus shuffling bytes locally.
    pub fn add_remote_cost(&mut self, cost: Duration) {
        match self {
            CommandGroup::Fanout(g) => g.remote_elapsed += cost,
            CommandGroup::Rename(g) => g.remote_elapsed += cost,
        }
    }

    pub fn remote_elapsed(&self) -> Duration {
        match self {
            CommandGroup::Fanout(g) => g.remote_elapsed,
            CommandGroup::Rename(g) => g.remote_elapsed,
        }
    }

    /// Renders the client-visible reply once `is_ready()`.
    pub fn render(&self) -> Vec<u8> {
        match self {
            CommandGroup::Fanout(g) => {
                let mut out = Vec::new();
                if let Some(prefix) = &g.prefix {
                    out.extend_from_slice(prefix);
                }
                if let Some(forced) = &g.forced_reply {
                    out.extend_from_slice(forced);
                    return out;
                }
                for sub in &g.subs {
                    match &sub.response {
                        Some(bytes) => out.extend_from_slice(bytes),
                        None => out.extend_from_slice(b"$-1\r\n"),
                    }
                }
                out
            }
            CommandGroup::Rename(g) => g.final_reply.clone().unwrap_or_default(),
        }
    }
}

fn direct_group(seq: u64, client: ClientHandle, reply: Vec<u8>) -> CommandGroup {
    CommandGroup::Fanout(FanoutGroup {
        seq,
        client,
        prefix: None,
        forced_reply: None,
        subs: vec![SubCommand::direct(reply)],
        awaiting: 0,
        created_at: Instant::now(),
        remote_elapsed: Duration::ZERO,
    })
}

fn unknown_command_error(raw_name: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"-ERR unknown command '");
    out.extend_from_slice(raw_name);
    out.extend_from_slice(b"'\r\n");
    out
}

fn wrong_args_error(verb: &str) -> Vec<u8> {
    format!("-ERR wrong number of arguments for '{}' command\r\n", verb.to_lowercase())
        .into_bytes()
}

const FORBIDDEN: &[&str] = &["KEYS", "FLUSHALL", "FLUSHDB", "SELECT", "MOVE", "SWAPDB"];

/// Single-key verbs recognised directly (not needing special fan-out), paired with the minimum
/// number of arguments after the verb itself.
const STANDARD: &[(&str, usize)] = &[
    ("GET", 1),
    ("SET", 2),
    ("SETNX", 2),
    ("SETEX", 3),
    ("PSETEX", 3),
    ("APPEND", 2),
    ("STRLEN", 1),
    ("EXISTS", 1),
    ("INCR", 1),
    ("DECR", 1),
    ("INCRBY", 2),
    ("DECRBY", 2),
    ("INCRBYFLOAT", 2),
    ("GETSET", 2),
    ("GETRANGE", 3),
    ("SETRANGE", 3),
    ("EXPIRE", 2),
    ("PEXPIRE", 2),
    ("TTL", 1),
    ("PTTL", 1),
    ("PERSIST", 1),
    ("TYPE", 1),
    ("DUMP", 1),
    ("RESTORE", 3),
    ("SORT", 1),
    ("LPUSH", 2),
    ("RPUSH", 2),
    ("LPOP", 1),
    ("RPOP", 1),
    ("LLEN", 1),
    ("LRANGE", 3),
    ("LINDEX", 2),
    ("LSET", 3),
    ("LREM", 3),
    ("LTRIM", 3),
    ("SADD", 2),
    ("SREM", 2),
    ("SCARD", 1),
    ("SISMEMBER", 2),
    ("SMEMBERS", 1),
    ("SPOP", 1),
    ("SRANDMEMBER", 1),
    ("HSET", 3),
    ("HGET", 2),
    ("HDEL", 2),
    ("HEXISTS", 2),
    ("HGETALL", 1),
    ("HKEYS", 1),
    ("HVALS", 1),
    ("HLEN", 1),
    ("HINCRBY", 3),
    ("ZADD", 3),
    ("ZREM", 2),
    ("ZSCORE", 2),
    ("ZRANK", 2),
    ("ZRANGE", 3),
    ("ZCARD", 1),
    ("ZINCRBY", 3),
];

fn uppercase(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| b.to_ascii_uppercase()).collect()
}

/// The outcome of splitting a single complete top-level message off the client's buffer.
pub enum SplitOutcome {
    Group(CommandGroup),
    /// `SUBSCRIBE`/`PSUBSCRIBE`: the caller must detach this client's socket to the pub/sub
    /// bridge and stop routing further frames through the core.
    Handoff,
}

/// Attempts to split one complete message off the head of `buf`. Returns `Ok(None)` if `buf`
/// does not yet hold a complete message. `*seq` is the client's monotonically increasing group
/// sequence counter, bumped once per emitted group.
pub fn split_one(
    buf: &[u8],
    client: ClientHandle,
    seq: &mut u64,
) -> Result<Option<(SplitOutcome, usize)>, ProtoError> {
    let (value, consumed) = match protocol::parse(buf)? {
        None => return Ok(None),
        Some(pair) => pair,
    };

    let outcome = match value {
        Value::Array(Some(items)) if !items.is_empty() => {
            if items.iter().any(|item| matches!(item, Value::Array(_))) {
                return Err(ProtoError::NestedArray);
            }

            let mut bulks: Vec<Vec<u8>> = Vec::with_capacity(items.len());
            let mut well_formed = true;
            for item in &items {
                match item.as_bulk() {
                    Some(bytes) => bulks.push(bytes.to_vec()),
                    None => {
                        well_formed = false;
                        break;
                    }
                }
            }

            if !well_formed {
                SplitOutcome::Group(direct_group(
                    bump(seq),
                    client,
                    b"-ERR Protocol error: expected bulk string array\r\n".to_vec(),
                ))
            } else {
                let raw_name = bulks.remove(0);
                let name = uppercase(&raw_name);
                build_group(&name, &raw_name, bulks, client, seq)
            }
        }
        Value::Array(_) => SplitOutcome::Group(direct_group(
            bump(seq),
            client,
            b"-ERR Protocol error: invalid command array\r\n".to_vec(),
        )),
        other => SplitOutcome::Group(build_inline(other, client, seq)),
    };

    Ok(Some((outcome, consumed)))
}

fn bump(seq: &mut u64) -> u64 {
    let current = *seq;
    *seq += 1;
    current
}

fn build_inline(value: Value, client: ClientHandle, seq: &mut u64) -> CommandGroup {
    let line = match value {
        Value::Simple(bytes) | Value::Error(bytes) => bytes,
        Value::Bulk(Some(bytes)) => bytes,
        Value::Integer(n) => n.to_string().into_bytes(),
        Value::Bulk(None) | Value::Array(_) => Vec::new(),
    };

    let mut words = line.split(|&b| b == b' ' || b == b'\t').filter(|w| !w.is_empty());
    let first = words.next().unwrap_or(&[]);

    if uppercase(first) == b"PING" {
        direct_group(bump(seq), client, b"+PONG\r\n".to_vec())
    } else {
        direct_group(bump(seq), client, unknown_command_error(first))
    }
}

fn build_group(
    name: &[u8],
    raw_name: &[u8],
    args: Vec<Vec<u8>>,
    client: ClientHandle,
    seq: &mut u64,
) -> SplitOutcome {
    if FORBIDDEN.iter().any(|f| f.as_bytes() == name) {
        return SplitOutcome::Group(direct_group(
            bump(seq),
            client,
            b"-ERR This command is not allowed in proxy mode\r\n".to_vec(),
        ));
    }

    match name {
        b"PING" => SplitOutcome::Group(direct_group(bump(seq), client, ping_reply(&args))),
        b"MGET" => SplitOutcome::Group(mget_group(args, client, seq)),
        b"DEL" => SplitOutcome::Group(del_group(args, client, seq)),
        b"MSET" => SplitOutcome::Group(mset_group(args, client, seq)),
        b"RENAME" => SplitOutcome::Group(rename_group(args, client, seq)),
        b"SUBSCRIBE" | b"PSUBSCRIBE" => SplitOutcome::Handoff,
        b"PUBLISH" => SplitOutcome::Group(publish_group(args, client, seq)),
        _ => {
            if let Some(&(verb, min_args)) = STANDARD.iter().find(|(verb, _)| verb.as_bytes() == name) {
                if args.len() < min_args {
                    SplitOutcome::Group(direct_group(bump(seq), client, wrong_args_error(verb)))
                } else {
                    let request = {
                        let mut full = Vec::with_capacity(1 + args.len());
                        full.push(name.to_vec());
                        full.extend(args.iter().cloned());
                        let refs: Vec<&[u8]> = full.iter().map(|v| v.as_slice()).collect();
                        protocol::encode_command(refs[0], &refs[1..])
                    };
                    let slot = key_slot(&args[0]);
                    SplitOutcome::Group(CommandGroup::Fanout(FanoutGroup {
                        seq: bump(seq),
                        client,
                        prefix: None,
                        forced_reply: None,
                        subs: vec![SubCommand::pending(slot, request)],
                        awaiting: 1,
                        created_at: Instant::now(),
                        remote_elapsed: Duration::ZERO,
                    }))
                }
            } else {
                SplitOutcome::Group(direct_group(bump(seq), client, unknown_command_error(raw_name)))
            }
        }
    }
}

fn ping_reply(args: &[Vec<u8>]) -> Vec<u8> {
    match args.len() {
        0 => b"+PONG\r\n".to_vec(),
        1 => {
            let mut out = Vec::new();
            protocol::encode_bulk(&mut out, Some(&args[0]));
            out
        }
        _ => wrong_args_error("ping"),
    }
}

fn mget_group(args: Vec<Vec<u8>>, client: ClientHandle, seq: &mut u64) -> CommandGroup {
    if args.is_empty() {
        return direct_group(bump(seq), client, wrong_args_error("mget"));
    }

    let mut prefix = Vec::new();
    protocol::encode_array_header(&mut prefix, args.len());

    let subs = args
        .iter()
        .map(|key| SubCommand::pending(key_slot(key), protocol::encode_command(b"GET", &[key])))
        .collect::<Vec<_>>();
    let awaiting = subs.len();

    CommandGroup::Fanout(FanoutGroup {
        seq: bump(seq),
        client,
        prefix: Some(prefix),
        forced_reply: None,
        subs,
        awaiting,
        created_at: Instant::now(),
        remote_elapsed: Duration::ZERO,
    })
}

fn del_group(args: Vec<Vec<u8>>, client: ClientHandle, seq: &mut u64) -> CommandGroup {
    if args.is_empty() {
        return direct_group(bump(seq), client, wrong_args_error("del"));
    }

    let mut prefix = Vec::new();
    protocol::encode_array_header(&mut prefix, args.len());

    let subs = args
        .iter()
        .map(|key| SubCommand::pending(key_slot(key), protocol::encode_command(b"DEL", &[key])))
        .collect::<Vec<_>>();
    let awaiting = subs.len();

    CommandGroup::Fanout(FanoutGroup {
        seq: bump(seq),
        client,
        prefix: Some(prefix),
        forced_reply: None,
        subs,
        awaiting,
        created_at: Instant::now(),
        remote_elapsed: Duration::ZERO,
    })
}

fn mset_group(args: Vec<Vec<u8>>, client: ClientHandle, seq: &mut u64) -> CommandGroup {
    if args.is_empty() || args.len() % 2 != 0 {
        return direct_group(bump(seq), client, wrong_args_error("mset"));
    }

    let subs = args
        .chunks_exact(2)
        .map(|pair| {
            let (key, value) = (&pair[0], &pair[1]);
            SubCommand::pending(key_slot(key), protocol::encode_command(b"SET", &[key, value]))
        })
        .collect::<Vec<_>>();
    let awaiting = subs.len();

    CommandGroup::Fanout(FanoutGroup {
        seq: bump(seq),
        client,
        prefix: None,
        forced_reply: Some(b"+OK\r\n".to_vec()),
        subs,
        awaiting,
        created_at: Instant::now(),
        remote_elapsed: Duration::ZERO,
    })
}

fn rename_group(args: Vec<Vec<u8>>, client: ClientHandle, seq: &mut u64) -> CommandGroup {
    if args.len() != 2 {
        return direct_group(bump(seq), client, wrong_args_error("rename"));
    }

    let src = args[0].clone();
    let dst = args[1].clone();
    let src_slot = key_slot(&src);
    let dst_slot = key_slot(&dst);

    if src_slot == dst_slot {
        let request = protocol::encode_command(b"RENAME", &[&src, &dst]);
        CommandGroup::Fanout(FanoutGroup {
            seq: bump(seq),
            client,
            prefix: None,
            forced_reply: None,
            subs: vec![SubCommand::pending(src_slot, request)],
            awaiting: 1,
            created_at: Instant::now(),
            remote_elapsed: Duration::ZERO,
        })
    } else {
        CommandGroup::Rename(RenameGroup {
            seq: bump(seq),
            client,
            src,
            dst,
            src_slot,
            dst_slot,
            stage: RenameStage::Get,
            current: None,
            final_reply: None,
            created_at: Instant::now(),
            remote_elapsed: Duration::ZERO,
        })
    }
}

fn publish_group(args: Vec<Vec<u8>>, client: ClientHandle, seq: &mut u64) -> CommandGroup {
    if args.len() != 2 {
        return direct_group(bump(seq), client, wrong_args_error("publish"));
    }

    let slot = rand::thread_rng().gen_range(0..crate::slot::SLOT_COUNT);
    let request = protocol::encode_command(b"PUBLISH", &[&args[0], &args[1]]);

    CommandGroup::Fanout(FanoutGroup {
        seq: bump(seq),
        client,
        prefix: None,
        forced_reply: None,
        subs: vec![SubCommand::pending(slot, request)],
        awaiting: 1,
        created_at: Instant::now(),
        remote_elapsed: Duration::ZERO,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    fn fake_client() -> ClientHandle {
        let mut arena: Arena<crate::client::Client> = Arena::new();
        arena.insert(crate::client::Client::for_test())
    }

    #[test]
    fn ping_with_no_args_is_pong() {
        let client = fake_client();
        let mut seq = 0u64;
        let (outcome, consumed) =
            split_one(b"*1\r\n$4\r\nPING\r\n", client, &mut seq).unwrap().unwrap();
        assert_eq!(consumed, "*1\r\n$4\r\nPING\r\n".len());
        match outcome {
            SplitOutcome::Group(group) => {
                assert!(group.is_ready());
                assert_eq!(group.render(), b"+PONG\r\n");
            }
            _ => panic!("expected a group"),
        }
    }

    #[test]
    fn unknown_command_reports_name() {
        let client = fake_client();
        let mut seq = 0u64;
        let (outcome, _) = split_one(b"*1\r\n$4\r\nXXXX\r\n", client, &mut seq).unwrap().unwrap();
        match outcome {
            SplitOutcome::Group(group) => {
                assert_eq!(group.render(), b"-ERR unknown command 'XXXX'\r\n");
            }
            _ => panic!("expected a group"),
        }
    }

    #[test]
    fn mget_fans_out_one_get_per_key() {
        let client = fake_client();
        let mut seq = 0u64;
        let (outcome, _) =
            split_one(b"*3\r\n$4\r\nMGET\r\n$2\r\nk1\r\n$2\r\nk2\r\n", client, &mut seq)
                .unwrap()
                .unwrap();
        match outcome {
            SplitOutcome::Group(CommandGroup::Fanout(g)) => {
                assert_eq!(g.subs.len(), 2);
                assert_eq!(g.subs[0].request, protocol::encode_command(b"GET", &[b"k1"]));
                assert_eq!(g.subs[1].request, protocol::encode_command(b"GET", &[b"k2"]));
                assert_eq!(g.awaiting, 2);
            }
            _ => panic!("expected a fanout group"),
        }
    }

    #[test]
    fn rename_same_slot_is_a_single_command() {
        let client = fake_client();
        let mut seq = 0u64;
        // both keys share a hash tag, so they land on the same slot
        let (outcome, _) = split_one(
            b"*3\r\n$6\r\nRENAME\r\n$7\r\n{t}key1\r\n$7\r\n{t}key2\r\n",
            client,
            &mut seq,
        )
        .unwrap()
        .unwrap();
        match outcome {
            SplitOutcome::Group(CommandGroup::Fanout(g)) => assert_eq!(g.subs.len(), 1),
            _ => panic!("expected a single fanout command"),
        }
    }

    #[test]
    fn rename_cross_slot_builds_a_stage_machine() {
        let client = fake_client();
        let mut seq = 0u64;
        let (outcome, _) =
            split_one(b"*3\r\n$6\r\nRENAME\r\n$1\r\na\r\n$1\r\nb\r\n", client, &mut seq)
                .unwrap()
                .unwrap();
        match outcome {
            SplitOutcome::Group(CommandGroup::Rename(g)) => {
                assert!(matches!(g.stage, RenameStage::Get));
                assert!(g.final_reply.is_none());
            }
            _ => panic!("expected a rename group"),
        }
    }

    #[test]
    fn subscribe_triggers_handoff() {
        let client = fake_client();
        let mut seq = 0u64;
        let (outcome, _) =
            split_one(b"*2\r\n$9\r\nSUBSCRIBE\r\n$2\r\nch\r\n", client, &mut seq).unwrap().unwrap();
        assert!(matches!(outcome, SplitOutcome::Handoff));
    }

    #[test]
    fn forbidden_command_is_rejected() {
        let client = fake_client();
        let mut seq = 0u64;
        let (outcome, _) = split_one(b"*1\r\n$4\r\nKEYS\r\n", client, &mut seq).unwrap().unwrap();
        match outcome {
            SplitOutcome::Group(group) => {
                assert_eq!(group.render(), b"-ERR This command is not allowed in proxy mode\r\n");
            }
            _ => panic!("expected a group"),
        }
    }

    #[test]
    fn incomplete_buffer_yields_none() {
        let client = fake_client();
        let mut seq = 0u64;
        assert!(split_one(b"*1\r\n$4\r\nPI", client, &mut seq).unwrap().is_none());
    }

    #[test]
    fn nested_array_at_the_top_level_is_a_fatal_protocol_error() {
        let client = fake_client();
        let mut seq = 0u64;
        // *2\r\n *1\r\n$3\r\nfoo\r\n $3\r\nbar\r\n — a command array whose first element is itself
        // an array, rather than a bulk string.
        let frame = b"*2\r\n*1\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        assert_eq!(split_one(frame, client, &mut seq).unwrap_err(), ProtoError::NestedArray);
    }
}
