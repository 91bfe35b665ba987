//! Splits a server connection's read buffer into individual replies, tagging redirection
//! errors (`MOVED`/`ASK`/`CLUSTERDOWN`) as `Retry` instead of handing their placeholder text
//! back to the client.

use crate::protocol::{self, ProtoError, Value};

pub enum Response {
    /// A complete reply frame, verbatim bytes to splice into the client's reply stream.
    Normal { bytes: Vec<u8>, is_error: bool },
    /// A redirection or cluster-down error: never delivered to the client directly, instead
    /// queued for retry once the slot map refreshes.
    Retry,
}

/// Splits as many complete responses as currently sit in `buf`, returning them along with the
/// number of bytes consumed off the front of the buffer.
pub fn split_responses(buf: &[u8]) -> Result<(Vec<Response>, usize), ProtoError> {
    let mut responses = Vec::new();
    let mut pos = 0usize;

    loop {
        match protocol::parse(&buf[pos..])? {
            None => break,
            Some((value, consumed)) => {
                let is_error = matches!(value, Value::Error(_));
                let is_retry = match &value {
                    Value::Error(text) => is_redirect_token(text),
                    _ => false,
                };

                if is_retry {
                    responses.push(Response::Retry);
                } else {
                    responses.push(Response::Normal {
                        bytes: buf[pos..pos + consumed].to_vec(),
                        is_error,
                    });
                }

                pos += consumed;
            }
        }
    }

    Ok((responses, pos))
}

fn is_redirect_token(text: &[u8]) -> bool {
    let token = text.split(|&b| b == b' ').next().unwrap_or(&[]);
    let upper: Vec<u8> = token.iter().map(|b| b.to_ascii_uppercase()).collect();
    upper == b"MOVED" || upper == b"ASK" || upper == b"CLUSTERDOWN"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multiple_normal_replies() {
        let (responses, consumed) = split_responses(b"$5\r\nworld\r\n$-1\r\n").unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(consumed, "$5\r\nworld\r\n$-1\r\n".len());
        assert!(matches!(responses[0], Response::Normal { is_error: false, .. }));
    }

    #[test]
    fn moved_error_becomes_retry() {
        let (responses, _) = split_responses(b"-MOVED 0 host2:1234\r\n").unwrap();
        assert_eq!(responses.len(), 1);
        assert!(matches!(responses[0], Response::Retry));
    }

    #[test]
    fn clusterdown_is_case_insensitive() {
        let (responses, _) = split_responses(b"-clusterdown The cluster is down\r\n").unwrap();
        assert!(matches!(responses[0], Response::Retry));
    }

    #[test]
    fn plain_error_is_normal_with_error_flag() {
        let (responses, _) = split_responses(b"-ERR no such key\r\n").unwrap();
        match &responses[0] {
            Response::Normal { bytes, is_error } => {
                assert!(*is_error);
                assert_eq!(bytes, b"-ERR no such key\r\n");
            }
            _ => panic!("expected a normal error reply"),
        }
    }

    #[test]
    fn incomplete_trailing_response_is_left_unconsumed() {
        let (responses, consumed) = split_responses(b"$5\r\nworld\r\n$3\r\nfo").unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(consumed, "$5\r\nworld\r\n".len());
    }
}
