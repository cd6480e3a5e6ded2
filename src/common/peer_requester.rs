use rayon::prelude::*;

use crate::errors::RaftError;
use crate::membership::MemberId;

/// Fans a request out to every peer in parallel and collects each peer's
/// reply, preserving the peer identity of every response.
pub fn request_from_peers<Req, Resp, Requester>(
    request: Req,
    peers: Vec<MemberId>,
    requester: Requester,
) -> Vec<(MemberId, Result<Resp, RaftError>)>
where
    Requester: Fn(MemberId, Req) -> Result<Resp, RaftError> + Sync,
    Req: Clone + Sync,
    Resp: Send,
{
    peers
        .into_par_iter()
        .map(|peer_id| {
            let response = requester(peer_id, request.clone());

            (peer_id, response)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::new_err;

    #[test]
    fn collects_reply_per_peer() {
        let peers: Vec<MemberId> = (0..3).map(|_| MemberId::new()).collect();
        let failing_peer = peers[1];

        let responses = request_from_peers(7u64, peers.clone(), |peer_id, request| {
            if peer_id == failing_peer {
                return new_err("no route".to_string(), String::new());
            }
            Ok(request + 1)
        });

        assert_eq!(3, responses.len());
        for (peer_id, response) in responses {
            if peer_id == failing_peer {
                assert!(response.is_err());
            } else {
                assert_eq!(8, response.unwrap());
            }
        }
    }

    #[test]
    fn empty_peer_list_yields_no_responses() {
        let responses =
            request_from_peers(0u64, Vec::new(), |_peer_id, request| Ok::<u64, RaftError>(request));

        assert!(responses.is_empty());
    }
}
