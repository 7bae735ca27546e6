//! Fuzzy-hash datagram listener (spec §4.5, §6.2): a dedicated Tokio task
//! owning one `UdpSocket`. No other worker touches the fuzzy store directly
//! (spec §5).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use siftmail_core::fuzzy::store::FuzzyStore;
use siftmail_core::fuzzy::wire::{parse_frame, FuzzyCmd, FuzzyFrame, FuzzyReply, FuzzyRequest, DIGEST_LEN};

const DISALLOWED_REPLY_VALUE: i32 = 403;

fn legacy_to_request(legacy: &siftmail_core::fuzzy::wire::LegacyRequest) -> FuzzyRequest {
    let mut digest = [0u8; DIGEST_LEN];
    digest[..legacy.hash.len()].copy_from_slice(&legacy.hash);
    FuzzyRequest {
        version: 1,
        cmd: legacy.cmd,
        flag: legacy.flag,
        value: legacy.value,
        tag: 0,
        digest,
        shingles: None,
    }
}

async fn handle_datagram(store: &FuzzyStore, source: SocketAddr, buf: &[u8]) -> Option<(FuzzyReply, bool)> {
    let frame = parse_frame(buf)?;
    let (req, is_legacy) = match frame {
        FuzzyFrame::Legacy(legacy) => (legacy_to_request(&legacy), true),
        FuzzyFrame::V2(req) => (req, false),
    };

    let reply = match req.cmd {
        FuzzyCmd::Check => match store.check(&req).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "fuzzy check failed");
                FuzzyReply::miss(req.tag)
            }
        },
        FuzzyCmd::Write => {
            if !store.is_allowed_to_update(source.ip()) {
                FuzzyReply { value: DISALLOWED_REPLY_VALUE, flag: 0, prob: 0.0, tag: req.tag }
            } else {
                store.write(&req);
                FuzzyReply { value: req.value, flag: req.flag, prob: 1.0, tag: req.tag }
            }
        }
        FuzzyCmd::Del => {
            if !store.is_allowed_to_update(source.ip()) {
                FuzzyReply { value: DISALLOWED_REPLY_VALUE, flag: 0, prob: 0.0, tag: req.tag }
            } else {
                store.delete(&req);
                FuzzyReply::miss(req.tag)
            }
        }
    };

    Some((reply, is_legacy))
}

/// Runs the UDP receive loop until the socket errors out. Paired with
/// [`FuzzyStore::run_sync_loop`], spawned separately by `main`.
pub async fn run(store: Arc<FuzzyStore>, listen_addr: SocketAddr) -> std::io::Result<()> {
    let socket = UdpSocket::bind(listen_addr).await?;
    debug!(%listen_addr, "fuzzy datagram listener bound");
    let mut buf = [0u8; 4096];

    loop {
        let (len, source) = socket.recv_from(&mut buf).await?;
        let Some((reply, is_legacy)) = handle_datagram(&store, source, &buf[..len]).await else {
            debug!(%source, len, "dropped malformed fuzzy datagram");
            continue;
        };

        let outgoing = if is_legacy {
            reply.to_legacy_ascii().into_bytes()
        } else {
            reply.to_bytes().to_vec()
        };
        if let Err(err) = socket.send_to(&outgoing, source).await {
            warn!(error = %err, %source, "failed to send fuzzy reply");
        }
    }
}
