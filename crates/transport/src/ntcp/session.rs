//! One NTCP link: the 4-phase authenticated handshake, then AES-CBC framed
//! message exchange with Adler-32 integrity and time-sync keepalives.
//!
//! The CBC streams seeded during the handshake chain straight through into
//! the data phase, so every 16-byte block on the wire belongs to one
//! continuous cipher stream per direction.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use veilnet_core::{IdentHash, Message, RouterContext, RouterIdentity, RouterInfo};
use veilnet_crypto::{
    adler32, derive_session_keys, sha256, CbcDecryption, CbcEncryption, AES_BLOCK_SIZE,
};

use crate::supplier::DhSupplier;
use crate::transports::TransportEvent;
use crate::{IncomingMessage, Result, SessionHandle, SessionKind, SessionRole, TransportError};

/// Largest routed message accepted on an NTCP link.
pub const NTCP_MAX_MESSAGE_LEN: usize = 16 * 1024;
/// Tear the session down after this much receive silence.
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Emit a time-sync frame after this much send silence.
const TIME_SYNC_INTERVAL: Duration = Duration::from_secs(60);
/// Establishment must finish within this bound.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum tolerated clock disagreement during the handshake.
const MAX_CLOCK_SKEW_SECS: i64 = 60;

const PHASE1_LEN: usize = 256 + 32;
const PHASE2_LEN: usize = 256 + 48;

/// Outbound queue depth per session.
pub(crate) const SEND_QUEUE_DEPTH: usize = 64;

pub(crate) async fn run_client(
    ctx: Arc<RouterContext>,
    supplier: Arc<DhSupplier>,
    remote: RouterInfo,
    events: mpsc::Sender<TransportEvent>,
) {
    let remote_hash = remote.ident_hash();
    let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, establish_client(&ctx, &supplier, &remote))
        .await
        .map_err(|_| TransportError::Handshake("timeout"))
        .and_then(|r| r);
    match result {
        Ok(established) => run_established(established, events).await,
        Err(err) => {
            warn!(peer = %remote_hash.abbrev(), %err, "NTCP connect failed");
            let _ = events
                .send(TransportEvent::ConnectFailed {
                    remote: remote_hash,
                    kind: SessionKind::Ntcp,
                })
                .await;
        }
    }
}

pub(crate) async fn run_server(
    ctx: Arc<RouterContext>,
    supplier: Arc<DhSupplier>,
    stream: TcpStream,
    events: mpsc::Sender<TransportEvent>,
) {
    let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, establish_server(&ctx, &supplier, stream))
        .await
        .map_err(|_| TransportError::Handshake("timeout"))
        .and_then(|r| r);
    match result {
        Ok(established) => run_established(established, events).await,
        Err(err) => debug!(%err, "inbound NTCP handshake failed"),
    }
}

struct Established {
    stream: TcpStream,
    encryption: CbcEncryption,
    decryption: CbcDecryption,
    remote: IdentHash,
    role: SessionRole,
}

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

fn check_skew(remote_ts: u32) -> Result<()> {
    let skew = now_secs() as i64 - remote_ts as i64;
    if skew.abs() > MAX_CLOCK_SKEW_SECS {
        return Err(TransportError::ClockSkew(skew));
    }
    Ok(())
}

fn align16(len: usize) -> usize {
    (len + 15) & !15
}

/// The tuple both handshake signatures cover.
fn signed_tuple(x: &[u8], y: &[u8], bob_hash: &IdentHash, ts_a: u32, ts_b: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256 + 256 + 32 + 8);
    buf.extend_from_slice(x);
    buf.extend_from_slice(y);
    buf.extend_from_slice(bob_hash.as_bytes());
    buf.extend_from_slice(&ts_a.to_be_bytes());
    buf.extend_from_slice(&ts_b.to_be_bytes());
    buf
}

async fn establish_client(
    ctx: &RouterContext,
    supplier: &DhSupplier,
    remote: &RouterInfo,
) -> Result<Established> {
    let addr = remote
        .ntcp_address()
        .and_then(|a| a.socket_addr())
        .ok_or(TransportError::NoAddress("NTCP"))?;
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    let dh = supplier.acquire().await;
    let x = *dh.public();
    let bob_hash = remote.ident_hash();

    // phase 1: X || SHA-256(X) ^ Bob's hash
    let mut phase1 = [0u8; PHASE1_LEN];
    phase1[..256].copy_from_slice(&x);
    let hx = sha256(&x);
    for i in 0..32 {
        phase1[256 + i] = hx[i] ^ bob_hash.as_bytes()[i];
    }
    stream.write_all(&phase1).await?;

    // phase 2: Y || E(SHA-256(X||Y) || tsB || padding)
    let mut phase2 = [0u8; PHASE2_LEN];
    stream.read_exact(&mut phase2).await?;
    let y: [u8; 256] = phase2[..256].try_into().expect("fixed split");

    let shared = dh.agree(&y)?;
    let (key, second) = derive_session_keys(&shared)?;
    let iv: [u8; AES_BLOCK_SIZE] = second[..16].try_into().expect("fixed split");
    let mut encryption = CbcEncryption::new(&key, &iv);
    let mut decryption = CbcDecryption::new(&key, &iv);

    let mut plain2 = [0u8; 48];
    plain2.copy_from_slice(&phase2[256..]);
    decryption.decrypt(&mut plain2);

    let mut xy = [0u8; 512];
    xy[..256].copy_from_slice(&x);
    xy[256..].copy_from_slice(&y);
    if plain2[..32] != sha256(&xy) {
        return Err(TransportError::Handshake("phase 2 digest mismatch"));
    }
    let ts_b = u32::from_be_bytes(plain2[32..36].try_into().expect("fixed split"));
    check_skew(ts_b)?;

    // phase 3: E(size || identity || tsA || padding || signature)
    let ts_a = now_secs();
    let ident_bytes = ctx.keys().identity().to_bytes();
    let signature = ctx
        .keys()
        .sign(&signed_tuple(&x, &y, &bob_hash, ts_a, ts_b))
        .map_err(TransportError::Core)?;

    let unpadded = 2 + ident_bytes.len() + 4 + signature.len();
    let total = align16(unpadded);
    let mut phase3 = Vec::with_capacity(total);
    phase3.extend_from_slice(&(ident_bytes.len() as u16).to_be_bytes());
    phase3.extend_from_slice(ident_bytes);
    phase3.extend_from_slice(&ts_a.to_be_bytes());
    let mut padding = vec![0u8; total - unpadded];
    rand::thread_rng().fill_bytes(&mut padding);
    phase3.extend_from_slice(&padding);
    phase3.extend_from_slice(&signature);
    encryption.encrypt(&mut phase3);
    stream.write_all(&phase3).await?;

    // phase 4: E(signature || padding), Bob's signature over the same tuple
    let sig_len = remote.identity().signing_key().sig_type().signature_len();
    let mut phase4 = vec![0u8; align16(sig_len)];
    stream.read_exact(&mut phase4).await?;
    decryption.decrypt(&mut phase4);
    remote
        .identity()
        .verify(
            &signed_tuple(&x, &y, &bob_hash, ts_a, ts_b),
            &phase4[..sig_len],
        )
        .map_err(|_| TransportError::Handshake("phase 4 signature"))?;

    debug!(peer = %bob_hash.abbrev(), "NTCP session established (client)");
    Ok(Established {
        stream,
        encryption,
        decryption,
        remote: bob_hash,
        role: SessionRole::Client,
    })
}

async fn establish_server(
    ctx: &RouterContext,
    supplier: &DhSupplier,
    mut stream: TcpStream,
) -> Result<Established> {
    stream.set_nodelay(true)?;
    let our_hash = ctx.ident_hash();

    // phase 1
    let mut phase1 = [0u8; PHASE1_LEN];
    stream.read_exact(&mut phase1).await?;
    let x: [u8; 256] = phase1[..256].try_into().expect("fixed split");
    let hx = sha256(&x);
    for i in 0..32 {
        if phase1[256 + i] != hx[i] ^ our_hash.as_bytes()[i] {
            return Err(TransportError::Handshake("phase 1 not addressed to us"));
        }
    }

    // phase 2
    let dh = supplier.acquire().await;
    let y = *dh.public();
    let shared = dh.agree(&x)?;
    let (key, second) = derive_session_keys(&shared)?;
    let iv: [u8; AES_BLOCK_SIZE] = second[..16].try_into().expect("fixed split");
    let mut encryption = CbcEncryption::new(&key, &iv);
    let mut decryption = CbcDecryption::new(&key, &iv);

    let ts_b = now_secs();
    let mut xy = [0u8; 512];
    xy[..256].copy_from_slice(&x);
    xy[256..].copy_from_slice(&y);
    let mut plain2 = [0u8; 48];
    plain2[..32].copy_from_slice(&sha256(&xy));
    plain2[32..36].copy_from_slice(&ts_b.to_be_bytes());
    rand::thread_rng().fill_bytes(&mut plain2[36..]);
    encryption.encrypt(&mut plain2);

    let mut phase2 = [0u8; PHASE2_LEN];
    phase2[..256].copy_from_slice(&y);
    phase2[256..].copy_from_slice(&plain2);
    stream.write_all(&phase2).await?;

    // phase 3: read enough to parse the identity, then the rest
    let mut block = [0u8; AES_BLOCK_SIZE];
    stream.read_exact(&mut block).await?;
    decryption.decrypt(&mut block);
    let ident_len = u16::from_be_bytes([block[0], block[1]]) as usize;
    if ident_len < 387 || ident_len > 2048 {
        return Err(TransportError::Handshake("phase 3 identity length"));
    }
    let mut plain3 = block.to_vec();
    // we cannot know the final length until the identity (and with it the
    // signature length) is in hand
    while plain3.len() < 2 + ident_len + 4 {
        let mut block = [0u8; AES_BLOCK_SIZE];
        stream.read_exact(&mut block).await?;
        decryption.decrypt(&mut block);
        plain3.extend_from_slice(&block);
    }
    let (remote_ident, consumed) = RouterIdentity::from_buffer(&plain3[2..2 + ident_len])
        .map_err(TransportError::Core)?;
    if consumed != ident_len {
        return Err(TransportError::Handshake("phase 3 identity length"));
    }
    let sig_len = remote_ident.signing_key().sig_type().signature_len();
    let total = align16(2 + ident_len + 4 + sig_len);
    while plain3.len() < total {
        let mut block = [0u8; AES_BLOCK_SIZE];
        stream.read_exact(&mut block).await?;
        decryption.decrypt(&mut block);
        plain3.extend_from_slice(&block);
    }

    let ts_a = u32::from_be_bytes(
        plain3[2 + ident_len..2 + ident_len + 4]
            .try_into()
            .expect("fixed split"),
    );
    check_skew(ts_a)?;
    remote_ident
        .verify(
            &signed_tuple(&x, &y, &our_hash, ts_a, ts_b),
            &plain3[total - sig_len..total],
        )
        .map_err(|_| TransportError::Handshake("phase 3 signature"))?;

    // phase 4: our signature over the same tuple
    let signature = ctx
        .keys()
        .sign(&signed_tuple(&x, &y, &our_hash, ts_a, ts_b))
        .map_err(TransportError::Core)?;
    let total4 = align16(signature.len());
    let mut phase4 = Vec::with_capacity(total4);
    phase4.extend_from_slice(&signature);
    let mut padding = vec![0u8; total4 - signature.len()];
    rand::thread_rng().fill_bytes(&mut padding);
    phase4.extend_from_slice(&padding);
    encryption.encrypt(&mut phase4);
    stream.write_all(&phase4).await?;

    let remote = remote_ident.hash();
    debug!(peer = %remote.abbrev(), "NTCP session established (server)");
    Ok(Established {
        stream,
        encryption,
        decryption,
        remote,
        role: SessionRole::Server,
    })
}

/// Post-handshake: reader and writer halves run concurrently; either side
/// exiting tears the session down.
async fn run_established(established: Established, events: mpsc::Sender<TransportEvent>) {
    let Established {
        stream,
        encryption,
        decryption,
        remote,
        role,
    } = established;
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_DEPTH);

    let handle = SessionHandle::new(remote, SessionKind::Ntcp, outbound_tx);
    if events
        .send(TransportEvent::Established {
            handle,
            role,
        })
        .await
        .is_err()
    {
        return;
    }

    let reader = read_loop(read_half, decryption, remote, events.clone());
    let writer = write_loop(write_half, encryption, outbound_rx);
    tokio::select! {
        result = reader => {
            if let Err(err) = result {
                debug!(peer = %remote.abbrev(), %err, "NTCP read loop ended");
            }
        }
        result = writer => {
            if let Err(err) = result {
                debug!(peer = %remote.abbrev(), %err, "NTCP write loop ended");
            }
        }
    }
    let _ = events
        .send(TransportEvent::Closed {
            remote,
            kind: SessionKind::Ntcp,
        })
        .await;
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    mut decryption: CbcDecryption,
    remote: IdentHash,
    events: mpsc::Sender<TransportEvent>,
) -> Result<()> {
    let mut decrypted = Vec::new();
    let mut pending = Vec::new();
    let mut wire = [0u8; 4096];
    loop {
        let n = tokio::time::timeout(IDLE_TIMEOUT, read_half.read(&mut wire))
            .await
            .map_err(|_| TransportError::BadFrame("idle timeout"))??;
        if n == 0 {
            return Err(TransportError::SessionClosed);
        }
        pending.extend_from_slice(&wire[..n]);

        let whole_blocks = pending.len() - pending.len() % AES_BLOCK_SIZE;
        let mut chunk = pending[..whole_blocks].to_vec();
        pending.drain(..whole_blocks);
        decryption.decrypt(&mut chunk);
        decrypted.extend_from_slice(&chunk);

        while let Some(frame_len) = complete_frame_len(&decrypted)? {
            let frame: Vec<u8> = decrypted.drain(..frame_len).collect();
            if let Some(msg) = parse_frame(&frame)? {
                trace!(peer = %remote.abbrev(), msg_type = ?msg.msg_type, "NTCP message received");
                if events
                    .send(TransportEvent::Inbound(IncomingMessage {
                        from: remote,
                        message: msg,
                    }))
                    .await
                    .is_err()
                {
                    return Ok(());
                }
            }
        }
    }
}

/// Frame length once the 2-byte size is available, or None to wait for more.
fn complete_frame_len(decrypted: &[u8]) -> Result<Option<usize>> {
    if decrypted.len() < AES_BLOCK_SIZE {
        return Ok(None);
    }
    let size = u16::from_be_bytes([decrypted[0], decrypted[1]]) as usize;
    let frame_len = if size == 0 {
        // time sync: size, 4-byte timestamp, padding, checksum
        AES_BLOCK_SIZE
    } else {
        if size > NTCP_MAX_MESSAGE_LEN {
            return Err(TransportError::BadFrame("oversized frame"));
        }
        align16(2 + size + 4)
    };
    if decrypted.len() < frame_len {
        return Ok(None);
    }
    Ok(Some(frame_len))
}

/// Verify the trailing Adler-32 and parse the framed message. Time-sync
/// frames update nothing and yield None.
fn parse_frame(frame: &[u8]) -> Result<Option<Message>> {
    let body_len = frame.len() - 4;
    let expected = u32::from_be_bytes(frame[body_len..].try_into().expect("fixed split"));
    if adler32(&frame[..body_len]) != expected {
        return Err(TransportError::BadFrame("adler mismatch"));
    }
    let size = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    if size == 0 {
        let ts = u32::from_be_bytes(frame[2..6].try_into().expect("fixed split"));
        check_skew(ts)?;
        return Ok(None);
    }
    let msg = Message::from_bytes(&frame[2..2 + size]).map_err(TransportError::Core)?;
    msg.check_expiration().map_err(TransportError::Core)?;
    Ok(Some(msg))
}

fn encode_frame(msg: &Message) -> Vec<u8> {
    let data = msg.to_bytes();
    let total = align16(2 + data.len() + 4);
    let mut frame = Vec::with_capacity(total);
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(&data);
    let mut padding = vec![0u8; total - 4 - frame.len()];
    rand::thread_rng().fill_bytes(&mut padding);
    frame.extend_from_slice(&padding);
    let checksum = adler32(&frame);
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame
}

fn encode_time_sync() -> Vec<u8> {
    let mut frame = Vec::with_capacity(AES_BLOCK_SIZE);
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&now_secs().to_be_bytes());
    frame.extend_from_slice(&[0u8; 6]);
    let checksum = adler32(&frame);
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut encryption: CbcEncryption,
    mut outbound: mpsc::Receiver<Message>,
) -> Result<()> {
    loop {
        let msg = match tokio::time::timeout(TIME_SYNC_INTERVAL, outbound.recv()).await {
            Ok(Some(msg)) => Some(msg),
            Ok(None) => return Ok(()),
            Err(_) => None,
        };
        let mut frame = match &msg {
            Some(msg) => {
                if msg.wire_len() > NTCP_MAX_MESSAGE_LEN {
                    warn!(len = msg.wire_len(), "dropping oversized NTCP message");
                    continue;
                }
                encode_frame(msg)
            }
            None => encode_time_sync(),
        };
        encryption.encrypt(&mut frame);
        write_half.write_all(&frame).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilnet_core::MessageType;

    #[test]
    fn frame_roundtrip() {
        let msg = Message::new(MessageType::Data, vec![0xAB; 100]);
        let frame = encode_frame(&msg);
        assert_eq!(frame.len() % 16, 0);
        assert_eq!(complete_frame_len(&frame).unwrap(), Some(frame.len()));
        let parsed = parse_frame(&frame).unwrap().unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn time_sync_frame_parses_to_none() {
        let frame = encode_time_sync();
        assert_eq!(frame.len(), 16);
        assert_eq!(complete_frame_len(&frame).unwrap(), Some(16));
        assert!(parse_frame(&frame).unwrap().is_none());
    }

    #[test]
    fn adler_mismatch_rejected() {
        let msg = Message::new(MessageType::Data, vec![1, 2, 3]);
        let mut frame = encode_frame(&msg);
        frame[4] ^= 0x01;
        assert!(parse_frame(&frame).is_err());
    }

    #[test]
    fn short_prefix_waits_for_more() {
        let msg = Message::new(MessageType::Data, vec![0u8; 50]);
        let frame = encode_frame(&msg);
        assert_eq!(complete_frame_len(&frame[..16]).unwrap(), None);
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut header = vec![0u8; 16];
        header[0] = 0xFF;
        header[1] = 0xFF;
        assert!(complete_frame_len(&header).is_err());
    }
}
