//! Peer channel: TCP server for wearable connections, handshake, then sealed frames.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use wearmaps_core::identity::{decrypt_wire, encrypt_wire, HANDSHAKE_FIXED_SIZE};
use wearmaps_core::wire::{LEN_SIZE, MAX_FRAME_LEN};
use wearmaps_core::{DeviceId, Handshake, Keypair, PeerNode};

use crate::relay::Event;

/// One live connection and the queue feeding its writer. A node that reconnects
/// before its old session dies has two entries, told apart by `conn`.
#[derive(Debug)]
pub struct PeerEntry {
    pub conn: u64,
    pub node: PeerNode,
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Live connections in connection order.
pub type PeerSenders = Arc<Mutex<Vec<PeerEntry>>>;

static NEXT_CONN: AtomicU64 = AtomicU64::new(1);

/// Distinct nodes in connection order, each listed once.
pub fn reachable(entries: &[PeerEntry]) -> Vec<PeerNode> {
    let mut out: Vec<PeerNode> = Vec::new();
    for entry in entries {
        if !out.iter().any(|n| n.id == entry.node.id) {
            out.push(entry.node.clone());
        }
    }
    out
}

/// Queue for the newest live connection to `peer_id`.
pub fn sender_for(entries: &[PeerEntry], peer_id: DeviceId) -> Option<&mpsc::UnboundedSender<Vec<u8>>> {
    entries
        .iter()
        .rev()
        .find(|e| e.node.id == peer_id)
        .map(|e| &e.tx)
}

/// Which end opened the connection. Each direction gets its own nonce space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Accept,
    Connect,
}

const NONCE_HIGH_BIT: u64 = 1 << 63;

impl Role {
    fn write_nonce_base(self) -> u64 {
        match self {
            Role::Accept => NONCE_HIGH_BIT,
            Role::Connect => 0,
        }
    }

    fn read_nonce_base(self) -> u64 {
        match self {
            Role::Accept => 0,
            Role::Connect => NONCE_HIGH_BIT,
        }
    }
}

/// Accept wearable connections forever.
pub async fn run_transport(
    listener: TcpListener,
    keypair: Arc<Keypair>,
    display_name: String,
    senders: PeerSenders,
    events: mpsc::UnboundedSender<Event>,
) -> std::io::Result<()> {
    loop {
        let (mut stream, addr) = listener.accept().await?;
        let keypair = keypair.clone();
        let display_name = display_name.clone();
        let senders = senders.clone();
        let events = events.clone();
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            match handshake(&mut stream, &keypair, &display_name, Role::Accept).await {
                Ok((peer, session_key)) => {
                    info!(peer = %peer.device_id, name = %peer.display_name, %addr, "wearable connected");
                    run_connection(stream, peer.peer_node(), session_key, senders, events).await;
                }
                Err(e) => warn!(%addr, error = %e, "handshake failed"),
            }
        });
    }
}

/// Exchange handshakes. The accepting side reads first.
/// Returns the peer's handshake and the session key for this connection.
pub async fn handshake(
    stream: &mut TcpStream,
    keypair: &Keypair,
    display_name: &str,
    role: Role,
) -> std::io::Result<(Handshake, [u8; 32])> {
    let hello = Handshake::for_keypair(keypair, display_name);
    let ours = hello.to_bytes();
    if role == Role::Connect {
        stream.write_all(&ours).await?;
        stream.flush().await?;
    }
    let mut fixed = [0u8; HANDSHAKE_FIXED_SIZE];
    stream.read_exact(&mut fixed).await?;
    let header = Handshake::parse_fixed(&fixed)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut name = vec![0u8; header.name_len];
    stream.read_exact(&mut name).await?;
    let theirs = Handshake::from_parts(header, &name)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if theirs.device_id == keypair.device_id() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "peer presented our own identity",
        ));
    }
    if role == Role::Accept {
        stream.write_all(&ours).await?;
        stream.flush().await?;
    }
    let key = keypair.session_key(&theirs.public_key, &hello.salt, &theirs.salt);
    Ok((theirs, key))
}

/// Seal and write one frame: 4 bytes LE length + ciphertext.
pub async fn write_sealed(
    writer: &mut OwnedWriteHalf,
    key: &[u8; 32],
    nonce: u64,
    plain: &[u8],
) -> std::io::Result<()> {
    let cipher = encrypt_wire(key, nonce, plain)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = cipher.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&cipher).await?;
    writer.flush().await
}

/// Read and open one frame. Fails on EOF, oversize, or a bad tag.
pub async fn read_sealed(
    reader: &mut OwnedReadHalf,
    key: &[u8; 32],
    nonce: u64,
) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; LEN_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    let mut cipher = vec![0u8; len as usize];
    reader.read_exact(&mut cipher).await?;
    decrypt_wire(key, nonce, &cipher)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn run_connection(
    stream: TcpStream,
    peer: PeerNode,
    session_key: [u8; 32],
    senders: PeerSenders,
    events: mpsc::UnboundedSender<Event>,
) {
    let peer_id = peer.id;
    let conn = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let nodes = {
        let mut s = senders.lock().await;
        s.push(PeerEntry {
            conn,
            node: peer,
            tx,
        });
        reachable(&s)
    };
    let _ = events.send(Event::Connected(nodes));

    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        let mut nonce = Role::Accept.write_nonce_base();
        while let Some(plain) = rx.recv().await {
            if let Err(e) = write_sealed(&mut writer, &session_key, nonce, &plain).await {
                warn!(peer = %peer_id, error = %e, "write failed");
                break;
            }
            nonce = nonce.wrapping_add(1);
        }
    });

    let mut nonce = Role::Accept.read_nonce_base();
    loop {
        match read_sealed(&mut reader, &session_key, nonce).await {
            Ok(plain) => {
                nonce = nonce.wrapping_add(1);
                if events.send(Event::Message(peer_id, plain)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(peer = %peer_id, error = %e, "connection closed");
                break;
            }
        }
    }

    let (remaining, still_live) = {
        let mut s = senders.lock().await;
        s.retain(|e| e.conn != conn);
        (reachable(&s), s.iter().any(|e| e.node.id == peer_id))
    };
    writer_task.abort();
    if still_live {
        debug!(peer = %peer_id, conn, "older connection closed, newer one still live");
        return;
    }
    info!(peer = %peer_id, "wearable disconnected");
    let _ = events.send(Event::Disconnected(peer_id, remaining));
}
