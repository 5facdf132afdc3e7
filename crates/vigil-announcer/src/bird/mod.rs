//! Client for the BIRD announce daemon.
//!
//! Communication is over per-group UNIX datagram socket pairs in
//! `sock_dir`: updates are sent to `<group>_m2b`, state requests arrive on
//! `<group>_b2m`. The daemon's request carries no payload; any received
//! datagram means "resend your full state".

pub mod message;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Deserialize;
use tokio::net::UnixDatagram;
use tracing::debug;

use crate::{AnnounceClient, AnnounceError, AnnounceStater, PrefixStatus};
use message::Message;

const DEFAULT_BATCH_SIZE: usize = 4096;

fn default_sock_dir() -> PathBuf {
    PathBuf::from("/var/run")
}

/// BIRD client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BirdConfig {
    /// Maximum number of records per datagram. Must not exceed the batch
    /// size configured in the daemon.
    pub batch_size: usize,
    /// Directory holding the announce sockets.
    pub sock_dir: PathBuf,
}

impl Default for BirdConfig {
    fn default() -> Self {
        BirdConfig {
            batch_size: DEFAULT_BATCH_SIZE,
            sock_dir: default_sock_dir(),
        }
    }
}

struct GroupSocket {
    sock: UnixDatagram,
    write_path: PathBuf,
}

impl GroupSocket {
    fn bind(sock_dir: &Path, group: &str) -> Result<Self, AnnounceError> {
        let listen_path = sock_dir.join(format!("{group}_b2m"));

        // A previous run may have left its socket file behind.
        match std::fs::remove_file(&listen_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let sock = UnixDatagram::bind(&listen_path)?;

        // The daemon runs under another user and must be able to write its
        // state requests into our socket.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = std::fs::metadata(&listen_path)?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(permissions.mode() | 0o022);
            std::fs::set_permissions(&listen_path, permissions)?;
        }

        Ok(GroupSocket {
            sock,
            write_path: sock_dir.join(format!("{group}_m2b")),
        })
    }

    async fn send(&self, buf: &[u8]) -> Result<(), AnnounceError> {
        if buf.is_empty() {
            return Ok(());
        }
        self.sock.send_to(buf, &self.write_path).await?;
        Ok(())
    }
}

/// Announce client speaking the BIRD datagram protocol, one socket pair
/// per announce group.
pub struct BirdClient {
    clients: HashMap<String, GroupSocket>,
    batch_size: usize,
    closed: AtomicBool,
}

impl BirdClient {
    /// Binds the receive socket of every group and prepares the send
    /// addresses. Fails when a socket cannot be created with the required
    /// permissions.
    pub fn new(config: &BirdConfig, groups: &[String]) -> Result<Self, AnnounceError> {
        let mut clients = HashMap::with_capacity(groups.len());
        for group in groups {
            clients.insert(group.clone(), GroupSocket::bind(&config.sock_dir, group)?);
        }

        Ok(BirdClient {
            clients,
            batch_size: config.batch_size.max(1),
            closed: AtomicBool::new(false),
        })
    }

    fn group(&self, group: &str) -> Result<&GroupSocket, AnnounceError> {
        self.clients
            .get(group)
            .ok_or_else(|| AnnounceError::UnknownGroup(group.to_string()))
    }

    async fn send_one(
        &self,
        group: &str,
        prefix: IpNet,
        status: PrefixStatus,
    ) -> Result<(), AnnounceError> {
        let socket = self.group(group)?;
        let mut buf = Vec::with_capacity(message::MESSAGE_SIZE);
        Message::new(prefix, status).encode(&mut buf);
        socket.send(&buf).await
    }
}

#[async_trait]
impl AnnounceClient for BirdClient {
    async fn raise_announce(&self, group: &str, prefix: IpNet) -> Result<(), AnnounceError> {
        self.send_one(group, prefix, PrefixStatus::Ready).await
    }

    async fn remove_announce(&self, group: &str, prefix: IpNet) -> Result<(), AnnounceError> {
        self.send_one(group, prefix, PrefixStatus::Unready).await
    }

    async fn process_batch(
        &self,
        group: &str,
        prefixes: &HashMap<IpNet, PrefixStatus>,
    ) -> Result<(), AnnounceError> {
        let socket = self.group(group)?;

        let mut buf = Vec::with_capacity(message::MESSAGE_SIZE * self.batch_size.min(prefixes.len()));
        let mut in_batch = 0;
        for (prefix, status) in prefixes {
            Message::new(*prefix, *status).encode(&mut buf);
            in_batch += 1;

            if in_batch == self.batch_size {
                socket.send(&buf).await?;
                buf.clear();
                in_batch = 0;
            }
        }
        socket.send(&buf).await?;

        debug!(group, prefixes = prefixes.len(), "sent announce batch");
        Ok(())
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AnnounceStater for BirdClient {
    async fn listen_state_request(&self, group: &str) -> Result<(), AnnounceError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AnnounceError::Shutdown);
        }
        let socket = self.group(group)?;

        // The request payload is meaningless; receiving anything at all is
        // the signal.
        let mut dummy = [0u8; 8];
        socket.sock.recv(&mut dummy).await?;

        if self.closed.load(Ordering::SeqCst) {
            return Err(AnnounceError::Shutdown);
        }
        Ok(())
    }
}
