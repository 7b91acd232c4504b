//! Blocking sources of RIP responses: the live multicast socket, and a
//! file-replay source used by deterministic tests (`-f`).

use std::fs::File;
use std::io::{self, Read};
use std::net::UdpSocket;

use crate::os::Listener;
use crate::rip::{self, RipResponse};

const MAX_DATAGRAM: usize = 4096;

pub struct MulticastListener {
    socket: UdpSocket,
    password: [u8; 16],
}

impl MulticastListener {
    pub fn new(socket: UdpSocket, password: [u8; 16]) -> Self {
        Self { socket, password }
    }
}

impl Listener for MulticastListener {
    fn next_batch(&mut self) -> io::Result<Option<Vec<RipResponse>>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, _from) = self.socket.recv_from(&mut buf)?;
            match rip::parse_packet(&buf[..len], &self.password) {
                Ok(entries) => return Ok(Some(entries)),
                Err(reason) => {
                    tracing::info!(%reason, "rejected incoming packet");
                    continue;
                }
            }
        }
    }
}

/// Replays raw RIP datagrams from a file, one `recv`-sized read per
/// iteration. Reaching end of file is a clean shutdown signal
/// (`next_batch` returns `Ok(None)`), not a fatal error: it is the expected
/// way a deterministic test run ends.
pub struct FileListener {
    file: File,
    password: [u8; 16],
}

impl FileListener {
    pub fn open(path: &std::path::Path, password: [u8; 16]) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            password,
        })
    }
}

impl Listener for FileListener {
    fn next_batch(&mut self) -> io::Result<Option<Vec<RipResponse>>> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let n = self.file.read(&mut buf)?;
            if n == 0 {
                return Ok(None);
            }
            match rip::parse_packet(&buf[..n], &self.password) {
                Ok(entries) => return Ok(Some(entries)),
                Err(reason) => {
                    tracing::info!(%reason, "rejected replayed packet");
                    continue;
                }
            }
        }
    }
}
