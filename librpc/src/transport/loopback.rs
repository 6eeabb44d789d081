/*
 * This file is part of librpc.
 *
 * librpc is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The `loopback` transport: an in-process rendezvous used to exercise
//! the engine without a real socket (spec.md §8's scenarios all run over
//! `loopback://<slot>`). The first `connect` to a slot parks a channel
//! half in the hub; the second `connect` claims it and the two ends are
//! wired together.

use super::{Inbound, Transport, TransportChannel};
use crate::error::{RpcError, RpcResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

struct Datagram {
    bytes: Vec<u8>,
    fds: Vec<RawFd>,
}

pub struct LoopbackChannel {
    tx: mpsc::Sender<Datagram>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
    closed: Arc<Notify>,
}

#[async_trait]
impl TransportChannel for LoopbackChannel {
    async fn send(&self, bytes: &[u8], fds: &[RawFd]) -> RpcResult<()> {
        self.tx
            .send(Datagram {
                bytes: bytes.to_vec(),
                fds: fds.to_vec(),
            })
            .await
            .map_err(|_| RpcError::disconnected("loopback peer dropped"))
    }

    async fn recv(&self) -> RpcResult<Option<Inbound>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            datagram = rx.recv() => Ok(datagram.map(|d| Inbound {
                bytes: d.bytes,
                fds: d.fds,
                credentials: None,
            })),
            _ = self.closed.notified() => Ok(None),
        }
    }

    fn abort(&self) {
        self.closed.notify_waiters();
    }
}

pub struct LoopbackTransport {
    hub: Mutex<HashMap<String, LoopbackChannel>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            hub: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, slot: &str) -> RpcResult<Box<dyn TransportChannel>> {
        let mut hub = self.hub.lock();
        if let Some(waiting) = hub.remove(slot) {
            return Ok(Box::new(waiting));
        }
        let (tx_a_to_b, rx_a_to_b) = mpsc::channel(64);
        let (tx_b_to_a, rx_b_to_a) = mpsc::channel(64);
        let closed = Arc::new(Notify::new());
        let a = LoopbackChannel {
            tx: tx_a_to_b,
            rx: tokio::sync::Mutex::new(rx_b_to_a),
            closed: closed.clone(),
        };
        let b = LoopbackChannel {
            tx: tx_b_to_a,
            rx: tokio::sync::Mutex::new(rx_a_to_b),
            closed,
        };
        hub.insert(slot.to_string(), b);
        Ok(Box::new(a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_connect_wires_up_to_the_first() {
        let t = LoopbackTransport::new();
        let a = t.connect("0").await.unwrap();
        let b = t.connect("0").await.unwrap();

        a.send(b"hello", &[]).await.unwrap();
        let got = b.recv().await.unwrap().unwrap();
        assert_eq!(got.bytes, b"hello");

        b.send(b"world", &[]).await.unwrap();
        let got = a.recv().await.unwrap().unwrap();
        assert_eq!(got.bytes, b"world");
    }

    #[tokio::test]
    async fn abort_unblocks_a_pending_recv() {
        let t = LoopbackTransport::new();
        let a = t.connect("1").await.unwrap();
        let _b = t.connect("1").await.unwrap();
        a.abort();
        assert!(a.recv().await.unwrap().is_none());
    }
}
