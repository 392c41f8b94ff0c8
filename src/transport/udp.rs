use super::{Datagram, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Gossip datagrams are small; anything larger than this is misbehaving.
const MAX_DATAGRAM: usize = 64 * 1024;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: String,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Datagram>>>,
    cancel: CancellationToken,
}

impl UdpTransport {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?.to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let reader_socket = socket.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    received = reader_socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, src)) => {
                                let datagram = Datagram {
                                    from: src.to_string(),
                                    payload: Bytes::copy_from_slice(&buf[..len]),
                                };
                                if tx.send(datagram).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "udp receive error");
                            }
                        }
                    }
                }
            }
        });

        Ok(UdpTransport {
            socket,
            local_addr,
            inbound: Mutex::new(Some(rx)),
            cancel,
        })
    }

    /// Stop the reader task and release the listener.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> &str {
        &self.local_addr
    }

    fn send(&self, dest: &str, payload: Bytes) {
        let addr: SocketAddr = match dest.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(dest, error = %e, "unparseable destination address");
                return;
            }
        };
        // try_send_to never blocks; a full socket buffer just loses the
        // datagram, which the protocol tolerates.
        if let Err(e) = self.socket.try_send_to(&payload, addr) {
            debug!(dest, error = %e, "udp send dropped");
        }
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Datagram>> {
        self.inbound.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_round_trip() {
        let a = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let b = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let mut b_inbound = b.take_inbound().unwrap();

        a.send(b.local_addr(), Bytes::from_static(b"ping"));
        let datagram = b_inbound.recv().await.unwrap();
        assert_eq!(&datagram.payload[..], b"ping");
        assert_eq!(datagram.from, a.local_addr());

        a.close();
        b.close();
    }
}
