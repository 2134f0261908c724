#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Local listener standing in for a storage node.
///
/// Accepted sockets are held open and indexed by the client's address so a
/// test can look up the server side of any pooled connection.
pub struct TestNode {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    streams: Arc<Mutex<HashMap<SocketAddr, TcpStream>>>,
}

impl TestNode {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let streams = Arc::new(Mutex::new(HashMap::new()));

        let accepted_task = Arc::clone(&accepted);
        let streams_task = Arc::clone(&streams);
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                streams_task.lock().await.insert(peer, stream);
                accepted_task.fetch_add(1, Ordering::SeqCst);
            }
        });

        Self {
            addr,
            accepted,
            streams,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Wait until `count` connections have been accepted.
    pub async fn wait_for_accepts(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.accepted() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener did not accept in time");
    }

    /// Client addresses of every accepted connection.
    pub async fn peers(&self) -> Vec<SocketAddr> {
        self.streams.lock().await.keys().copied().collect()
    }

    /// Server side of the connection whose client end is bound to `client`.
    pub async fn take(&self, client: SocketAddr) -> TcpStream {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(stream) = self.streams.lock().await.remove(&client) {
                    return stream;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection was never accepted")
    }
}

/// True once the peer of `server` has closed its end.
pub async fn is_closed(server: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match tokio::time::timeout(Duration::from_secs(1), server.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}
