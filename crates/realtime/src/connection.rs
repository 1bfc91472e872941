//! Physical hub connections
//!
//! A `Connection` is a pair of message queues. Dropping `outgoing` asks the
//! transport to close; `incoming` yielding `None` means the remote side is gone.
//! `ConnectionFactory` opens one per call; the channel supervisor calls it
//! again for every reconnect, with whatever token the store holds at that
//! moment.

use std::future::Future;
use std::pin::Pin;

use session_auth::Credential;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::HubMessage;

/// Boxed future returned by `ConnectionFactory::connect`.
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<Connection>> + Send + 'a>>;

/// Opens physical connections for named channels.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility (`Arc<dyn ConnectionFactory>`).
pub trait ConnectionFactory: Send + Sync {
    fn connect<'a>(&'a self, channel: &'a str, token: Option<Credential>) -> ConnectFuture<'a>;
}

/// Client side of an open connection.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::Sender<HubMessage>,
    pub incoming: mpsc::Receiver<HubMessage>,
}

/// Remote side of an in-memory connection.
#[derive(Debug)]
pub struct Peer {
    /// Messages the client sent
    pub from_client: mpsc::Receiver<HubMessage>,
    /// Messages to deliver to the client; drop to simulate a dropped socket
    pub to_client: mpsc::Sender<HubMessage>,
}

impl Connection {
    /// Connected pair of in-memory queues, for embedding a hub in-process.
    pub fn in_memory(buffer: usize) -> (Connection, Peer) {
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (in_tx, in_rx) = mpsc::channel(buffer);
        (
            Connection {
                outgoing: out_tx,
                incoming: in_rx,
            },
            Peer {
                from_client: out_rx,
                to_client: in_tx,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn in_memory_pair_routes_both_directions() {
        let (mut conn, mut peer) = Connection::in_memory(4);

        conn.outgoing
            .send(HubMessage::Invocation {
                invocation_id: Some("1".into()),
                target: "RequestChapterContent".into(),
                arguments: vec![json!("C9")],
            })
            .await
            .unwrap();
        let sent = peer.from_client.recv().await.unwrap();
        assert!(matches!(sent, HubMessage::Invocation { target, .. } if target == "RequestChapterContent"));

        peer.to_client.send(HubMessage::Ping).await.unwrap();
        assert_eq!(conn.incoming.recv().await.unwrap(), HubMessage::Ping);
    }

    #[tokio::test]
    async fn dropping_peer_closes_incoming() {
        let (mut conn, peer) = Connection::in_memory(1);
        drop(peer);
        assert!(conn.incoming.recv().await.is_none());
    }
}
