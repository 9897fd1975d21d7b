use std::{collections::BTreeSet, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserId,
    protocol::{ClientPresenceRequest, ServerPresenceEvent, SubscriptionUpdate},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, RwLock},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::PresenceError, transport::PresenceSubscription, Presence};

const STREAM_PATH: &str = "presence";

type PresenceSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Maps `http(s)://host/base` to `ws(s)://host/base/presence`.
pub fn http_to_ws_url(server_url: &str) -> Result<String, PresenceError> {
    let invalid = || PresenceError::InvalidServerUrl(server_url.to_string());
    let mut url = Url::parse(server_url.trim()).map_err(|_| invalid())?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid()),
    };
    url.set_scheme(scheme).map_err(|_| invalid())?;
    let path = format!("{}/{STREAM_PATH}", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

/// WebSocket live presence stream.
///
/// Subscription deltas go out as `subscribe` frames while a connection is
/// up. Deltas issued while disconnected are coalesced and sent first on the
/// next connection. Inbound presence frames are fed into
/// [`Presence::notify`]. A dropped connection resets the cache and the next
/// connection restarts it.
pub struct WsPresenceChannel {
    ws_url: String,
    outbound: RwLock<Outbound>,
}

#[derive(Default)]
struct Outbound {
    sender: Option<mpsc::UnboundedSender<ClientPresenceRequest>>,
    queued_added: BTreeSet<UserId>,
    queued_removed: BTreeSet<UserId>,
}

impl Outbound {
    fn queue(&mut self, update: SubscriptionUpdate) {
        for id in update.added.unwrap_or_default() {
            self.queued_removed.remove(&id);
            self.queued_added.insert(id);
        }
        for id in update.removed.unwrap_or_default() {
            self.queued_added.remove(&id);
            self.queued_removed.insert(id);
        }
    }

    fn take_queued(&mut self) -> Option<SubscriptionUpdate> {
        let update = SubscriptionUpdate::new(
            std::mem::take(&mut self.queued_added).into_iter().collect(),
            std::mem::take(&mut self.queued_removed).into_iter().collect(),
        );
        (!update.is_empty()).then_some(update)
    }
}

impl WsPresenceChannel {
    pub fn new(ws_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            ws_url: ws_url.into(),
            outbound: RwLock::new(Outbound::default()),
        })
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub async fn is_connected(&self) -> bool {
        self.outbound.read().await.sender.is_some()
    }

    /// Connects, serves and reconnects until `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        presence: Arc<Presence>,
        reconnect_delay: Duration,
        cancel: CancellationToken,
    ) {
        let mut connections = 0u64;
        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect_async(self.ws_url.as_str()) => result,
            };

            match connected {
                Ok((socket, _)) => {
                    connections += 1;
                    info!(url = %self.ws_url, connections, "presence: live stream connected");
                    let cancelled = self
                        .serve(socket, &presence, connections > 1, &cancel)
                        .await;
                    if cancelled {
                        break;
                    }
                    info!(url = %self.ws_url, "presence: live stream disconnected");
                    presence.reset().await;
                }
                Err(err) => {
                    warn!(url = %self.ws_url, error = %err, "presence: failed to connect live stream");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
        }
        self.outbound.write().await.sender = None;
    }

    /// Returns true when the connection ended because `cancel` fired.
    async fn serve(
        &self,
        socket: PresenceSocket,
        presence: &Arc<Presence>,
        reconnected: bool,
        cancel: &CancellationToken,
    ) -> bool {
        let (mut writer, mut reader) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientPresenceRequest>();
        {
            let mut outbound = self.outbound.write().await;
            if let Some(update) = outbound.take_queued() {
                debug!(
                    added = update.added.as_ref().map_or(0, Vec::len),
                    removed = update.removed.as_ref().map_or(0, Vec::len),
                    "presence: replaying queued subscription changes"
                );
                let _ = tx.send(ClientPresenceRequest::Subscribe(update));
            }
            outbound.sender = Some(tx);
        }

        if reconnected {
            presence.restart().await;
        }

        let writer_task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "presence: failed to encode subscription frame");
                        continue;
                    }
                };
                if writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let cancelled = loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break true,
                frame = reader.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerPresenceEvent>(&text) {
                        Ok(event) => presence.notify(event.into_record()).await,
                        Err(err) => warn!(error = %err, "presence: skipping malformed frame"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break false,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "presence: live stream read failed");
                    break false;
                }
            }
        };

        self.outbound.write().await.sender = None;
        writer_task.abort();
        cancelled
    }
}

#[async_trait]
impl PresenceSubscription for WsPresenceChannel {
    async fn update(&self, update: SubscriptionUpdate) -> Result<()> {
        let mut outbound = self.outbound.write().await;
        if let Some(sender) = &outbound.sender {
            if sender
                .send(ClientPresenceRequest::Subscribe(update.clone()))
                .is_ok()
            {
                return Ok(());
            }
            outbound.sender = None;
        }
        debug!("presence: live stream down, queueing subscription change");
        outbound.queue(update);
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod tests;
