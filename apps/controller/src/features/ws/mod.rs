//! WebSocket progress fan-out. Broadcasts are fire-and-forget after the DB
//! commit; a slow client drops frames rather than stalling lifecycle jobs.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/ws", get(ws_progress))
}

async fn ws_progress(ws: WebSocketUpgrade, State(st): State<AppState>) -> Response {
    let rx = st.ws.subscribe();
    ws.on_upgrade(move |socket| async move {
        if let Err(err) = pump(socket, rx).await {
            tracing::debug!(error = %err, "progress websocket closed");
        }
    })
}

async fn pump(
    socket: WebSocket,
    mut rx: tokio::sync::broadcast::Receiver<String>,
) -> anyhow::Result<()> {
    let (mut tx, mut incoming) = socket.split();
    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Ok(body) => tx.send(Message::Text(body)).await?,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "progress subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            frame = incoming.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
    }
    Ok(())
}
