//! WebSocket gateway.
//!
//! Stateless fan-in/fan-out between client sockets and the store's pub/sub
//! channels. Inbound frames are stamped with a connection id and republished
//! on the room's incoming channel; the relay task forwards room events back,
//! filtered by `target_client_id`. Any number of gateway processes can run
//! side by side.

use crate::config::{CartelaConfig, GameConfig};
use crate::errors::{EngineError, EngineResult};
use crate::manager::active_games_overview;
use crate::protocol::{
    events_channel, incoming_channel, ClientMessage, InboundEnvelope, OutboundEnvelope,
    ServerEvent,
};
use crate::store::StateStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct GatewayApp {
    store: Arc<dyn StateStore>,
    config: CartelaConfig,
}

/// Whether an outbound envelope belongs on this client's socket.
pub fn should_deliver(envelope: &OutboundEnvelope, client_id: &str) -> bool {
    match &envelope.target_client_id {
        None => true,
        Some(target) => target == client_id,
    }
}

/// What a `/ws/game/{stake}` path segment resolves to.
#[derive(Debug, PartialEq, Eq)]
enum RoomRoute {
    /// The cross-stake lobby (`all`), served the room overview.
    Lobby,
    /// One configured stake room.
    Stake,
}

fn room_route(config: &GameConfig, stake: &str) -> Option<RoomRoute> {
    if stake == "all" {
        return Some(RoomRoute::Lobby);
    }
    stake
        .parse::<u32>()
        .ok()
        .filter(|s| config.stakes.contains(s))
        .map(|_| RoomRoute::Stake)
}

pub fn router(store: Arc<dyn StateStore>, config: CartelaConfig) -> Router {
    let app = Arc::new(GatewayApp { store, config });
    Router::new()
        .route("/ws/game/:stake", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app)
}

/// Bind and serve until the task is cancelled.
pub async fn run_gateway(store: Arc<dyn StateStore>, config: CartelaConfig) -> EngineResult<()> {
    let addr = format!(
        "{}:{}",
        config.gateway.listen_address, config.gateway.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "gateway listening");
    axum::serve(listener, router(store, config))
        .await
        .map_err(|e| EngineError::Gateway(e.to_string()))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ws_handler(
    Path(stake): Path<String>,
    State(app): State<Arc<GatewayApp>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match room_route(&app.config.game, &stake) {
        Some(RoomRoute::Lobby) => ws
            .on_upgrade(move |socket| handle_lobby_socket(app, socket))
            .into_response(),
        Some(RoomRoute::Stake) => ws
            .on_upgrade(move |socket| handle_socket(app, stake, socket))
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Lobby sockets get the cross-stake overview on connect and again for every
/// frame they send; they never join a room.
async fn handle_lobby_socket(app: Arc<GatewayApp>, socket: WebSocket) {
    let client_id = Uuid::new_v4().to_string();
    debug!(%client_id, "lobby socket connected");
    let (mut ws_tx, mut ws_rx) = socket.split();

    if let Err(e) = send_overview(&app, &mut ws_tx).await {
        warn!(%client_id, error = %e, "lobby overview failed");
        return;
    }
    while let Some(Ok(frame)) = ws_rx.next().await {
        match frame {
            Message::Text(_) => {
                if send_overview(&app, &mut ws_tx).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    debug!(%client_id, "lobby socket closed");
}

async fn send_overview(
    app: &GatewayApp,
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
) -> EngineResult<()> {
    let data = active_games_overview(Arc::clone(&app.store), &app.config.game).await?;
    let text = serde_json::to_string(&ServerEvent::ActiveGameData { data })?;
    ws_tx
        .send(Message::Text(text))
        .await
        .map_err(|e| EngineError::Gateway(e.to_string()))
}

async fn handle_socket(app: Arc<GatewayApp>, stake: String, socket: WebSocket) {
    let client_id = Uuid::new_v4().to_string();
    debug!(%client_id, %stake, "socket connected");

    let subscription = match app.store.subscribe(&events_channel(&stake)).await {
        Ok(sub) => sub,
        Err(e) => {
            warn!(%client_id, error = %e, "subscribe failed, dropping socket");
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Relay: room events -> socket, honoring per-client targeting. Clients
    // receive the bare event, never the envelope.
    let relay_client_id = client_id.clone();
    let relay = tokio::spawn(async move {
        let mut subscription = subscription;
        while let Some(message) = subscription.next_message().await {
            let envelope: OutboundEnvelope = match serde_json::from_str(&message.payload) {
                Ok(env) => env,
                Err(e) => {
                    warn!(error = %e, "malformed event payload");
                    continue;
                }
            };
            if !should_deliver(&envelope, &relay_client_id) {
                continue;
            }
            let text = match serde_json::to_string(&envelope.event) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // A fresh socket gets the room snapshot and nudges an idle room to
    // schedule once players are waiting.
    for bootstrap in [ClientMessage::GetStakeStat, ClientMessage::RequestGameStart] {
        if let Err(e) = forward(&app, &stake, &client_id, bootstrap).await {
            warn!(%client_id, error = %e, "bootstrap frame failed");
        }
    }

    let mut last_user_id: Option<i64> = None;
    while let Some(Ok(frame)) = ws_rx.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let message: ClientMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                debug!(%client_id, error = %e, "unparseable client frame");
                continue;
            }
        };
        match &message {
            ClientMessage::SelectNumber { player_id, .. } => last_user_id = Some(*player_id),
            ClientMessage::JoinedBingo { user_id } => last_user_id = Some(*user_id),
            _ => {}
        }
        if let Err(e) = forward(&app, &stake, &client_id, message).await {
            warn!(%client_id, error = %e, "forward failed");
            break;
        }
    }

    // Release the user's pending selection; a no-op mid-game since the game
    // snapshot is already fixed.
    if let Some(user_id) = last_user_id {
        let _ = forward(
            &app,
            &stake,
            &client_id,
            ClientMessage::RemoveNumber { user_id },
        )
        .await;
    }
    relay.abort();
    debug!(%client_id, "socket closed");
}

async fn forward(
    app: &GatewayApp,
    stake: &str,
    client_id: &str,
    payload: ClientMessage,
) -> EngineResult<()> {
    let envelope = InboundEnvelope {
        client_id: client_id.to_string(),
        stake: stake.to_string(),
        payload,
    };
    let text = serde_json::to_string(&envelope)?;
    app.store.publish(&incoming_channel(stake), &text).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_route_accepts_lobby_and_configured_stakes() {
        let game = GameConfig::default();
        assert_eq!(room_route(&game, "all"), Some(RoomRoute::Lobby));
        assert_eq!(room_route(&game, "10"), Some(RoomRoute::Stake));
        assert_eq!(room_route(&game, "11"), None);
        assert_eq!(room_route(&game, "lobby"), None);
    }

    #[test]
    fn test_delivery_filter() {
        let broadcast = OutboundEnvelope {
            event: ServerEvent::TimerMessage {
                remaining_seconds: 5,
            },
            target_client_id: None,
        };
        assert!(should_deliver(&broadcast, "a"));
        assert!(should_deliver(&broadcast, "b"));

        let targeted = OutboundEnvelope {
            event: ServerEvent::Error {
                message: "x".to_string(),
            },
            target_client_id: Some("a".to_string()),
        };
        assert!(should_deliver(&targeted, "a"));
        assert!(!should_deliver(&targeted, "b"));
    }
}
