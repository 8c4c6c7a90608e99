use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::{delete, get, post},
};
use axum_server::tls_rustls::RustlsConfig;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lib_signage::core::SessionGuard;
use lib_signage::protocol::{ErrorCode, InboundMessage, OutboundMessage, decode_inbound};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::signage_logic::config::Settings;
use crate::signage_logic::handlers;
use crate::signage_logic::state::AppState;

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(handlers::health_handler))
        .route(
            "/api/v1/schedules",
            post(handlers::create_schedule).put(handlers::update_schedules),
        )
        .route("/api/v1/schedules/{id}", delete(handlers::delete_schedule))
        .route("/api/v1/cache/schedules", get(handlers::cache_snapshot))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

/// Serves HTTP (or HTTPS when TLS paths are configured) until `shutdown` fires.
pub async fn run(settings: Settings, app_state: AppState, shutdown: CancellationToken) -> Result<()> {
    let app = router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));

    if let Some((cert_path, key_path)) = settings.tls {
        let tls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
            .await
            .with_context(|| format!("failed to load TLS configuration from {}", cert_path.display()))?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            info!("Downstream server shutting down.");
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });

        info!("Downstream server listening on https://{}", addr);
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .context("TLS server failed")?;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!("Downstream server listening on http://{}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("Downstream server shutting down.");
            })
            .await
            .context("HTTP server failed")?;
    }
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_message(sink: &mut WsSink, message: &OutboundMessage) -> bool {
    match message.to_json() {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Dropping unencodable outbound message");
            true
        }
    }
}

/// Waits for `register_monitor` and runs the handshake.
///
/// ## Logic:
/// 1. Frames other than text are ignored until the deadline.
/// 2. A malformed or unknown text frame is answered with `malformed_message`.
/// 3. A rejected handshake is answered with its error code and ends the connection.
async fn await_registration(
    sink: &mut WsSink,
    stream: &mut WsStream,
    sender: mpsc::UnboundedSender<OutboundMessage>,
    state: &AppState,
) -> Option<SessionGuard> {
    let deadline = tokio::time::sleep(state.liveness.register_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Connection did not register in time, closing");
                return None;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match decode_inbound(text.as_str()) {
                    Ok(InboundMessage::RegisterMonitor { token }) => {
                        return match state.registry.register(sender.clone(), token.as_deref()).await {
                            Ok(guard) => Some(guard),
                            Err(e) => {
                                info!(reason = %e, "Monitor registration rejected");
                                send_message(sink, &OutboundMessage::Error(ErrorCode::from(&e))).await;
                                None
                            }
                        };
                    }
                    Err(e) => {
                        debug!(error = %e, "Bad frame before registration");
                        if !send_message(sink, &OutboundMessage::Error(ErrorCode::MalformedMessage)).await {
                            return None;
                        }
                    }
                },
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => {
                    debug!(error = %e, "Socket error before registration");
                    return None;
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (sender, mut outbound) = mpsc::unbounded_channel::<OutboundMessage>();

    // --- Phase 1: Registration ---
    let Some(guard) = await_registration(&mut sink, &mut stream, sender, &state).await else {
        let _ = sink.close().await;
        return;
    };
    let device_id = guard.device().id;
    let session_id = guard.session_id();

    // --- Phase 2: Connected ---
    let mut heartbeat = tokio::time::interval(state.liveness.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Close(_))) | None => {
                    debug!(device_id, "Peer closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!(device_id, error = %e, "Read error, ending session");
                    break;
                }
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    let reply = match decode_inbound(text.as_str()) {
                        Ok(InboundMessage::RegisterMonitor { .. }) => ErrorCode::MonitorAlreadyConnected,
                        Err(e) => {
                            debug!(device_id, error = %e, "Bad frame from registered monitor");
                            ErrorCode::MalformedMessage
                        }
                    };
                    if !send_message(&mut sink, &OutboundMessage::Error(reply)).await {
                        break;
                    }
                }
                Some(Ok(_)) => last_seen = Instant::now(),
            },
            message = outbound.recv() => match message {
                Some(message) => {
                    if !send_message(&mut sink, &message).await {
                        warn!(device_id, event = message.event(), "Write failed, ending session");
                        break;
                    }
                }
                // The registry dropped this session.
                None => break,
            },
            _ = heartbeat.tick() => {
                if last_seen.elapsed() >= state.liveness.idle_timeout {
                    info!(device_id, "Monitor idle too long, closing session");
                    break;
                }
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(guard);
    let _ = sink.close().await;
    info!(device_id, session_id, "Monitor session closed");
}
