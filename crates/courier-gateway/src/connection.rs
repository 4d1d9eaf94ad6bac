use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, trace, warn};

use courier_types::events::{GatewayCommand, ServerEvent};

use crate::auth::Identity;
use crate::error::GatewayError;
use crate::gateway::Gateway;

/// Drive one WebSocket for an already-authenticated user.
///
/// The credential was checked at the HTTP upgrade, so the socket goes
/// straight to admission and the event loop.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, identity: Identity) {
    let heartbeat_interval = gateway.config().heartbeat_interval;
    let max_missed = gateway.config().max_missed_heartbeats;

    let mut session = gateway.admit(identity).await;
    let Some(mut events) = session.take_events() else {
        return;
    };
    let (mut sender, mut receiver) = socket.split();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();

    // Outbound: everything published to this connection, plus heartbeat pings.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("could not encode outbound event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= max_missed {
                            warn!("heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Inbound: commands are handled one at a time, in arrival order.
    let receive = async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let ack = match serde_json::from_str::<GatewayCommand>(text.as_str()) {
                        Ok(command) => {
                            trace!("{} issued {}", session.user_id(), command.name());
                            session.handle(command).await
                        }
                        Err(e) => {
                            warn!(
                                "{} ({}) bad command: {} -- raw: {}",
                                session.username(),
                                session.user_id(),
                                e,
                                text.chars().take(200).collect::<String>()
                            );
                            ServerEvent::Ack {
                                op: "unknown".into(),
                                client_temp_id: None,
                                outcome: GatewayError::Invalid(format!("malformed command: {}", e)).to_outcome(),
                            }
                        }
                    };
                    session.reply(ack);
                }
                Message::Pong(_) => {
                    pong_received.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = &mut send_task => {}
        _ = receive => {}
    }
    send_task.abort();

    info!("{} ({}) left the gateway", session.username(), session.user_id());
    session.close();
}
