use axum::{
    extract::{
        Extension,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};

use complyflow_core::TenantId;

use crate::app::errors;
use crate::app::services::AppServices;
use crate::middleware::extract_token;
use crate::realtime::{GatewaySession, RealtimeGateway, ServerMessage};

/// Authenticate, then upgrade to the realtime WebSocket.
///
/// The tenant is fixed here from the token; `join` frames can only confirm it.
pub async fn connect(
    ws: WebSocketUpgrade,
    Extension(services): Extension<AppServices>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let Some(token) = extract_token(&headers, &uri) else {
        return errors::json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "missing token");
    };

    let gateway = services.gateway.clone();
    let tenant_id = match gateway.authenticate(&token) {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!(error = %e, "realtime authentication failed");
            return errors::json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "invalid token");
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, gateway, tenant_id))
        .into_response()
}

async fn handle_socket(socket: WebSocket, gateway: RealtimeGateway, tenant_id: TenantId) {
    tracing::info!(tenant_id = %tenant_id, "realtime connection opened");

    let (mut sink, mut stream) = socket.split();
    let mut session = GatewaySession::new(tenant_id);

    loop {
        let outbound = tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => session.on_text(&gateway, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    tracing::debug!(tenant_id = %tenant_id, error = %e, "realtime receive error");
                    break;
                }
            },
            frame = session.next_frame() => frame,
        };

        if let Some(message) = outbound {
            if send(&mut sink, &message).await.is_err() {
                tracing::debug!(tenant_id = %tenant_id, "realtime sink closed");
                break;
            }
        }
    }

    // Dropping the session deregisters it from the hub; job state is untouched.
    drop(session);
    tracing::info!(tenant_id = %tenant_id, "realtime connection closed");
}

async fn send<S>(sink: &mut S, message: &ServerMessage) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    sink.send(Message::Text(message.to_json())).await
}
