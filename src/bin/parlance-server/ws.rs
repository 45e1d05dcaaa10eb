//! WebSocket transports for the streaming pipeline.
//!
//! Two variants share one driver:
//! - `/v1/stream` speaks JSON envelopes both ways.
//! - `/v1/stream/binary` takes one leading text `config` envelope, then raw
//!   little-endian f32 audio frames; an empty binary frame ends the stream.
//!
//! The socket side is deliberately thin: it parses frames, routes typed messages into
//! the session, and pumps session output back out. All pipeline state lives in the
//! session task.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use parlance::streaming::manager::SessionGateway;
use parlance::streaming::protocol::{
    self, AudioFrame, ClientMessage, ControlCommand, ControlRequest, ServerMessage,
};

use crate::AppState;

#[derive(Clone, Copy, PartialEq)]
enum Transport {
    Json,
    Binary,
}

pub async fn stream_json(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| accept(socket, state, Transport::Json))
}

pub async fn stream_binary(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| accept(socket, state, Transport::Binary))
}

async fn accept(mut socket: WebSocket, state: AppState, transport: Transport) {
    let gateway = match state.manager.open() {
        Ok(gateway) => gateway,
        Err(err) => {
            // Typed refusal, then hang up.
            let frame = ServerMessage::from_error(&err).to_frame();
            let _ = socket.send(Message::Text(frame.into())).await;
            let _ = socket.close().await;
            info!(error = %err, "connection refused");
            return;
        }
    };

    drive(socket, &state, gateway, transport).await;
}

async fn drive(socket: WebSocket, state: &AppState, gateway: SessionGateway, transport: Transport) {
    let SessionGateway {
        id,
        mut outbound,
        transport_tx,
    } = gateway;

    let (mut sink, mut stream) = socket.split();

    // Pump session output to the socket until either side goes away.
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let frame = message.to_frame();
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let mut configured = false;

    while let Some(received) = stream.next().await {
        let message = match received {
            Ok(message) => message,
            Err(err) => {
                debug!(session_id = %id, error = %err, "websocket receive error");
                break;
            }
        };

        let client_message = match message {
            Message::Text(text) => match parse_text_frame(&text, transport, configured) {
                Ok(parsed) => parsed,
                Err(err) => {
                    let _ = transport_tx.send(ServerMessage::from_error(&err)).await;
                    if !err.recoverable() {
                        break;
                    }
                    continue;
                }
            },
            Message::Binary(bytes) if transport == Transport::Binary => {
                if bytes.is_empty() {
                    // End-of-stream marker: flush the active utterance. Closing here
                    // would cancel the flush mid-flight, so keep the socket open and let
                    // the client hang up once it has read the final result.
                    let stop = ClientMessage::Control(ControlRequest {
                        command: ControlCommand::Stop,
                        parameters: None,
                    });
                    let _ = state.manager.route(id, stop).await;
                    continue;
                }
                match decode_binary_audio(&bytes, state.settings.sample_rate) {
                    Ok(frame) => ClientMessage::Audio(frame),
                    Err(err) => {
                        let _ = transport_tx.send(ServerMessage::from_error(&err)).await;
                        continue;
                    }
                }
            }
            Message::Binary(_) => {
                let err = parlance::Error::Validation(
                    "binary frames are not accepted on the JSON transport".into(),
                );
                let _ = transport_tx.send(ServerMessage::from_error(&err)).await;
                continue;
            }
            Message::Close(_) => break,
            // The underlying stack answers pings for us.
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if matches!(client_message, ClientMessage::Config(_)) {
            configured = true;
        }

        if let Err(err) = state.manager.route(id, client_message).await {
            warn!(session_id = %id, error = %err, "routing failed");
            break;
        }
    }

    state.manager.close(id);
    writer.abort();
    debug!(session_id = %id, "websocket transport finished");
}

fn parse_text_frame(
    text: &str,
    transport: Transport,
    configured: bool,
) -> parlance::Result<ClientMessage> {
    let message = protocol::parse_client_frame(text)?;

    // The binary transport's only legal text frame is the leading config.
    if transport == Transport::Binary {
        match &message {
            ClientMessage::Config(_) => {}
            _ if !configured => {
                return Err(parlance::Error::Validation(
                    "binary transport expects a config frame first".into(),
                ));
            }
            ClientMessage::Audio(_) => {
                return Err(parlance::Error::Validation(
                    "binary transport expects audio as binary frames".into(),
                ));
            }
            ClientMessage::Control(_) => {}
        }
    }

    Ok(message)
}

fn decode_binary_audio(bytes: &[u8], sample_rate: u32) -> parlance::Result<AudioFrame> {
    if bytes.len() % 4 != 0 {
        return Err(parlance::Error::Validation(format!(
            "binary audio frame length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    let audio_data: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    let frame = AudioFrame {
        audio_data,
        sample_rate,
    };
    frame.validate()?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_audio_frames_decode_little_endian_f32() -> anyhow::Result<()> {
        let mut bytes = Vec::new();
        for value in [0.0f32, 0.5, -0.5] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        let frame = decode_binary_audio(&bytes, 16_000)?;
        assert_eq!(frame.audio_data, vec![0.0, 0.5, -0.5]);
        assert_eq!(frame.sample_rate, 16_000);
        Ok(())
    }

    #[test]
    fn ragged_binary_frames_are_rejected() {
        let err = decode_binary_audio(&[0u8; 7], 16_000).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn binary_transport_rejects_audio_before_config() {
        let frame = r#"{ "type": "audio", "data": { "audio_data": [0.0] } }"#;
        let err = parse_text_frame(frame, Transport::Binary, false).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn binary_transport_accepts_control_after_config() -> anyhow::Result<()> {
        let frame = r#"{ "type": "control", "data": { "command": "stop" } }"#;
        let message = parse_text_frame(frame, Transport::Binary, true)?;
        assert!(matches!(message, ClientMessage::Control(_)));
        Ok(())
    }
}
