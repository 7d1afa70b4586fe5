//! Websocket transport binding.
//!
//! Bridges a `tokio-tungstenite` stream onto the channel-based
//! [`Transport`] the server core speaks. One pump task per socket: inbound
//! websocket messages become [`ConnEvent`]s, outbound [`Outgoing`] commands
//! become websocket messages.

use crate::connection::{self, Outgoing, Transport};
use crate::server::{ConnectRequest, Server};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::WebSocketStream;

/// Accept websocket upgrades on `listener` and admit each connection into
/// `server`, forever. The request path picks the document (see
/// [`crate::server::first_path_segment`]).
pub async fn serve(listener: TcpListener, server: Server) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        log::debug!("tcp connection from {peer}");
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = accept_connection(stream, server).await {
                log::debug!("websocket handshake with {peer} failed: {e}");
            }
        });
    }
}

async fn accept_connection(
    stream: TcpStream,
    server: Server,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let request_path = Arc::new(Mutex::new(String::from("/")));
    let capture = request_path.clone();
    let ws = tokio_tungstenite::accept_hdr_async(
        stream,
        move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            if let Ok(mut path) = capture.lock() {
                *path = req.uri().path().to_string();
            }
            Ok(resp)
        },
    )
    .await?;

    let path = match request_path.lock() {
        Ok(path) => path.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    let (conn, transport) = connection::pair();
    transport.mark_open();
    tokio::spawn(pump(ws, transport));
    server.admit(conn, ConnectRequest::new(path), None);
    Ok(())
}

/// Shovel messages between the socket and the channel transport until
/// either side goes away.
async fn pump(ws: WebSocketStream<TcpStream>, transport: Transport) {
    let (mut sink, mut stream) = ws.split();
    let Transport {
        events,
        mut outgoing,
        lifecycle,
    } = transport;
    let deliver = |event: connection::ConnEvent| {
        let _ = events.send(event);
    };

    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Binary(data))) => {
                    deliver(connection::ConnEvent::Frame(data.to_vec()));
                }
                Some(Ok(Message::Text(_))) => deliver(connection::ConnEvent::NonBinary),
                Some(Ok(Message::Pong(_))) => deliver(connection::ConnEvent::Pong),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    lifecycle.advance(connection::ConnState::Closed);
                    deliver(connection::ConnEvent::Closed);
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    log::debug!("websocket read error: {e}");
                    lifecycle.advance(connection::ConnState::Closed);
                    deliver(connection::ConnEvent::Closed);
                    break;
                }
            },
            command = outgoing.recv() => match command {
                Some(Outgoing::Frame(bytes)) => {
                    if sink.send(Message::Binary(Bytes::from(bytes))).await.is_err() {
                        lifecycle.advance(connection::ConnState::Closed);
                        deliver(connection::ConnEvent::Closed);
                        break;
                    }
                }
                Some(Outgoing::Ping) => {
                    let _ = sink.send(Message::Ping(Bytes::new())).await;
                }
                Some(Outgoing::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    // Keep reading until the peer acknowledges the close.
                }
                Some(Outgoing::Terminate) | None => {
                    lifecycle.advance(connection::ConnState::Closed);
                    deliver(connection::ConnEvent::Closed);
                    break;
                }
            },
        }
    }
}
