//! Per-connection protocol handler for a session's websocket.
//!
//! A connection starts unauthenticated: everything except an `a` message is
//! ignored and nothing is sent. Once the token checks out the connection is
//! split into an inbound loop (client → session) and an outbound loop
//! (session → client) that run until the client goes away or the session
//! ends. Only the outbound loop ever sends `e`.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::future::{Fuse, FusedFuture, FutureExt};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use ptyplex_core::wire::{ClientFrame, ServerFrame, Utf8Decoder};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::daemon::auth::AuthToken;
use crate::daemon::lifecycle::{ExitCause, FlowState};
use crate::daemon::session::{Attachment, Session};

/// Default interval between keepalive (`k`) messages.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(10);

/// Input buffered per connection while the child is not reading stdin.
const MAX_PENDING_INPUT: usize = 1024 * 1024;

/// How long a client-requested close waits for `e` to go out.
const EXIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// How the inbound loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundEnd {
    /// Client sent `c`; the session is closing.
    Closed,
    /// Socket closed or errored; the session lives on headless.
    Disconnected,
    /// A re-sent token did not match.
    AuthFailed,
}

/// Serve one websocket for an attached session until either side ends it.
///
/// Dropping `attachment` on return marks the session disconnected.
pub async fn serve(socket: WebSocket, attachment: Attachment, token: AuthToken, keepalive: Duration) {
    let session = attachment.session();
    let id = session.id();
    let (mut sink, mut stream) = socket.split();

    if !authenticate(&mut sink, &mut stream, session, &token).await {
        return;
    }
    info!(session = id, "Client authenticated");

    let (reply_tx, reply_rx) = mpsc::channel(1);
    let outbound = pump_outbound(sink, session, keepalive, reply_rx);
    let inbound = pump_inbound(stream, session, &token, reply_tx);
    tokio::pin!(outbound, inbound);

    tokio::select! {
        end = &mut inbound => {
            debug!(session = id, ?end, "Inbound loop ended");
            if end == InboundEnd::Closed
                && tokio::time::timeout(EXIT_FLUSH_TIMEOUT, &mut outbound).await.is_err()
            {
                debug!(session = id, "Timed out sending exit");
            }
        }
        () = &mut outbound => {
            debug!(session = id, "Outbound loop ended");
        }
    }
}

/// Wait for a valid `a` message. Returns false if the connection should end.
async fn authenticate(
    sink: &mut WsSink,
    stream: &mut WsStream,
    session: &Session,
    token: &AuthToken,
) -> bool {
    loop {
        let message = tokio::select! {
            _ = session.lifecycle().cancelled() => return false,
            message = stream.next() => message,
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(session = session.id(), "Socket error before auth: {}", e);
                return false;
            }
            None => return false,
        };
        if matches!(message, Message::Close(_)) {
            return false;
        }
        let Some(bytes) = payload(&message) else {
            continue;
        };

        match ClientFrame::parse(bytes) {
            Some(ClientFrame::Auth(presented)) if token.verify(presented) => {
                return send(sink, ServerFrame::AuthAck).await;
            }
            Some(ClientFrame::Auth(_)) => {
                warn!(session = session.id(), "Rejected connection with bad token");
                let _ = sink.send(Message::Close(None)).await;
                return false;
            }
            _ => debug!(session = session.id(), "Ignoring message before auth"),
        }
    }
}

async fn pump_inbound(
    mut stream: WsStream,
    session: &Session,
    token: &AuthToken,
    replies: mpsc::Sender<ServerFrame>,
) -> InboundEnd {
    let id = session.id();
    // Input waiting behind a write that the child has not drained yet.
    let mut pending: Vec<u8> = Vec::new();
    let write = Fuse::terminated();
    tokio::pin!(write);

    loop {
        if write.is_terminated() && !pending.is_empty() {
            write.set(session.write(std::mem::take(&mut pending)).fuse());
        }

        // Keep reading the socket while a write is blocked on the child, so
        // `p`, `r`, `s` and `c` are never stuck behind stdin.
        let message = tokio::select! {
            written = &mut write, if !write.is_terminated() => {
                if let Err(e) = written {
                    debug!(session = id, "Dropping input: {}", e);
                }
                continue;
            }
            message = stream.next() => message,
        };
        let Some(message) = message else {
            break;
        };
        let message = match message {
            Ok(Message::Close(_)) => break,
            Ok(message) => message,
            Err(e) => {
                debug!(session = id, "Socket read error: {}", e);
                break;
            }
        };
        let Some(frame) = payload(&message).and_then(ClientFrame::parse) else {
            continue;
        };

        match frame {
            ClientFrame::Auth(presented) => {
                if !token.verify(presented) {
                    warn!(session = id, "Re-sent token did not match, closing");
                    return InboundEnd::AuthFailed;
                }
                if replies.send(ServerFrame::AuthAck).await.is_err() {
                    break;
                }
            }
            ClientFrame::Pause => {
                if session.pause() {
                    debug!(session = id, "Output paused");
                }
            }
            ClientFrame::Resume => {
                if session.resume() {
                    debug!(session = id, "Output resumed");
                }
            }
            ClientFrame::Write(bytes) => {
                if pending.len() + bytes.len() > MAX_PENDING_INPUT {
                    warn!(session = id, "Input backlog full, dropping {} bytes", bytes.len());
                } else {
                    pending.extend_from_slice(bytes);
                }
            }
            ClientFrame::Resize(Some(size)) => {
                if let Err(e) = session.resize(size.into()) {
                    warn!(session = id, "Resize failed: {:#}", e);
                }
            }
            ClientFrame::Resize(None) => {
                debug!(session = id, "Dropping malformed resize");
            }
            ClientFrame::Close => {
                session.close(ExitCause::ClientClosed);
                return InboundEnd::Closed;
            }
            ClientFrame::Unknown(opcode) => {
                debug!(session = id, "Ignoring unknown opcode {:?}", char::from(opcode));
            }
        }
    }
    InboundEnd::Disconnected
}

async fn pump_outbound(
    mut sink: WsSink,
    session: &Session,
    keepalive: Duration,
    mut replies: mpsc::Receiver<ServerFrame>,
) {
    let id = session.id();
    let lifecycle = session.lifecycle();

    let mut output = tokio::select! {
        _ = lifecycle.cancelled() => {
            finish(&mut sink, session, None, &mut Utf8Decoder::new()).await;
            return;
        }
        output = session.inbound().lock() => output,
    };
    let mut flow = session.flow().subscribe();
    let mut decoder = Utf8Decoder::new();
    let mut ticker = interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // A chunk read just before a pause is held here until resume.
    let mut held: Option<Vec<u8>> = None;
    let mut output_open = true;
    let mut replies_open = true;

    loop {
        let running = *flow.borrow_and_update() == FlowState::Running;
        if running {
            if let Some(chunk) = held.take() {
                let text = decoder.push(&chunk);
                if !text.is_empty() && !send(&mut sink, ServerFrame::Data(text)).await {
                    return;
                }
                continue;
            }
        }

        let frame = tokio::select! {
            _ = lifecycle.cancelled() => {
                finish(&mut sink, session, Some(&mut *output), &mut decoder).await;
                return;
            }
            chunk = output.recv(), if running && output_open && held.is_none() => {
                let still_running = *flow.borrow() == FlowState::Running;
                match chunk {
                    Some(chunk) if still_running => {
                        let text = decoder.push(&chunk);
                        if text.is_empty() {
                            continue;
                        }
                        ServerFrame::Data(text)
                    }
                    Some(chunk) => {
                        held = Some(chunk);
                        continue;
                    }
                    None => {
                        debug!(session = id, "PTY output closed");
                        output_open = false;
                        continue;
                    }
                }
            }
            changed = flow.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            reply = replies.recv(), if replies_open => match reply {
                Some(frame) => frame,
                None => {
                    replies_open = false;
                    continue;
                }
            },
            _ = ticker.tick() => ServerFrame::Keepalive,
        };

        if !send(&mut sink, frame).await {
            debug!(session = id, "Socket write failed");
            return;
        }
    }
}

/// Send `e` and close. When the process exited on its own, output that was
/// already read is flushed first.
async fn finish(
    sink: &mut WsSink,
    session: &Session,
    output: Option<&mut mpsc::Receiver<Vec<u8>>>,
    decoder: &mut Utf8Decoder,
) {
    if session.lifecycle().cause() == Some(ExitCause::ProcessExited) {
        let mut text = String::new();
        if let Some(output) = output {
            while let Ok(chunk) = output.try_recv() {
                text.push_str(&decoder.push(&chunk));
            }
        }
        text.push_str(&decoder.finish());
        if !text.is_empty() && !send(sink, ServerFrame::Data(text)).await {
            return;
        }
    }
    if send(sink, ServerFrame::Exit).await {
        let _ = sink.close().await;
    }
}

async fn send(sink: &mut WsSink, frame: ServerFrame) -> bool {
    sink.send(Message::Text(frame.encode().into())).await.is_ok()
}

/// Raw bytes of a data-carrying message. Control frames carry none.
fn payload(message: &Message) -> Option<&[u8]> {
    match message {
        Message::Text(text) => Some(text.as_str().as_bytes()),
        Message::Binary(bytes) => Some(&bytes[..]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_of_text_and_binary() {
        let text = Message::Text("wls".into());
        assert_eq!(payload(&text), Some(&b"wls"[..]));

        let binary = Message::Binary(vec![b'w', 0xff].into());
        assert_eq!(payload(&binary), Some(&[b'w', 0xff][..]));
    }

    #[test]
    fn test_control_frames_carry_no_payload() {
        assert_eq!(payload(&Message::Ping(Vec::new().into())), None);
        assert_eq!(payload(&Message::Close(None)), None);
    }
}
