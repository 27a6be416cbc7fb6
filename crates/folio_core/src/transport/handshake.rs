//! Credential handshake that precedes binary traffic on every open.
//!
//! ```text
//! C -> S: <credential>                                  (first text frame)
//! S -> C: "authenticated" | "access-denied:<reason>"    (exactly one)
//! ```
//!
//! Other text frames received while waiting are ignored.

use std::time::Duration;

use super::{Frame, TransportChannel, TransportEvent};

pub const AUTHENTICATED: &str = "authenticated";
pub const ACCESS_DENIED_PREFIX: &str = "access-denied:";

/// Meaning of a text frame received while waiting for the handshake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    Authenticated,
    Denied(String),
    Ignored,
}

impl HandshakeReply {
    pub fn parse(text: &str) -> Self {
        if text == AUTHENTICATED {
            HandshakeReply::Authenticated
        } else if let Some(reason) = text.strip_prefix(ACCESS_DENIED_PREFIX) {
            HandshakeReply::Denied(reason.to_string())
        } else {
            HandshakeReply::Ignored
        }
    }
}

/// Result of one handshake attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Authenticated,
    /// Permanent rejection. Callers must not retry.
    Denied(String),
    /// The connection closed or failed before a reply.
    Failed(String),
    /// No reply within the timeout.
    TimedOut,
}

/// Send `credential` and wait for the server's verdict.
pub async fn authenticate(
    channel: &mut TransportChannel,
    credential: &str,
    timeout: Duration,
) -> HandshakeOutcome {
    if !channel.send(Frame::Text(credential.to_string())) {
        return HandshakeOutcome::Failed("Connection closed before handshake".to_string());
    }

    let wait = async {
        loop {
            match channel.incoming.recv().await {
                Some(TransportEvent::Frame(Frame::Text(text))) => match HandshakeReply::parse(&text) {
                    HandshakeReply::Authenticated => return HandshakeOutcome::Authenticated,
                    HandshakeReply::Denied(reason) => return HandshakeOutcome::Denied(reason),
                    HandshakeReply::Ignored => {
                        log::debug!("[Handshake] Ignoring text frame: {}", text);
                    }
                },
                Some(TransportEvent::Frame(Frame::Binary(_))) => {
                    log::debug!("[Handshake] Dropping binary frame received before authentication");
                }
                Some(TransportEvent::Closed(reason)) => {
                    return HandshakeOutcome::Failed(
                        reason.unwrap_or_else(|| "Connection closed".to_string()),
                    );
                }
                Some(TransportEvent::Error(e)) => return HandshakeOutcome::Failed(e),
                None => return HandshakeOutcome::Failed("Connection closed".to_string()),
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(outcome) => outcome,
        Err(_) => HandshakeOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn pair() -> (
        TransportChannel,
        mpsc::UnboundedReceiver<Frame>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            TransportChannel {
                outgoing: out_tx,
                incoming: in_rx,
            },
            out_rx,
            in_tx,
        )
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(HandshakeReply::parse("authenticated"), HandshakeReply::Authenticated);
        assert_eq!(
            HandshakeReply::parse("access-denied:invalid-token"),
            HandshakeReply::Denied("invalid-token".to_string())
        );
        assert_eq!(HandshakeReply::parse("pong"), HandshakeReply::Ignored);
        assert_eq!(HandshakeReply::parse("Authenticated"), HandshakeReply::Ignored);
    }

    #[tokio::test]
    async fn test_credential_is_first_frame_and_noise_is_skipped() {
        let (mut channel, mut sent, server) = pair();
        server.send(TransportEvent::Frame(Frame::Text("hello".into()))).unwrap();
        server.send(TransportEvent::Frame(Frame::Binary(vec![0, 0, 0]))).unwrap();
        server
            .send(TransportEvent::Frame(Frame::Text(AUTHENTICATED.into())))
            .unwrap();

        let outcome = authenticate(&mut channel, "token-1", Duration::from_secs(1)).await;
        assert_eq!(outcome, HandshakeOutcome::Authenticated);
        assert_eq!(sent.recv().await, Some(Frame::Text("token-1".into())));
    }

    #[tokio::test]
    async fn test_denied_and_closed() {
        let (mut channel, _sent, server) = pair();
        server
            .send(TransportEvent::Frame(Frame::Text("access-denied:expired".into())))
            .unwrap();
        assert_eq!(
            authenticate(&mut channel, "t", Duration::from_secs(1)).await,
            HandshakeOutcome::Denied("expired".to_string())
        );

        let (mut channel, _sent, server) = pair();
        server
            .send(TransportEvent::Error("HTTP error: 401 Unauthorized".into()))
            .unwrap();
        assert_eq!(
            authenticate(&mut channel, "t", Duration::from_secs(1)).await,
            HandshakeOutcome::Failed("HTTP error: 401 Unauthorized".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_times_out() {
        let (mut channel, _sent, _server) = pair();
        assert_eq!(
            authenticate(&mut channel, "t", Duration::from_secs(10)).await,
            HandshakeOutcome::TimedOut
        );
    }
}
