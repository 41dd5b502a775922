//! The single receive loop.
//!
//! Reads frames until the connection ends, routing each by its token. When
//! the stream ends for any reason the transport is marked closed and every
//! outstanding exchange is abandoned with the close reason.

use super::table::CorrelationTable;
use crate::protocol::extract_token;
use crate::transport::{CloseReason, FrameStream, Inbound, Transport};
use std::sync::Arc;
use tracing::{error, info, trace, warn};

pub(crate) async fn receive_loop(
    mut stream: Box<dyn FrameStream>,
    table: Arc<CorrelationTable>,
    transport: Arc<Transport>,
) -> CloseReason {
    let peer = transport.peer().to_string();

    let reason = loop {
        match stream.next_frame().await {
            Inbound::Frame(frame) => match extract_token(&frame) {
                Some(token) => {
                    trace!("Received {} bytes for {}", frame.len(), token);
                    table.deliver(&token, frame);
                }
                None => {
                    table.record_malformed();
                    warn!(
                        "Discarding frame without a request_id from {} ({} bytes)",
                        peer,
                        frame.len()
                    );
                }
            },
            Inbound::Closed(reason) => {
                if reason.is_graceful() {
                    info!("Connection to {} closed: {}", peer, reason);
                } else {
                    warn!("Connection to {} closed unexpectedly: {}", peer, reason);
                }
                break reason;
            }
            Inbound::Failed(e) => {
                error!("Receive from {} failed: {}", peer, e);
                break CloseReason::TransportFailure(e.to_string());
            }
        }
    };

    transport.mark_closed();
    let abandoned = table.abandon_all(reason.clone());
    if abandoned > 0 {
        warn!(
            "Abandoned {} outstanding exchange(s) on {}: {}",
            abandoned, peer, reason
        );
    }
    reason
}
