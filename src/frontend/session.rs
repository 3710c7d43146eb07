//! Session accepting one SOCKS client and forwarding its request to the
//! backend over a virtual channel.
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::*;

use crate::codec;
use crate::model::{self, Auth, Reply, Request, Response, SocksVersion};
use crate::relay::PeerTraffic;
use crate::session::{Session, SessionError};
use crate::tcp::Connection;
use crate::transport::Frame;

/// time given to a reply to reach the client before the socket is closed
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// longest handshake message buffered while waiting for its end
const MAX_MESSAGE_LEN: usize = 1024;

#[derive(Debug, Default)]
struct Progress {
    version: Option<SocksVersion>,
    /// an auth method was selected, so a request reply is expected
    negotiated: bool,
    replied: bool,
}

/// Runs the session until the flow terminates, then releases the socket and
/// the channel.
pub async fn run(session: Arc<Session>, conn: Connection, totals: PeerTraffic) {
    session.set_connection(&conn);
    let mut progress = Progress::default();
    let res = session.guard(handshake(&session, &conn, &mut progress)).await;
    match res {
        Ok(early) => {
            forward_early_data(&session, early, &totals);
            session.link(&conn, &totals);
            session.wait_terminated(&conn).await;
        }
        Err(err) => {
            match &err {
                SessionError::Rejected(reply) => {
                    info!("{}: handshake failed: {}", session.long_id(), reply)
                }
                SessionError::Stopped => debug!("{}: stopped during handshake", session.long_id()),
                err => warn!("{}: handshake error: {}", session.long_id(), err),
            }
            send_failure(&session, &conn, &progress, &err).await;
        }
    }
    session.release().await;
    info!("discarded {}", session.long_id());
}

/// Cuts one message at a time out of the bytes the client sent.
struct MessageReader<'a> {
    conn: &'a Connection,
    buf: BytesMut,
}

impl<'a> MessageReader<'a> {
    fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            buf: BytesMut::new(),
        }
    }

    async fn fill(&mut self) -> Result<(), SessionError> {
        if self.buf.len() > MAX_MESSAGE_LEN {
            return Err(model::Error::message_fmt(format_args!(
                "handshake message longer than {} bytes",
                MAX_MESSAGE_LEN
            ))
            .into());
        }
        let data = self.conn.receive_next().await?;
        self.buf.extend_from_slice(&data);
        Ok(())
    }

    async fn peek_first(&mut self) -> Result<&[u8], SessionError> {
        while self.buf.is_empty() {
            self.fill().await?;
        }
        Ok(&self.buf[..])
    }

    async fn next_message(
        &mut self,
        message_len: fn(&[u8]) -> Option<usize>,
    ) -> Result<Bytes, SessionError> {
        loop {
            if let Some(len) = message_len(&self.buf) {
                return Ok(self.buf.split_to(len).freeze());
            }
            self.fill().await?;
        }
    }

    /// Bytes the client sent after its request.
    fn into_rest(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Runs the handshake. On success, yields what the client sent after its
/// request without waiting for the reply.
async fn handshake(
    session: &Session,
    conn: &Connection,
    progress: &mut Progress,
) -> Result<Bytes, SessionError> {
    let mut reader = MessageReader::new(conn);
    let version = codec::check_version(reader.peek_first().await?)?;
    progress.version = Some(version);
    let request = match version {
        SocksVersion::V5 => {
            let greeting = reader.next_message(codec::auth_handshake_len).await?;
            codec::interpret_auth_handshake(&greeting)?;
            progress.negotiated = true;
            conn.send(Bytes::from(codec::compose_auth_response(Auth::NoAuth)))
                .await?;
            let buf = reader.next_message(codec::request_len).await?;
            codec::interpret_request(&buf)?
        }
        SocksVersion::V4 => {
            progress.negotiated = true;
            let buf = reader.next_message(codec::request_v4_len).await?;
            codec::interpret_request_v4(&buf)?
        }
    };

    let response = handshake_with_peer(session, conn, request).await;
    let reply = match version {
        SocksVersion::V5 => codec::compose_response(&response)?,
        SocksVersion::V4 => codec::compose_response_v4(&response),
    };
    progress.replied = true;
    conn.send(Bytes::from(reply)).await?;
    if response.reply != Reply::Succeeded {
        return Err(SessionError::Rejected(response.reply));
    }
    Ok(reader.into_rest())
}

/// Sends data that arrived together with the request ahead of anything read
/// once linked.
fn forward_early_data(session: &Session, early: Bytes, totals: &PeerTraffic) {
    if early.is_empty() {
        return;
    }
    let len = early.len();
    debug!("{}: forwarding {} bytes sent with the request", session.long_id(), len);
    let traffic = session.traffic();
    traffic.socket_received.fetch_add(len as u64, Ordering::Relaxed);
    match session.channel().send(Frame::Binary(early)) {
        Ok(()) => {
            traffic.channel_sent.fetch_add(len as u64, Ordering::Relaxed);
            let _ = totals.bytes_sent_to_peer.handle(len);
        }
        Err(err) => debug!("{}: dropping {} bytes: {}", session.long_id(), len, err),
    }
}

/// Forwards `request` to the backend and waits for its response. Any failure
/// comes back as a generic FAILURE response.
async fn handshake_with_peer(session: &Session, conn: &Connection, request: Request) -> Response {
    debug!(
        "{}: received endpoint from SOCKS client: {}",
        session.long_id(),
        request.endpoint
    );
    conn.pause();
    match exchange(session, &request).await {
        Ok(response) => response,
        Err(err) => {
            debug!(
                "{}: unexpected failure during handshake, returning generic FAILURE to SOCKS client: {}",
                session.long_id(),
                err
            );
            Response::failure()
        }
    }
}

async fn exchange(session: &Session, request: &Request) -> Result<Response, SessionError> {
    let channel = session.channel();
    let text = serde_json::to_string(request)
        .map_err(|err| SessionError::peer(format_args!("cannot encode request: {}", err)))?;
    channel.send(Frame::Text(text))?;
    let frame = channel.data_from_peer().next_item().await?;
    let text = match frame {
        Frame::Text(text) => text,
        Frame::Binary(data) => {
            return Err(SessionError::peer(format_args!(
                "received {} bytes of binary data during handshake",
                data.len()
            )))
        }
    };
    let response: Response = serde_json::from_str(&text)
        .map_err(|err| SessionError::peer(format_args!("could not parse response: {}", err)))?;
    if !response.is_valid() {
        return Err(SessionError::peer(format_args!(
            "invalid response received during handshake: {}",
            text
        )));
    }
    Ok(response)
}

/// Leaves the client with a reply matching the stage its handshake reached.
async fn send_failure(session: &Session, conn: &Connection, progress: &Progress, err: &SessionError) {
    if progress.replied || conn.is_closed() {
        return;
    }
    let reply = match (progress.version, progress.negotiated, err) {
        (Some(SocksVersion::V5), false, SessionError::Protocol(model::Error::NoAcceptableMethod)) => {
            codec::compose_auth_response(Auth::NoMethods)
        }
        (Some(SocksVersion::V4), _, _) => codec::compose_response_v4(&Response::failure()),
        _ => match codec::compose_response(&Response::failure()) {
            Ok(reply) => reply,
            Err(err) => {
                error!("{}: cannot compose failure reply: {}", session.long_id(), err);
                return;
            }
        },
    };
    match tokio::time::timeout(REPLY_TIMEOUT, conn.send(Bytes::from(reply))).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!("{}: cannot send failure reply: {}", session.long_id(), err),
        Err(_) => debug!("{}: timed out sending failure reply", session.long_id()),
    }
}
