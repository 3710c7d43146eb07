//! Session receiving a forwarded request over a virtual channel and
//! connecting to its destination.
use std::sync::Arc;

use bytes::Bytes;
use log::*;

use super::policy;
use crate::codec;
use crate::connector::Connector;
use crate::model::{self, Auth, Command, Endpoint, Reply, Request, Response};
use crate::relay::PeerTraffic;
use crate::session::{Session, SessionError};
use crate::tcp::{Connection, ConnectionInfo, SocketError};
use crate::transport::Frame;

/// What every session of one backend shares.
pub struct Context {
    pub allow_non_unicast: bool,
    pub reproxy: Option<Endpoint>,
    pub connector: Arc<dyn Connector>,
    pub totals: PeerTraffic,
}

/// Runs the session until the flow terminates, then releases the socket and
/// the channel.
pub async fn run(session: Arc<Session>, context: Arc<Context>) {
    match session.guard(handshake(&session, &context)).await {
        Ok(conn) => {
            session.link(&conn, &context.totals);
            session.wait_terminated(&conn).await;
        }
        Err(SessionError::Stopped) => debug!("{}: stopped during handshake", session.long_id()),
        Err(err) => info!("{}: handshake failed: {}", session.long_id(), err),
    }
    session.release().await;
}

async fn handshake(session: &Session, context: &Context) -> Result<Connection, SessionError> {
    let endpoint = match receive_endpoint(session).await {
        Ok(endpoint) => endpoint,
        Err(err) => {
            reply_to_peer(session, Reply::UnsupportedCommand, None)?;
            return Err(err);
        }
    };
    if !policy::is_allowed_endpoint(&endpoint, context.allow_non_unicast) {
        reply_to_peer(session, Reply::NotAllowed, None)?;
        return Err(SessionError::NotAllowed);
    }

    let conn = match &context.reproxy {
        Some(reproxy) => {
            debug!("{}: connecting through reproxy {}", session.long_id(), reproxy);
            Connection::connect(context.connector.clone(), reproxy.clone(), false)
        }
        None => Connection::connect(context.connector.clone(), endpoint.clone(), true),
    };
    session.set_connection(&conn);
    let info = match conn.once_connected().await {
        Ok(info) => info,
        Err(err) => {
            info!("{}: failed to connect to remote endpoint", session.long_id());
            let reply = match &err {
                SocketError::Connect(failure) => failure.reply(context.allow_non_unicast),
                _ => Reply::Failure,
            };
            reply_to_peer(session, reply, None)?;
            return Err(err.into());
        }
    };

    let (reply, bound) = match &context.reproxy {
        Some(_) => match connect_through_reproxy(session, &conn, &endpoint).await {
            Ok(bound) => (Reply::Succeeded, bound),
            Err(err) => {
                debug!("{}: failed to complete reproxy handshake", session.long_id());
                reply_to_peer(session, Reply::Failure, None)?;
                return Err(err);
            }
        },
        None => (reply_from_info(&info, context.allow_non_unicast), info.bound.clone()),
    };
    info!("{}: connected to remote endpoint", session.long_id());
    reply_to_peer(session, reply, Some(bound))?;
    if reply != Reply::Succeeded {
        return Err(SessionError::Rejected(reply));
    }
    Ok(conn)
}

/// Waits for the frontend's request and returns its destination.
async fn receive_endpoint(session: &Session) -> Result<Endpoint, SessionError> {
    let frame = session.channel().data_from_peer().next_item().await?;
    let text = match frame {
        Frame::Text(text) => text,
        Frame::Binary(data) => {
            return Err(SessionError::peer(format_args!(
                "received {} bytes of binary data during handshake",
                data.len()
            )))
        }
    };
    let request: Request = serde_json::from_str(&text).map_err(|err| {
        SessionError::peer(format_args!("received malformed message during handshake: {}", err))
    })?;
    if !request.is_valid() {
        return Err(SessionError::peer(format_args!(
            "received invalid request: {:?}",
            request
        )));
    }
    if request.command != Command::Connect {
        return Err(model::Error::command_not_supported(request.command).into());
    }
    debug!(
        "{}: received endpoint from peer: {}",
        session.long_id(),
        request.endpoint
    );
    Ok(request.endpoint)
}

/// A resolved destination that turns out not to be allowed is reported as a
/// generic failure, so the reply does not reveal what a name resolved to.
fn reply_from_info(info: &ConnectionInfo, allow_non_unicast: bool) -> Reply {
    match info.remote.ip() {
        Some(ip) if policy::is_allowed_address(ip, allow_non_unicast) => Reply::Succeeded,
        _ => Reply::Failure,
    }
}

/// Runs a NOAUTH CONNECT handshake with the reproxy server for `endpoint`.
async fn connect_through_reproxy(
    session: &Session,
    conn: &Connection,
    endpoint: &Endpoint,
) -> Result<Endpoint, SessionError> {
    let auth = codec::compose_auth_handshake(&[Auth::NoAuth])?;
    conn.send(Bytes::from(auth)).await?;
    let auth = codec::interpret_auth_response(&conn.receive_next().await?)?;
    trace!("{}: reproxy selected auth method {:?}", session.long_id(), auth);
    if auth != Auth::NoAuth {
        return Err(model::Error::NoAcceptableMethod.into());
    }

    let request = codec::compose_request(&Request::connect(endpoint.clone()))?;
    conn.send(Bytes::from(request)).await?;
    let response = codec::interpret_response(&conn.receive_next().await?)?;
    trace!("{}: reproxy response {:?}", session.long_id(), response);
    if response.reply != Reply::Succeeded {
        return Err(SessionError::Rejected(response.reply));
    }
    Ok(Endpoint::unspecified())
}

fn reply_to_peer(session: &Session, reply: Reply, bound: Option<Endpoint>) -> Result<(), SessionError> {
    let response = Response::new(reply, bound);
    debug!("{}: sending response to peer: {:?}", session.long_id(), response);
    let text = serde_json::to_string(&response)
        .map_err(|err| SessionError::peer(format_args!("cannot encode response: {}", err)))?;
    session.channel().send(Frame::Text(text))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connector::test::RedirectConnector;
    use crate::connector::ConnectFailure;
    use crate::transport::test::MockChannel;
    use crate::transport::DataChannel;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn context(connector: RedirectConnector, allow_non_unicast: bool) -> Arc<Context> {
        Arc::new(Context {
            allow_non_unicast,
            reproxy: None,
            connector: Arc::new(connector),
            totals: PeerTraffic::default(),
        })
    }

    async fn next_sent(mock: &MockChannel) -> Frame {
        loop {
            if let Some(frame) = mock.take_sent().into_iter().next() {
                return frame;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn response(mock: &MockChannel) -> Response {
        match next_sent(mock).await {
            Frame::Text(text) => serde_json::from_str(&text).unwrap(),
            frame => panic!("unexpected frame {:?}", frame),
        }
    }

    fn request(endpoint: Endpoint) -> String {
        serde_json::to_string(&Request::connect(endpoint)).unwrap()
    }

    #[tokio::test]
    async fn connect_and_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Endpoint::new("93.184.216.34", 80);
        let connector = vec![(target.clone(), Ok(listener.local_addr().unwrap()))]
            .into_iter()
            .collect();
        // the redirected socket is a loopback one
        let context = context(connector, true);
        let mock = MockChannel::new("p1");
        let session = Session::new(mock.clone());
        let task = tokio::spawn(run(session.clone(), context));

        mock.receive_text(&request(target));
        let (mut server, _) = listener.accept().await.unwrap();
        let response = response(&mock).await;
        assert_eq!(response.reply, Reply::Succeeded);
        assert_eq!(response.endpoint.unwrap().address, "127.0.0.1");

        let _ = mock
            .data_from_peer()
            .handle(Frame::Binary(Bytes::from_static(b"GET /")));
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");
        server.write_all(b"200").await.unwrap();
        assert_eq!(next_sent(&mock).await, Frame::Binary(Bytes::from_static(b"200")));

        mock.close();
        task.await.unwrap();
        let mut rest = vec![];
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn resolved_local_address_is_a_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Endpoint::new("intranet.example", 80);
        let connector = vec![(target.clone(), Ok(listener.local_addr().unwrap()))]
            .into_iter()
            .collect();
        let mock = MockChannel::new("p1");
        let task = tokio::spawn(run(Session::new(mock.clone()), context(connector, false)));
        mock.receive_text(&request(target));
        let response = response(&mock).await;
        assert_eq!(response.reply, Reply::Failure);
        task.await.unwrap();
        assert!(mock.closed().is_cancelled());
    }

    #[tokio::test]
    async fn literal_local_address_is_not_allowed() {
        let mock = MockChannel::new("p1");
        let task = tokio::spawn(run(
            Session::new(mock.clone()),
            context(RedirectConnector::default(), false),
        ));
        mock.receive_text(&request(Endpoint::new("192.168.0.1", 22)));
        assert_eq!(response(&mock).await, Response::new(Reply::NotAllowed, None));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_failures() {
        let table = [
            (ConnectFailure::TimedOut, false, Reply::TtlExpired),
            (ConnectFailure::NameNotResolved, false, Reply::HostUnreachable),
            (ConnectFailure::Refused, false, Reply::Failure),
            (ConnectFailure::Refused, true, Reply::ConnectionRefused),
        ];
        for (failure, allow_non_unicast, expected) in table.iter() {
            let target = Endpoint::new("example.com", 443);
            let connector = vec![(target.clone(), Err(*failure))].into_iter().collect();
            let mock = MockChannel::new("p1");
            let task = tokio::spawn(run(
                Session::new(mock.clone()),
                context(connector, *allow_non_unicast),
            ));
            mock.receive_text(&request(target));
            assert_eq!(response(&mock).await.reply, *expected, "{:?}", failure);
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn unsupported_requests() {
        let mock = MockChannel::new("p1");
        let task = tokio::spawn(run(
            Session::new(mock.clone()),
            context(RedirectConnector::default(), false),
        ));
        let udp = Request {
            command: Command::UdpAssociate,
            endpoint: Endpoint::new("example.com", 53),
        };
        mock.receive_text(&serde_json::to_string(&udp).unwrap());
        assert_eq!(response(&mock).await.reply, Reply::UnsupportedCommand);
        task.await.unwrap();

        let mock = MockChannel::new("p2");
        let task = tokio::spawn(run(
            Session::new(mock.clone()),
            context(RedirectConnector::default(), false),
        ));
        mock.receive_text("not json");
        assert_eq!(response(&mock).await.reply, Reply::UnsupportedCommand);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn through_reproxy() {
        let reproxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reproxy_endpoint = Endpoint::from(reproxy.local_addr().unwrap());
        let connector: RedirectConnector = vec![(
            reproxy_endpoint.clone(),
            Ok(reproxy.local_addr().unwrap()),
        )]
        .into_iter()
        .collect();
        let context = Arc::new(Context {
            allow_non_unicast: false,
            reproxy: Some(reproxy_endpoint),
            connector: Arc::new(connector),
            totals: PeerTraffic::default(),
        });
        let mock = MockChannel::new("p1");
        let task = tokio::spawn(run(Session::new(mock.clone()), context));
        mock.receive_text(&request(Endpoint::new("example.com", 80)));

        let (mut upstream, _) = reproxy.accept().await.unwrap();
        let mut buf = [0u8; 3];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [5, 1, 0]);
        upstream.write_all(&[5, 0]).await.unwrap();
        let mut buf = [0u8; 18];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..5], &[5, 1, 0, 3, 11]);
        assert_eq!(&buf[5..16], b"example.com");
        assert_eq!(&buf[16..], &[0, 80]);
        upstream
            .write_all(&[5, 0, 0, 1, 1, 2, 3, 4, 0, 1])
            .await
            .unwrap();

        assert_eq!(
            response(&mock).await,
            Response::new(Reply::Succeeded, Some(Endpoint::unspecified()))
        );
        upstream.write_all(b"hi").await.unwrap();
        assert_eq!(next_sent(&mock).await, Frame::Binary(Bytes::from_static(b"hi")));
        drop(upstream);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reproxy_refusal_is_a_failure() {
        let reproxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reproxy_endpoint = Endpoint::from(reproxy.local_addr().unwrap());
        let connector: RedirectConnector = vec![(
            reproxy_endpoint.clone(),
            Ok(reproxy.local_addr().unwrap()),
        )]
        .into_iter()
        .collect();
        let context = Arc::new(Context {
            allow_non_unicast: false,
            reproxy: Some(reproxy_endpoint),
            connector: Arc::new(connector),
            totals: PeerTraffic::default(),
        });
        let mock = MockChannel::new("p1");
        let task = tokio::spawn(run(Session::new(mock.clone()), context));
        mock.receive_text(&request(Endpoint::new("example.com", 80)));

        let (mut upstream, _) = reproxy.accept().await.unwrap();
        let mut buf = [0u8; 3];
        upstream.read_exact(&mut buf).await.unwrap();
        // requires username/password
        upstream.write_all(&[5, 2]).await.unwrap();
        assert_eq!(response(&mock).await, Response::new(Reply::Failure, None));
        task.await.unwrap();
    }
}
