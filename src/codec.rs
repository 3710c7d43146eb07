//! SOCKS4/4a and SOCKS5 message encoding.
//!
//! Each `interpret_*` function parses exactly one message out of a byte slice
//! and each `compose_*` function builds one. Nothing here keeps state or does
//! I/O. A malformed message is reported as an [`Error`].
use std::convert::TryFrom;
use std::io::{self, Cursor, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::slice;

use log::*;

use crate::model::{Error, Result, *};
use crate::raw_message::*;

trait ReadSocksExt {
    fn read_u8(&mut self) -> Result<u8>;
    fn read_u16(&mut self) -> Result<u16>;
    fn read_rsv(&mut self) -> Result<u8>;
    fn read_version(&mut self, expected: u8) -> Result<u8>;
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>>;
    fn read_methods(&mut self, nmethods: usize) -> Result<Vec<Auth>>;
    fn read_cstring(&mut self) -> Result<Vec<u8>>;
    fn read_destination(&mut self) -> Result<Destination>;
}

trait WriteSocksExt {
    fn write_u8(&mut self, v: u8) -> Result<()>;
    fn write_u16(&mut self, v: u16) -> Result<()>;
    fn write_methods(&mut self, methods: &[Auth]) -> Result<()>;
    fn write_short_string(&mut self, s: &str) -> Result<()>;
    fn write_destination(&mut self, destination: &Destination) -> Result<()>;
}

impl<T> ReadSocksExt for T
where
    T: io::Read,
{
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_rsv(&mut self) -> Result<u8> {
        let rsv = self.read_u8()?;
        if rsv != RESERVED {
            Err(Error::message_fmt(format_args!("value of rsv is not 0({})", rsv)))
        } else {
            Ok(rsv)
        }
    }

    fn read_version(&mut self, expected: u8) -> Result<u8> {
        let version = self.read_u8()?;
        if version != expected {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(version)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_methods(&mut self, nmethods: usize) -> Result<Vec<Auth>> {
        Ok(self
            .read_bytes(nmethods)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    fn read_cstring(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![];
        loop {
            match self.read_u8()? {
                0 => return Ok(buf),
                c => buf.push(c),
            }
        }
    }

    fn read_destination(&mut self) -> Result<Destination> {
        let address_type = AddressType::try_from(self.read_u8()?)?;
        let (address, address_len) = match address_type {
            AddressType::Ipv4 => {
                let mut buf = [0u8; 4];
                self.read_exact(&mut buf)?;
                (Ipv4Addr::from(buf).to_string(), 4)
            }
            AddressType::Ipv6 => {
                let mut buf = [0u8; 16];
                self.read_exact(&mut buf)?;
                (Ipv6Addr::from(buf).to_string(), 16)
            }
            AddressType::Dns => {
                let len = self.read_u8()? as usize;
                let name = domain_name(self.read_bytes(len)?)?;
                (name, 1 + len)
            }
        };
        let port = self.read_u16()?;
        Ok(Destination {
            address_type,
            endpoint: Endpoint::new(address, port),
            address_byte_length: 1 + address_len + 2,
        })
    }
}

impl<T> WriteSocksExt for T
where
    T: io::Write,
{
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(slice::from_ref(&v))?;
        Ok(())
    }

    fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_methods(&mut self, methods: &[Auth]) -> Result<()> {
        if methods.is_empty() || methods.len() > 255 {
            return Err(Error::message_fmt(format_args!(
                "number of auth methods out of range: {}",
                methods.len()
            )));
        }
        self.write_u8(methods.len() as u8)?;
        let codes: Vec<u8> = methods.iter().map(Auth::code).collect();
        self.write_all(&codes)?;
        Ok(())
    }

    fn write_short_string(&mut self, s: &str) -> Result<()> {
        if s.len() > 255 {
            return Err(Error::message_fmt(format_args!(
                "string is too long: {} bytes",
                s.len()
            )));
        }
        self.write_u8(s.len() as u8)?;
        self.write_all(s.as_bytes())?;
        Ok(())
    }

    fn write_destination(&mut self, destination: &Destination) -> Result<()> {
        let endpoint = &destination.endpoint;
        self.write_u8(destination.address_type as u8)?;
        match (destination.address_type, endpoint.ip()) {
            (AddressType::Ipv4, Some(IpAddr::V4(ip))) => self.write_all(&ip.octets())?,
            (AddressType::Ipv6, Some(IpAddr::V6(ip))) => self.write_all(&ip.octets())?,
            (AddressType::Dns, _) => {
                check_domain_name(&endpoint.address)?;
                self.write_short_string(&endpoint.address)?
            }
            (atyp, _) => {
                return Err(Error::message_fmt(format_args!(
                    "address {} does not match {:?}",
                    endpoint.address, atyp
                )))
            }
        }
        self.write_u16(endpoint.port)?;
        Ok(())
    }
}

fn domain_name(buf: Vec<u8>) -> Result<String> {
    let name = String::from_utf8(buf)
        .map_err(|_| Error::message_fmt(format_args!("domain name is not ascii")))?;
    check_domain_name(&name)?;
    Ok(name)
}

fn check_domain_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 || !name.is_ascii() {
        return Err(Error::message_fmt(format_args!(
            "invalid domain name: {:?}",
            name
        )));
    }
    Ok(())
}

/// Reports which protocol version a client speaks from its first byte.
pub fn check_version(buf: &[u8]) -> Result<SocksVersion> {
    match buf.first() {
        None => Err(Error::Truncated),
        Some(&SOCKS4_VERSION) => Ok(SocksVersion::V4),
        Some(&SOCKS5_VERSION) => Ok(SocksVersion::V5),
        Some(&version) => Err(Error::UnsupportedVersion(version)),
    }
}

/// Length of the SOCKS5 version negotiation at the start of `buf`, or `None`
/// until enough bytes are buffered.
pub fn auth_handshake_len(buf: &[u8]) -> Option<usize> {
    let len = 2 + *buf.get(1)? as usize;
    (buf.len() >= len).then_some(len)
}

/// Length of the SOCKS5 request at the start of `buf`, or `None` until
/// enough bytes are buffered. An unknown address type claims the whole
/// buffer so the parser reports it.
pub fn request_len(buf: &[u8]) -> Option<usize> {
    let address_len = match AddressType::try_from(*buf.get(3)?) {
        Ok(AddressType::Ipv4) => 4,
        Ok(AddressType::Ipv6) => 16,
        Ok(AddressType::Dns) => 1 + *buf.get(4)? as usize,
        Err(_) => return Some(buf.len()),
    };
    let len = 4 + address_len + 2;
    (buf.len() >= len).then_some(len)
}

/// Length of the SOCKS4 or SOCKS4a request at the start of `buf`, or `None`
/// until the user id and host name terminators are buffered.
pub fn request_v4_len(buf: &[u8]) -> Option<usize> {
    let ip = buf.get(4..8)?;
    let nul = |from: usize| {
        buf.get(from..)?
            .iter()
            .position(|&b| b == 0)
            .map(|pos| from + pos + 1)
    };
    let user_end = nul(8)?;
    if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        nul(user_end)
    } else {
        Some(user_end)
    }
}

/// Parses the SOCKS5 version negotiation.
///
/// Fails unless `NOAUTH` is among the offered methods.
pub fn interpret_auth_handshake(buf: &[u8]) -> Result<Vec<Auth>> {
    let mut cur = Cursor::new(buf);
    cur.read_version(SOCKS5_VERSION)?;
    let nmethods = cur.read_u8()? as usize;
    if nmethods == 0 {
        return Err(Error::message_fmt(format_args!(
            "at least one authentication method must be offered"
        )));
    }
    let methods = cur.read_methods(nmethods)?;
    trace!("auth methods: {:?}", methods);
    if !methods.contains(&Auth::NoAuth) {
        return Err(Error::NoAcceptableMethod);
    }
    Ok(methods)
}

pub fn compose_auth_handshake(methods: &[Auth]) -> Result<Vec<u8>> {
    let mut buf = vec![SOCKS5_VERSION];
    buf.write_methods(methods)?;
    Ok(buf)
}

pub fn compose_auth_response(method: Auth) -> Vec<u8> {
    vec![SOCKS5_VERSION, method.code()]
}

pub fn interpret_auth_response(buf: &[u8]) -> Result<Auth> {
    if buf.len() != 2 {
        return Err(Error::message_fmt(format_args!(
            "auth response must be exactly 2 bytes long: {}",
            buf.len()
        )));
    }
    let mut cur = Cursor::new(buf);
    cur.read_version(SOCKS5_VERSION)?;
    Ok(cur.read_u8()?.into())
}

pub fn compose_user_pass_request(request: &UserPassRequest) -> Result<Vec<u8>> {
    let mut buf = vec![USERPASS_VERSION];
    buf.write_short_string(&request.username)?;
    buf.write_short_string(&request.password)?;
    Ok(buf)
}

pub fn interpret_user_pass_request(buf: &[u8]) -> Result<UserPassRequest> {
    if buf.len() < 3 {
        return Err(Error::Truncated);
    }
    let mut cur = Cursor::new(buf);
    cur.read_version(USERPASS_VERSION)?;
    let ulen = cur.read_u8()? as usize;
    let username = cur.read_bytes(ulen)?;
    let plen = cur.read_u8()? as usize;
    let password = cur.read_bytes(plen)?;
    if cur.position() as usize != buf.len() {
        return Err(Error::message_fmt(format_args!(
            "username/password request has {} trailing bytes",
            buf.len() - cur.position() as usize
        )));
    }
    let text = |bytes: Vec<u8>| {
        String::from_utf8(bytes)
            .map_err(|_| Error::message_fmt(format_args!("credentials are not utf-8")))
    };
    Ok(UserPassRequest {
        username: text(username)?,
        password: text(password)?,
    })
}

pub fn compose_user_pass_response(success: bool) -> Vec<u8> {
    let status = if success {
        USERPASS_SUCCESS
    } else {
        USERPASS_FAILURE
    };
    vec![USERPASS_VERSION, status]
}

/// Returns whether the server accepted the credentials.
pub fn interpret_user_pass_response(buf: &[u8]) -> Result<bool> {
    if buf.len() != 2 {
        return Err(Error::message_fmt(format_args!(
            "username/password response must be exactly 2 bytes long: {}",
            buf.len()
        )));
    }
    let mut cur = Cursor::new(buf);
    cur.read_version(USERPASS_VERSION)?;
    Ok(cur.read_u8()? == USERPASS_SUCCESS)
}

/// Chooses the address encoding for `endpoint`.
pub fn make_destination(endpoint: &Endpoint) -> Result<Destination> {
    let (address_type, address_len) = match endpoint.ip() {
        Some(IpAddr::V4(_)) => (AddressType::Ipv4, 4),
        Some(IpAddr::V6(_)) => (AddressType::Ipv6, 16),
        None => {
            check_domain_name(&endpoint.address)?;
            (AddressType::Dns, 1 + endpoint.address.len())
        }
    };
    Ok(Destination {
        address_type,
        endpoint: endpoint.clone(),
        address_byte_length: 1 + address_len + 2,
    })
}

pub fn interpret_destination(buf: &[u8]) -> Result<Destination> {
    Cursor::new(buf).read_destination()
}

pub fn compose_destination(destination: &Destination) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(destination.address_byte_length);
    buf.write_destination(destination)?;
    Ok(buf)
}

/// Parses a SOCKS5 CONNECT or UDP ASSOCIATE request.
pub fn interpret_request(buf: &[u8]) -> Result<Request> {
    if buf.len() < SOCKS5_MIN_REQUEST_LEN {
        return Err(Error::Truncated);
    }
    let mut cur = Cursor::new(buf);
    cur.read_version(SOCKS5_VERSION)?;
    let command = Command::try_from(cur.read_u8()?)?;
    if command == Command::Bind {
        return Err(Error::command_not_supported(command));
    }
    cur.read_rsv()?;
    let destination = cur.read_destination()?;
    Ok(Request {
        command,
        endpoint: destination.endpoint,
    })
}

pub fn compose_request(request: &Request) -> Result<Vec<u8>> {
    let destination = make_destination(&request.endpoint)?;
    let mut buf = vec![SOCKS5_VERSION, request.command.into(), RESERVED];
    buf.write_destination(&destination)?;
    Ok(buf)
}

/// Builds a SOCKS5 reply. A response without an endpoint is sent as
/// `0.0.0.0:0`.
pub fn compose_response(response: &Response) -> Result<Vec<u8>> {
    let endpoint = response
        .endpoint
        .clone()
        .unwrap_or_else(Endpoint::unspecified);
    let destination = make_destination(&endpoint)?;
    let mut buf = vec![SOCKS5_VERSION, response.reply.into(), RESERVED];
    buf.write_destination(&destination)?;
    Ok(buf)
}

pub fn interpret_response(buf: &[u8]) -> Result<Response> {
    let mut cur = Cursor::new(buf);
    cur.read_version(SOCKS5_VERSION)?;
    let reply = Reply::try_from(cur.read_u8()?)?;
    cur.read_rsv()?;
    let destination = cur.read_destination()?;
    Ok(Response {
        reply,
        endpoint: Some(destination.endpoint),
    })
}

/// Parses the header of a SOCKS5 UDP datagram. Fragments are rejected.
pub fn interpret_udp_message(buf: &[u8]) -> Result<UdpMessage<'_>> {
    if buf.len() < UDP_MIN_HEADER_LEN {
        return Err(Error::Truncated);
    }
    let mut cur = Cursor::new(buf);
    cur.read_u16()?;
    let frag = cur.read_u8()?;
    if frag != 0 {
        return Err(Error::Fragmented { frag });
    }
    let destination = cur.read_destination()?;
    let pos = cur.position() as usize;
    Ok(UdpMessage {
        frag,
        destination,
        data: &buf[pos..],
    })
}

pub fn compose_udp_message(destination: &Destination, data: &[u8]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(3 + destination.address_byte_length + data.len());
    buf.write_u16(0)?;
    buf.write_u8(0)?;
    buf.write_destination(destination)?;
    buf.write_all(data)?;
    Ok(buf)
}

/// Parses a SOCKS4 or SOCKS4a CONNECT request.
///
/// SOCKS4a is signalled by an address `0.0.0.x` with `x` non-zero, followed
/// by a NUL terminated host name after the user id.
pub fn interpret_request_v4(buf: &[u8]) -> Result<Request> {
    if buf.len() < SOCKS4_MIN_REQUEST_LEN {
        return Err(Error::Truncated);
    }
    let mut cur = Cursor::new(buf);
    cur.read_version(SOCKS4_VERSION)?;
    match cur.read_u8()? {
        SOCKS4_CONNECT => {}
        code => {
            return match Command::try_from(code) {
                Ok(cmd) => Err(Error::command_not_supported(cmd)),
                Err(err) => Err(err.into()),
            }
        }
    }
    let port = cur.read_u16()?;
    let mut ip = [0u8; 4];
    cur.read_exact(&mut ip)?;
    // user id is not used
    cur.read_cstring()?;
    let address = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        domain_name(cur.read_cstring()?)?
    } else {
        Ipv4Addr::from(ip).to_string()
    };
    Ok(Request::connect(Endpoint::new(address, port)))
}

pub fn compose_request_v4(request: &Request) -> Result<Vec<u8>> {
    if request.command != Command::Connect {
        return Err(Error::command_not_supported(request.command));
    }
    let endpoint = &request.endpoint;
    let mut buf = vec![SOCKS4_VERSION, SOCKS4_CONNECT];
    buf.write_u16(endpoint.port)?;
    match endpoint.ip() {
        Some(IpAddr::V4(ip)) => {
            buf.write_all(&ip.octets())?;
            // empty user id
            buf.write_u8(0)?;
        }
        Some(IpAddr::V6(ip)) => {
            return Err(Error::message_fmt(format_args!(
                "SOCKS4 cannot carry an IPv6 address: {}",
                ip
            )))
        }
        None => {
            check_domain_name(&endpoint.address)?;
            let marker = u8::try_from(endpoint.address.len()).unwrap_or(u8::MAX);
            buf.write_all(&[0, 0, 0, marker, 0])?;
            buf.write_all(endpoint.address.as_bytes())?;
            buf.write_u8(0)?;
        }
    }
    Ok(buf)
}

/// Builds a SOCKS4 reply. Anything but success is reported as a failure and
/// an endpoint that is not IPv4 is sent as `0.0.0.0:0`.
pub fn compose_response_v4(response: &Response) -> Vec<u8> {
    let code = match response.reply {
        Reply::Succeeded => ResultCode4::Granted,
        _ => ResultCode4::Failed,
    };
    let (ip, port) = match response.endpoint.as_ref().map(|e| (e.ip(), e.port)) {
        Some((Some(IpAddr::V4(ip)), port)) => (ip, port),
        _ => (Ipv4Addr::UNSPECIFIED, 0),
    };
    let mut buf = vec![SOCKS4_REPLY_VERSION, code as u8];
    buf.extend_from_slice(&port.to_be_bytes());
    buf.extend_from_slice(&ip.octets());
    buf
}

pub fn interpret_response_v4(buf: &[u8]) -> Result<Response> {
    let mut cur = Cursor::new(buf);
    cur.read_version(SOCKS4_REPLY_VERSION)?;
    let reply = match ResultCode4::from_u8(cur.read_u8()?)? {
        ResultCode4::Granted => Reply::Succeeded,
        ResultCode4::Failed => Reply::Failure,
    };
    let port = cur.read_u16()?;
    let mut ip = [0u8; 4];
    cur.read_exact(&mut ip)?;
    Ok(Response {
        reply,
        endpoint: Some(Endpoint::new(Ipv4Addr::from(ip).to_string(), port)),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn ep(address: &str, port: u16) -> Endpoint {
        Endpoint::new(address, port)
    }

    #[test]
    fn message_lengths() {
        assert_eq!(auth_handshake_len(&[5]), None);
        assert_eq!(auth_handshake_len(&[5, 2, 0]), None);
        assert_eq!(auth_handshake_len(&[5, 2, 0, 2, 5, 1]), Some(4));

        let ipv4 = [5, 1, 0, 1, 93, 184, 216, 34, 0, 80];
        assert_eq!(request_len(&ipv4[..9]), None);
        assert_eq!(request_len(&ipv4), Some(10));
        assert_eq!(request_len(&[5, 1, 0, 3]), None);
        assert_eq!(request_len(&[5, 1, 0, 3, 1, b'a', 0, 80, 9]), Some(8));
        let mut ipv6 = vec![5, 1, 0, 4];
        ipv6.extend_from_slice(&[0; 18]);
        assert_eq!(request_len(&ipv6), Some(22));
        assert_eq!(request_len(&[5, 1, 0, 9, 1]), Some(5));

        assert_eq!(request_v4_len(&[4, 1, 0, 80, 1, 2, 3, 4]), None);
        assert_eq!(request_v4_len(&[4, 1, 0, 80, 1, 2, 3, 4, b'u', 0, 7]), Some(10));
        let socks4a = [4, 1, 0, 80, 0, 0, 0, 1, 0, b'a', b'.', b'b', 0];
        assert_eq!(request_v4_len(&socks4a[..12]), None);
        assert_eq!(request_v4_len(&socks4a), Some(13));
    }

    #[test]
    fn version_detection() {
        assert_eq!(check_version(&[5, 1, 0]).unwrap(), SocksVersion::V5);
        assert_eq!(check_version(&[4, 1]).unwrap(), SocksVersion::V4);
        assert!(matches!(check_version(&[]), Err(Error::Truncated)));
        assert!(matches!(
            check_version(&[6]),
            Err(Error::UnsupportedVersion(6))
        ));
    }

    #[test]
    fn auth_handshake() {
        assert_eq!(interpret_auth_handshake(&[5, 1, 0]).unwrap(), vec![Auth::NoAuth]);
        assert_eq!(
            interpret_auth_handshake(&[5, 5, 0, 1, 2, 0x6a, 0xef]).unwrap(),
            vec![
                Auth::NoAuth,
                Auth::GssApi,
                Auth::UserPass,
                Auth::IANAMethod(0x6a),
                Auth::Private(0xef)
            ]
        );
        assert!(matches!(
            interpret_auth_handshake(&[5, 1, 2]),
            Err(Error::NoAcceptableMethod)
        ));
        assert!(matches!(
            interpret_auth_handshake(&[4, 1, 0]),
            Err(Error::UnsupportedVersion(4))
        ));
        assert!(matches!(interpret_auth_handshake(&[5, 2, 0]), Err(Error::Truncated)));
        assert!(interpret_auth_handshake(&[5, 0]).is_err());

        let methods = vec![Auth::UserPass, Auth::NoAuth];
        let buf = compose_auth_handshake(&methods).unwrap();
        assert_eq!(buf, vec![5, 2, 2, 0]);
        assert_eq!(interpret_auth_handshake(&buf).unwrap(), methods);
        assert!(compose_auth_handshake(&[]).is_err());

        assert_eq!(compose_auth_response(Auth::NoAuth), vec![5, 0]);
        assert_eq!(interpret_auth_response(&[5, 0xff]).unwrap(), Auth::NoMethods);
        assert!(interpret_auth_response(&[5, 0, 0]).is_err());
    }

    #[test]
    fn user_pass() {
        let buf = vec![1, 3, b'b', b'o', b'b', 2, b'p', b'w'];
        let request = interpret_user_pass_request(&buf).unwrap();
        assert_eq!(
            request,
            UserPassRequest {
                username: "bob".into(),
                password: "pw".into()
            }
        );
        assert_eq!(compose_user_pass_request(&request).unwrap(), buf);

        let mut trailing = buf.clone();
        trailing.push(0);
        assert!(interpret_user_pass_request(&trailing).is_err());
        assert!(matches!(
            interpret_user_pass_request(&buf[..6]),
            Err(Error::Truncated)
        ));
        assert!(matches!(
            interpret_user_pass_request(&[5, 0, 0]),
            Err(Error::UnsupportedVersion(5))
        ));

        assert_eq!(compose_user_pass_response(true), vec![1, 0]);
        assert_eq!(compose_user_pass_response(false), vec![1, 0xff]);
        assert!(interpret_user_pass_response(&[1, 0]).unwrap());
        assert!(!interpret_user_pass_response(&[1, 0xff]).unwrap());
        assert!(interpret_user_pass_response(&[1]).is_err());
    }

    #[test]
    fn request_v5() {
        let connect = [5, 1, 0, 1, 0x5d, 0xb8, 0xd8, 0x22, 0x00, 0x50];
        assert_eq!(
            interpret_request(&connect).unwrap(),
            Request::connect(ep("93.184.216.34", 80))
        );

        let domain = [
            5, 3, 0, 3, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm',
            0x7, 0xe4,
        ];
        assert_eq!(
            interpret_request(&domain).unwrap(),
            Request {
                command: Command::UdpAssociate,
                endpoint: ep("example.com", 2020)
            }
        );

        let mut v6 = vec![5, 1, 0, 4];
        v6.extend_from_slice(&Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1).octets());
        v6.extend_from_slice(&[0x01, 0xbb]);
        assert_eq!(
            interpret_request(&v6).unwrap(),
            Request::connect(ep("2001:db8::1", 443))
        );
    }

    #[test]
    fn request_v5_rejected() {
        // too short
        assert!(matches!(interpret_request(&[5, 1, 0, 1, 1, 2, 3]), Err(Error::Truncated)));
        assert!(matches!(
            interpret_request(&[5, 1, 0, 1, 1, 2, 3, 4, 0]),
            Err(Error::Truncated)
        ));
        // BIND
        assert!(matches!(
            interpret_request(&[5, 2, 0, 1, 1, 2, 3, 4, 0, 80]),
            Err(Error::CommandNotSupported {
                cmd: Command::Bind
            })
        ));
        // unknown CMD
        assert!(matches!(
            interpret_request(&[5, 9, 0, 1, 1, 2, 3, 4, 0, 80]),
            Err(Error::Code(_))
        ));
        // unknown ATYP
        assert!(matches!(
            interpret_request(&[5, 1, 0, 2, 1, 2, 3, 4, 0, 80]),
            Err(Error::Code(_))
        ));
        // wrong VER
        assert!(matches!(
            interpret_request(&[4, 1, 0, 1, 1, 2, 3, 4, 0, 80]),
            Err(Error::UnsupportedVersion(4))
        ));
        // domain length past the end of the buffer
        assert!(matches!(
            interpret_request(&[5, 1, 0, 3, 20, b'a', b'b', 0, 80]),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn request_round_trip() {
        for endpoint in [
            ep("93.184.216.34", 80),
            ep("2001:db8::8", 8080),
            ep("example.com", 443),
        ] {
            for command in [Command::Connect, Command::UdpAssociate] {
                let request = Request {
                    command,
                    endpoint: endpoint.clone(),
                };
                let buf = compose_request(&request).unwrap();
                assert_eq!(interpret_request(&buf).unwrap(), request);
            }
        }
    }

    #[test]
    fn response_v5() {
        let response = Response::new(Reply::Succeeded, Some(ep("127.0.0.1", 1080)));
        let buf = compose_response(&response).unwrap();
        assert_eq!(buf, vec![5, 0, 0, 1, 127, 0, 0, 1, 0x4, 0x38]);
        assert_eq!(interpret_response(&buf).unwrap(), response);

        let failure = compose_response(&Response::failure()).unwrap();
        assert_eq!(failure, vec![5, 1, 0, 1, 0, 0, 0, 0, 0, 0]);

        let domain = Response::new(Reply::HostUnreachable, Some(ep("example.com", 8335)));
        let buf = compose_response(&domain).unwrap();
        assert_eq!(
            buf,
            vec![
                5, 4, 0, 3, 11, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.', b'c', b'o', b'm',
                0x20, 0x8f
            ]
        );
        assert_eq!(interpret_response(&buf).unwrap(), domain);

        assert!(matches!(
            interpret_response(&[5, 9, 0, 1, 0, 0, 0, 0, 0, 0]),
            Err(Error::Code(_))
        ));
    }

    #[test]
    fn destination() {
        let destination = make_destination(&ep("example.com", 80)).unwrap();
        assert_eq!(destination.address_type, AddressType::Dns);
        assert_eq!(destination.address_byte_length, 15);
        let mut buf = compose_destination(&destination).unwrap();
        assert_eq!(buf.len(), destination.address_byte_length);
        buf.extend_from_slice(b"payload");
        assert_eq!(interpret_destination(&buf).unwrap(), destination);

        assert_eq!(make_destination(&ep("10.0.0.1", 1)).unwrap().address_byte_length, 7);
        assert_eq!(make_destination(&ep("::1", 1)).unwrap().address_byte_length, 19);
        assert!(make_destination(&ep("", 1)).is_err());
        assert!(make_destination(&ep(&"a".repeat(256), 1)).is_err());
    }

    #[test]
    fn udp_message() {
        let mut buf = vec![0, 0, 0, 1, 10, 0, 0, 1, 0, 53];
        buf.extend_from_slice(b"query");
        let message = interpret_udp_message(&buf).unwrap();
        assert_eq!(message.frag, 0);
        assert_eq!(message.destination.endpoint, ep("10.0.0.1", 53));
        assert_eq!(message.data, b"query");
        assert_eq!(
            compose_udp_message(&message.destination, message.data).unwrap(),
            buf
        );

        buf[2] = 1;
        assert!(matches!(
            interpret_udp_message(&buf),
            Err(Error::Fragmented { frag: 1 })
        ));
        assert!(matches!(
            interpret_udp_message(&[0, 0, 0, 1, 10, 0]),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn request_v4() {
        let buf = [4, 1, 0, 80, 1, 2, 3, 4, 0];
        assert_eq!(
            interpret_request_v4(&buf).unwrap(),
            Request::connect(ep("1.2.3.4", 80))
        );
        assert_eq!(compose_request_v4(&Request::connect(ep("1.2.3.4", 80))).unwrap(), buf);

        // user id is skipped
        let with_user = [4, 1, 0, 80, 1, 2, 3, 4, b'b', b'o', b'b', 0];
        assert_eq!(
            interpret_request_v4(&with_user).unwrap(),
            Request::connect(ep("1.2.3.4", 80))
        );

        let mut socks4a = vec![4, 1, 0x1, 0xbb, 0, 0, 0, 1, 0];
        socks4a.extend_from_slice(b"example.com\0");
        assert_eq!(
            interpret_request_v4(&socks4a).unwrap(),
            Request::connect(ep("example.com", 443))
        );

        let request = Request::connect(ep("example.com", 443));
        let buf = compose_request_v4(&request).unwrap();
        assert_eq!(&buf[4..8], &[0, 0, 0, 11]);
        assert_eq!(interpret_request_v4(&buf).unwrap(), request);
    }

    #[test]
    fn request_v4_rejected() {
        assert!(matches!(interpret_request_v4(&[4, 1, 0, 80, 1, 2, 3, 4]), Err(Error::Truncated)));
        assert!(matches!(
            interpret_request_v4(&[5, 1, 0, 80, 1, 2, 3, 4, 0]),
            Err(Error::UnsupportedVersion(5))
        ));
        assert!(matches!(
            interpret_request_v4(&[4, 2, 0, 80, 1, 2, 3, 4, 0]),
            Err(Error::CommandNotSupported {
                cmd: Command::Bind
            })
        ));
        // user id never terminated
        assert!(matches!(
            interpret_request_v4(&[4, 1, 0, 80, 1, 2, 3, 4, b'b', b'o']),
            Err(Error::Truncated)
        ));
        // SOCKS4a host name never terminated
        assert!(matches!(
            interpret_request_v4(&[4, 1, 0, 80, 0, 0, 0, 1, 0, b'a']),
            Err(Error::Truncated)
        ));
        assert!(compose_request_v4(&Request::connect(ep("::1", 80))).is_err());
    }

    #[test]
    fn response_v4() {
        let granted = Response::new(Reply::Succeeded, Some(ep("10.1.2.3", 1080)));
        let buf = compose_response_v4(&granted);
        assert_eq!(buf, vec![0, 90, 0x4, 0x38, 10, 1, 2, 3]);
        assert_eq!(interpret_response_v4(&buf).unwrap(), granted);

        let refused = Response::new(Reply::ConnectionRefused, None);
        let buf = compose_response_v4(&refused);
        assert_eq!(buf, vec![0, 91, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            interpret_response_v4(&buf).unwrap(),
            Response::new(Reply::Failure, Some(ep("0.0.0.0", 0)))
        );
        assert!(interpret_response_v4(&[0, 92, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(interpret_response_v4(&[4, 90, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
