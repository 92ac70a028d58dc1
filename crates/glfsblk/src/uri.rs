//! Image location parsing.
//!
//! ```text
//! gluster[+transport]://[server[:port]]/volname/image[?socket=...]
//! ```
//!
//! `transport` is one of `tcp`, `unix` or `rdma` and defaults to `tcp`.
//! `server` is a host name, an IPv4 address or a bracketed IPv6 address and
//! defaults to `localhost`; a missing port is handed to the client library as 0,
//! which selects its default. The unix transport takes no server or port and
//! names the glusterd socket with a single `socket` query parameter instead.
//! `volname` is the gluster volume and `image` the path of the disk image inside
//! it, which may contain further slashes.
//!
//! Examples:
//!
//! ```text
//! gluster://1.2.3.4/testvol/a.img
//! gluster+tcp://1.2.3.4:24007/testvol/dir/a.img
//! gluster+tcp://[1:2:3:4:5:6:7:8]:24007/testvol/dir/a.img
//! gluster+tcp://server.domain.com:24007/testvol/dir/a.img
//! gluster+unix:///testvol/dir/a.img?socket=/tmp/glusterd.socket
//! gluster+rdma://1.2.3.4:24007/testvol/a.img
//! ```

use core::fmt;
use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::error::{GlusterError, Result};

/// Host used when the location names no server.
pub const DEFAULT_HOST: &str = "localhost";

/// Transport used to reach the volfile server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// TCP/IP.
    Tcp,
    /// UNIX domain socket.
    Unix,
    /// RDMA.
    Rdma,
}

impl Transport {
    /// Name the client library expects.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Unix => "unix",
            Transport::Rdma => "rdma",
        }
    }

    /// Explicit URI scheme for this transport.
    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Tcp => "gluster+tcp",
            Transport::Unix => "gluster+unix",
            Transport::Rdma => "gluster+rdma",
        }
    }

    /// Maps a URI scheme to a transport. A missing scheme means TCP.
    pub fn from_scheme(scheme: Option<&str>) -> Option<Transport> {
        match scheme {
            None | Some("gluster") | Some("gluster+tcp") => Some(Transport::Tcp),
            Some("gluster+unix") => Some(Transport::Unix),
            Some("gluster+rdma") => Some(Transport::Rdma),
            Some(_) => None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the volfile server lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum GlusterServer {
    /// TCP endpoint.
    Tcp {
        /// Host name or address, IPv6 without brackets.
        host: String,
        /// Port, 0 for the library default.
        port: u16,
    },
    /// RDMA endpoint.
    Rdma {
        /// Host name or address, IPv6 without brackets.
        host: String,
        /// Port, 0 for the library default.
        port: u16,
    },
    /// Local glusterd socket.
    Unix {
        /// Path of the UNIX domain socket.
        socket: String,
    },
}

impl GlusterServer {
    /// Transport of this endpoint.
    pub fn transport(&self) -> Transport {
        match self {
            GlusterServer::Tcp { .. } => Transport::Tcp,
            GlusterServer::Rdma { .. } => Transport::Rdma,
            GlusterServer::Unix { .. } => Transport::Unix,
        }
    }

    /// The `host` argument for `glfs_set_volfile_server`: the host, or the
    /// socket path for the unix transport.
    pub fn host(&self) -> &str {
        match self {
            GlusterServer::Tcp { host, .. } | GlusterServer::Rdma { host, .. } => host,
            GlusterServer::Unix { socket } => socket,
        }
    }

    /// The port argument; always 0 for the unix transport.
    pub fn port(&self) -> u16 {
        match self {
            GlusterServer::Tcp { port, .. } | GlusterServer::Rdma { port, .. } => *port,
            GlusterServer::Unix { .. } => 0,
        }
    }
}

/// Parsed image location: volfile server, volume and image path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlusterConf {
    /// Volfile server endpoint.
    pub server: GlusterServer,
    /// Volume name, never empty and never containing `/`.
    pub volname: String,
    /// Image path inside the volume, never empty and never starting with `/`.
    pub image: String,
}

impl GlusterConf {
    /// Builds a descriptor, checking the volume and image invariants.
    pub fn new(server: GlusterServer, volname: &str, image: &str) -> Result<Self> {
        if volname.is_empty() || volname.contains('/') {
            return Err(GlusterError::invalid_uri(
                volname,
                "volume name must be non-empty and free of '/'",
            ));
        }
        if image.is_empty() || image.starts_with('/') {
            return Err(GlusterError::invalid_uri(
                image,
                "image path must be non-empty and relative to the volume",
            ));
        }
        match &server {
            GlusterServer::Unix { socket } if socket.is_empty() => {
                return Err(GlusterError::invalid_uri(socket, "socket path is empty"));
            }
            GlusterServer::Tcp { host, .. } | GlusterServer::Rdma { host, .. } => {
                if host.is_empty() {
                    return Err(GlusterError::invalid_uri(host, "server host is empty"));
                }
                if host.contains(':') && !is_address_literal(host) {
                    return Err(GlusterError::invalid_uri(
                        host,
                        "malformed IPv6 address literal",
                    ));
                }
            }
            GlusterServer::Unix { .. } => {}
        }
        Ok(Self {
            server,
            volname: volname.to_string(),
            image: image.to_string(),
        })
    }

    /// Transport of the volfile server.
    pub fn transport(&self) -> Transport {
        self.server.transport()
    }

    /// Canonical location string. Parsing it yields an equal descriptor.
    pub fn to_uri(&self) -> String {
        let mut uri = String::from(self.transport().scheme());
        uri.push_str("://");
        match &self.server {
            GlusterServer::Tcp { host, port } | GlusterServer::Rdma { host, port } => {
                if host.contains(':') {
                    uri.push('[');
                    uri.push_str(host);
                    uri.push(']');
                } else {
                    uri.push_str(&urlencoding::encode(host));
                }
                if *port != 0 {
                    uri.push(':');
                    uri.push_str(&port.to_string());
                }
            }
            GlusterServer::Unix { .. } => {}
        }
        uri.push('/');
        uri.push_str(&urlencoding::encode(&self.volname));
        uri.push('/');
        let segments: Vec<Cow<'_, str>> = self.image.split('/').map(urlencoding::encode).collect();
        uri.push_str(&segments.join("/"));
        if let GlusterServer::Unix { socket } = &self.server {
            uri.push_str("?socket=");
            uri.push_str(&urlencoding::encode(socket));
        }
        uri
    }
}

impl fmt::Display for GlusterConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

/// Generic URI components, not yet decoded.
#[derive(Debug, PartialEq, Eq)]
struct RawUri<'a> {
    scheme: Option<&'a str>,
    authority: Option<&'a str>,
    path: &'a str,
    query: Option<&'a str>,
}

fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn split_uri(s: &str) -> RawUri<'_> {
    let s = s.split_once('#').map_or(s, |(before, _)| before);

    let (scheme, rest) = match s.split_once(':') {
        Some((scheme, rest)) if is_scheme(scheme) => (Some(scheme), rest),
        _ => (None, s),
    };

    let (hier, query) = match rest.split_once('?') {
        Some((hier, query)) => (hier, Some(query)),
        None => (rest, None),
    };

    let (authority, path) = match hier.strip_prefix("//") {
        Some(after) => match after.find('/') {
            Some(idx) => (Some(&after[..idx]), &after[idx..]),
            None => (Some(after), ""),
        },
        None => (None, hier),
    };

    RawUri {
        scheme,
        authority,
        path,
        query,
    }
}

fn decode(s: &str) -> std::result::Result<String, &'static str> {
    urlencoding::decode(s)
        .map(Cow::into_owned)
        .map_err(|_| "percent-encoding does not decode to UTF-8")
}

/// Characters allowed between the brackets of an address literal.
fn is_address_literal(host: &str) -> bool {
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.')
}

/// Splits `[userinfo@]host[:port]`. User info is ignored.
fn split_authority(
    authority: &str,
) -> std::result::Result<(Option<String>, Option<u16>), &'static str> {
    let hostport = authority.rsplit_once('@').map_or(authority, |(_, h)| h);

    let bracketed = hostport.starts_with('[');
    let (host, port) = if let Some(rest) = hostport.strip_prefix('[') {
        let (literal, after) = rest
            .split_once(']')
            .ok_or("unterminated IPv6 address literal")?;
        if literal.is_empty() {
            return Err("empty IPv6 address literal");
        }
        let port = match after {
            "" => None,
            _ => Some(after.strip_prefix(':').ok_or("unexpected text after IPv6 address")?),
        };
        if literal.contains(['[', ']']) {
            return Err("malformed IPv6 address literal");
        }
        (literal, port)
    } else {
        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (hostport, None),
        };
        if host.contains([':', '[', ']']) {
            return Err("malformed server address");
        }
        (host, port)
    };

    let port = match port {
        None | Some("") => None,
        Some(p) => {
            if !p.bytes().all(|b| b.is_ascii_digit()) {
                return Err("port is not a number");
            }
            Some(p.parse::<u16>().map_err(|_| "port out of range")?)
        }
    };

    let host = match host {
        "" => None,
        h => {
            let h = decode(h)?;
            if bracketed && !is_address_literal(&h) {
                return Err("malformed IPv6 address literal");
            }
            if !bracketed && h.contains(':') {
                return Err("malformed server address");
            }
            Some(h)
        }
    };

    Ok((host, port))
}

/// Splits `/volname/image...` into its two parts.
fn parse_volume_options(path: &str) -> std::result::Result<(String, String), &'static str> {
    let path = path.trim_start_matches('/');
    let (volname, image) = path.split_once('/').ok_or("missing volume name or image path")?;
    if volname.is_empty() {
        return Err("missing volume name");
    }
    let image = image.trim_start_matches('/');
    if image.is_empty() {
        return Err("missing image path");
    }
    Ok((volname.to_string(), image.to_string()))
}

/// Parses `name=value` pairs separated by `&` or `;`. Empty pairs are skipped;
/// a pair without `=` has no value.
fn parse_query(
    query: Option<&str>,
) -> std::result::Result<Vec<(String, Option<String>)>, &'static str> {
    let mut params = Vec::new();
    let Some(query) = query else {
        return Ok(params);
    };
    for pair in query.split(['&', ';']) {
        if pair.is_empty() {
            continue;
        }
        let param = match pair.split_once('=') {
            Some((name, value)) => (decode(name)?, Some(decode(value)?)),
            None => (decode(pair)?, None),
        };
        params.push(param);
    }
    Ok(params)
}

/// Parses an image location into a [`GlusterConf`].
///
/// Any malformed input yields [`GlusterError::InvalidUri`]; the parser never panics.
pub fn parse_uri(filename: &str) -> Result<GlusterConf> {
    let invalid = |reason: &str| GlusterError::invalid_uri(filename, reason);

    let raw = split_uri(filename);

    let transport = Transport::from_scheme(raw.scheme)
        .ok_or_else(|| invalid("unknown transport scheme"))?;

    let path = decode(raw.path).map_err(invalid)?;
    let (volname, image) = parse_volume_options(&path).map_err(invalid)?;

    let params = parse_query(raw.query).map_err(invalid)?;

    let server = match transport {
        Transport::Unix => {
            if raw.authority.is_some_and(|a| !a.is_empty()) {
                return Err(invalid("unix transport takes no server or port"));
            }
            let [(name, value)] = params.as_slice() else {
                return Err(invalid("unix transport requires exactly one 'socket' parameter"));
            };
            if name != "socket" {
                return Err(invalid("unix transport requires exactly one 'socket' parameter"));
            }
            match value {
                Some(socket) if !socket.is_empty() => GlusterServer::Unix {
                    socket: socket.clone(),
                },
                _ => return Err(invalid("socket path is empty")),
            }
        }
        Transport::Tcp | Transport::Rdma => {
            if !params.is_empty() {
                return Err(invalid("query parameters are only valid with the unix transport"));
            }
            let (host, port) = match raw.authority {
                Some(authority) => split_authority(authority).map_err(invalid)?,
                None => (None, None),
            };
            let host = host.unwrap_or_else(|| DEFAULT_HOST.to_string());
            let port = port.unwrap_or(0);
            if transport == Transport::Tcp {
                GlusterServer::Tcp { host, port }
            } else {
                GlusterServer::Rdma { host, port }
            }
        }
    };

    Ok(GlusterConf {
        server,
        volname,
        image,
    })
}
