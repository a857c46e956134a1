//! SOCKS5 tunnel (RFC 1928, RFC 1929)
//!
//! One quirk is kept for compatibility with the proxies this client has
//! historically been pointed at: the CONNECT command always uses address
//! type DOMAIN carrying the destination IP's text form, never the IPV4 or
//! IPV6 address types. Non-idiomatic, but widely accepted.

use crate::error::{Error, Result};
use crate::options::ProxyOptions;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NONE: u8 = 0x00;
const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

fn reply_error(code: u8) -> Error {
    let text = match code {
        0x01 => "General SOCKS server failure",
        0x02 => "Connection not allowed by ruleset",
        0x03 => "Network unreachable",
        0x04 => "Host unreachable",
        0x05 => "Connection refused",
        0x06 => "TTL expired",
        0x07 => "Command not supported",
        0x08 => "Address type not supported",
        _ => "Unknown SOCKS error",
    };
    Error::Proxy(format!("{text} (code {code})"))
}

/// Open a TCP connection to `dest` through the configured SOCKS5 proxy.
pub async fn connect_through(
    options: &ProxyOptions,
    dest: SocketAddr,
    keep_alive: bool,
) -> Result<TcpStream> {
    options.validate()?;

    let proxy_addr = lookup_host((options.address.as_str(), options.port))
        .await
        .map_err(|e| Error::Proxy(format!("proxy address lookup failed: {e}")))?
        .next()
        .ok_or_else(|| Error::Proxy("proxy address resolved to nothing".into()))?;

    let socket = match proxy_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if keep_alive {
        socket.set_keepalive(true)?;
    }
    let mut stream = socket.connect(proxy_addr).await.map_err(|e| Error::Connect {
        addr: proxy_addr,
        source: e,
    })?;

    negotiate(&mut stream, options, dest).await?;
    debug!(proxy = %proxy_addr, dest = %dest, "proxy tunnel established");
    Ok(stream)
}

async fn negotiate(
    stream: &mut TcpStream,
    options: &ProxyOptions,
    dest: SocketAddr,
) -> Result<()> {
    // method selection
    let with_credentials = options.username.is_some();
    let greeting: &[u8] = if with_credentials {
        &[SOCKS_VERSION, 2, METHOD_NONE, METHOD_USERNAME_PASSWORD]
    } else {
        &[SOCKS_VERSION, 1, METHOD_NONE]
    };
    stream.write_all(greeting).await?;

    let mut chosen = [0u8; 2];
    stream.read_exact(&mut chosen).await?;
    if chosen[0] != SOCKS_VERSION {
        return Err(Error::Proxy(format!(
            "unexpected SOCKS version {}",
            chosen[0]
        )));
    }
    match chosen[1] {
        METHOD_NONE => {}
        METHOD_USERNAME_PASSWORD if with_credentials => {
            authenticate(stream, options).await?;
        }
        METHOD_UNACCEPTABLE => {
            return Err(Error::Proxy("no acceptable authentication method".into()))
        }
        other => return Err(Error::Proxy(format!("unsupported method {other}"))),
    }

    // CONNECT, destination as DOMAIN text
    let host = dest.ip().to_string();
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&dest.port().to_be_bytes());
    stream.write_all(&request).await?;

    // reply header
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Error::Proxy(format!(
            "unexpected SOCKS version {} in reply",
            header[0]
        )));
    }
    if header[1] != 0x00 {
        return Err(reply_error(header[1]));
    }

    // bound address, by type
    match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            if len[0] == 0xFF {
                return Err(Error::Proxy("bound domain length out of range".into()));
            }
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
        }
        other => {
            return Err(Error::Proxy(format!("unknown bound address type {other}")));
        }
    }
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    Ok(())
}

async fn authenticate(stream: &mut TcpStream, options: &ProxyOptions) -> Result<()> {
    let username = options.username.as_deref().unwrap_or_default();
    let password = options.password.as_deref().unwrap_or_default();

    let mut request = Vec::with_capacity(3 + username.len() + password.len());
    request.push(AUTH_VERSION);
    request.push(username.len() as u8);
    request.extend_from_slice(username.as_bytes());
    request.push(password.len() as u8);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Error::Proxy("authentication failed".into()));
    }
    Ok(())
}
