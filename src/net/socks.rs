//! Unauthenticated SOCKS5 client handshake (RFC 1928).

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::TransportError;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// The RFC 1928 reply-code message table. The status is the second byte of
/// the reply (index 1, not the reserved byte at index 2).
pub fn socks_reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "Network unreachable",
        0x04 => "Host unreachable",
        0x05 => "Connection refused",
        0x06 => "TTL expired",
        0x07 => "Command not supported",
        0x08 => "Address type not supported",
        _ => "Unknown SOCKS error",
    }
}

/// Run the handshake on a freshly connected proxy socket, asking the proxy
/// to connect onwards to `host:port` by domain name.
pub(crate) async fn tunnel(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
) -> Result<(), TransportError> {
    if host.len() > 255 {
        return Err(TransportError::SocksProtocol(
            "host name too long for a SOCKS request".to_owned(),
        ));
    }

    // method negotiation: offer only NO AUTHENTICATION
    stream
        .write_all(&[VERSION, 1, NO_AUTH])
        .await
        .map_err(TransportError::WriteFailed)?;
    let mut method = [0u8; 2];
    stream
        .read_exact(&mut method)
        .await
        .map_err(TransportError::ReadFailed)?;
    if method != [VERSION, NO_AUTH] {
        return Err(TransportError::SocksProtocol(format!(
            "server selected unsupported method {:#04x}/{:#04x}",
            method[0], method[1]
        )));
    }

    // connect request with the target spelled as a domain name
    let mut request = vec![VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream
        .write_all(&request)
        .await
        .map_err(TransportError::WriteFailed)?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .map_err(TransportError::ReadFailed)?;
    if head[0] != VERSION {
        return Err(TransportError::SocksProtocol(format!(
            "unexpected reply version {:#04x}",
            head[0]
        )));
    }
    if head[1] != 0x00 {
        return Err(TransportError::SocksFailed { code: head[1] });
    }

    // consume the bound address so the tunnel starts at a frame boundary
    let addr_len = match head[3] {
        ATYP_IPV4 => 4usize,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(TransportError::ReadFailed)?;
            len[0] as usize
        }
        other => {
            return Err(TransportError::SocksProtocol(format!(
                "unexpected address type {other:#04x}"
            )))
        }
    };
    let mut remainder = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut remainder)
        .await
        .map_err(TransportError::ReadFailed)?;
    Ok(())
}
