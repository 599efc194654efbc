//! Tunnel server functions: domain decoding, URL construction, and a
//! WebSocket transport.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderValue, Uri},
        Message,
    },
};

use crate::{crypto::compute_sha256, error::CableError, session::Transport, RoutingId, TunnelId};

/// Well-known domains.
///
/// Source: <https://source.chromium.org/chromium/chromium/src/+/main:device/fido/cable/v2_handshake.cc;l=123-125;drc=6767131b3528fefd866f604b32ebbb278c35d395>
const ASSIGNED_DOMAINS: [&str; 2] = [
    // Google
    "cable.ua5v.com",
    // Apple
    "cable.auth.com",
];

const TUNNEL_SERVER_SALT: &[u8] = "caBLEv2 tunnel server domain\0\0\0".as_bytes();
const TUNNEL_SERVER_ID_OFFSET: usize = TUNNEL_SERVER_SALT.len() - 3;
const TUNNEL_SERVER_TLDS: [&str; 4] = [".com", ".org", ".net", ".info"];
const BASE32_CHARS: &[u8] = "abcdefghijklmnopqrstuvwxyz234567".as_bytes();

const BASE64URL: base64::Config = base64::Config::new(base64::CharacterSet::UrlSafe, false);

/// Decodes a `domain_id` into an actual domain name.
///
/// IDs below 256 index the assigned-domain table; higher IDs are hashed
/// into a deterministic `cable.<base32>.<tld>` name, so every 16-bit value
/// above the assigned range is a valid (if not necessarily registered)
/// tunnel server.
pub fn get_domain(domain_id: u16) -> Option<String> {
    if domain_id < 256 {
        return ASSIGNED_DOMAINS.get(usize::from(domain_id)).map(|d| d.to_string());
    }

    let mut buf = TUNNEL_SERVER_SALT.to_vec();
    buf[TUNNEL_SERVER_ID_OFFSET..TUNNEL_SERVER_ID_OFFSET + 2]
        .copy_from_slice(&domain_id.to_le_bytes());
    let digest = compute_sha256(&buf);
    let mut result = u64::from_le_bytes(digest[..8].try_into().ok()?);

    let tld = TUNNEL_SERVER_TLDS[(result & 3) as usize];

    let mut o = String::from("cable.");
    result >>= 2;
    while result != 0 {
        o.push(char::from_u32(BASE32_CHARS[(result & 31) as usize].into())?);
        result >>= 5;
    }
    o.push_str(tld);

    Some(o)
}

/// Builds the WebSocket URL a QR-initiated session connects to.
pub fn get_connect_uri(
    tunnel_server_id: u16,
    routing_id: &RoutingId,
    tunnel_id: &TunnelId,
) -> Option<Uri> {
    get_domain(tunnel_server_id).and_then(|domain| {
        let routing_id = hex::encode_upper(routing_id);
        let tunnel_id = hex::encode_upper(tunnel_id);

        Uri::builder()
            .scheme("wss")
            .authority(domain)
            .path_and_query(format!("/cable/connect/{}/{}", routing_id, tunnel_id))
            .build()
            .ok()
    })
}

/// Builds the WebSocket URL a state-assisted session connects to, from the
/// contact ID the tunnel server issued us.
pub fn get_contact_uri(tunnel_server_id: u16, contact_id: &[u8]) -> Option<Uri> {
    get_domain(tunnel_server_id).and_then(|domain| {
        let contact_id = base64::encode_config(contact_id, BASE64URL);
        Uri::builder()
            .scheme("wss")
            .authority(domain)
            .path_and_query(format!("/cable/contact/{}", contact_id))
            .build()
            .ok()
    })
}

/// A WebSocket connection to a caBLE tunnel server.
///
/// Outbound frames go through an unbounded channel, so [Transport::send] is
/// synchronous and never blocks the [Session][crate::session::Session]
/// dispatcher; a background task pumps them into the socket. Inbound frames
/// are read with [recv][Self::recv] and fed to the dispatcher by the
/// caller.
pub struct Tunnel {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Tunnel {
    pub async fn connect(uri: &Uri) -> Result<Self, CableError> {
        let mut request = IntoClientRequest::into_client_request(uri)
            .map_err(|_| CableError::Transport)?;

        let headers = request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("fido.cable"),
        );
        let origin = format!("wss://{}", uri.host().unwrap_or_default());
        headers.insert(
            "Origin",
            HeaderValue::from_str(&origin).map_err(|_| CableError::Transport)?,
        );

        trace!(?request);
        let (stream, response) = connect_async(request).await.map_err(|e| {
            error!("websocket error: {:?}", e);
            CableError::Transport
        })?;
        trace!(?response);

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (tx, mut outbound) = mpsc::unbounded_channel::<Message>();
        let (inbound, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_tx.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Binary(b)) => {
                        if inbound.send(b).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            // dropping `inbound` signals closure to the reader
        });

        Ok(Self { tx, rx })
    }

    /// Receives the next binary frame, or `None` once the tunnel closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Transport for Tunnel {
    fn send(&mut self, frame: Vec<u8>) -> Result<(), CableError> {
        self.tx
            .send(Message::Binary(frame))
            .map_err(|_| CableError::Transport)
    }

    fn close(&mut self) -> Result<(), CableError> {
        self.tx
            .send(Message::Close(None))
            .map_err(|_| CableError::Transport)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn check_known_tunnel_server_domains() {
        assert_eq!(get_domain(0), Some(String::from("cable.ua5v.com")));
        assert_eq!(get_domain(1), Some(String::from("cable.auth.com")));
        assert_eq!(
            get_domain(266),
            Some(String::from("cable.wufkweyy3uaxb.com"))
        );

        assert_eq!(get_domain(255), None);

        // 🦀 = \u{1f980}
        assert_eq!(
            get_domain(0xf980),
            Some(String::from("cable.my4kstlhndi4c.net"))
        )
    }

    #[test]
    fn check_all_hashed_tunnel_servers() {
        for x in 256..u16::MAX {
            assert_ne!(get_domain(x), None);
        }
    }

    #[test]
    fn connect_uri_format() {
        let uri = get_connect_uri(0, &[0xab, 0xcd, 0xef], &[0x01; 16]).unwrap();
        assert_eq!(
            uri.to_string(),
            "wss://cable.ua5v.com/cable/connect/ABCDEF/01010101010101010101010101010101"
        );

        // unknown tunnel server
        assert!(get_connect_uri(200, &[0; 3], &[0; 16]).is_none());
    }

    #[test]
    fn contact_uri_format() {
        let uri = get_contact_uri(1, &[0xfb, 0xef, 0xff]).unwrap();
        // urlsafe base64, no padding
        assert_eq!(uri.to_string(), "wss://cable.auth.com/cable/contact/--__");
    }
}
