//! WebSocket 传输
//!
//! 建连后由一个后台任务在链路与 socket 之间双向转发 JSON 文本帧。

use application::{ChannelLink, Connector, Credential, LinkEndpoint, LinkEvent, TransportError};
use async_trait::async_trait;
use domain::{DisconnectReason, InboundEvent, TransportKind};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::connector::ServerEndpoint;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketConnector {
    endpoint: ServerEndpoint,
}

impl WebSocketConnector {
    pub fn new(endpoint: ServerEndpoint) -> Self {
        Self { endpoint }
    }
}

fn map_connect_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 {
                TransportError::Unauthorized(format!("HTTP {status}"))
            } else {
                TransportError::rejected(TransportKind::WebSocket, format!("HTTP {status}"))
            }
        }
        WsError::Io(err) => TransportError::Unreachable(err.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(
        &self,
        _transport: TransportKind,
        credential: &Credential,
    ) -> Result<ChannelLink, TransportError> {
        let mut url = Url::parse(&self.endpoint.ws_url("/ws"))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        url.query_pairs_mut().append_pair("token", credential.token());
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.token()))
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (socket, _response) = connect_async(request).await.map_err(map_connect_error)?;
        info!("WebSocket 传输已建立");

        let (link, endpoint) = ChannelLink::pair();
        tokio::spawn(pump(socket, endpoint));
        Ok(link)
    }
}

/// 在 socket 与链路端点之间转发，直到任一侧关闭
async fn pump(socket: Socket, endpoint: LinkEndpoint) {
    let (mut sink, mut stream) = socket.split();
    let LinkEndpoint {
        mut outbound,
        inbound,
    } = endpoint;
    let close = |reason| {
        let _ = inbound.send(LinkEvent::Closed(reason));
    };

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "上行事件序列化失败");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::text(text)).await {
                        warn!(error = %err, "WebSocket 写入失败");
                        close(DisconnectReason::TransportError);
                        break;
                    }
                }
                None => {
                    // 通道侧放弃了链路
                    let _ = sink.send(Message::Close(None)).await;
                    debug!("本地关闭 WebSocket");
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<InboundEvent>(&text) {
                        Ok(event) => {
                            if inbound.send(LinkEvent::Event(event)).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "无法解析的服务端事件"),
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    close(DisconnectReason::ServerClosed);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "WebSocket 读取失败");
                    close(DisconnectReason::TransportError);
                    break;
                }
                None => {
                    close(DisconnectReason::TransportClosed);
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::ClientEvent;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, ServerEndpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, ServerEndpoint::new(format!("http://{addr}")))
    }

    #[tokio::test]
    async fn relays_events_both_ways_and_reports_server_close() {
        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::text(r#"{"event":"notification_update"}"#))
                .await
                .unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            ws.close(None).await.unwrap();
            reply.into_text().unwrap().to_string()
        });

        let connector = WebSocketConnector::new(endpoint);
        let mut link = connector
            .open(TransportKind::WebSocket, &Credential::new("t"))
            .await
            .unwrap();

        assert_eq!(
            link.inbound.recv().await,
            Some(LinkEvent::Event(InboundEvent::NotificationUpdate))
        );
        link.outbound.send(ClientEvent::Pong).unwrap();

        assert_eq!(server.await.unwrap(), r#"{"event":"pong"}"#);
        assert_eq!(
            link.inbound.recv().await,
            Some(LinkEvent::Closed(DisconnectReason::ServerClosed))
        );
    }

    #[tokio::test]
    async fn token_is_encoded_in_the_upgrade_query() {
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

        let (listener, endpoint) = listener().await;
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut seen = None;
            let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                seen = request.uri().query().map(str::to_owned);
                Ok(response)
            };
            let ws = tokio_tungstenite::accept_hdr_async(stream, capture)
                .await
                .unwrap();
            drop(ws);
            seen
        });

        let _link = WebSocketConnector::new(endpoint)
            .open(TransportKind::WebSocket, &Credential::new("a+b c&d"))
            .await
            .unwrap();

        assert_eq!(server.await.unwrap().as_deref(), Some("token=a%2Bb+c%26d"));
    }

    #[tokio::test]
    async fn unauthorized_upgrade_is_an_auth_error() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
            stream
                .write_all(b"HTTP/1.1 401 Unauthorized\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let err = WebSocketConnector::new(endpoint)
            .open(TransportKind::WebSocket, &Credential::new("bad"))
            .await
            .err()
            .unwrap();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn refused_upgrade_is_a_rejection() {
        let (listener, endpoint) = listener().await;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let err = WebSocketConnector::new(endpoint)
            .open(TransportKind::WebSocket, &Credential::new("t"))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            TransportError::Rejected {
                transport: TransportKind::WebSocket,
                ..
            }
        ));
    }
}
