use std::{sync::Arc, time::Duration};

use futures::{SinkExt, Stream, StreamExt};
use shared::protocol::{handshake_request, split_handshake};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

use super::{
    channel::{HubChannel, Outbound},
    ConnectRequest, TransportKind,
};
use crate::error::TransportError;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

pub(crate) async fn connect(
    request: &ConnectRequest,
    invoke_timeout: Duration,
) -> Result<Arc<HubChannel>, TransportError> {
    let ws_url = websocket_url(&request.url, &request.access_token)?;
    let url_text = ws_url.to_string();

    let mut upgrade = url_text
        .as_str()
        .into_client_request()
        .map_err(|err| classify(&url_text, err))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", request.access_token))
        .map_err(|err| TransportError::Handshake(format!("invalid access token header: {err}")))?;
    upgrade.headers_mut().insert(AUTHORIZATION, bearer);

    let (stream, _) = connect_async(upgrade)
        .await
        .map_err(|err| classify(&url_text, err))?;
    let (mut writer, mut reader) = stream.split();

    let handshake =
        handshake_request().map_err(|err| TransportError::Protocol(err.to_string()))?;
    writer
        .send(Message::Text(handshake))
        .await
        .map_err(|err| classify(&url_text, err))?;
    let leftover = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut reader))
        .await
        .map_err(|_| TransportError::Handshake("timed out waiting for handshake".into()))??;
    debug!(url = %url_text, "hub: websocket handshake complete");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let channel = HubChannel::new(TransportKind::WebSockets, outbound_tx, invoke_timeout);

    let writer_channel = Arc::downgrade(&channel);
    tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let record = match outbound {
                Outbound::Record(record) => record,
                Outbound::Close => {
                    let _ = writer.send(Message::Close(None)).await;
                    break;
                }
            };
            if let Err(err) = writer.send(Message::Text(record)).await {
                warn!("hub: websocket send failed: {err}");
                if let Some(channel) = writer_channel.upgrade() {
                    channel.finish(Some(TransportError::Closed(err.to_string())));
                }
                break;
            }
        }
    });

    if !leftover.is_empty() {
        channel.handle_text(&leftover);
    }

    let reader_channel = Arc::clone(&channel);
    let reader_task = tokio::spawn(async move {
        let error = loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => reader_channel.handle_text(&text),
                Some(Ok(Message::Close(frame))) => {
                    break TransportError::Closed(
                        frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "websocket closed by hub".into()),
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break TransportError::Closed(err.to_string()),
                None => break TransportError::Closed("websocket stream ended".into()),
            }
        };
        reader_channel.finish(Some(error));
    });
    channel.attach_reader(reader_task);

    Ok(channel)
}

/// `http(s)` → `ws(s)`, with the token also carried as `access_token`.
pub(crate) fn websocket_url(url: &Url, access_token: &str) -> Result<Url, TransportError> {
    let mut ws_url = url.clone();
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::Unreachable {
                url: url.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            })
        }
    };
    ws_url
        .set_scheme(scheme)
        .map_err(|_| TransportError::Unreachable {
            url: url.to_string(),
            reason: format!("cannot switch scheme to {scheme}"),
        })?;
    if !access_token.is_empty() {
        ws_url
            .query_pairs_mut()
            .append_pair("access_token", access_token);
    }
    Ok(ws_url)
}

async fn read_handshake<S>(reader: &mut S) -> Result<String, TransportError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = reader.next().await {
        match message.map_err(|err| TransportError::Handshake(err.to_string()))? {
            Message::Text(text) => {
                let (response, rest) = split_handshake(&text)
                    .map_err(|err| TransportError::Handshake(err.to_string()))?;
                if let Some(error) = response.error {
                    return Err(TransportError::Handshake(error));
                }
                return Ok(rest.to_string());
            }
            Message::Close(_) => {
                return Err(TransportError::Handshake(
                    "hub closed the socket during handshake".into(),
                ))
            }
            _ => {}
        }
    }
    Err(TransportError::Handshake(
        "websocket ended during handshake".into(),
    ))
}

/// Uses the upgrade response status when there is one; never message text.
fn classify(url: &str, err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            TransportError::from_status(response.status().as_u16(), url)
        }
        other => TransportError::Unreachable {
            url: url.to_string(),
            reason: other.to_string(),
        },
    }
}
