use std::{sync::Arc, time::Duration};

use reqwest::{header::AUTHORIZATION, Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use shared::protocol::{handshake_request, split_handshake};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use super::{
    channel::{HubChannel, Outbound},
    ConnectRequest, TransportKind,
};
use crate::error::TransportError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default)]
    connection_token: Option<String>,
    #[serde(default)]
    available_transports: Vec<AvailableTransport>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailableTransport {
    transport: String,
}

pub(crate) async fn connect(
    http: &Client,
    request: &ConnectRequest,
    invoke_timeout: Duration,
) -> Result<Arc<HubChannel>, TransportError> {
    let base = http_url(&request.url)?;
    let token = request.access_token.clone();

    let negotiate_at = negotiate_url(&base);
    let response = authorized(http.post(negotiate_at.clone()), &token)
        .send()
        .await
        .map_err(|err| unreachable(&negotiate_at, err))?;
    let response = check_status(response, &negotiate_at)?;
    let negotiated: NegotiateResponse = response
        .json()
        .await
        .map_err(|err| TransportError::Protocol(format!("invalid negotiate response: {err}")))?;
    if let Some(error) = negotiated.error {
        return Err(TransportError::Handshake(error));
    }
    if !negotiated.available_transports.is_empty()
        && !negotiated
            .available_transports
            .iter()
            .any(|t| t.transport.eq_ignore_ascii_case("LongPolling"))
    {
        return Err(TransportError::Handshake(
            "hub does not offer long polling".into(),
        ));
    }
    let connection_token = negotiated
        .connection_token
        .or(negotiated.connection_id)
        .ok_or_else(|| TransportError::Protocol("negotiate response has no token".into()))?;

    let poll_url = connection_url(&base, &connection_token);
    debug!(url = %poll_url, "hub: long polling negotiated");

    let handshake =
        handshake_request().map_err(|err| TransportError::Protocol(err.to_string()))?;
    send_body(http, &poll_url, &token, handshake).await?;

    let leftover = match poll(http, &poll_url, &token).await? {
        Some(body) => {
            let (response, rest) = split_handshake(&body)
                .map_err(|err| TransportError::Handshake(err.to_string()))?;
            if let Some(error) = response.error {
                return Err(TransportError::Handshake(error));
            }
            rest.to_string()
        }
        None => {
            return Err(TransportError::Handshake(
                "hub closed the poll during handshake".into(),
            ))
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let channel = HubChannel::new(TransportKind::LongPolling, outbound_tx, invoke_timeout);

    let writer_channel = Arc::downgrade(&channel);
    let writer_http = http.clone();
    let writer_url = poll_url.clone();
    let writer_token = token.clone();
    tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Record(record) => {
                    if let Err(err) =
                        send_body(&writer_http, &writer_url, &writer_token, record).await
                    {
                        warn!("hub: long polling send failed: {err}");
                        if let Some(channel) = writer_channel.upgrade() {
                            channel.finish(Some(err));
                        }
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = authorized(writer_http.delete(writer_url.clone()), &writer_token)
                        .send()
                        .await;
                    break;
                }
            }
        }
    });

    if !leftover.is_empty() {
        channel.handle_text(&leftover);
    }

    let poller_channel = Arc::clone(&channel);
    let poller_http = http.clone();
    let poller = tokio::spawn(async move {
        let error = loop {
            match poll(&poller_http, &poll_url, &token).await {
                Ok(Some(body)) => {
                    if !body.is_empty() {
                        poller_channel.handle_text(&body);
                    }
                    if !poller_channel.is_open() {
                        return;
                    }
                }
                Ok(None) => break TransportError::Closed("hub ended the poll".into()),
                Err(err) => break err,
            }
        };
        poller_channel.finish(Some(error));
    });
    channel.attach_reader(poller);

    Ok(channel)
}

/// `GET` once; `None` when the hub reports the connection as closed.
async fn poll(http: &Client, url: &Url, token: &str) -> Result<Option<String>, TransportError> {
    let response = authorized(http.get(url.clone()), token)
        .send()
        .await
        .map_err(|err| unreachable(url, err))?;
    if response.status() == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let response = check_status(response, url)?;
    let body = response
        .text()
        .await
        .map_err(|err| TransportError::Closed(err.to_string()))?;
    Ok(Some(body))
}

async fn send_body(
    http: &Client,
    url: &Url,
    token: &str,
    body: String,
) -> Result<(), TransportError> {
    let response = authorized(http.post(url.clone()), token)
        .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
        .body(body)
        .send()
        .await
        .map_err(|err| unreachable(url, err))?;
    check_status(response, url)?;
    Ok(())
}

fn authorized(builder: RequestBuilder, token: &str) -> RequestBuilder {
    if token.is_empty() {
        builder
    } else {
        builder.header(AUTHORIZATION, format!("Bearer {token}"))
    }
}

fn check_status(
    response: reqwest::Response,
    url: &Url,
) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(TransportError::from_status(status.as_u16(), url.as_str()))
    }
}

fn unreachable(url: &Url, err: reqwest::Error) -> TransportError {
    match err.status() {
        Some(status) => TransportError::from_status(status.as_u16(), url.as_str()),
        None => TransportError::Unreachable {
            url: url.to_string(),
            reason: err.to_string(),
        },
    }
}

fn http_url(url: &Url) -> Result<Url, TransportError> {
    let scheme = match url.scheme() {
        "https" | "wss" => "https",
        "http" | "ws" => "http",
        other => {
            return Err(TransportError::Unreachable {
                url: url.to_string(),
                reason: format!("unsupported scheme '{other}'"),
            })
        }
    };
    let mut converted = url.clone();
    converted
        .set_scheme(scheme)
        .map_err(|_| TransportError::Unreachable {
            url: url.to_string(),
            reason: format!("cannot switch scheme to {scheme}"),
        })?;
    Ok(converted)
}

/// `<hub path>/negotiate?<original query>&negotiateVersion=1`
pub(crate) fn negotiate_url(url: &Url) -> Url {
    let mut negotiate = url.clone();
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    negotiate.set_path(&path);
    negotiate
        .query_pairs_mut()
        .append_pair("negotiateVersion", "1");
    negotiate
}

pub(crate) fn connection_url(url: &Url, connection_token: &str) -> Url {
    let mut connection = url.clone();
    connection
        .query_pairs_mut()
        .append_pair("id", connection_token);
    connection
}
