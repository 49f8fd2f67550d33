//! HTTP session-gateway transport
//!
//! The gateway fronts the media server: it allocates a session for the
//! caller, relays agent data-channel traffic and track state over SSE, and
//! accepts control requests (mute, interrupt, ping) for the session.

use crate::{
    error::{Error, Result, TransportErrorKind},
    stream::RawEvent,
    types::{ConnectConfig, Connection, ConnectionHandle},
};
use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::Transport;

/// Transport backed by an HTTP session gateway
pub struct GatewayTransport {
    client: reqwest::Client,
}

impl GatewayTransport {
    /// Create a new gateway transport
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create with a preconfigured HTTP client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn authorized(
        &self,
        builder: reqwest::RequestBuilder,
        token: Option<&str>,
        headers: Option<&HeaderMap>,
    ) -> reqwest::RequestBuilder {
        let mut builder = builder;
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(headers) = headers {
            builder = builder.headers(headers.clone());
        }
        builder
    }

    async fn post_control(
        &self,
        handle: &ConnectionHandle,
        path: &str,
        body: serde_json::Value,
    ) -> Result<()> {
        let url = format!("{}/{}", handle.endpoint(), path);
        let response = self
            .authorized(self.client.post(&url), handle.token(), None)
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

impl Default for GatewayTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for GatewayTransport {
    async fn connect(&self, config: &ConnectConfig) -> Result<Connection> {
        let base = config.url.trim_end_matches('/');
        if base.is_empty() {
            return Err(Error::Unsupported("gateway URL is not configured".into()));
        }
        let headers = header_map(&config.headers)?;

        let response = self
            .authorized(
                self.client.post(format!("{}/sessions", base)),
                config.token.as_deref(),
                Some(&headers),
            )
            .json(&CreateSessionRequest {
                room: &config.room,
                identity: &config.identity,
            })
            .send()
            .await?;
        let created: CreateSessionResponse = check_status(response).await?.json().await?;

        let endpoint = format!("{}/sessions/{}", base, created.connection_id);
        let request = self.authorized(
            self.client.get(format!("{}/events", endpoint)),
            config.token.as_deref(),
            Some(&headers),
        );
        let event_source = EventSource::new(request)
            .map_err(|e| Error::Unsupported(format!("Failed to create event source: {}", e)))?;

        tracing::debug!("Gateway session {} created", created.connection_id);

        Ok(Connection {
            handle: ConnectionHandle::new(created.connection_id, endpoint, config.token.clone()),
            events: Box::pin(create_stream(event_source)),
        })
    }

    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<()> {
        let response = self
            .authorized(self.client.delete(handle.endpoint()), handle.token(), None)
            .send()
            .await?;
        // Already gone is as good as closed
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    async fn mute_mic(&self, handle: &ConnectionHandle, muted: bool) -> Result<()> {
        self.post_control(handle, "mic", serde_json::json!({ "muted": muted }))
            .await
    }

    async fn interrupt_playback(&self, handle: &ConnectionHandle) -> Result<()> {
        self.post_control(handle, "interrupt", serde_json::json!({}))
            .await
    }

    async fn probe(&self, handle: &ConnectionHandle) -> Result<Duration> {
        let started = Instant::now();
        let response = self
            .authorized(
                self.client.get(format!("{}/ping", handle.endpoint())),
                handle.token(),
                None,
            )
            .send()
            .await?;
        check_status(response).await?;
        Ok(started.elapsed())
    }
}

/// Validate the extra gateway headers; a header that cannot be sent is a
/// configuration error, not something to skip
fn header_map(headers: &std::collections::HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = key
            .parse::<HeaderName>()
            .map_err(|e| Error::Unsupported(format!("Invalid header name '{}': {}", key, e)))?;
        let value = value
            .parse::<HeaderValue>()
            .map_err(|e| Error::Unsupported(format!("Invalid value for header '{}': {}", key, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::from_status(status.as_u16(), body))
}

/// Create the raw event stream from SSE events.
///
/// The stream ends after the first disconnect; reconnecting is the session
/// layer's decision, not the event source's.
fn create_stream(mut event_source: EventSource) -> impl futures::Stream<Item = RawEvent> {
    stream! {
        while let Some(event_result) = event_source.next().await {
            match event_result {
                Ok(Event::Open) => {
                    yield RawEvent::connected();
                }
                Ok(Event::Message(message)) => {
                    yield raw_event_from_sse(&message.event, message.data);
                }
                Err(reqwest_eventsource::Error::StreamEnded) => {
                    yield RawEvent::disconnected(TransportErrorKind::Network, "event stream ended");
                    break;
                }
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, _)) => {
                    let error = Error::from_status(status.as_u16(), "");
                    yield RawEvent::disconnected(error.kind(), error.to_string());
                    break;
                }
                Err(reqwest_eventsource::Error::InvalidContentType(value, _)) => {
                    yield RawEvent::disconnected(
                        TransportErrorKind::Unsupported,
                        format!("unexpected content type {:?}", value),
                    );
                    break;
                }
                Err(e) => {
                    yield RawEvent::disconnected(TransportErrorKind::Network, e.to_string());
                    break;
                }
            }
        }
        event_source.close();
    }
}

/// Map one SSE message onto a raw event.
///
/// Payloads that do not match their event name are passed through as data
/// messages so the normalizer can report them.
pub(crate) fn raw_event_from_sse(event: &str, data: String) -> RawEvent {
    let parsed = match event {
        "audio_started" => serde_json::from_str::<TrackPayload>(&data)
            .ok()
            .map(|p| RawEvent::RemoteAudioStarted { track_id: p.track_id }),
        "audio_stopped" => serde_json::from_str::<TrackPayload>(&data)
            .ok()
            .map(|p| RawEvent::RemoteAudioStopped { track_id: p.track_id }),
        "quality" => serde_json::from_str::<QualityPayload>(&data)
            .ok()
            .map(|p| RawEvent::QualitySample {
                latency_ms: p.latency_ms,
                packet_loss: p.packet_loss,
            }),
        "fatal" => serde_json::from_str::<FatalPayload>(&data)
            .ok()
            .map(|p| RawEvent::FatalError {
                kind: p.kind,
                message: p.message,
            }),
        "disconnected" => serde_json::from_str::<FatalPayload>(&data)
            .ok()
            .map(|p| RawEvent::disconnected(p.kind, p.message)),
        _ => None,
    };

    parsed.unwrap_or_else(|| RawEvent::DataMessage {
        topic: (event != "message").then(|| event.to_string()),
        payload: data,
    })
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct CreateSessionRequest<'a> {
    room: &'a str,
    identity: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    connection_id: String,
}

#[derive(Debug, Deserialize)]
struct TrackPayload {
    track_id: String,
}

#[derive(Debug, Deserialize)]
struct QualityPayload {
    latency_ms: f64,
    #[serde(default)]
    packet_loss: f64,
}

#[derive(Debug, Deserialize)]
struct FatalPayload {
    kind: TransportErrorKind,
    #[serde(default)]
    message: String,
}
