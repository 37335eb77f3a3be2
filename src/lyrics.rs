//! Desktop-lyrics broadcast hub.
//!
//! Every connected stream client gets a small bounded queue. `broadcast` only
//! ever does a non-blocking push onto each queue, so a stalled client loses
//! messages instead of holding up the others.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::response::sse::Event;
use futures_util::Stream;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound queue depth per subscriber.
pub const QUEUE_CAPACITY: usize = 10;

/// Idle time after which a heartbeat event is written.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const CONNECTED_MESSAGE: &str = "OSD lyrics stream connected";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LyricsFormat {
    /// Word-timed: `[start,dur]<offset,dur,0>word...`
    Krc,
    /// Line-timed: `[mm:ss.xx]line`
    Lrc,
    Plain,
}

impl LyricsFormat {
    /// Classifies raw lyric text by shape. Never rejects input.
    pub fn infer(text: &str) -> Self {
        if !text.starts_with('[') {
            return LyricsFormat::Plain;
        }
        // A comma followed (anywhere later) by "]<".
        let word_timed = text
            .find(',')
            .is_some_and(|comma| text[comma + 1..].contains("]<"));
        if word_timed {
            LyricsFormat::Krc
        } else if text.contains(':') && text.contains(']') {
            LyricsFormat::Lrc
        } else {
            LyricsFormat::Plain
        }
    }

    /// Name written in the `format` field. The helper only understands
    /// `lrc` and `krc`; plain text is sent as `lrc`.
    pub fn wire_name(self) -> &'static str {
        match self {
            LyricsFormat::Krc => "krc",
            LyricsFormat::Lrc | LyricsFormat::Plain => "lrc",
        }
    }
}

impl Serialize for LyricsFormat {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.wire_name())
    }
}

/// One event on the lyrics stream; serialized as the `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LyricsEvent {
    Connected {
        message: String,
    },
    LyricsUpdate {
        text: String,
        #[serde(rename = "songName")]
        song_name: String,
        artist: String,
        format: LyricsFormat,
    },
    Heartbeat,
}

impl LyricsEvent {
    pub fn connected() -> Self {
        LyricsEvent::Connected {
            message: CONNECTED_MESSAGE.to_string(),
        }
    }

    /// Builds an update, inferring the format from `text`.
    pub fn update(text: impl Into<String>, song_name: impl Into<String>, artist: impl Into<String>) -> Self {
        let text = text.into();
        let format = LyricsFormat::infer(&text);
        LyricsEvent::LyricsUpdate {
            text,
            song_name: song_name.into(),
            artist: artist.into(),
            format,
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings and unit variants; encoding cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    fn to_sse(&self) -> Event {
        Event::default().data(self.to_json())
    }
}

struct Subscriber {
    tx: mpsc::Sender<LyricsEvent>,
    cancel: CancellationToken,
    serial: u64,
}

/// Receiving half handed to a connection by [`LyricsHub::subscribe`].
pub struct Subscription {
    pub remote: SocketAddr,
    pub rx: mpsc::Receiver<LyricsEvent>,
    pub cancel: CancellationToken,
    serial: u64,
}

/// Subscriber set keyed by the remote address of the connection.
#[derive(Clone, Default)]
pub struct LyricsHub {
    subscribers: Arc<Mutex<HashMap<SocketAddr, Subscriber>>>,
    // Distinguishes successive subscriptions from one address, so a finished
    // stream never removes its successor.
    next_serial: Arc<AtomicU64>,
}

impl LyricsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and queues its `connected` acknowledgement.
    /// A second subscribe from the same connection replaces (and cancels) the first.
    pub fn subscribe(&self, remote: SocketAddr) -> Subscription {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let _ = tx.try_send(LyricsEvent::connected());

        let count = {
            let mut subs = self.lock();
            if let Some(old) = subs.insert(
                remote,
                Subscriber {
                    tx,
                    cancel: cancel.clone(),
                    serial,
                },
            ) {
                old.cancel.cancel();
            }
            subs.len()
        };
        info!("lyrics: client {remote} connected ({count} total)");

        Subscription {
            remote,
            rx,
            cancel,
            serial,
        }
    }

    /// Idempotent.
    pub fn unsubscribe(&self, remote: &SocketAddr) {
        self.remove_where(remote, |_| true);
    }

    fn remove_where(&self, remote: &SocketAddr, pred: impl FnOnce(&Subscriber) -> bool) {
        let (removed, count) = {
            let mut subs = self.lock();
            let removed = if subs.get(remote).is_some_and(pred) {
                subs.remove(remote)
            } else {
                None
            };
            (removed, subs.len())
        };
        if let Some(sub) = removed {
            sub.cancel.cancel();
            info!("lyrics: client {remote} disconnected ({count} total)");
        }
    }

    /// Non-blocking fan-out. Returns how many subscribers accepted the event.
    pub fn broadcast(&self, event: &LyricsEvent) -> usize {
        let subs = self.lock();
        if subs.is_empty() {
            debug!("lyrics: no clients, nothing to broadcast");
            return 0;
        }

        let mut delivered = 0;
        for (remote, sub) in subs.iter() {
            match sub.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("lyrics: client {remote} queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("lyrics: client {remote} already gone, dropping event");
                }
            }
        }
        debug!("lyrics: broadcast to {delivered}/{} client(s)", subs.len());
        delivered
    }

    /// Cancels and forgets every subscriber. Used on server shutdown so
    /// long-lived streams cannot hold the listener open.
    pub fn close_all(&self) {
        let drained: Vec<(SocketAddr, Subscriber)> = self.lock().drain().collect();
        info!("lyrics: closing {} client(s)", drained.len());
        for (_, sub) in drained {
            sub.cancel.cancel();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The per-connection send loop, as an SSE body stream.
    ///
    /// Each step waits for the first of: a queued event, `heartbeat` of idle
    /// time, or cancellation. The subscriber is removed when the stream ends
    /// or is dropped by the transport (client went away).
    pub fn event_stream(
        &self,
        sub: Subscription,
        heartbeat: Duration,
    ) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
        let session = Session {
            rx: sub.rx,
            cancel: sub.cancel,
            heartbeat,
            _guard: UnsubscribeOnDrop {
                hub: self.clone(),
                remote: sub.remote,
                serial: sub.serial,
            },
        };

        futures_util::stream::unfold(session, |mut s| async move {
            let event = tokio::select! {
                _ = s.cancel.cancelled() => return None,
                msg = s.rx.recv() => msg?,
                _ = tokio::time::sleep(s.heartbeat) => LyricsEvent::Heartbeat,
            };
            Some((Ok::<_, Infallible>(event.to_sse()), s))
        })
    }
}

struct Session {
    rx: mpsc::Receiver<LyricsEvent>,
    cancel: CancellationToken,
    heartbeat: Duration,
    _guard: UnsubscribeOnDrop,
}

struct UnsubscribeOnDrop {
    hub: LyricsHub,
    remote: SocketAddr,
    serial: u64,
}

impl Drop for UnsubscribeOnDrop {
    fn drop(&mut self) {
        let serial = self.serial;
        self.hub.remove_where(&self.remote, |sub| sub.serial == serial);
    }
}
