//! WebSocket relay client: batch fetches, live subscriptions and publishing.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{future::join_all, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::{
    broadcast::RelayPublisher,
    event::Event,
    filter::Filter,
    source::{EventSource, FeedMessage, Subscription},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

static NEXT_SUB: AtomicU64 = AtomicU64::new(1);

fn next_subscription_id(prefix: &str) -> String {
    format!("{prefix}-{}", NEXT_SUB.fetch_add(1, Ordering::Relaxed))
}

/// Messages a relay can send to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub: String, event: Event },
    Eose { sub: String },
    Ok { id: String, accepted: bool, message: String },
    Closed { sub: String, message: String },
    Notice(String),
}

impl RelayMessage {
    /// Parse a relay text frame. Unknown or malformed frames yield `None`.
    pub fn parse(txt: &str) -> Option<Self> {
        let val: Value = serde_json::from_str(txt).ok()?;
        let arr = val.as_array()?;
        let text = |i: usize| arr.get(i).and_then(|v| v.as_str()).map(str::to_string);
        match arr.first().and_then(|v| v.as_str())? {
            "EVENT" if arr.len() >= 3 => Some(RelayMessage::Event {
                sub: text(1)?,
                event: serde_json::from_value(arr[2].clone()).ok()?,
            }),
            "EOSE" => Some(RelayMessage::Eose { sub: text(1)? }),
            "OK" => Some(RelayMessage::Ok {
                id: text(1)?,
                accepted: arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false),
                message: text(3).unwrap_or_default(),
            }),
            "CLOSED" => Some(RelayMessage::Closed {
                sub: text(1)?,
                message: text(2).unwrap_or_default(),
            }),
            "NOTICE" => Some(RelayMessage::Notice(text(1).unwrap_or_default())),
            _ => None,
        }
    }
}

/// Set of relays used for every read and write.
#[derive(Debug, Clone)]
pub struct RelayPool {
    relays: Vec<String>,
    tor_socks: Option<String>,
    timeout: Duration,
}

impl RelayPool {
    /// Create a pool over `relays`, optionally dialing through a SOCKS5 proxy.
    pub fn new(relays: Vec<String>, tor_socks: Option<String>) -> Self {
        Self {
            relays,
            tor_socks,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-relay fetch/publish timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Issue a `REQ` to one relay and collect events until `EOSE`.
    pub async fn fetch_from(&self, relay: &str, filter: &Filter) -> Result<Vec<Event>> {
        let work = async {
            let mut ws = connect_ws(relay, self.tor_socks.as_deref()).await?;
            let sub = next_subscription_id("fetch");
            let req = json!(["REQ", sub, Value::Object(filter.to_json())]);
            ws.send(Message::Text(req.to_string())).await?;
            let mut events = vec![];
            while let Some(msg) = ws.next().await {
                match msg? {
                    Message::Text(txt) => match RelayMessage::parse(&txt) {
                        Some(RelayMessage::Event { sub: s, event }) if s == sub => events.push(event),
                        Some(RelayMessage::Eose { sub: s }) if s == sub => break,
                        Some(RelayMessage::Closed { sub: s, message }) if s == sub => {
                            bail!("subscription closed by relay: {message}")
                        }
                        Some(RelayMessage::Notice(n)) => debug!(relay = %relay, "notice: {n}"),
                        _ => {}
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            let _ = ws.send(Message::Text(json!(["CLOSE", sub]).to_string())).await;
            let _ = ws.close(None).await;
            Ok(events)
        };
        timeout(self.timeout, work)
            .await
            .map_err(|_| anyhow!("fetch from {relay} timed out"))?
    }

    /// Send an `EVENT` to one relay and wait for its `OK`.
    pub async fn publish_one(&self, relay: &str, event: &Event) -> Result<()> {
        let work = async {
            let mut ws = connect_ws(relay, self.tor_socks.as_deref()).await?;
            ws.send(Message::Text(json!(["EVENT", event]).to_string()))
                .await?;
            while let Some(msg) = ws.next().await {
                if let Message::Text(txt) = msg? {
                    if let Some(RelayMessage::Ok {
                        id,
                        accepted,
                        message,
                    }) = RelayMessage::parse(&txt)
                    {
                        if id != event.id {
                            continue;
                        }
                        let _ = ws.close(None).await;
                        if accepted {
                            return Ok(());
                        }
                        bail!("rejected: {message}");
                    }
                }
            }
            Err(anyhow!("connection closed before OK"))
        };
        timeout(self.timeout, work)
            .await
            .map_err(|_| anyhow!("publish to {relay} timed out"))?
    }
}

#[async_trait]
impl EventSource for RelayPool {
    async fn fetch_events(&self, filter: &Filter) -> Result<Vec<Event>> {
        if self.relays.is_empty() {
            bail!("no relays configured");
        }
        let results = join_all(self.relays.iter().map(|r| self.fetch_from(r, filter))).await;
        let mut seen = HashSet::new();
        let mut events = vec![];
        let mut last_err = None;
        let mut any_ok = false;
        for (relay, result) in self.relays.iter().zip(results) {
            match result {
                Ok(batch) => {
                    any_ok = true;
                    debug!(relay = %relay, count = batch.len(), "fetched events");
                    for ev in batch {
                        if seen.insert(ev.id.clone()) {
                            events.push(ev);
                        }
                    }
                }
                Err(e) => {
                    warn!(relay = %relay, "fetch failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        match (any_ok, last_err) {
            (false, Some(e)) => Err(e.context("every relay failed")),
            _ => Ok(events),
        }
    }

    fn subscribe(&self, filters: Vec<Filter>) -> Subscription {
        let (tx, rx) = mpsc::channel(256);
        let seen = Arc::new(Mutex::new(HashMap::new()));
        let opened = Instant::now();
        let tasks = self
            .relays
            .iter()
            .cloned()
            .map(|relay| {
                let tx = tx.clone();
                let filters = filters.clone();
                let seen = seen.clone();
                let tor_socks = self.tor_socks.clone();
                tokio::spawn(async move {
                    loop {
                        let current = slide_window(&filters, opened.elapsed().as_secs());
                        if let Some(floor) = window_floor(&current) {
                            seen.lock().retain(|_, created_at| *created_at >= floor);
                        }
                        if let Err(e) =
                            stream_relay(&relay, tor_socks.as_deref(), &current, &tx, &seen).await
                        {
                            warn!(relay = %relay, "subscription error: {e}");
                        }
                        if tx.is_closed() {
                            break;
                        }
                        sleep(RECONNECT_DELAY).await;
                    }
                })
            })
            .collect();
        Subscription::new(rx, tasks)
    }
}

/// Move every `since` forward by `elapsed` seconds so a reconnect asks for
/// the same recent window instead of everything since the first connect.
fn slide_window(filters: &[Filter], elapsed: u64) -> Vec<Filter> {
    filters
        .iter()
        .cloned()
        .map(|mut f| {
            f.since = f.since.map(|s| s.saturating_add(elapsed));
            f
        })
        .collect()
}

/// Oldest timestamp any filter still asks for, if every filter is bounded.
fn window_floor(filters: &[Filter]) -> Option<u64> {
    filters
        .iter()
        .map(|f| f.since)
        .collect::<Option<Vec<_>>>()?
        .into_iter()
        .min()
}

#[async_trait]
impl RelayPublisher for RelayPool {
    fn relays(&self) -> Vec<String> {
        self.relays.clone()
    }

    async fn publish_to(&self, relay: &str, event: &Event) -> Result<()> {
        self.publish_one(relay, event).await
    }
}

/// Keep one relay subscription open, forwarding events not yet seen on any relay.
async fn stream_relay(
    relay: &str,
    tor_socks: Option<&str>,
    filters: &[Filter],
    tx: &mpsc::Sender<FeedMessage>,
    seen: &Mutex<HashMap<String, u64>>,
) -> Result<()> {
    let mut ws = connect_ws(relay, tor_socks).await?;
    let sub = next_subscription_id("live");
    let mut req = vec![Value::String("REQ".into()), Value::String(sub.clone())];
    req.extend(filters.iter().map(|f| Value::Object(f.to_json())));
    ws.send(Message::Text(Value::Array(req).to_string())).await?;
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(txt) => match RelayMessage::parse(&txt) {
                Some(RelayMessage::Event { event, .. }) => {
                    if seen
                        .lock()
                        .insert(event.id.clone(), event.created_at)
                        .is_some()
                    {
                        continue;
                    }
                    if tx.send(FeedMessage::Event(event)).await.is_err() {
                        return Ok(());
                    }
                }
                Some(RelayMessage::Eose { .. }) => {
                    debug!(relay = %relay, "EOSE received for live subscription");
                    if tx.send(FeedMessage::Eose(relay.to_string())).await.is_err() {
                        return Ok(());
                    }
                }
                Some(RelayMessage::Closed { message, .. }) => {
                    bail!("subscription closed by relay: {message}")
                }
                _ => {}
            },
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay).with_context(|| format!("invalid relay url {relay}"))?;
    let host = url.host_str().ok_or_else(|| anyhow!("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("missing port"))?;
    let req = relay.into_client_request()?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{kinds, Tag};
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message as TMsg};

    fn announcement(id: &str, url: &str) -> Event {
        Event {
            id: id.into(),
            pubkey: "p".into(),
            kind: kinds::MINT_ANNOUNCEMENT,
            created_at: 1,
            tags: vec![Tag::new(&["u", url])],
            content: String::new(),
            sig: String::new(),
        }
    }

    /// Relay answering the first REQ with `events` then EOSE, and EVENTs with OK.
    async fn spawn_relay(events: Vec<Event>, accept: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let events = events.clone();
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    while let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                        let val: Value = serde_json::from_str(&txt).unwrap();
                        match val[0].as_str() {
                            Some("REQ") => {
                                let sub = val[1].as_str().unwrap().to_string();
                                let filter = Filter::from_value(&val[2]);
                                for ev in events.iter().filter(|e| filter.matches(e)) {
                                    let msg = json!(["EVENT", sub, ev]).to_string();
                                    ws.send(TMsg::Text(msg)).await.unwrap();
                                }
                                let eose = json!(["EOSE", sub]).to_string();
                                ws.send(TMsg::Text(eose)).await.unwrap();
                            }
                            Some("EVENT") => {
                                let id = val[1]["id"].as_str().unwrap().to_string();
                                let ok = json!(["OK", id, accept, if accept { "" } else { "blocked" }]);
                                ws.send(TMsg::Text(ok.to_string())).await.unwrap();
                            }
                            _ => {}
                        }
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    #[test]
    fn parses_relay_frames() {
        assert_eq!(
            RelayMessage::parse(r#"["EOSE","s1"]"#),
            Some(RelayMessage::Eose { sub: "s1".into() })
        );
        assert_eq!(
            RelayMessage::parse(r#"["OK","ab",false,"blocked: spam"]"#),
            Some(RelayMessage::Ok {
                id: "ab".into(),
                accepted: false,
                message: "blocked: spam".into()
            })
        );
        assert!(RelayMessage::parse("not json").is_none());
        assert!(RelayMessage::parse(r#"["EVENT","s1",{"bogus":1}]"#).is_none());
    }

    #[tokio::test]
    async fn fetch_merges_and_dedups_across_relays() {
        let a = spawn_relay(
            vec![announcement("aa", "https://a"), announcement("bb", "https://b")],
            true,
        )
        .await;
        let b = spawn_relay(
            vec![announcement("bb", "https://b"), announcement("cc", "https://c")],
            true,
        )
        .await;
        let pool = RelayPool::new(vec![a, b], None);
        let events = pool
            .fetch_events(&Filter::new().kinds([kinds::MINT_ANNOUNCEMENT]))
            .await
            .unwrap();
        let mut ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, ["aa", "bb", "cc"]);
    }

    #[tokio::test]
    async fn fetch_tolerates_one_dead_relay() {
        let live = spawn_relay(vec![announcement("aa", "https://a")], true).await;
        let pool = RelayPool::new(vec!["ws://127.0.0.1:9".into(), live], None);
        let events = pool.fetch_events(&Filter::new()).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn fetch_fails_when_every_relay_fails() {
        let pool = RelayPool::new(vec!["ws://127.0.0.1:9".into()], None);
        assert!(pool.fetch_events(&Filter::new()).await.is_err());
        assert!(RelayPool::new(vec![], None)
            .fetch_events(&Filter::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn publish_reports_ok_and_rejection() {
        let yes = spawn_relay(vec![], true).await;
        let no = spawn_relay(vec![], false).await;
        let pool = RelayPool::new(vec![yes.clone(), no.clone()], None);
        let ev = announcement("dd", "https://d");
        pool.publish_one(&yes, &ev).await.unwrap();
        let err = pool.publish_one(&no, &ev).await.unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }

    #[tokio::test]
    async fn subscription_forwards_each_event_once() {
        let ev = announcement("aa", "https://a");
        let a = spawn_relay(vec![ev.clone()], true).await;
        let b = spawn_relay(vec![ev.clone()], true).await;
        let pool = RelayPool::new(vec![a, b], None);
        let mut sub = pool.subscribe(vec![Filter::new().kinds([kinds::MINT_ANNOUNCEMENT])]);
        let mut events = 0;
        let mut eose = 0;
        while eose < 2 {
            match timeout(Duration::from_secs(5), sub.recv()).await.unwrap() {
                Some(FeedMessage::Event(e)) => {
                    assert_eq!(e.id, "aa");
                    events += 1;
                }
                Some(FeedMessage::Eose(_)) => eose += 1,
                None => break,
            }
        }
        assert_eq!(events, 1);
        sub.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_requests_a_fresh_window() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (since_tx, mut since_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let mut ws = accept_async(stream).await.unwrap();
                if let Some(Ok(TMsg::Text(txt))) = ws.next().await {
                    let val: Value = serde_json::from_str(&txt).unwrap();
                    let _ = since_tx.send(val[2]["since"].as_u64());
                }
                let _ = ws.close(None).await;
            }
        });
        let pool = RelayPool::new(vec![format!("ws://{addr}")], None);
        let sub = pool.subscribe(vec![Filter::new().since(1_000)]);
        assert_eq!(since_rx.recv().await.unwrap(), Some(1_000));
        let second = since_rx.recv().await.unwrap().unwrap();
        assert!(second >= 1_000 + RECONNECT_DELAY.as_secs());
        drop(sub);
    }

    #[test]
    fn window_slides_bounded_filters_only() {
        let filters = vec![Filter::new().since(10), Filter::new().kinds([1])];
        let slid = slide_window(&filters, 5);
        assert_eq!(slid[0].since, Some(15));
        assert_eq!(slid[1].since, None);
        assert_eq!(window_floor(&slid), None);
        assert_eq!(window_floor(&slid[..1]), Some(15));
    }
}
