//! Zaps: zap requests, invoice retrieval and payment with fallbacks.

use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    broadcast::Outbox,
    event::{kinds, Event, UnsignedEvent},
    filter::Filter,
    source::{EventSource, FeedMessage},
};

/// Budget for a single payment attempt.
pub const PAYMENT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default zap invoice endpoint.
pub const DEFAULT_INVOICE_ENDPOINT: &str = "https://api.getalby.com/nostr/zap";

/// Parameters of a zap.
#[derive(Debug, Clone, PartialEq)]
pub struct ZapRequest {
    pub recipient: String,
    pub amount_msats: u64,
    pub relays: Vec<String>,
    /// Event being zapped, if any.
    pub event_id: Option<String>,
    pub comment: String,
}

impl ZapRequest {
    /// Draft of the kind-9734 zap request.
    pub fn draft(&self) -> UnsignedEvent {
        let amount = self.amount_msats.to_string();
        let mut relays = vec!["relays"];
        relays.extend(self.relays.iter().map(String::as_str));
        let mut draft = UnsignedEvent::new(kinds::ZAP_REQUEST, self.comment.clone())
            .tag(&["p", &self.recipient])
            .tag(&["amount", &amount])
            .tag(&relays);
        if let Some(id) = &self.event_id {
            draft = draft.tag(&["e", id]);
        }
        draft
    }
}

/// Whether `invoice` looks like a BOLT11 payment request.
pub fn is_bolt11(invoice: &str) -> bool {
    let lower = invoice.trim().to_ascii_lowercase();
    let lower = lower.strip_prefix("lightning:").unwrap_or(&lower);
    ["lnbc", "lntb", "lntbs", "lnbcrt"]
        .iter()
        .any(|p| lower.starts_with(p))
        && lower.len() > 20
}

/// Client for the invoice endpoint.
#[derive(Debug, Clone)]
pub struct InvoiceClient {
    client: reqwest::Client,
    endpoint: String,
}

impl InvoiceClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PAYMENT_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Exchange a signed zap request for a BOLT11 invoice.
    pub async fn fetch_invoice(&self, zap_request: &Event) -> Result<String> {
        let encoded = STANDARD.encode(serde_json::to_vec(zap_request)?);
        let url = format!("{}/{}", self.endpoint.trim_end_matches('/'), encoded);
        let body: Value = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let pr = body
            .get("pr")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("invoice response has no `pr`"))?;
        if !is_bolt11(pr) {
            bail!("malformed invoice");
        }
        Ok(pr.to_string())
    }
}

/// A way of paying an invoice.
#[async_trait]
pub trait PaymentMethod: Send + Sync {
    fn name(&self) -> &str;

    /// Pay `invoice`, returning the preimage.
    async fn pay(&self, invoice: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum PaymentOutcome {
    Paid { method: String, preimage: String },
    /// Nothing could pay; the user pays the invoice by hand.
    Manual { invoice: String },
}

/// Try `methods` in order; the first success wins. Each attempt is bounded
/// by `budget`.
pub async fn pay_invoice(
    methods: &[Arc<dyn PaymentMethod>],
    invoice: &str,
    budget: Duration,
) -> PaymentOutcome {
    for method in methods {
        match timeout(budget, method.pay(invoice)).await {
            Ok(Ok(preimage)) => {
                info!(method = method.name(), "invoice paid");
                return PaymentOutcome::Paid {
                    method: method.name().to_string(),
                    preimage,
                };
            }
            Ok(Err(e)) => warn!(method = method.name(), "payment failed: {e:#}"),
            Err(_) => warn!(method = method.name(), "payment timed out"),
        }
    }
    PaymentOutcome::Manual {
        invoice: invoice.to_string(),
    }
}

/// Wallet-connect payer: posts a `pay_invoice` request to the wallet service
/// and waits for its response event.
pub struct NwcPayer {
    source: Arc<dyn EventSource>,
    outbox: Outbox,
    wallet_pubkey: String,
}

impl NwcPayer {
    pub fn new(source: Arc<dyn EventSource>, outbox: Outbox, wallet_pubkey: String) -> Self {
        Self {
            source,
            outbox,
            wallet_pubkey,
        }
    }
}

#[async_trait]
impl PaymentMethod for NwcPayer {
    fn name(&self) -> &str {
        "nwc"
    }

    async fn pay(&self, invoice: &str) -> Result<String> {
        let content = json!({"method": "pay_invoice", "params": {"invoice": invoice}});
        let request = self.outbox.sign(
            UnsignedEvent::new(kinds::NWC_REQUEST, content.to_string())
                .tag(&["p", &self.wallet_pubkey]),
        )?;
        let mut sub = self.source.subscribe(vec![Filter::new()
            .kinds([kinds::NWC_RESPONSE])
            .authors([self.wallet_pubkey.clone()])
            .tag("e", [request.id.clone()])]);
        self.outbox.send(&request).await?;
        debug!(id = %request.id, "wallet-connect request sent");
        while let Some(msg) = sub.recv().await {
            let FeedMessage::Event(ev) = msg else {
                continue;
            };
            if ev.kind != kinds::NWC_RESPONSE || ev.tag_value("e") != Some(request.id.as_str()) {
                continue;
            }
            let body: Value = serde_json::from_str(&ev.content).context("wallet response")?;
            if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
                let msg = err.get("message").and_then(Value::as_str).unwrap_or("wallet error");
                bail!("{msg}");
            }
            return body
                .pointer("/result/preimage")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| anyhow!("wallet response without preimage"));
        }
        bail!("wallet subscription closed")
    }
}

/// Zap flow: sign the request, get an invoice, pay it.
pub struct Zapper {
    outbox: Outbox,
    invoices: InvoiceClient,
    methods: Vec<Arc<dyn PaymentMethod>>,
    budget: Duration,
}

impl Zapper {
    pub fn new(outbox: Outbox, invoices: InvoiceClient, methods: Vec<Arc<dyn PaymentMethod>>) -> Self {
        Self {
            outbox,
            invoices,
            methods,
            budget: PAYMENT_TIMEOUT,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub async fn zap(&self, req: &ZapRequest) -> Result<PaymentOutcome> {
        self.outbox.require_identity()?;
        if req.amount_msats == 0 {
            bail!("zap amount must be positive");
        }
        let signed = self.outbox.sign(req.draft())?;
        let invoice = self.invoices.fetch_invoice(&signed).await?;
        Ok(pay_invoice(&self.methods, &invoice, self.budget).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::Tag,
        signer::{Keys, Signer},
        source::tests::MemorySource,
    };
    use axum::{extract::Path, routing::get, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    const INVOICE: &str = "lnbc10n1pjexampleexampleexampleexample";

    struct Scripted {
        name: &'static str,
        result: Option<&'static str>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, result: Option<&'static str>, delay_secs: u64) -> Arc<Self> {
            Arc::new(Self {
                name,
                result,
                delay: Duration::from_secs(delay_secs),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PaymentMethod for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn pay(&self, _invoice: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.result
                .map(str::to_string)
                .ok_or_else(|| anyhow!("declined"))
        }
    }

    #[test]
    fn zap_request_tags() {
        let req = ZapRequest {
            recipient: "pk".into(),
            amount_msats: 21_000,
            relays: vec!["wss://a".into(), "wss://b".into()],
            event_id: Some("ev".into()),
            comment: "thanks".into(),
        };
        let d = req.draft();
        assert_eq!(d.kind, kinds::ZAP_REQUEST);
        assert_eq!(d.tag_value("amount"), Some("21000"));
        assert!(d.tags.contains(&Tag::new(&["relays", "wss://a", "wss://b"])));
        assert_eq!(d.tag_value("e"), Some("ev"));
        assert!(is_bolt11(INVOICE));
        assert!(!is_bolt11("not-an-invoice"));
    }

    #[tokio::test(start_paused = true)]
    async fn first_working_method_wins_and_slow_ones_time_out() {
        let slow = Scripted::new("slow", Some("never"), 60);
        let broken = Scripted::new("broken", None, 0);
        let good = Scripted::new("good", Some("preimage"), 1);
        let unused = Scripted::new("unused", Some("x"), 0);
        let methods: Vec<Arc<dyn PaymentMethod>> =
            vec![slow.clone(), broken.clone(), good.clone(), unused.clone()];
        let outcome = pay_invoice(&methods, INVOICE, PAYMENT_TIMEOUT).await;
        assert_eq!(
            outcome,
            PaymentOutcome::Paid {
                method: "good".into(),
                preimage: "preimage".into()
            }
        );
        assert_eq!(unused.calls.load(Ordering::SeqCst), 0);

        let methods: Vec<Arc<dyn PaymentMethod>> = vec![broken];
        assert_eq!(
            pay_invoice(&methods, INVOICE, PAYMENT_TIMEOUT).await,
            PaymentOutcome::Manual {
                invoice: INVOICE.into()
            }
        );
    }

    #[tokio::test]
    async fn invoice_endpoint_receives_encoded_request() {
        let app = Router::new().route(
            "/zap/*request",
            get(|Path(request): Path<String>| async move {
                let raw = STANDARD.decode(request).unwrap();
                let ev: Event = serde_json::from_slice(&raw).unwrap();
                assert_eq!(ev.kind, kinds::ZAP_REQUEST);
                Json(json!({ "pr": INVOICE }))
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let keys = Arc::new(Keys::from_slice(&[6u8; 32]).unwrap());
        let relays = Arc::new(MemorySource::default());
        let outbox = Outbox::new(keys, relays);
        let zapper = Zapper::new(
            outbox,
            InvoiceClient::new(format!("http://{addr}/zap")).unwrap(),
            vec![],
        );
        let outcome = zapper
            .zap(&ZapRequest {
                recipient: "pk".into(),
                amount_msats: 1000,
                relays: vec![],
                event_id: None,
                comment: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            PaymentOutcome::Manual {
                invoice: INVOICE.into()
            }
        );
    }

    #[tokio::test]
    async fn wallet_connect_round_trip() {
        let source = Arc::new(MemorySource::default());
        let user = Arc::new(Keys::from_slice(&[7u8; 32]).unwrap());
        let wallet = Keys::from_slice(&[8u8; 32]).unwrap();
        let payer = Arc::new(NwcPayer::new(
            source.clone(),
            Outbox::new(user, source.clone()),
            wallet.public_key_hex(),
        ));

        let pay = tokio::spawn({
            let payer = payer.clone();
            async move { payer.pay(INVOICE).await }
        });
        // Act as the wallet service: answer the request once it shows up.
        let request = loop {
            let found = source
                .events
                .lock()
                .iter()
                .find(|e| e.kind == kinds::NWC_REQUEST)
                .cloned();
            if let Some(ev) = found {
                break ev;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let body: Value = serde_json::from_str(&request.content).unwrap();
        assert_eq!(body["params"]["invoice"], INVOICE);
        let response = wallet
            .sign(
                UnsignedEvent::new(
                    kinds::NWC_RESPONSE,
                    json!({"result_type": "pay_invoice", "result": {"preimage": "abc"}}).to_string(),
                )
                .tag(&["e", &request.id]),
            )
            .unwrap();
        source.push(response);
        assert_eq!(pay.await.unwrap().unwrap(), "abc");
    }
}
