//! End-to-end scenarios: a [`Client`] talking to a running [`Application`] over a real socket,
//! with a wiremock server standing in for the merchant's notification endpoint.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::codec;
use crate::fields::{FAIL, FieldMap, RETURN_CODE, RETURN_MSG, SUCCESS};
use crate::pay::{self, PayResultNotify, UnifiedOrderRequest};
use crate::signing;
use crate::{Application, Client, ClientConfig, Config, SignType};

const KEY: &str = "testkey";

struct RunningServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    async fn start(notify_delay_secs: u64) -> Self {
        let config = Config {
            addr: "127.0.0.1:0".to_string(),
            api_key: Some(KEY.to_string()),
            notify_delay_secs,
            notify_timeout_secs: Some(5),
        };
        let listener = TcpListener::bind(&config.addr).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = Application::new(config).expect("Failed to create application");
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(app.serve_on(listener, async move { token.cancelled().await }));

        Self { addr, shutdown, task }
    }

    fn client(&self, api_key: &str, sign_type: SignType) -> Client {
        let config = ClientConfig::builder()
            .app_id("wx2421b1c4370ec43b")
            .mch_id("10000100")
            .api_key(api_key)
            .sign_type(sign_type)
            .override_base_url(format!("http://{}", self.addr))
            .timeout(Duration::from_secs(5))
            .build();
        Client::new(config).unwrap()
    }

    /// Drop the serving future without a graceful shutdown.
    async fn abort(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

/// Records when each callback arrives and acknowledges it.
#[derive(Clone, Default)]
struct Arrivals(Arc<Mutex<Vec<(Instant, Vec<u8>)>>>);

impl Arrivals {
    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    fn take(&self) -> Vec<(Instant, Vec<u8>)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl Respond for Arrivals {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.0.lock().unwrap().push((Instant::now(), request.body.clone()));
        let ack: FieldMap = [(RETURN_CODE, SUCCESS), (RETURN_MSG, "OK")].into_iter().collect();
        ResponseTemplate::new(200).set_body_bytes(codec::encode(&ack).unwrap())
    }
}

async fn recording_callback() -> (MockServer, Arrivals) {
    let server = MockServer::start().await;
    let arrivals = Arrivals::default();
    Mock::given(method("POST"))
        .and(path("/notify"))
        .respond_with(arrivals.clone())
        .mount(&server)
        .await;
    (server, arrivals)
}

async fn silent_callback() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;
    server
}

fn order(out_trade_no: &str, notify_url: String) -> UnifiedOrderRequest {
    UnifiedOrderRequest::builder()
        .body("Tencent-Game")
        .out_trade_no(out_trade_no)
        .total_fee(101)
        .fee_type("CNY")
        .spbill_create_ip("127.0.0.1")
        .notify_url(notify_url)
        .trade_type("NATIVE")
        .attach("e2e")
        .build()
}

async fn wait_for_arrivals(arrivals: &Arrivals, count: usize, within: Duration) {
    tokio::time::timeout(within, async {
        while arrivals.len() < count {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("callback did not arrive in time");
}

#[test_log::test(tokio::test)]
async fn test_accepted_order_gets_one_delayed_signed_callback() {
    let delay = Duration::from_secs(1);
    let (callback, arrivals) = recording_callback().await;
    let server = RunningServer::start(1).await;
    let client = server.client(KEY, SignType::Md5);

    let sent_at = Instant::now();
    let response = pay::unified_order(&client, &order("E2E-1", format!("{}/notify", callback.uri())))
        .await
        .unwrap();
    assert_eq!(response.return_code, SUCCESS);
    assert_eq!(response.result_code, SUCCESS);
    assert!(response.prepay_id.starts_with("wx"));
    // The synchronous answer does not wait for the notification
    assert!(sent_at.elapsed() < delay);
    assert_eq!(arrivals.len(), 0);

    wait_for_arrivals(&arrivals, 1, delay + Duration::from_secs(3)).await;
    // Single attempt: nothing else shows up
    tokio::time::sleep(Duration::from_millis(500)).await;
    let received = arrivals.take();
    assert_eq!(received.len(), 1);

    let (arrived_at, body) = &received[0];
    assert!(arrived_at.duration_since(sent_at) >= delay);

    let notification = codec::decode(body).unwrap();
    assert!(signing::verify_embedded(&notification, KEY, SignType::Md5));
    let notify = PayResultNotify::from_fields(&notification).unwrap();
    assert_eq!(notify.return_code, SUCCESS);
    assert_eq!(notify.out_trade_no, "E2E-1");
    assert_eq!(notify.total_fee, 101);
    assert_eq!(notify.fee_type, "CNY");
    assert_eq!(notify.attach, "e2e");
    assert_eq!(notify.appid, "wx2421b1c4370ec43b");

    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_hmac_order_signs_response_and_callback_with_hmac() {
    let (callback, arrivals) = recording_callback().await;
    let server = RunningServer::start(1).await;
    let client = server.client(KEY, SignType::HmacSha256);

    // The client verifies the HMAC response signature; a mismatch would be an Err
    let response = pay::unified_order(&client, &order("E2E-2", format!("{}/notify", callback.uri())))
        .await
        .unwrap();
    assert_eq!(response.result_code, SUCCESS);

    wait_for_arrivals(&arrivals, 1, Duration::from_secs(4)).await;
    let (_, body) = arrivals.take().remove(0);
    let notification = codec::decode(&body).unwrap();
    assert!(signing::verify_embedded(&notification, KEY, SignType::HmacSha256));
    assert!(!signing::verify_embedded(&notification, KEY, SignType::Md5));

    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_bad_signature_is_rejected_and_schedules_nothing() {
    let callback = silent_callback().await;
    let server = RunningServer::start(1).await;
    let client = server.client("not-the-shared-key", SignType::Md5);

    let response = pay::unified_order(&client, &order("E2E-3", format!("{}/notify", callback.uri())))
        .await
        .unwrap();
    assert_eq!(response.return_code, FAIL);
    assert_eq!(response.return_msg, "Signature Incorrect");

    // Outlast the notification delay; the callback mock expects zero calls
    tokio::time::sleep(Duration::from_millis(1500)).await;
    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_unsupported_api_answers_fail() {
    let server = RunningServer::start(1).await;
    let client = server.client(KEY, SignType::Md5);

    let response = client.post_xml("/pay/orderquery", FieldMap::new()).await.unwrap();
    assert!(!response.is_return_success());
    assert_eq!(response.fields().get(RETURN_MSG), Some("unsupported api: /pay/orderquery"));

    server.stop().await;
}

#[test_log::test(tokio::test)]
async fn test_shutdown_cancels_pending_notifications() {
    let callback = silent_callback().await;
    let server = RunningServer::start(3).await;
    let client = server.client(KEY, SignType::Md5);

    let response = pay::unified_order(&client, &order("E2E-4", format!("{}/notify", callback.uri())))
        .await
        .unwrap();
    assert_eq!(response.result_code, SUCCESS);
    drop(client);

    server.stop().await;
    tokio::time::sleep(Duration::from_millis(3500)).await;
}

#[test_log::test(tokio::test)]
async fn test_aborted_server_cancels_pending_notifications() {
    let callback = silent_callback().await;
    let server = RunningServer::start(1).await;
    let client = server.client(KEY, SignType::Md5);

    let response = pay::unified_order(&client, &order("E2E-5", format!("{}/notify", callback.uri())))
        .await
        .unwrap();
    assert_eq!(response.result_code, SUCCESS);

    server.abort().await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
}
