//! Simulation of the provider's order endpoint, for integration testing merchants.
//!
//! Every answer is HTTP 200 with an XML body; rejections are `return_code = FAIL` bodies. An
//! accepted order is answered synchronously and, independently, a signed payment-result
//! notification is pushed to the order's `notify_url` once the configured delay has elapsed.

pub mod notify;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::post,
};
use bon::Builder;
use chrono::Utc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::codec;
use crate::errors::{Error, Result};
use crate::fields::{APPID, FieldMap, MCH_ID, NONCE_STR, RESULT_CODE, RETURN_CODE, RETURN_MSG, SIGN, SIGN_TYPE, SUCCESS};
use crate::pay::{self, PayResultNotify, UNIFIED_ORDER_PATH, UnifiedOrderRequest};
use crate::signing::{self, SignType};
use notify::{NotificationDispatcher, NotificationJob};

const RESPONSE_CONTENT_TYPE: &str = "application/xml";

/// A [`FieldMap`] rendered as an XML response body.
#[derive(Debug, Clone)]
pub struct Xml(pub FieldMap);

impl IntoResponse for Xml {
    fn into_response(self) -> Response {
        match codec::encode(&self.0) {
            Ok(body) => ([(header::CONTENT_TYPE, RESPONSE_CONTENT_TYPE)], body).into_response(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode response body");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Shared state for the simulation handlers.
#[derive(Clone, Builder)]
pub struct AppState {
    #[builder(into)]
    pub api_key: Arc<str>,
    pub notify_delay: Duration,
    pub dispatcher: NotificationDispatcher,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(UNIFIED_ORDER_PATH, post(unified_order))
        .fallback(unsupported_api)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

async fn unsupported_api(uri: Uri) -> Error {
    Error::InvalidRequest {
        message: format!("unsupported api: {}", uri.path()),
    }
}

/// Verify an inbound request signed with the algorithm it names.
fn verify_inbound(fields: &FieldMap, api_key: &str) -> Result<SignType> {
    let sign_type = SignType::from_field(fields.get(SIGN_TYPE))?;
    if !signing::verify_embedded(fields, api_key, sign_type) {
        return Err(Error::SignatureMismatch);
    }
    Ok(sign_type)
}

fn signed(mut fields: FieldMap, api_key: &str, sign_type: SignType) -> FieldMap {
    let signature = signing::sign(&fields, api_key, sign_type);
    fields.insert(SIGN, signature);
    fields
}

#[tracing::instrument(skip_all)]
async fn unified_order(State(state): State<AppState>, body: Bytes) -> Result<Xml> {
    let fields = codec::decode(&body)?;
    let sign_type = verify_inbound(&fields, &state.api_key)?;

    if fields.get_or_empty("notify_url").is_empty() {
        return Err(Error::InvalidRequest {
            message: "invalid notify url".to_string(),
        });
    }
    let order = UnifiedOrderRequest::from_fields(&fields)?;

    let now = Utc::now();
    let mut response = FieldMap::new();
    response.insert(RETURN_CODE, SUCCESS);
    response.insert(RETURN_MSG, "OK");
    response.insert_non_empty(APPID, &order.appid);
    response.insert_non_empty(MCH_ID, &order.mch_id);
    response.insert_non_empty("device_info", &order.device_info);
    response.insert(NONCE_STR, signing::nonce_str());
    response.insert(RESULT_CODE, SUCCESS);
    response.insert("trade_type", &order.trade_type);
    response.insert("prepay_id", format!("wx{}{}", pay::format_time(now), signing::nonce_str()));

    let notification = signed(payment_result(&order).to_fields(), &state.api_key, sign_type);
    let payload = codec::encode(&notification)?;
    let handle = state
        .dispatcher
        .schedule(NotificationJob::new(order.notify_url.clone(), payload, state.notify_delay));

    tracing::info!(
        out_trade_no = %order.out_trade_no,
        total_fee = order.total_fee,
        sign_type = %sign_type,
        job_id = %handle.id(),
        "Accepted unified order"
    );
    Ok(Xml(signed(response, &state.api_key, sign_type)))
}

/// The notification a paid order produces.
fn payment_result(order: &UnifiedOrderRequest) -> PayResultNotify {
    PayResultNotify {
        return_code: SUCCESS.to_string(),
        appid: order.appid.clone(),
        mch_id: order.mch_id.clone(),
        device_info: order.device_info.clone(),
        nonce_str: signing::nonce_str(),
        result_code: SUCCESS.to_string(),
        openid: format!("wxopenid{}", signing::nonce_str()),
        is_subscribe: "Y".to_string(),
        trade_type: order.trade_type.clone(),
        bank_type: "CMB_CREDIT".to_string(),
        total_fee: order.total_fee,
        fee_type: order.fee_type.clone(),
        cash_fee: order.total_fee,
        transaction_id: format!("wxtr_{}", signing::nonce_str()),
        out_trade_no: order.out_trade_no.clone(),
        attach: order.attach.clone(),
        time_end: pay::format_time(Utc::now()),
        ..Default::default()
    }
}
