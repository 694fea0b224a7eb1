//! Unified order placement and the asynchronous payment-result notification.
//!
//! Each message converts to and from a [`FieldMap`] with an explicit field list. Optional
//! string fields are omitted from the wire when empty; integer amounts are in fen (1/100 CNY).

use bon::Builder;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};

use crate::client::{Client, Response};
use crate::codec::{self, IndexedList};
use crate::errors::{Error, Result};
use crate::fields::{
    APPID, ERR_CODE, ERR_CODE_DES, FieldMap, MCH_ID, NONCE_STR, RESULT_CODE, RETURN_CODE, RETURN_MSG, SIGN_TYPE,
};
use crate::signing::SignType;

pub const UNIFIED_ORDER_PATH: &str = "/pay/unifiedorder";

/// Provider timestamps are `yyyyMMddHHmmss` in Beijing time (UTC+8).
const TIME_FORMAT: &str = "%Y%m%d%H%M%S";
const BEIJING_OFFSET_HOURS: i64 = 8;

/// Render `time` the way the provider expects it.
pub fn format_time(time: DateTime<Utc>) -> String {
    (time.naive_utc() + TimeDelta::hours(BEIJING_OFFSET_HOURS)).format(TIME_FORMAT).to_string()
}

/// Inverse of [`format_time`].
pub fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    let local = NaiveDateTime::parse_from_str(value, TIME_FORMAT).ok()?;
    Some((local - TimeDelta::hours(BEIJING_OFFSET_HOURS)).and_utc())
}

fn optional_time(fields: &FieldMap, key: &str) -> Result<Option<DateTime<Utc>>> {
    match fields.get(key) {
        None | Some("") => Ok(None),
        Some(raw) => parse_time(raw)
            .map(Some)
            .ok_or_else(|| Error::invalid(key, None, raw, format!("expected {TIME_FORMAT}"))),
    }
}

fn optional_sign_type(fields: &FieldMap) -> Result<Option<SignType>> {
    match fields.get(SIGN_TYPE) {
        None | Some("") => Ok(None),
        Some(name) => name.parse().map(Some),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(on(String, into))]
pub struct UnifiedOrderRequest {
    /// Filled from the client config when empty
    #[builder(default)]
    pub appid: String,
    #[builder(default)]
    pub mch_id: String,
    #[builder(default)]
    pub device_info: String,
    pub sign_type: Option<SignType>,
    pub body: String,
    #[builder(default)]
    pub detail: String,
    #[builder(default)]
    pub attach: String,
    pub out_trade_no: String,
    #[builder(default)]
    pub fee_type: String,
    pub total_fee: i64,
    pub spbill_create_ip: String,
    pub time_start: Option<DateTime<Utc>>,
    pub time_expire: Option<DateTime<Utc>>,
    #[builder(default)]
    pub goods_tag: String,
    pub notify_url: String,
    /// JSAPI, NATIVE, APP or MWEB
    pub trade_type: String,
    #[builder(default)]
    pub product_id: String,
    #[builder(default)]
    pub limit_pay: String,
    #[builder(default)]
    pub openid: String,
    #[builder(default)]
    pub scene_info: String,
}

impl UnifiedOrderRequest {
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert_non_empty(APPID, &self.appid);
        fields.insert_non_empty(MCH_ID, &self.mch_id);
        fields.insert_non_empty("device_info", &self.device_info);
        if let Some(sign_type) = self.sign_type {
            fields.insert(SIGN_TYPE, sign_type.as_str());
        }
        fields.insert("body", &self.body);
        fields.insert_non_empty("detail", &self.detail);
        fields.insert_non_empty("attach", &self.attach);
        fields.insert("out_trade_no", &self.out_trade_no);
        fields.insert_non_empty("fee_type", &self.fee_type);
        fields.insert("total_fee", self.total_fee.to_string());
        fields.insert("spbill_create_ip", &self.spbill_create_ip);
        if let Some(time) = self.time_start {
            fields.insert("time_start", format_time(time));
        }
        if let Some(time) = self.time_expire {
            fields.insert("time_expire", format_time(time));
        }
        fields.insert_non_empty("goods_tag", &self.goods_tag);
        fields.insert("notify_url", &self.notify_url);
        fields.insert("trade_type", &self.trade_type);
        fields.insert_non_empty("product_id", &self.product_id);
        fields.insert_non_empty("limit_pay", &self.limit_pay);
        fields.insert_non_empty("openid", &self.openid);
        fields.insert_non_empty("scene_info", &self.scene_info);
        fields
    }

    /// Parse an inbound request (the simulation server's view of it).
    pub fn from_fields(fields: &FieldMap) -> Result<Self> {
        Ok(Self {
            appid: fields.get_or_empty(APPID).to_string(),
            mch_id: fields.get_or_empty(MCH_ID).to_string(),
            device_info: fields.get_or_empty("device_info").to_string(),
            sign_type: optional_sign_type(fields)?,
            body: fields.require("body")?.to_string(),
            detail: fields.get_or_empty("detail").to_string(),
            attach: fields.get_or_empty("attach").to_string(),
            out_trade_no: fields.require("out_trade_no")?.to_string(),
            fee_type: fields.get_or_empty("fee_type").to_string(),
            total_fee: fields.parse_i64("total_fee")?.ok_or_else(|| Error::missing("total_fee"))?,
            spbill_create_ip: fields.get_or_empty("spbill_create_ip").to_string(),
            time_start: optional_time(fields, "time_start")?,
            time_expire: optional_time(fields, "time_expire")?,
            goods_tag: fields.get_or_empty("goods_tag").to_string(),
            notify_url: fields.get_or_empty("notify_url").to_string(),
            trade_type: fields.require("trade_type")?.to_string(),
            product_id: fields.get_or_empty("product_id").to_string(),
            limit_pay: fields.get_or_empty("limit_pay").to_string(),
            openid: fields.get_or_empty("openid").to_string(),
            scene_info: fields.get_or_empty("scene_info").to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnifiedOrderResponse {
    pub return_code: String,
    pub return_msg: String,
    pub appid: String,
    pub mch_id: String,
    pub device_info: String,
    pub nonce_str: String,
    pub result_code: String,
    pub err_code: String,
    pub err_code_des: String,
    pub trade_type: String,
    pub prepay_id: String,
    /// NATIVE only
    pub code_url: String,
    /// MWEB only
    pub mweb_url: String,
    /// Raw response body, kept for audit logging
    pub body: String,
}

impl UnifiedOrderResponse {
    pub fn from_response(response: &Response) -> Result<Self> {
        let fields = response.fields();
        Ok(Self {
            return_code: fields.require(RETURN_CODE)?.to_string(),
            return_msg: fields.get_or_empty(RETURN_MSG).to_string(),
            appid: fields.get_or_empty(APPID).to_string(),
            mch_id: fields.get_or_empty(MCH_ID).to_string(),
            device_info: fields.get_or_empty("device_info").to_string(),
            nonce_str: fields.get_or_empty(NONCE_STR).to_string(),
            result_code: fields.get_or_empty(RESULT_CODE).to_string(),
            err_code: fields.get_or_empty(ERR_CODE).to_string(),
            err_code_des: fields.get_or_empty(ERR_CODE_DES).to_string(),
            trade_type: fields.get_or_empty("trade_type").to_string(),
            prepay_id: fields.get_or_empty("prepay_id").to_string(),
            code_url: fields.get_or_empty("code_url").to_string(),
            mweb_url: fields.get_or_empty("mweb_url").to_string(),
            body: response.body().to_string(),
        })
    }
}

/// Place an order. A `FAIL` status comes back as a normal response.
pub async fn unified_order(client: &Client, request: &UnifiedOrderRequest) -> Result<UnifiedOrderResponse> {
    let response = client.post_xml(UNIFIED_ORDER_PATH, request.to_fields()).await?;
    UnifiedOrderResponse::from_response(&response)
}

pub const COUPON_COUNT: &str = "coupon_count";
const COUPON_SHAPE: &[&str] = &["coupon_id", "coupon_type", "coupon_fee"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coupon {
    pub coupon_id: String,
    /// CASH or NO_CASH
    pub coupon_type: String,
    pub coupon_fee: i64,
}

/// The payment result pushed to the merchant's `notify_url`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayResultNotify {
    pub return_code: String,
    pub return_msg: String,
    pub appid: String,
    pub mch_id: String,
    pub device_info: String,
    pub nonce_str: String,
    pub result_code: String,
    pub err_code: String,
    pub err_code_des: String,
    pub openid: String,
    /// Y or N
    pub is_subscribe: String,
    pub trade_type: String,
    pub bank_type: String,
    pub total_fee: i64,
    pub fee_type: String,
    pub cash_fee: i64,
    pub cash_fee_type: String,
    pub coupon_fee: Option<i64>,
    pub coupons: Vec<Coupon>,
    pub transaction_id: String,
    pub out_trade_no: String,
    pub attach: String,
    pub time_end: String,
}

impl PayResultNotify {
    /// Unsigned field map; the sender adds `sign`.
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(RETURN_CODE, &self.return_code);
        fields.insert_non_empty(RETURN_MSG, &self.return_msg);
        fields.insert_non_empty(APPID, &self.appid);
        fields.insert_non_empty(MCH_ID, &self.mch_id);
        fields.insert_non_empty("device_info", &self.device_info);
        fields.insert_non_empty(NONCE_STR, &self.nonce_str);
        fields.insert_non_empty(RESULT_CODE, &self.result_code);
        fields.insert_non_empty(ERR_CODE, &self.err_code);
        fields.insert_non_empty(ERR_CODE_DES, &self.err_code_des);
        fields.insert_non_empty("openid", &self.openid);
        fields.insert_non_empty("is_subscribe", &self.is_subscribe);
        fields.insert_non_empty("trade_type", &self.trade_type);
        fields.insert_non_empty("bank_type", &self.bank_type);
        fields.insert("total_fee", self.total_fee.to_string());
        fields.insert_non_empty("fee_type", &self.fee_type);
        fields.insert("cash_fee", self.cash_fee.to_string());
        fields.insert_non_empty("cash_fee_type", &self.cash_fee_type);
        if let Some(fee) = self.coupon_fee {
            fields.insert("coupon_fee", fee.to_string());
        }
        if !self.coupons.is_empty() {
            let records: Vec<FieldMap> = self
                .coupons
                .iter()
                .map(|c| {
                    let mut record = FieldMap::new();
                    record.insert("coupon_id", &c.coupon_id);
                    record.insert_non_empty("coupon_type", &c.coupon_type);
                    record.insert("coupon_fee", c.coupon_fee.to_string());
                    record
                })
                .collect();
            codec::push_indexed(&mut fields, COUPON_COUNT, &records);
        }
        fields.insert_non_empty("transaction_id", &self.transaction_id);
        fields.insert_non_empty("out_trade_no", &self.out_trade_no);
        fields.insert_non_empty("attach", &self.attach);
        fields.insert_non_empty("time_end", &self.time_end);
        fields
    }

    /// Parse a received notification. The caller verifies `sign` separately.
    pub fn from_fields(fields: &FieldMap) -> Result<Self> {
        let coupons = IndexedList::new(fields, COUPON_COUNT, COUPON_SHAPE)?.decode_with(|record| {
            Ok(Coupon {
                coupon_id: record.string("coupon_id"),
                coupon_type: record.string("coupon_type"),
                coupon_fee: record.int("coupon_fee")?,
            })
        })?;

        Ok(Self {
            return_code: fields.require(RETURN_CODE)?.to_string(),
            return_msg: fields.get_or_empty(RETURN_MSG).to_string(),
            appid: fields.get_or_empty(APPID).to_string(),
            mch_id: fields.get_or_empty(MCH_ID).to_string(),
            device_info: fields.get_or_empty("device_info").to_string(),
            nonce_str: fields.get_or_empty(NONCE_STR).to_string(),
            result_code: fields.get_or_empty(RESULT_CODE).to_string(),
            err_code: fields.get_or_empty(ERR_CODE).to_string(),
            err_code_des: fields.get_or_empty(ERR_CODE_DES).to_string(),
            openid: fields.get_or_empty("openid").to_string(),
            is_subscribe: fields.get_or_empty("is_subscribe").to_string(),
            trade_type: fields.get_or_empty("trade_type").to_string(),
            bank_type: fields.get_or_empty("bank_type").to_string(),
            total_fee: fields.parse_i64("total_fee")?.unwrap_or_default(),
            fee_type: fields.get_or_empty("fee_type").to_string(),
            cash_fee: fields.parse_i64("cash_fee")?.unwrap_or_default(),
            cash_fee_type: fields.get_or_empty("cash_fee_type").to_string(),
            coupon_fee: fields.parse_i64("coupon_fee")?,
            coupons,
            transaction_id: fields.get_or_empty("transaction_id").to_string(),
            out_trade_no: fields.get_or_empty("out_trade_no").to_string(),
            attach: fields.get_or_empty("attach").to_string(),
            time_end: fields.get_or_empty("time_end").to_string(),
        })
    }
}
