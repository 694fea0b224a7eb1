//! Customs declaration status query.
//!
//! The response is the canonical multi-record shape: a `count` field followed by
//! `customs_0`, `state_0`, ..., `customs_1`, ... for each declaration on the order.

use bon::Builder;

use crate::client::Client;
use crate::codec::{IndexedList, IndexedRecord};
use crate::errors::Result;
use crate::fields::{FieldMap, RESULT_CODE, RETURN_CODE, RETURN_MSG};

pub const DECLARE_QUERY_PATH: &str = "/cgi-bin/mch/customs/customdeclarequery";

pub const QUERY_COUNT: &str = "count";

/// Per-record fields of a query list entry
pub const QUERY_ITEM_FIELDS: &[&str] = &[
    "customs",
    "state",
    "modify_time",
    "cert_check_result",
    "sub_order_no",
    "sub_order_id",
    "mch_customs_no",
    "fee_type",
    "order_fee",
    "duty",
    "transport_fee",
    "product_fee",
    "explanation",
];

/// Identifies the order by one of four keys. When several are set the provider prefers
/// `sub_order_id`, then `sub_order_no`, then `transaction_id`, then `out_trade_no`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Builder)]
#[builder(on(String, into))]
pub struct DeclareQueryRequest {
    #[builder(default)]
    pub out_trade_no: String,
    #[builder(default)]
    pub transaction_id: String,
    #[builder(default)]
    pub sub_order_no: String,
    #[builder(default)]
    pub sub_order_id: String,
    pub customs: String,
}

impl DeclareQueryRequest {
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert_non_empty("out_trade_no", &self.out_trade_no);
        fields.insert_non_empty("transaction_id", &self.transaction_id);
        fields.insert_non_empty("sub_order_no", &self.sub_order_no);
        fields.insert_non_empty("sub_order_id", &self.sub_order_id);
        fields.insert("customs", &self.customs);
        fields
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryItem {
    pub customs: String,
    /// UNDECLARED, SUBMITTED, PROCESSING, SUCCESS, FAIL or EXCEPT
    pub state: String,
    /// `yyyyMMddHHmmss`, Beijing time
    pub modify_time: String,
    /// UNCHECKED, SAME or DIFFERENT
    pub cert_check_result: String,

    pub sub_order_no: String,
    pub sub_order_id: String,
    pub mch_customs_no: String,
    pub fee_type: String,
    pub order_fee: i64,
    pub duty: i64,
    pub transport_fee: i64,
    pub product_fee: i64,
    /// Failure reason when `state` is FAIL or EXCEPT
    pub explanation: String,
}

impl QueryItem {
    fn from_record(record: IndexedRecord<'_>) -> Result<Self> {
        Ok(Self {
            customs: record.string("customs"),
            state: record.string("state"),
            modify_time: record.string("modify_time"),
            cert_check_result: record.string("cert_check_result"),
            sub_order_no: record.string("sub_order_no"),
            sub_order_id: record.string("sub_order_id"),
            mch_customs_no: record.string("mch_customs_no"),
            fee_type: record.string("fee_type"),
            order_fee: record.int("order_fee")?,
            duty: record.int("duty")?,
            transport_fee: record.int("transport_fee")?,
            product_fee: record.int("product_fee")?,
            explanation: record.string("explanation"),
        })
    }

    /// Unindexed record, for `codec::push_indexed`
    pub fn to_record(&self) -> FieldMap {
        let mut record = FieldMap::new();
        record.insert("customs", &self.customs);
        record.insert_non_empty("state", &self.state);
        record.insert_non_empty("modify_time", &self.modify_time);
        record.insert_non_empty("cert_check_result", &self.cert_check_result);
        record.insert_non_empty("sub_order_no", &self.sub_order_no);
        record.insert_non_empty("sub_order_id", &self.sub_order_id);
        record.insert_non_empty("mch_customs_no", &self.mch_customs_no);
        record.insert_non_empty("fee_type", &self.fee_type);
        record.insert("order_fee", self.order_fee.to_string());
        record.insert("duty", self.duty.to_string());
        record.insert("transport_fee", self.transport_fee.to_string());
        record.insert("product_fee", self.product_fee.to_string());
        record.insert_non_empty("explanation", &self.explanation);
        record
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclareQueryResponse {
    pub return_code: String,
    pub return_msg: String,
    pub result_code: String,
    pub transaction_id: String,
    pub query_list: Vec<QueryItem>,
    /// Raw response body, kept for audit logging
    pub body: String,
}

impl DeclareQueryResponse {
    pub fn from_fields(fields: &FieldMap) -> Result<Self> {
        let query_list = IndexedList::new(fields, QUERY_COUNT, QUERY_ITEM_FIELDS)?.decode_with(QueryItem::from_record)?;
        Ok(Self {
            return_code: fields.get_or_empty(RETURN_CODE).to_string(),
            return_msg: fields.get_or_empty(RETURN_MSG).to_string(),
            result_code: fields.get_or_empty(RESULT_CODE).to_string(),
            transaction_id: fields.get_or_empty("transaction_id").to_string(),
            query_list,
            body: String::new(),
        })
    }
}

/// Query the declaration status of an order. The whole call fails if any list entry is
/// malformed; no partial list is returned.
pub async fn declare_query(client: &Client, request: &DeclareQueryRequest) -> Result<DeclareQueryResponse> {
    let response = client.post_xml(DECLARE_QUERY_PATH, request.to_fields()).await?;
    let mut parsed = DeclareQueryResponse::from_fields(response.fields())?;
    parsed.body = response.body().to_string();
    Ok(parsed)
}
