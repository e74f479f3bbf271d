//! Request payloads and BSON conversion

use bson::{doc, Bson, Document};
use dbfan_query::{DataError, Query, Result};
use serde::Deserialize;

/// `{database?, collection, filter?, sort?, projection?}`, or
/// `{database?, collection, filter?, max: field}` for the largest value of a field
#[derive(Debug, Deserialize)]
pub(crate) struct FindPayload {
    pub database: Option<String>,
    pub collection: String,
    #[serde(default)]
    pub filter: Option<serde_json::Value>,
    #[serde(default)]
    pub max: Option<String>,
    #[serde(default)]
    pub sort: Option<serde_json::Value>,
    #[serde(default)]
    pub projection: Option<serde_json::Value>,
}

/// One of:
/// - `{database?, collection, insert: [docs]}`
/// - `{database?, collection, filter, update}`
/// - `{database?, collection, filter, delete: true}`
#[derive(Debug, Deserialize)]
pub(crate) struct WritePayload {
    pub database: Option<String>,
    pub collection: String,
    #[serde(default)]
    pub insert: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub filter: Option<serde_json::Value>,
    #[serde(default)]
    pub update: Option<serde_json::Value>,
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug)]
pub(crate) enum WriteOp {
    Insert(Vec<Document>),
    Update { filter: Document, update: Document },
    Delete { filter: Document },
}

pub(crate) fn parse_find(query: &Query) -> Result<FindPayload> {
    serde_json::from_value(query.to_json()?)
        .map_err(|e| DataError::invalid_query(format!("Invalid MongoDB find payload: {}", e)))
}

/// `$group` pipeline yielding one `{_id: "", max}` document
pub(crate) fn max_pipeline(field: &str, filter: Option<Document>) -> Result<Vec<Document>> {
    let field = field.trim();
    if field.is_empty() || field.starts_with('$') {
        return Err(DataError::invalid_query(format!(
            "`max` must name a field, got {:?}",
            field
        )));
    }

    let mut pipeline = Vec::new();
    if let Some(filter) = filter {
        pipeline.push(doc! { "$match": filter });
    }
    pipeline.push(doc! {
        "$group": { "_id": "", "max": { "$max": format!("${}", field) } }
    });
    Ok(pipeline)
}

pub(crate) fn parse_write(query: &Query) -> Result<(Option<String>, String, WriteOp)> {
    let payload: WritePayload = serde_json::from_value(query.to_json()?)
        .map_err(|e| DataError::invalid_query(format!("Invalid MongoDB write payload: {}", e)))?;

    let op = match (payload.insert, payload.filter, payload.update, payload.delete) {
        (Some(documents), None, None, false) => WriteOp::Insert(
            documents
                .into_iter()
                .map(|document| to_document(document, "insert"))
                .collect::<Result<_>>()?,
        ),
        (None, Some(filter), Some(update), false) => WriteOp::Update {
            filter: to_document(filter, "filter")?,
            update: to_document(update, "update")?,
        },
        (None, Some(filter), None, true) => WriteOp::Delete {
            filter: to_document(filter, "filter")?,
        },
        _ => {
            return Err(DataError::invalid_query(
                "MongoDB write payload needs exactly one of `insert`, \
                 `filter` + `update` or `filter` + `delete`",
            ))
        }
    };

    Ok((payload.database, payload.collection, op))
}

/// Convert a JSON object (extended JSON allowed) into a BSON document
pub(crate) fn to_document(value: serde_json::Value, field: &str) -> Result<Document> {
    match Bson::try_from(value) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(DataError::invalid_query(format!(
            "`{}` must be an object, got {:?}",
            field,
            other.element_type()
        ))),
        Err(e) => Err(DataError::invalid_query(format!("`{}`: {}", field, e))),
    }
}

pub(crate) fn optional_document(
    value: Option<serde_json::Value>,
    field: &str,
) -> Result<Option<Document>> {
    value.map(|value| to_document(value, field)).transpose()
}

/// ObjectIds become hex strings and dates RFC 3339 text; everything else maps
/// onto the nearest JSON shape.
pub fn bson_to_json(value: Bson) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Bson::Null | Bson::Undefined => Json::Null,
        Bson::Boolean(b) => Json::Bool(b),
        Bson::Int32(i) => Json::from(i),
        Bson::Int64(i) => Json::from(i),
        Bson::Double(f) => match serde_json::Number::from_f64(f) {
            Some(n) => Json::Number(n),
            None => Json::String(f.to_string()),
        },
        Bson::String(s) => Json::String(s),
        Bson::ObjectId(oid) => Json::String(oid.to_hex()),
        Bson::DateTime(dt) => match dt.try_to_rfc3339_string() {
            Ok(text) => Json::String(text),
            Err(_) => Json::from(dt.timestamp_millis()),
        },
        Bson::Decimal128(d) => Json::String(d.to_string()),
        Bson::Array(items) => Json::Array(items.into_iter().map(bson_to_json).collect()),
        Bson::Document(document) => Json::Object(document_to_map(document)),
        other => other.into_relaxed_extjson(),
    }
}

pub fn document_to_map(document: Document) -> serde_json::Map<String, serde_json::Value> {
    document
        .into_iter()
        .map(|(key, value)| (key, bson_to_json(value)))
        .collect()
}
