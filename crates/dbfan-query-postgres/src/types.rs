//! Conversions between dbfan values and the PostgreSQL wire format

use bytes::BytesMut;
use dbfan_query::Value;
use std::error::Error;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};

type BoxError = Box<dyn Error + Sync + Send>;

/// A bound parameter. Converts to whatever type the server inferred for the
/// placeholder, parsing text when the placeholder is not textual.
#[derive(Debug, Clone)]
pub struct PgParam(pub Value);

fn is_textual(ty: &Type) -> bool {
    matches!(
        ty.name(),
        "text" | "varchar" | "bpchar" | "name" | "unknown" | "citext"
    )
}

impl ToSql for PgParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match &self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) if is_textual(ty) => b.to_string().to_sql(ty, out),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => match ty.name() {
                "int2" => i16::try_from(*i)?.to_sql(ty, out),
                "int4" => i32::try_from(*i)?.to_sql(ty, out),
                "oid" => u32::try_from(*i)?.to_sql(ty, out),
                "float4" => (*i as f32).to_sql(ty, out),
                "float8" => (*i as f64).to_sql(ty, out),
                _ if is_textual(ty) => i.to_string().to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            Value::Float(f) => match ty.name() {
                "float4" => (*f as f32).to_sql(ty, out),
                _ if is_textual(ty) => f.to_string().to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            Value::Text(s) => match ty.name() {
                "bool" => s.trim().parse::<bool>()?.to_sql(ty, out),
                "int2" => s.trim().parse::<i16>()?.to_sql(ty, out),
                "int4" => s.trim().parse::<i32>()?.to_sql(ty, out),
                "int8" => s.trim().parse::<i64>()?.to_sql(ty, out),
                "float4" => s.trim().parse::<f32>()?.to_sql(ty, out),
                "float8" => s.trim().parse::<f64>()?.to_sql(ty, out),
                "uuid" => uuid::Uuid::parse_str(s.trim())?.to_sql(ty, out),
                "json" | "jsonb" => serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out),
                _ => s.as_str().to_sql(ty, out),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Any column rendered as text
#[derive(Debug, Clone, PartialEq)]
pub struct PgText(pub String);

impl<'a> FromSql<'a> for PgText {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        let text = match ty.name() {
            "bool" => bool::from_sql(ty, raw)?.to_string(),
            "int2" => i16::from_sql(ty, raw)?.to_string(),
            "int4" => i32::from_sql(ty, raw)?.to_string(),
            "int8" => i64::from_sql(ty, raw)?.to_string(),
            "oid" => u32::from_sql(ty, raw)?.to_string(),
            "float4" => f32::from_sql(ty, raw)?.to_string(),
            "float8" => f64::from_sql(ty, raw)?.to_string(),
            "numeric" => numeric_to_string(raw)?,
            "uuid" => uuid::Uuid::from_sql(ty, raw)?.to_string(),
            "timestamp" => chrono::NaiveDateTime::from_sql(ty, raw)?.to_string(),
            "timestamptz" => chrono::DateTime::<chrono::Utc>::from_sql(ty, raw)?.to_rfc3339(),
            "date" => chrono::NaiveDate::from_sql(ty, raw)?.to_string(),
            "time" => chrono::NaiveTime::from_sql(ty, raw)?.to_string(),
            "json" | "jsonb" => serde_json::Value::from_sql(ty, raw)?.to_string(),
            "bytea" => raw.iter().map(|b| format!("{:02x}", b)).collect(),
            // Binary format of these is the text itself
            "text" | "varchar" | "bpchar" | "name" | "xml" | "citext" | "unknown" => {
                String::from_utf8_lossy(raw).into_owned()
            }
            _ => match ty.kind() {
                Kind::Enum(_) => String::from_utf8_lossy(raw).into_owned(),
                Kind::Domain(inner) => PgText::from_sql(inner, raw)?.0,
                Kind::Array(_) => array_to_string(ty, raw)?,
                _ => return Err(format!("cannot render {} as text", ty.name()).into()),
            },
        };
        Ok(PgText(text))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Arrays render as a JSON array of element texts
fn array_to_string(ty: &Type, raw: &[u8]) -> Result<String, BoxError> {
    let elements = Vec::<Option<PgText>>::from_sql(ty, raw)?
        .into_iter()
        .map(|element| match element {
            Some(PgText(text)) => serde_json::Value::String(text),
            None => serde_json::Value::Null,
        })
        .collect();
    Ok(serde_json::Value::Array(elements).to_string())
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Decode the binary `numeric` format: base-10000 digit groups with a weight
/// (exponent of the first group) and a display scale
fn numeric_to_string(raw: &[u8]) -> Result<String, BoxError> {
    if raw.len() < 8 {
        return Err("invalid numeric header".into());
    }

    let read_i16 = |at: usize| i16::from_be_bytes([raw[at], raw[at + 1]]);
    let ndigits = read_i16(0).max(0) as usize;
    let weight = read_i16(2) as i32;
    let sign = u16::from_be_bytes([raw[4], raw[5]]);
    let dscale = u16::from_be_bytes([raw[6], raw[7]]) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    if raw.len() < 8 + ndigits * 2 {
        return Err("numeric digits truncated".into());
    }
    let digits: Vec<i16> = (0..ndigits).map(|i| read_i16(8 + i * 2)).collect();
    let group = |index: i32| -> i16 {
        if index < 0 {
            0
        } else {
            digits.get(index as usize).copied().unwrap_or(0)
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&group(0).to_string());
        for index in 1..=weight {
            out.push_str(&format!("{:04}", group(index)));
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut index = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", group(index)));
            index += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}
