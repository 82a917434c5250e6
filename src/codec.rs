//! Binary encode/decode of [`RowValues`] via `tokio_postgres::types`.

use std::error::Error;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};
use tokio_util::bytes::{Bytes, BytesMut};

use crate::error::PqMiddlewareError;
use crate::types::RowValues;

/// Binary wire format code.
pub const FORMAT_BINARY: i16 = 1;
/// Text wire format code.
pub const FORMAT_TEXT: i16 = 0;

impl ToSql for RowValues {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            RowValues::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql_checked(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql_checked(ty, out),
                _ => (*i).to_sql_checked(ty, out),
            },
            #[allow(clippy::cast_possible_truncation)]
            RowValues::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql_checked(ty, out),
                _ => (*f).to_sql_checked(ty, out),
            },
            RowValues::Text(s) => s.to_sql_checked(ty, out),
            RowValues::Bool(b) => (*b).to_sql_checked(ty, out),
            RowValues::Timestamp(dt) => match *ty {
                Type::TIMESTAMPTZ => dt.and_utc().to_sql_checked(ty, out),
                Type::DATE => dt.date().to_sql_checked(ty, out),
                _ => dt.to_sql_checked(ty, out),
            },
            RowValues::Null => Ok(IsNull::Yes),
            RowValues::JSON(jsval) => jsval.to_sql_checked(ty, out),
            RowValues::Blob(bytes) => bytes.to_sql_checked(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::TEXT
                | Type::VARCHAR
                | Type::BPCHAR
                | Type::NAME
                | Type::BOOL
                | Type::TIMESTAMP
                | Type::TIMESTAMPTZ
                | Type::DATE
                | Type::JSON
                | Type::JSONB
                | Type::BYTEA
        )
    }

    to_sql_checked!();
}

/// Wire type implied by a value. An untyped NULL is sent as `unknown`, which
/// the server resolves from the statement.
#[must_use]
pub fn infer_type(value: &RowValues) -> Type {
    match value {
        RowValues::Int(_) => Type::INT8,
        RowValues::Float(_) => Type::FLOAT8,
        RowValues::Text(_) => Type::TEXT,
        RowValues::Bool(_) => Type::BOOL,
        RowValues::Timestamp(_) => Type::TIMESTAMP,
        RowValues::JSON(_) => Type::JSONB,
        RowValues::Blob(_) => Type::BYTEA,
        RowValues::Null => Type::UNKNOWN,
    }
}

/// Encode a value as binary for `ty`. NULL encodes as `None`.
///
/// # Errors
/// Returns `PqMiddlewareError::ParameterError` when the value does not fit the type.
pub fn encode(value: &RowValues, ty: &Type) -> Result<Option<Bytes>, PqMiddlewareError> {
    if matches!(value, RowValues::Null) {
        return Ok(None);
    }
    let mut buf = BytesMut::new();
    match value.to_sql_checked(ty, &mut buf) {
        Ok(IsNull::Yes) => Ok(None),
        Ok(IsNull::No) => Ok(Some(buf.freeze())),
        Err(e) => Err(PqMiddlewareError::ParameterError(format!(
            "cannot encode {value:?} as {ty}: {e}"
        ))),
    }
}

fn decode_with<'a, T: FromSql<'a>>(ty: &Type, raw: &'a [u8]) -> Result<T, PqMiddlewareError> {
    T::from_sql(ty, raw)
        .map_err(|e| PqMiddlewareError::ProtocolError(format!("cannot decode {ty} column: {e}")))
}

/// Decode one cell. `raw == None` is SQL NULL.
///
/// # Errors
/// Returns `PqMiddlewareError::ProtocolError` when the bytes are not valid for the type.
pub fn decode(ty: &Type, format: i16, raw: Option<&[u8]>) -> Result<RowValues, PqMiddlewareError> {
    let Some(raw) = raw else {
        return Ok(RowValues::Null);
    };
    if format == FORMAT_TEXT {
        return String::from_utf8(raw.to_vec())
            .map(RowValues::Text)
            .map_err(|e| PqMiddlewareError::ProtocolError(format!("invalid utf-8 in column: {e}")));
    }
    let value = match *ty {
        Type::INT2 => RowValues::Int(i64::from(decode_with::<i16>(ty, raw)?)),
        Type::INT4 => RowValues::Int(i64::from(decode_with::<i32>(ty, raw)?)),
        Type::INT8 => RowValues::Int(decode_with::<i64>(ty, raw)?),
        Type::OID => RowValues::Int(i64::from(decode_with::<u32>(ty, raw)?)),
        Type::FLOAT4 => RowValues::Float(f64::from(decode_with::<f32>(ty, raw)?)),
        Type::FLOAT8 => RowValues::Float(decode_with::<f64>(ty, raw)?),
        Type::BOOL => RowValues::Bool(decode_with::<bool>(ty, raw)?),
        Type::TIMESTAMP => RowValues::Timestamp(decode_with::<NaiveDateTime>(ty, raw)?),
        Type::TIMESTAMPTZ => {
            RowValues::Timestamp(decode_with::<DateTime<Utc>>(ty, raw)?.naive_utc())
        }
        Type::DATE => RowValues::Timestamp(
            decode_with::<NaiveDate>(ty, raw)?
                .and_hms_opt(0, 0, 0)
                .unwrap_or_default(),
        ),
        Type::JSON | Type::JSONB => RowValues::JSON(decode_with::<Value>(ty, raw)?),
        Type::BYTEA => RowValues::Blob(decode_with::<Vec<u8>>(ty, raw)?),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            RowValues::Text(decode_with::<String>(ty, raw)?)
        }
        _ => RowValues::Blob(raw.to_vec()),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_narrows_to_declared_width() {
        let bytes = encode(&RowValues::Int(7), &Type::INT4).unwrap().unwrap();
        assert_eq!(bytes.len(), 4);
        let value = decode(&Type::INT4, FORMAT_BINARY, Some(&bytes[..])).unwrap();
        assert_eq!(value, RowValues::Int(7));

        let err = encode(&RowValues::Int(i64::MAX), &Type::INT2).unwrap_err();
        assert!(matches!(err, PqMiddlewareError::ParameterError(_)));
    }

    #[test]
    fn null_has_no_payload() {
        assert!(encode(&RowValues::Null, &Type::TEXT).unwrap().is_none());
        assert_eq!(decode(&Type::TEXT, FORMAT_BINARY, None).unwrap(), RowValues::Null);
    }

    #[test]
    fn mismatched_type_is_rejected() {
        let err = encode(&RowValues::Bool(true), &Type::INT8).unwrap_err();
        assert!(matches!(err, PqMiddlewareError::ParameterError(_)));
    }

    #[test]
    fn text_format_decodes_as_text() {
        let value = decode(&Type::INT4, FORMAT_TEXT, Some(&b"12"[..])).unwrap();
        assert_eq!(value, RowValues::Text("12".into()));
    }

    #[test]
    fn untyped_null_is_sent_as_unknown() {
        assert_eq!(infer_type(&RowValues::Int(1)), Type::INT8);
        assert_eq!(infer_type(&RowValues::Blob(vec![1])), Type::BYTEA);
        assert_eq!(infer_type(&RowValues::Null), Type::UNKNOWN);
        assert!(encode(&RowValues::Null, &Type::UNKNOWN).unwrap().is_none());
    }

    #[test]
    fn unknown_binary_type_is_blob() {
        let value = decode(&Type::UUID, FORMAT_BINARY, Some(&[1u8, 2, 3][..])).unwrap();
        assert_eq!(value, RowValues::Blob(vec![1, 2, 3]));
    }
}
