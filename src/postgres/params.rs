use std::error::Error;

use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_util::bytes;
use uuid::Uuid;

use crate::types::RowValues;

/// Borrowed argument list in the shape `tokio_postgres` expects.
pub struct Params<'a> {
    references: Vec<&'a (dyn ToSql + Sync)>,
}

impl<'a> Params<'a> {
    #[must_use]
    pub fn convert(args: &'a [RowValues]) -> Params<'a> {
        let mut references = Vec::with_capacity(args.len());
        for arg in args {
            references.push(arg as &(dyn ToSql + Sync));
        }
        Params { references }
    }

    #[must_use]
    pub fn as_refs(&self) -> &[&'a (dyn ToSql + Sync)] {
        &self.references
    }
}

impl ToSql for RowValues {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            // Narrow integer columns need the exact wire width.
            RowValues::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                _ => (*i).to_sql(ty, out),
            },
            #[allow(clippy::cast_possible_truncation)]
            RowValues::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => (*f).to_sql(ty, out),
            },
            // Ids travel as text and are parsed only when the column is a uuid.
            RowValues::Text(s) => match *ty {
                Type::UUID => Uuid::parse_str(s)?.to_sql(ty, out),
                _ => s.to_sql(ty, out),
            },
            RowValues::Bool(b) => (*b).to_sql(ty, out),
            RowValues::Timestamp(dt) => match *ty {
                Type::TIMESTAMPTZ => dt.and_utc().to_sql(ty, out),
                _ => dt.to_sql(ty, out),
            },
            RowValues::Null => Ok(IsNull::Yes),
            RowValues::JSON(jsval) => jsval.to_sql(ty, out),
            RowValues::Blob(bytes) => bytes.to_sql(ty, out),
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
                | Type::UUID
                | Type::JSON
                | Type::JSONB
                | Type::BYTEA
        )
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_narrows_to_column_width() {
        let mut buf = bytes::BytesMut::new();
        RowValues::Int(7).to_sql(&Type::INT4, &mut buf).unwrap();
        assert_eq!(buf.len(), 4);

        let mut buf = bytes::BytesMut::new();
        assert!(RowValues::Int(1 << 40).to_sql(&Type::INT4, &mut buf).is_err());
    }

    #[test]
    fn null_binds_as_sql_null() {
        let mut buf = bytes::BytesMut::new();
        let is_null = RowValues::Null.to_sql(&Type::TEXT, &mut buf).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
    }

    #[test]
    fn rejects_unsupported_column_types() {
        assert!(<RowValues as ToSql>::accepts(&Type::INT8));
        assert!(<RowValues as ToSql>::accepts(&Type::JSONB));
        assert!(!<RowValues as ToSql>::accepts(&Type::INET));
    }

    #[test]
    fn text_binds_to_uuid_columns() {
        let mut buf = bytes::BytesMut::new();
        RowValues::Text("7b0f5f5e-8c1a-4c55-9f5d-2b1e0c7a9d10".into())
            .to_sql(&Type::UUID, &mut buf)
            .unwrap();
        assert_eq!(buf.len(), 16);

        let mut buf = bytes::BytesMut::new();
        assert!(
            RowValues::Text("not-a-uuid".into())
                .to_sql(&Type::UUID, &mut buf)
                .is_err()
        );
    }

    #[test]
    fn timestamp_binds_to_timestamptz_columns() {
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .and_then(|d| d.and_hms_opt(12, 30, 0))
            .unwrap();
        assert!(<RowValues as ToSql>::accepts(&Type::TIMESTAMPTZ));
        let mut buf = bytes::BytesMut::new();
        RowValues::Timestamp(ts)
            .to_sql_checked(&Type::TIMESTAMPTZ, &mut buf)
            .unwrap();
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn params_borrow_every_argument() {
        let args = vec![RowValues::Int(1), RowValues::Text("a".into())];
        assert_eq!(Params::convert(&args).as_refs().len(), 2);
    }
}
