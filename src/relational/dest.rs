use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;

use crate::error::StoreError;
use crate::types::RowValues;

/// Conversion from one column value into a typed destination.
pub trait FromRowValue: Sized {
    /// # Errors
    /// Returns `StoreError::ScanError` if the value has an incompatible type.
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError>;
}

/// A destination for a whole row: a tuple of column types, or the raw values.
pub trait ScanDest: Sized {
    /// # Errors
    /// Returns `StoreError::ScanError` on a column-count or type mismatch.
    fn scan_from(values: &[RowValues]) -> Result<Self, StoreError>;
}

fn mismatch(expected: &str, found: &RowValues) -> StoreError {
    StoreError::ScanError(format!(
        "cannot scan {} value into {expected}",
        found.type_name()
    ))
}

impl FromRowValue for i64 {
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        match value {
            RowValues::Int(v) => Ok(*v),
            other => Err(mismatch("i64", other)),
        }
    }
}

impl FromRowValue for i32 {
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        match value {
            RowValues::Int(v) => i32::try_from(*v)
                .map_err(|e| StoreError::ScanError(format!("cannot scan {v} into i32: {e}"))),
            other => Err(mismatch("i32", other)),
        }
    }
}

impl FromRowValue for i16 {
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        match value {
            RowValues::Int(v) => i16::try_from(*v)
                .map_err(|e| StoreError::ScanError(format!("cannot scan {v} into i16: {e}"))),
            other => Err(mismatch("i16", other)),
        }
    }
}

impl FromRowValue for f64 {
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        match value {
            RowValues::Float(v) => Ok(*v),
            other => Err(mismatch("f64", other)),
        }
    }
}

impl FromRowValue for f32 {
    #[allow(clippy::cast_possible_truncation)]
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        match value {
            RowValues::Float(v) => Ok(*v as f32),
            other => Err(mismatch("f32", other)),
        }
    }
}

impl FromRowValue for bool {
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        match value {
            RowValues::Bool(v) => Ok(*v),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl FromRowValue for String {
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        match value {
            RowValues::Text(v) => Ok(v.clone()),
            other => Err(mismatch("String", other)),
        }
    }
}

impl FromRowValue for NaiveDateTime {
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        match value {
            RowValues::Timestamp(v) => Ok(*v),
            other => Err(mismatch("NaiveDateTime", other)),
        }
    }
}

impl FromRowValue for JsonValue {
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        match value {
            RowValues::JSON(v) => Ok(v.clone()),
            other => Err(mismatch("serde_json::Value", other)),
        }
    }
}

impl FromRowValue for Vec<u8> {
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        match value {
            RowValues::Blob(v) => Ok(v.clone()),
            other => Err(mismatch("Vec<u8>", other)),
        }
    }
}

impl FromRowValue for RowValues {
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        Ok(value.clone())
    }
}

impl<T: FromRowValue> FromRowValue for Option<T> {
    fn from_row_value(value: &RowValues) -> Result<Self, StoreError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_row_value(value).map(Some)
        }
    }
}

impl ScanDest for Vec<RowValues> {
    fn scan_from(values: &[RowValues]) -> Result<Self, StoreError> {
        Ok(values.to_vec())
    }
}

macro_rules! impl_scan_dest_tuple {
    ($len:expr => $($ty:ident $idx:tt),+) => {
        impl<$($ty: FromRowValue),+> ScanDest for ($($ty,)+) {
            fn scan_from(values: &[RowValues]) -> Result<Self, StoreError> {
                if values.len() != $len {
                    return Err(StoreError::ScanError(format!(
                        "destination expects {} columns, row has {}",
                        $len,
                        values.len()
                    )));
                }
                Ok(($($ty::from_row_value(&values[$idx])?,)+))
            }
        }
    };
}

impl_scan_dest_tuple!(1 => A 0);
impl_scan_dest_tuple!(2 => A 0, B 1);
impl_scan_dest_tuple!(3 => A 0, B 1, C 2);
impl_scan_dest_tuple!(4 => A 0, B 1, C 2, D 3);
impl_scan_dest_tuple!(5 => A 0, B 1, C 2, D 3, E 4);
impl_scan_dest_tuple!(6 => A 0, B 1, C 2, D 3, E 4, F 5);
impl_scan_dest_tuple!(7 => A 0, B 1, C 2, D 3, E 4, F 5, G 6);
impl_scan_dest_tuple!(8 => A 0, B 1, C 2, D 3, E 4, F 5, G 6, H 7);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_mismatch_is_a_scan_error() {
        let values = vec![RowValues::Int(1), RowValues::Int(2)];
        let err = <(i64,)>::scan_from(&values).unwrap_err();
        assert!(matches!(err, StoreError::ScanError(_)));
        assert!(err.to_string().contains("expects 1 columns, row has 2"));
    }

    #[test]
    fn type_mismatch_is_a_scan_error() {
        let values = vec![RowValues::Text("x".into())];
        let err = <(i64,)>::scan_from(&values).unwrap_err();
        assert!(matches!(err, StoreError::ScanError(_)));
    }

    #[test]
    fn null_needs_an_option_destination() {
        let values = vec![RowValues::Null, RowValues::Null];
        let (a, b): (Option<String>, Option<i64>) = ScanDest::scan_from(&values).unwrap();
        assert_eq!(a, None);
        assert_eq!(b, None);

        let err = <(String,)>::scan_from(&[RowValues::Null]).unwrap_err();
        assert!(matches!(err, StoreError::ScanError(_)));
    }

    #[test]
    fn narrowing_checks_range() {
        assert_eq!(i32::from_row_value(&RowValues::Int(42)).unwrap(), 42);
        assert!(i16::from_row_value(&RowValues::Int(1 << 20)).is_err());
    }
}
