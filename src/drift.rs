//! Classification of warehouse load errors into schema drift signals.
//!
//! The warehouse reports schema violations only as free text. This module is
//! the single place that inspects that text: it maps a message to a
//! [`DriftSignal`] and never decides what to do about it.

use std::sync::LazyLock;

use regex::Regex;

use crate::warehouse::FieldType;

static TYPE_CHANGED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)Field\s+([A-Za-z_][A-Za-z0-9_]*)\s+has changed type from ([A-Za-z0-9_]+)\s+to\s+([A-Za-z0-9_]+)",
    )
    .expect("type change pattern compiles")
});

static PARQUET_DOUBLE_MISMATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)Parquet column '([A-Za-z_][A-Za-z0-9_]*)' has type [A-Za-z0-9_]+ which does not match the target cpp_type DOUBLE",
    )
    .expect("parquet mismatch pattern compiles")
});

/// A column whose type differs between the destination and the staged file.
///
/// `from` is the type the destination currently declares and `to` the type the
/// file would introduce, matching the order of the warehouse's
/// "has changed type from X to Y" phrasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDrift {
    pub column: String,
    pub from: FieldType,
    pub to: FieldType,
}

impl TypeDrift {
    pub fn is_int_float(&self) -> bool {
        is_int_float_mismatch(&self.from, &self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftSignal {
    TypeChanged(TypeDrift),
    /// The file's column is not the wide float type the table expects.
    ParquetTypeMismatch { column: String },
    Unclassified,
}

/// An int/float type change wins; otherwise a parquet mismatch in the same
/// message is preferred over a type change that cannot be resolved.
pub fn classify(message: &str) -> DriftSignal {
    match extract_type_change(message) {
        Some(drift) if drift.is_int_float() => DriftSignal::TypeChanged(drift),
        other => match extract_parquet_type_mismatch(message) {
            Some(column) => DriftSignal::ParquetTypeMismatch { column },
            None => other.map_or(DriftSignal::Unclassified, DriftSignal::TypeChanged),
        },
    }
}

pub fn extract_type_change(message: &str) -> Option<TypeDrift> {
    let captures = TYPE_CHANGED.captures(message)?;
    Some(TypeDrift {
        column: captures[1].to_string(),
        from: FieldType::new(&captures[2]),
        to: FieldType::new(&captures[3]),
    })
}

pub fn extract_parquet_type_mismatch(message: &str) -> Option<String> {
    PARQUET_DOUBLE_MISMATCH
        .captures(message)
        .map(|captures| captures[1].to_string())
}

/// True when one side is integer-family and the other float-family.
pub fn is_int_float_mismatch(left: &FieldType, right: &FieldType) -> bool {
    (left.is_integer() && right.is_float()) || (left.is_float() && right.is_integer())
}
