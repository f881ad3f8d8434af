use log::info;

use crate::warehouse::{FieldType, TableId, Warehouse, WarehouseError};

/// Widens `column` on the destination table to `FLOAT64`.
///
/// Re-issuing the change against an already widened column is harmless. Any
/// failure is returned as-is; callers treat it as fatal for the current file.
pub fn promote_column_to_float<W>(
    warehouse: &W,
    table: &TableId,
    column: &str,
) -> Result<(), WarehouseError>
where
    W: Warehouse + ?Sized,
{
    warehouse.alter_column_type(table, column, &FieldType::float64())?;
    info!("Promoted column type to FLOAT64: {table}.{column}");
    Ok(())
}
