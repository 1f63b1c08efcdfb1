use thiserror::Error;

#[derive(Error, Debug)]
pub enum DisbursementError {
    #[error("Required relation '{relation}' was not provided")]
    MissingTable { relation: String },

    #[error("Relation '{relation}' is missing required column {column}")]
    MissingColumn { relation: String, column: String },

    #[error("Invalid report configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid completion tolerance {0}: must be between 0 and 100")]
    InvalidTolerance(rust_decimal::Decimal),

    #[error("Invalid amount scale {0}: must be positive")]
    InvalidScale(rust_decimal::Decimal),

    #[error("Amounts for '{unit}' exceed the decimal range")]
    AmountOverflow { unit: String },

    #[error("Shared source lock was poisoned by a panicking reader")]
    SourcePoisoned,

    #[error("Workbook error: {0}")]
    Workbook(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DisbursementError {
    pub(crate) fn missing_column(relation: &str, aliases: &[&str]) -> Self {
        let column = aliases
            .iter()
            .map(|a| format!("'{}'", a))
            .collect::<Vec<_>>()
            .join(" or ");
        Self::MissingColumn {
            relation: relation.to_string(),
            column,
        }
    }

    pub(crate) fn overflow(unit: &str) -> Self {
        Self::AmountOverflow {
            unit: unit.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DisbursementError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_column_names_every_alias() {
        let err = DisbursementError::missing_column("Operaciones", &["IDEtapa", "NoEtapa"]);
        assert_eq!(
            err.to_string(),
            "Relation 'Operaciones' is missing required column 'IDEtapa' or 'NoEtapa'"
        );
    }
}
