//! Action items extracted from an email by the summariser.
//!
//! Stored as a JSON array in a TEXT column; see `sql.rs` for the Diesel
//! mapping.

use serde::{Deserialize, Serialize};
use std::ops::Deref;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "diesel", derive(diesel::AsExpression, diesel::FromSqlRow))]
#[cfg_attr(feature = "diesel", diesel(sql_type = diesel::sql_types::Text))]
#[serde(transparent)]
pub struct ActionItems(pub Vec<String>);

impl ActionItems {
    /// Build from raw model output, dropping blank entries.
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ActionItems(
            items
                .into_iter()
                .map(Into::into)
                .map(|s: String| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    pub fn into_inner(self) -> Vec<String> {
        self.0
    }
}

impl Deref for ActionItems {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<String>> for ActionItems {
    fn from(items: Vec<String>) -> Self {
        ActionItems::new(items)
    }
}
