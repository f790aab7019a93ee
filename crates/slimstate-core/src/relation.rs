//! Warehouse relation identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// A fully qualified relation (table or view) in a warehouse
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relation {
    /// Database/catalog name
    pub database: String,

    /// Schema name
    pub schema: String,

    /// Relation name (alias or node name)
    pub identifier: String,
}

impl Relation {
    /// Create a new relation
    pub fn new(database: impl Into<String>, schema: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            schema: schema.into(),
            identifier: identifier.into(),
        }
    }

    /// Unquoted fully qualified name, used as a lookup key
    pub fn fqn(&self) -> String {
        format!("{}.{}.{}", self.database, self.schema, self.identifier)
    }

    /// Quoted form as it appears in compiled SQL
    pub fn render(&self) -> String {
        format!(
            "{}.{}.{}",
            quote(&self.database),
            quote(&self.schema),
            quote(&self.identifier)
        )
    }
}

fn quote(part: &str) -> String {
    format!("\"{}\"", part.replace('"', "\"\""))
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}
