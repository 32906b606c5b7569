//! JSON document collections with a small filter language.
//!
//! The store offers query / get / add / update / delete on single documents.
//! There are no multi-document transactions; callers read, decide, and write.

use std::fmt;
use std::future::Future;

use chrono::Utc;
use libsql::params;
use libsql::params::Params;
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use recapsync_shared::{RecapSyncError, Result};

use crate::Storage;

/// The document collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Events,
    Groups,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Groups => "groups",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored document and its id.
#[derive(Debug, Clone, PartialEq)]
pub struct Document<T> {
    pub id: String,
    pub data: T,
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Predicate over top-level document fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Field equals the string value.
    Eq(String, String),
    /// Array field contains the string value.
    ArrayContains(String, String),
    /// Every sub-filter holds. Empty matches everything.
    And(Vec<Filter>),
    /// Some sub-filter holds. Empty matches nothing.
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<String>) -> Self {
        Self::Eq(field.to_string(), value.into())
    }

    pub fn array_contains(field: &str, value: impl Into<String>) -> Self {
        Self::ArrayContains(field.to_string(), value.into())
    }

    /// Compile to a SQL boolean expression over `body`, appending bind values.
    pub(crate) fn to_sql(&self, binds: &mut Vec<String>) -> Result<String> {
        match self {
            Self::Eq(field, value) => {
                check_field(field)?;
                binds.push(value.clone());
                Ok(format!("json_extract(body, '$.{field}') = ?"))
            }
            Self::ArrayContains(field, value) => {
                check_field(field)?;
                binds.push(value.clone());
                Ok(format!(
                    "EXISTS (SELECT 1 FROM json_each(body, '$.{field}') WHERE json_each.value = ?)"
                ))
            }
            Self::And(parts) => join(parts, " AND ", "1", binds),
            Self::Or(parts) => join(parts, " OR ", "0", binds),
        }
    }
}

fn join(parts: &[Filter], op: &str, empty: &str, binds: &mut Vec<String>) -> Result<String> {
    if parts.is_empty() {
        return Ok(empty.to_string());
    }
    let compiled = parts
        .iter()
        .map(|p| p.to_sql(binds))
        .collect::<Result<Vec<_>>>()?;
    Ok(format!("({})", compiled.join(op)))
}

/// Field names are spliced into JSON paths, so only identifiers are allowed.
fn check_field(field: &str) -> Result<()> {
    let mut chars = field.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RecapSyncError::validation(format!(
            "invalid filter field: {field:?}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

/// Single-document operations over the `events` and `groups` collections.
pub trait DocumentStore {
    /// Every document matching `filter`, in insertion order.
    fn query<T: DeserializeOwned>(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> impl Future<Output = Result<Vec<Document<T>>>>;

    fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: &str,
    ) -> impl Future<Output = Result<Option<Document<T>>>>;

    /// Insert a new document and return its generated id.
    fn add<T: Serialize>(&self, collection: Collection, data: &T)
    -> impl Future<Output = Result<String>>;

    /// Merge the top-level fields of `patch` into an existing document.
    fn update<T: Serialize>(
        &self,
        collection: Collection,
        id: &str,
        patch: &T,
    ) -> impl Future<Output = Result<()>>;

    fn delete(&self, collection: Collection, id: &str) -> impl Future<Output = Result<()>>;
}

fn decode<T: DeserializeOwned>(collection: Collection, id: &str, body: &str) -> Result<T> {
    serde_json::from_str(body)
        .map_err(|e| RecapSyncError::Storage(format!("{collection}/{id}: invalid document: {e}")))
}

fn encode<T: Serialize>(data: &T) -> Result<String> {
    serde_json::to_string(data).map_err(|e| RecapSyncError::StoreWrite(e.to_string()))
}

impl DocumentStore for Storage {
    async fn query<T: DeserializeOwned>(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Document<T>>> {
        let mut binds = vec![collection.as_str().to_string()];
        let predicate = filter.to_sql(&mut binds)?;
        let sql = format!(
            "SELECT id, body FROM documents WHERE collection = ? AND {predicate} ORDER BY rowid"
        );
        let values = binds.into_iter().map(libsql::Value::Text).collect();

        let mut rows = self
            .conn
            .query(&sql, Params::Positional(values))
            .await
            .map_err(|e| RecapSyncError::Storage(e.to_string()))?;

        let mut docs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| RecapSyncError::Storage(e.to_string()))?
        {
            let id: String = row
                .get(0)
                .map_err(|e| RecapSyncError::Storage(e.to_string()))?;
            let body: String = row
                .get(1)
                .map_err(|e| RecapSyncError::Storage(e.to_string()))?;
            let data = decode(collection, &id, &body)?;
            docs.push(Document { id, data });
        }
        Ok(docs)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document<T>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id],
            )
            .await
            .map_err(|e| RecapSyncError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let body: String = row
                    .get(0)
                    .map_err(|e| RecapSyncError::Storage(e.to_string()))?;
                Ok(Some(Document {
                    id: id.to_string(),
                    data: decode(collection, id, &body)?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(RecapSyncError::Storage(e.to_string())),
        }
    }

    async fn add<T: Serialize>(&self, collection: Collection, data: &T) -> Result<String> {
        let body = encode(data)?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO documents (collection, id, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![collection.as_str(), id.as_str(), body, now.as_str(), now.as_str()],
            )
            .await
            .map_err(|e| RecapSyncError::StoreWrite(format!("{collection}: {e}")))?;
        tracing::debug!(%collection, %id, "document added");
        Ok(id)
    }

    async fn update<T: Serialize>(&self, collection: Collection, id: &str, patch: &T) -> Result<()> {
        let patch = encode(patch)?;
        let now = Utc::now().to_rfc3339();
        let changed = self
            .conn
            .execute(
                "UPDATE documents SET body = json_patch(body, ?1), updated_at = ?2
                 WHERE collection = ?3 AND id = ?4",
                params![patch, now.as_str(), collection.as_str(), id],
            )
            .await
            .map_err(|e| RecapSyncError::StoreWrite(format!("{collection}/{id}: {e}")))?;
        if changed == 0 {
            return Err(RecapSyncError::StoreWrite(format!(
                "{collection}/{id}: no such document"
            )));
        }
        Ok(())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection.as_str(), id],
            )
            .await
            .map_err(|e| RecapSyncError::StoreWrite(format!("{collection}/{id}: {e}")))?;
        Ok(())
    }
}
