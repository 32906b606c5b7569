//! Store wrappers for exercising write and read failures in tests.

use serde::Serialize;
use serde::de::DeserializeOwned;

use recapsync_shared::{RecapSyncError, Result};
use recapsync_storage::{Collection, Document, DocumentStore, Filter, Storage};

/// Which store calls to reject.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Rejections {
    pub event_adds: bool,
    pub group_queries: bool,
    pub group_gets: bool,
    pub group_updates: bool,
}

/// Delegates to a real store except for the rejected calls.
pub(crate) struct FlakyStore<'a> {
    inner: &'a Storage,
    reject: Rejections,
}

impl<'a> FlakyStore<'a> {
    pub(crate) fn new(inner: &'a Storage, reject: Rejections) -> Self {
        Self { inner, reject }
    }
}

fn rejected(what: &str) -> RecapSyncError {
    RecapSyncError::StoreWrite(format!("{what}: rejected"))
}

impl DocumentStore for FlakyStore<'_> {
    async fn query<T: DeserializeOwned>(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Vec<Document<T>>> {
        if self.reject.group_queries && collection == Collection::Groups {
            return Err(RecapSyncError::Storage("groups query: rejected".into()));
        }
        self.inner.query(collection, filter).await
    }

    async fn get<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document<T>>> {
        if self.reject.group_gets && collection == Collection::Groups {
            return Err(RecapSyncError::Storage(format!("groups/{id}: rejected")));
        }
        self.inner.get(collection, id).await
    }

    async fn add<T: Serialize>(&self, collection: Collection, data: &T) -> Result<String> {
        if self.reject.event_adds && collection == Collection::Events {
            return Err(rejected("events"));
        }
        self.inner.add(collection, data).await
    }

    async fn update<T: Serialize>(&self, collection: Collection, id: &str, patch: &T) -> Result<()> {
        if self.reject.group_updates && collection == Collection::Groups {
            return Err(rejected(&format!("groups/{id}")));
        }
        self.inner.update(collection, id, patch).await
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<()> {
        self.inner.delete(collection, id).await
    }
}
