//! MongoDB backend
//!
//! Maps the store capability traits onto the official `mongodb` driver.
//! Entries are stored as
//! `{ key: String, data: Binary, expires: Date | null, last_change: Date }`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, spec::BinarySubtype, Binary, Bson, Document};
use mongodb::error::{ErrorKind, RETRYABLE_WRITE_ERROR};
use mongodb::options::{ClientOptions, Credential, IndexOptions, ServerAddress};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::debug;

use crate::cache::CacheEntry;
use crate::config::CacheConfig;
use crate::store::{
    fields, CollectionLayout, DocumentStore, EntryCollection, EntryFilter, IndexSpec, KeyMatch,
    Liveness, StoreConnect, StoreError, StoreResult,
};

// == Error Classification ==
impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        if err.contains_label(RETRYABLE_WRITE_ERROR) {
            return StoreError::Transient(err.to_string());
        }

        match err.kind.as_ref() {
            ErrorKind::Io(_)
            | ErrorKind::ServerSelection { .. }
            | ErrorKind::ConnectionPoolCleared { .. } => StoreError::Transient(err.to_string()),
            ErrorKind::BsonDeserialization(_) => StoreError::Decode(err.to_string()),
            _ => StoreError::Operation(err.to_string()),
        }
    }
}

// == Connect ==
/// Opens a [`MongoStore`] from the host, port, credentials and database in
/// [`CacheConfig`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MongoConnect;

#[async_trait]
impl StoreConnect for MongoConnect {
    async fn connect(&self, config: &CacheConfig) -> StoreResult<Arc<dyn DocumentStore>> {
        let store = MongoStore::connect(config)?;
        Ok(Arc::new(store))
    }
}

// == Mongo Store ==
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    database_name: String,
}

impl MongoStore {
    /// Builds a client for the configured server. The driver connects lazily,
    /// so reachability is only known after [`DocumentStore::ping`].
    pub fn connect(config: &CacheConfig) -> StoreResult<Self> {
        let mut options = ClientOptions::default();
        options.hosts = vec![ServerAddress::Tcp {
            host: config.host.clone(),
            port: Some(config.port),
        }];
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        options.server_selection_timeout = Some(config.connect_timeout());
        options.connect_timeout = Some(config.connect_timeout());

        if config.username.is_some() {
            let mut credential = Credential::default();
            credential.username = config.username.clone();
            credential.password = config.password.clone();
            credential.source = config.auth_source.clone();
            options.credential = Some(credential);
        }

        let client = Client::with_options(options)?;

        Ok(Self {
            client,
            database_name: config.database.clone(),
        })
    }

    pub fn database(&self) -> Database {
        self.client.database(&self.database_name)
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn ping(&self) -> StoreResult<()> {
        self.database().run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> StoreResult<bool> {
        let names = self
            .database()
            .list_collection_names()
            .filter(doc! { "name": name })
            .await?;
        Ok(names.iter().any(|n| n == name))
    }

    async fn create_collection(&self, name: &str, layout: CollectionLayout) -> StoreResult<()> {
        let db = self.database();
        match layout {
            CollectionLayout::Capped {
                max_documents,
                max_bytes,
            } => {
                db.create_collection(name)
                    .capped(true)
                    .size(max_bytes)
                    .max(max_documents)
                    .await?
            }
            CollectionLayout::Unbounded => db.create_collection(name).await?,
        }
        Ok(())
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> StoreResult<()> {
        let mut keys = Document::new();
        for field in &index.fields {
            keys.insert(*field, 1);
        }

        let mut options = IndexOptions::default();
        options.name = Some(index.name.clone());
        if index.unique {
            options.unique = Some(true);
        }
        options.expire_after = index.expire_after;

        let model = IndexModel::builder().keys(keys).options(options).build();
        self.database()
            .collection::<Document>(collection)
            .create_index(model)
            .await?;
        Ok(())
    }

    async fn is_capped(&self, name: &str) -> StoreResult<bool> {
        let specs: Vec<_> = self
            .database()
            .list_collections()
            .filter(doc! { "name": name })
            .await?
            .try_collect()
            .await?;

        Ok(specs
            .iter()
            .find(|spec| spec.name == name)
            .and_then(|spec| spec.options.capped)
            .unwrap_or(false))
    }

    fn collection(&self, name: &str) -> Arc<dyn EntryCollection> {
        Arc::new(MongoCollection {
            inner: self.database().collection::<Document>(name),
        })
    }
}

// == Mongo Collection ==
struct MongoCollection {
    inner: Collection<Document>,
}

#[async_trait]
impl EntryCollection for MongoCollection {
    async fn find_one(&self, filter: &EntryFilter) -> StoreResult<Option<CacheEntry>> {
        let newest = self
            .inner
            .find_one(filter_document(filter))
            .sort(doc! { fields::LAST_CHANGE: -1 })
            .await?;
        match newest {
            Some(document) => Ok(Some(entry_from_document(&document)?)),
            None => Ok(None),
        }
    }

    async fn find(&self, filter: &EntryFilter) -> StoreResult<Vec<CacheEntry>> {
        let documents: Vec<Document> = self
            .inner
            .find(filter_document(filter))
            .await?
            .try_collect()
            .await?;

        documents.iter().map(entry_from_document).collect()
    }

    async fn upsert(&self, entry: &CacheEntry) -> StoreResult<()> {
        let update = doc! {
            "$set": {
                fields::DATA: binary(&entry.data),
                fields::EXPIRES: optional_date(entry.expires),
                fields::LAST_CHANGE: to_bson_date(entry.last_change),
            }
        };

        self.inner
            .update_one(doc! { fields::KEY: entry.key.as_str() }, update)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn insert(&self, entry: &CacheEntry) -> StoreResult<()> {
        self.inner.insert_one(entry_document(entry)).await?;
        Ok(())
    }

    async fn remove(&self, filter: &EntryFilter) -> StoreResult<u64> {
        let result = self.inner.delete_many(filter_document(filter)).await?;
        Ok(result.deleted_count)
    }

    async fn expire(&self, filter: &EntryFilter, at: DateTime<Utc>) -> StoreResult<u64> {
        let update = doc! { "$set": { fields::EXPIRES: to_bson_date(at) } };
        let result = self
            .inner
            .update_many(filter_document(filter), update)
            .await?;
        Ok(result.modified_count)
    }

    async fn remove_oldest(&self, limit: u64) -> StoreResult<u64> {
        if limit == 0 {
            return Ok(0);
        }

        let oldest: Vec<Document> = self
            .inner
            .find(doc! {})
            .sort(doc! { fields::LAST_CHANGE: 1 })
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .projection(doc! { fields::KEY: 1 })
            .await?
            .try_collect()
            .await?;

        let keys: Vec<&str> = oldest
            .iter()
            .filter_map(|d| d.get_str(fields::KEY).ok())
            .collect();
        debug!(count = keys.len(), "Removing oldest entries");

        let result = self
            .inner
            .delete_many(doc! { fields::KEY: { "$in": keys } })
            .await?;
        Ok(result.deleted_count)
    }

    async fn count(&self) -> StoreResult<u64> {
        Ok(self.inner.count_documents(doc! {}).await?)
    }
}

// == Document Mapping ==

fn to_bson_date(at: DateTime<Utc>) -> mongodb::bson::DateTime {
    mongodb::bson::DateTime::from_millis(at.timestamp_millis())
}

fn from_bson_date(at: mongodb::bson::DateTime) -> StoreResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(at.timestamp_millis())
        .ok_or_else(|| StoreError::Decode(format!("timestamp out of range: {}", at)))
}

fn binary(bytes: &[u8]) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

/// Stored in place of a missing expiry. Capped collections reject updates
/// that change a document's size, so soft removal must be able to overwrite
/// `expires` with a value of the same width.
const NEVER_EXPIRES: mongodb::bson::DateTime = mongodb::bson::DateTime::MAX;

fn optional_date(at: Option<DateTime<Utc>>) -> Bson {
    match at {
        Some(at) => Bson::DateTime(to_bson_date(at)),
        None => Bson::DateTime(NEVER_EXPIRES),
    }
}

fn entry_document(entry: &CacheEntry) -> Document {
    doc! {
        fields::KEY: entry.key.as_str(),
        fields::DATA: binary(&entry.data),
        fields::EXPIRES: optional_date(entry.expires),
        fields::LAST_CHANGE: to_bson_date(entry.last_change),
    }
}

/// Translates an [`EntryFilter`] into a MongoDB query document.
fn filter_document(filter: &EntryFilter) -> Document {
    let mut query = Document::new();

    match &filter.keys {
        KeyMatch::Any => {}
        KeyMatch::Exact(key) => {
            query.insert(fields::KEY, key.as_str());
        }
        KeyMatch::In(keys) => {
            query.insert(fields::KEY, doc! { "$in": keys.clone() });
        }
    }

    match filter.liveness {
        Liveness::Any => {}
        Liveness::LiveAt(now) => {
            // `expires: null` also matches documents without the field
            query.insert(
                "$or",
                vec![
                    doc! { fields::EXPIRES: Bson::Null },
                    doc! { fields::EXPIRES: { "$gt": to_bson_date(now) } },
                ],
            );
        }
        Liveness::ExpiredAt(now) => {
            query.insert(fields::EXPIRES, doc! { "$lte": to_bson_date(now) });
        }
    }

    query
}

fn entry_from_document(document: &Document) -> StoreResult<CacheEntry> {
    let key = match document.get(fields::KEY) {
        Some(Bson::String(key)) => key.clone(),
        _ => return Err(StoreError::Decode("missing string field 'key'".to_string())),
    };

    let data = match document.get(fields::DATA) {
        Some(Bson::Binary(binary)) => binary.bytes.clone(),
        _ => {
            return Err(StoreError::Decode(format!(
                "entry '{}' has no binary 'data'",
                key
            )))
        }
    };

    let expires = match document.get(fields::EXPIRES) {
        Some(Bson::DateTime(at)) if *at == NEVER_EXPIRES => None,
        Some(Bson::DateTime(at)) => Some(from_bson_date(*at)?),
        Some(Bson::Null) | None => None,
        Some(other) => {
            return Err(StoreError::Decode(format!(
                "entry '{}' has non-date 'expires': {}",
                key, other
            )))
        }
    };

    let last_change = match document.get(fields::LAST_CHANGE) {
        Some(Bson::DateTime(at)) => from_bson_date(*at)?,
        // Written by an older schema that did not track it
        _ => DateTime::<Utc>::default(),
    };

    Ok(CacheEntry {
        key,
        data,
        expires,
        last_change,
    })
}
