use std::fmt;

use futures_util::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::error::ErrorKind;
use mongodb::event::EventHandler;
use mongodb::event::command::CommandEvent;
use mongodb::event::sdam::SdamEvent;
use mongodb::options::{
    ClientOptions, ClusteredIndex, CreateCollectionOptions, IndexOptions, TimeseriesOptions,
};
use mongodb::{Client, Collection, Database, IndexModel};

use super::common::{BoxedStore, Connector, DocumentStore};
use crate::document::AdRecord;
use crate::error::{StoreError, StoreResult};
use crate::observer::{Observer, TopologyEvent};
use crate::query::{
    CollectionLayout, FindQuery, IndexKeys, IndexUsage, QueryPlan, RecordFilter, RecordUpdate,
    ReplicaSetStatus, UpdateOutcome,
};

/// Server error code for creating a collection that already exists.
const NAMESPACE_EXISTS: i32 = 48;

const APP_NAME: &str = "adbench";

/// Connects to a MongoDB deployment through the official driver.
#[derive(Clone)]
pub struct MongoConnector {
    uri: String,
    database: String,
}

impl MongoConnector {
    /// Creates a connector for `database` on the deployment at `uri`.
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
        }
    }
}

impl fmt::Debug for MongoConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoConnector")
            .field("uri", &"[redacted]")
            .field("database", &self.database)
            .finish()
    }
}

#[async_trait::async_trait]
impl Connector for MongoConnector {
    async fn connect(&self, observer: Observer) -> StoreResult<BoxedStore> {
        let mut options = ClientOptions::parse(self.uri.as_str())
            .await
            .map_err(|cause| connect_error("invalid connection string", cause))?;
        options.app_name.get_or_insert_with(|| APP_NAME.to_owned());
        options.command_event_handler = Some(command_handler(observer.clone()));
        options.sdam_event_handler = Some(sdam_handler(observer));

        let client = Client::with_options(options)
            .map_err(|cause| connect_error("failed to create client", cause))?;

        // The driver connects lazily, so make sure the cluster is actually reachable.
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|cause| connect_error("cluster did not answer ping", cause))?;

        tracing::info!(database = %self.database, "connected to cluster");
        let database = client.database(&self.database);
        Ok(Box::new(MongoStore { client, database }))
    }
}

fn connect_error(context: &str, cause: mongodb::error::Error) -> StoreError {
    StoreError::Connect {
        context: context.to_owned(),
        cause: Some(cause),
    }
}

fn connection_label(address: &impl fmt::Display, id: u32) -> String {
    format!("{address}#{id}")
}

fn command_handler(observer: Observer) -> EventHandler<CommandEvent> {
    EventHandler::callback(move |event: CommandEvent| match event {
        CommandEvent::Started(started) => observer.command_started(
            &started.command_name,
            &connection_label(&started.connection.address, started.connection.id),
        ),
        CommandEvent::Succeeded(succeeded) => observer.command_succeeded(
            &succeeded.command_name,
            &connection_label(&succeeded.connection.address, succeeded.connection.id),
        ),
        CommandEvent::Failed(failed) => observer.command_failed(
            &failed.command_name,
            &connection_label(&failed.connection.address, failed.connection.id),
            &failed.failure,
        ),
        _ => {}
    })
}

fn sdam_handler(observer: Observer) -> EventHandler<SdamEvent> {
    EventHandler::callback(move |event: SdamEvent| {
        if let SdamEvent::ServerDescriptionChanged(change) = event {
            observer.server_description_changed(TopologyEvent::new(
                change.address.to_string(),
                format!("{:?}", change.previous_description.server_type()),
                format!("{:?}", change.new_description.server_type()),
            ));
        }
    })
}

fn is_namespace_exists(error: &mongodb::error::Error) -> bool {
    matches!(
        *error.kind,
        ErrorKind::Command(ref command) if command.code == NAMESPACE_EXISTS
    )
}

/// Extracts primary and secondaries from a `replSetGetStatus` reply.
fn parse_replica_set_status(status: &Document) -> StoreResult<ReplicaSetStatus> {
    let members = status
        .get_array("members")
        .map_err(|e| StoreError::Response(format!("replSetGetStatus members: {e}")))?;

    let mut result = ReplicaSetStatus {
        set_name: status.get_str("set").ok().map(str::to_owned),
        ..Default::default()
    };

    for member in members {
        let Some(member) = member.as_document() else {
            continue;
        };
        let (Ok(name), Ok(state)) = (member.get_str("name"), member.get_str("stateStr")) else {
            continue;
        };
        match state {
            "PRIMARY" => result.primary = Some(name.to_owned()),
            "SECONDARY" => result.secondaries.push(name.to_owned()),
            _ => {}
        }
    }

    Ok(result)
}

/// Converts a record limit to the driver's limit.
///
/// The server treats a limit of zero as "no limit", so zero maps to `None` and callers must skip
/// the query instead.
fn server_limit(limit: usize) -> Option<i64> {
    match limit {
        0 => None,
        limit => Some(i64::try_from(limit).unwrap_or(i64::MAX)),
    }
}

fn as_count(value: &Bson) -> Option<u64> {
    match *value {
        Bson::Int32(count) => u64::try_from(count).ok(),
        Bson::Int64(count) => u64::try_from(count).ok(),
        Bson::Double(count) if count >= 0.0 => Some(count as u64),
        _ => None,
    }
}

/// Reads one document of an `$indexStats` stage.
fn parse_index_usage(stats: &Document) -> StoreResult<IndexUsage> {
    let name = stats
        .get_str("name")
        .map_err(|e| StoreError::Response(format!("$indexStats name: {e}")))?;
    let accesses = stats
        .get_document("accesses")
        .ok()
        .and_then(|accesses| accesses.get("ops"))
        .and_then(as_count)
        .unwrap_or_default();

    Ok(IndexUsage {
        name: name.to_owned(),
        accesses,
    })
}

/// Reads the winning plan and execution counters of an `executionStats` explain.
fn parse_query_plan(explain: &Document) -> StoreResult<QueryPlan> {
    let winning = explain
        .get_document("queryPlanner")
        .and_then(|planner| planner.get_document("winningPlan"))
        .map_err(|e| StoreError::Response(format!("explain winningPlan: {e}")))?;

    // the slot based engine nests the classic plan tree one level deeper
    let mut stage = winning.get_document("queryPlan").unwrap_or(winning);
    let mut index = None;
    loop {
        if let Ok(name) = stage.get_str("indexName") {
            index = Some(name.to_owned());
        }
        match stage.get_document("inputStage") {
            Ok(input) => stage = input,
            Err(_) => break,
        }
    }

    let stats = explain.get_document("executionStats").ok();
    let counter = |field: &str| {
        stats
            .and_then(|stats| stats.get(field))
            .and_then(as_count)
            .unwrap_or_default()
    };

    Ok(QueryPlan {
        stage: stage.get_str("stage").unwrap_or("UNKNOWN").to_owned(),
        index,
        keys_examined: counter("totalKeysExamined"),
        docs_examined: counter("totalDocsExamined"),
        returned: counter("nReturned"),
    })
}

/// A [`DocumentStore`] backed by a MongoDB replica set.
#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    fn collection(&self, name: &str) -> Collection<AdRecord> {
        self.database.collection(name)
    }
}

#[async_trait::async_trait]
impl DocumentStore for MongoStore {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    async fn create_collection(&self, name: &str, layout: &CollectionLayout) -> StoreResult<()> {
        let mut options = CreateCollectionOptions::default();
        match layout {
            CollectionLayout::Plain => {}
            CollectionLayout::Clustered => {
                options.clustered_index = Some(ClusteredIndex::default());
            }
            CollectionLayout::TimeSeries {
                time_field,
                meta_field,
            } => {
                options.timeseries = Some(
                    TimeseriesOptions::builder()
                        .time_field(time_field.clone())
                        .meta_field(Some(meta_field.clone()))
                        .build(),
                );
            }
        }

        match self.database.create_collection(name).with_options(options).await {
            Ok(()) => Ok(()),
            Err(error) if is_namespace_exists(&error) => {
                tracing::debug!(collection = name, "collection already exists");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn create_indexes(
        &self,
        collection: &str,
        indexes: &[IndexKeys],
    ) -> StoreResult<Vec<String>> {
        let models = indexes.iter().map(|index| {
            IndexModel::builder()
                .keys(index.to_document())
                .options(IndexOptions::builder().name(index.name.clone()).build())
                .build()
        });

        let result = self.collection(collection).create_indexes(models).await?;
        Ok(result.index_names)
    }

    async fn list_indexes(&self, collection: &str) -> StoreResult<Vec<String>> {
        Ok(self.collection(collection).list_index_names().await?)
    }

    async fn insert_one(&self, collection: &str, record: &AdRecord) -> StoreResult<()> {
        self.collection(collection).insert_one(record).await?;
        Ok(())
    }

    async fn find(&self, collection: &str, query: &FindQuery) -> StoreResult<Vec<AdRecord>> {
        let Some(limit) = server_limit(query.limit) else {
            return Ok(Vec::new());
        };

        let collection = self.collection(collection);
        let mut find = collection.find(query.filter.to_document()).limit(limit);
        if let Some(sort) = query.sort_document() {
            find = find.sort(sort);
        }

        let cursor = find.await?;
        Ok(cursor.try_collect().await?)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &RecordFilter,
        update: &RecordUpdate,
    ) -> StoreResult<UpdateOutcome> {
        let result = self
            .collection(collection)
            .update_many(filter.to_document(), update.to_document())
            .await?;

        Ok(UpdateOutcome {
            matched: result.matched_count,
            modified: result.modified_count,
        })
    }

    async fn index_stats(&self, collection: &str) -> StoreResult<Vec<IndexUsage>> {
        let cursor = self
            .collection(collection)
            .aggregate([doc! { "$indexStats": {} }])
            .await?;
        let stats: Vec<Document> = cursor.try_collect().await?;
        stats.iter().map(parse_index_usage).collect()
    }

    async fn explain(&self, collection: &str, query: &FindQuery) -> StoreResult<QueryPlan> {
        let Some(limit) = server_limit(query.limit) else {
            return Ok(QueryPlan {
                stage: "EOF".to_owned(),
                ..Default::default()
            });
        };

        let mut find = doc! {
            "find": collection,
            "filter": query.filter.to_document(),
            "limit": limit,
        };
        if let Some(sort) = query.sort_document() {
            find.insert("sort", sort);
        }

        let explain = self
            .database
            .run_command(doc! { "explain": find, "verbosity": "executionStats" })
            .await?;
        parse_query_plan(&explain)
    }

    async fn replica_set_status(&self) -> StoreResult<ReplicaSetStatus> {
        let status = self
            .client
            .database("admin")
            .run_command(doc! { "replSetGetStatus": 1 })
            .await?;
        parse_replica_set_status(&status)
    }

    async fn disconnect(&self) -> StoreResult<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}
