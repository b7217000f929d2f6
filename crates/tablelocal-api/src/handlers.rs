//! Table service request handlers.
//!
//! Every request lands in [`dispatch`], which resolves the addressed
//! resource from the path and routes on the effective method. Store calls
//! are synchronous, so no lock is ever held across an await point.

use crate::auth::Authenticator;
use crate::batch::{
    SubRequest, SubResponse, boundary_from_content_type, parse_batch, write_batch_response,
};
use crate::error::{ApiResult, ERROR_CONTENT_TYPE, error_body, status_of};
use crate::metrics::TableMetrics;
use crate::odata::{self, MetadataLevel, ServiceRoot};
use crate::resource::{Resource, parse_path};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tablelocal_common::{Entity, Error, IfMatch, Result, TableName};
use tablelocal_query::Filter;
use tablelocal_store::{
    BatchFailure, BatchOperation, Catalog, ContinuationToken, EntityStore, ListTablesRequest,
    OperationOutcome, ScanRequest,
};
use tracing::debug;

/// Largest `$top` a query may ask for
pub const MAX_TOP: usize = 1000;

/// OData protocol version announced on every response
pub const DATA_SERVICE_VERSION: &str = "3.0;";

/// Application state shared across handlers
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub account: String,
    pub metrics: TableMetrics,
    pub authenticator: Authenticator,
}

impl AppState {
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, authenticator: Authenticator) -> Self {
        Self {
            catalog,
            account: authenticator.account().to_string(),
            metrics: TableMetrics::new(),
            authenticator,
        }
    }
}

/// The method a request acts as. Clients that cannot send `MERGE` tunnel it
/// through `POST` with an `X-HTTP-Method` header.
#[must_use]
pub fn effective_method(method: &Method, x_http_method: Option<&str>) -> Method {
    if method == Method::POST
        && let Some(tunnelled) =
            x_http_method.and_then(|m| Method::from_bytes(m.trim().as_bytes()).ok())
    {
        return tunnelled;
    }
    method.clone()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn prefers_no_content(prefer: Option<&str>) -> bool {
    prefer.is_some_and(|p| p.to_ascii_lowercase().contains("return-no-content"))
}

/// Catch-all table service handler
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    match handle(&state, &method, &uri, &headers, &query, &body) {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

/// Liveness check
pub async fn health_check() -> Response {
    (
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"healthy"}"#,
    )
        .into_response()
}

/// Prometheus scrape endpoint
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export_prometheus(),
    )
        .into_response()
}

struct RequestContext<'a> {
    state: &'a AppState,
    headers: &'a HeaderMap,
    query: &'a HashMap<String, String>,
    body: &'a [u8],
    level: MetadataLevel,
    root: ServiceRoot,
}

impl RequestContext<'_> {
    fn header(&self, name: &str) -> Option<&str> {
        header_str(self.headers, name)
    }

    fn prefers_no_content(&self) -> bool {
        prefers_no_content(self.header("prefer"))
    }

    fn filter(&self) -> Result<Option<Filter>> {
        match self.query.get("$filter") {
            Some(source) => Ok(Some(Filter::parse(source)?)),
            None => Ok(None),
        }
    }

    fn top(&self) -> Result<Option<usize>> {
        self.query
            .get("$top")
            .map(|raw| {
                raw.trim()
                    .parse::<usize>()
                    .ok()
                    .filter(|n| (1..=MAX_TOP).contains(n))
                    .ok_or_else(|| {
                        Error::invalid_input(format!("$top must be between 1 and {MAX_TOP}, got {raw}"))
                    })
            })
            .transpose()
    }

    fn select(&self) -> Option<Vec<String>> {
        self.query.get("$select").map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
    }

    /// A continuation component echoed back by the client. Form decoding turns
    /// `+` into a space, and base64 never contains spaces, so undo that.
    fn continuation(&self, name: &str) -> Option<String> {
        self.query
            .get(name)
            .filter(|v| !v.is_empty())
            .map(|v| v.replace(' ', "+"))
    }
}

fn handle(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: &[u8],
) -> ApiResult<Response> {
    let method = effective_method(method, header_str(headers, "x-http-method"));
    let resource = parse_path(uri.path(), &state.account)?;
    debug!("{} {:?}", method, resource);

    let ctx = RequestContext {
        state,
        headers,
        query,
        body,
        level: MetadataLevel::from_accept(header_str(headers, "accept")),
        root: ServiceRoot::new(
            header_str(headers, "host").unwrap_or("127.0.0.1"),
            &state.account,
        ),
    };

    let reply = match (method.as_str(), resource) {
        ("POST", Resource::Tables) => create_table(&ctx)?,
        ("GET", Resource::Tables) => list_tables(&ctx)?,
        ("GET", Resource::Table(name)) => get_table(&ctx, &name)?,
        ("DELETE", Resource::Table(name)) => delete_table(&ctx, &name)?,
        ("POST", Resource::Batch) => return batch_request(&ctx),
        ("GET", Resource::Entities(table)) => query_entities(&ctx, &table)?,
        (verb, resource @ (Resource::Entities(_) | Resource::Entity(..))) => {
            entity_request(&ctx, verb, resource)?
        }
        (verb, resource) => {
            return Err(Error::MethodNotAllowed(format!(
                "{verb} is not supported on {resource:?}"
            ))
            .into());
        }
    };
    Ok(into_http(reply))
}

/// Turn a reply into an HTTP response
fn into_http(reply: SubResponse) -> Response {
    let empty = reply.body.is_empty();
    let mut response = (reply.status, reply.body).into_response();
    let headers = response.headers_mut();
    if empty {
        headers.remove(header::CONTENT_TYPE);
    }
    for (name, value) in &reply.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    response
}

// ---- Tables ----

fn create_table(ctx: &RequestContext<'_>) -> Result<SubResponse> {
    let name = odata::table_name_from_json(ctx.body)?;
    let outcome = ctx.state.catalog.create_table_if_not_exists(&name)?;
    if !outcome.created() {
        return Err(Error::TableAlreadyExists(name.to_string()));
    }

    let location = format!("{}/Tables('{}')", ctx.root.base_url, name);
    if ctx.prefers_no_content() {
        return Ok(SubResponse::new(StatusCode::NO_CONTENT)
            .header("Location", location)
            .header("Preference-Applied", "return-no-content"));
    }
    Ok(SubResponse::new(StatusCode::CREATED)
        .header("Location", location)
        .header("Preference-Applied", "return-content")
        .body(
            ctx.level.content_type(),
            odata::table_to_json(&name, &ctx.root, ctx.level, true).to_string(),
        ))
}

fn list_tables(ctx: &RequestContext<'_>) -> Result<SubResponse> {
    let request = ListTablesRequest {
        prefix: None,
        filter: ctx.filter()?,
        top: ctx.top()?,
        next_table_name: ctx.continuation("NextTableName"),
    };
    let page = ctx.state.catalog.list_tables(&request)?;
    let names: Vec<TableName> = page.tables.into_iter().map(|t| t.name).collect();

    let mut reply = SubResponse::new(StatusCode::OK).body(
        ctx.level.content_type(),
        odata::tables_feed(&names, &ctx.root, ctx.level).to_string(),
    );
    if let Some(next) = page.next_table_name {
        reply = reply.header("x-ms-continuation-NextTableName", next);
    }
    Ok(reply)
}

fn get_table(ctx: &RequestContext<'_>, name: &TableName) -> Result<SubResponse> {
    let store = ctx.state.catalog.get_table(name)?;
    Ok(SubResponse::new(StatusCode::OK).body(
        ctx.level.content_type(),
        odata::table_to_json(store.name(), &ctx.root, ctx.level, true).to_string(),
    ))
}

fn delete_table(ctx: &RequestContext<'_>, name: &TableName) -> Result<SubResponse> {
    ctx.state.catalog.delete_table(name)?;
    Ok(SubResponse::new(StatusCode::NO_CONTENT))
}

// ---- Entities ----

fn query_entities(ctx: &RequestContext<'_>, table: &TableName) -> Result<SubResponse> {
    let store = ctx.state.catalog.get_table(table)?;

    let mut request = ScanRequest::new();
    if let Some(filter) = ctx.filter()? {
        request = request.with_filter(filter);
    }
    if let Some(top) = ctx.top()? {
        request = request.with_top(top);
    }
    if let Some(next_partition_key) = ctx.continuation("NextPartitionKey") {
        let next_row_key = ctx.continuation("NextRowKey");
        request = request.with_continuation(ContinuationToken::decode(
            &next_partition_key,
            next_row_key.as_deref(),
        )?);
    }

    let page = store.scan(&request)?;
    let select = ctx.select();
    let feed = odata::entities_feed(
        &page.entities,
        store.name().as_str(),
        &ctx.root,
        ctx.level,
        select.as_deref(),
    );

    let mut reply = SubResponse::new(StatusCode::OK).body(ctx.level.content_type(), feed.to_string());
    if let Some(token) = page.continuation {
        let (next_partition_key, next_row_key) = token.encode();
        reply = reply
            .header("x-ms-continuation-NextPartitionKey", next_partition_key)
            .header("x-ms-continuation-NextRowKey", next_row_key);
    }
    Ok(reply)
}

fn entity_request(ctx: &RequestContext<'_>, verb: &str, resource: Resource) -> Result<SubResponse> {
    let if_match = ctx.header("if-match").map(IfMatch::parse);
    let (table, op) = entity_operation(verb, resource, if_match, ctx.body)?;
    let store = ctx.state.catalog.get_table(&table)?;

    let shape = ReplyShape {
        inserted: matches!(op, BatchOperation::Insert(_)),
        no_content: ctx.prefers_no_content(),
        level: ctx.level,
    };
    let outcome = apply(&store, op)?;
    let select = ctx.select();
    Ok(outcome_reply(
        &ctx.root,
        store.name().as_str(),
        &outcome,
        &shape,
        select.as_deref(),
    ))
}

/// Map a single-entity request onto a store operation.
///
/// `PUT` and `MERGE` without `If-Match` are upserts; `DELETE` insists on one.
fn entity_operation(
    verb: &str,
    resource: Resource,
    if_match: Option<IfMatch>,
    body: &[u8],
) -> Result<(TableName, BatchOperation)> {
    let op = match (verb, resource) {
        ("POST", Resource::Entities(table)) => {
            let data = odata::entity_from_json(body, None)?;
            (table, BatchOperation::Insert(data))
        }
        ("GET", Resource::Entity(table, key)) => (table, BatchOperation::Retrieve(key)),
        ("PUT", Resource::Entity(table, key)) => {
            let data = odata::entity_from_json(body, Some(&key))?;
            let op = match if_match {
                Some(condition) => BatchOperation::Replace(data, condition),
                None => BatchOperation::InsertOrReplace(data),
            };
            (table, op)
        }
        ("MERGE" | "PATCH", Resource::Entity(table, key)) => {
            let data = odata::entity_from_json(body, Some(&key))?;
            let op = match if_match {
                Some(condition) => BatchOperation::Merge(data, condition),
                None => BatchOperation::InsertOrMerge(data),
            };
            (table, op)
        }
        ("DELETE", Resource::Entity(table, key)) => {
            let condition = if_match.ok_or(Error::MissingRequiredHeader("If-Match"))?;
            (table, BatchOperation::Delete(key, condition))
        }
        (verb, resource) => {
            return Err(Error::MethodNotAllowed(format!(
                "{verb} is not supported on {resource:?}"
            )));
        }
    };
    Ok(op)
}

fn apply(store: &EntityStore, op: BatchOperation) -> Result<OperationOutcome> {
    Ok(match op {
        BatchOperation::Insert(data) => OperationOutcome::Written(store.insert(data)?),
        BatchOperation::Replace(data, condition) => {
            OperationOutcome::Written(store.replace(data, &condition)?)
        }
        BatchOperation::Merge(data, condition) => {
            OperationOutcome::Written(store.merge(data, &condition)?)
        }
        BatchOperation::InsertOrReplace(data) => {
            OperationOutcome::Written(store.insert_or_replace(data)?)
        }
        BatchOperation::InsertOrMerge(data) => {
            OperationOutcome::Written(store.insert_or_merge(data)?)
        }
        BatchOperation::Delete(key, condition) => {
            store.delete(&key, &condition)?;
            OperationOutcome::Deleted(key)
        }
        BatchOperation::Retrieve(key) => OperationOutcome::Retrieved(store.retrieve(&key)?),
    })
}

/// How the reply to one operation should look
struct ReplyShape {
    inserted: bool,
    no_content: bool,
    level: MetadataLevel,
}

fn outcome_reply(
    root: &ServiceRoot,
    table: &str,
    outcome: &OperationOutcome,
    shape: &ReplyShape,
    select: Option<&[String]>,
) -> SubResponse {
    let entity_body = |entity: &Entity| {
        odata::entity_to_json(entity, table, root, shape.level, select, true).to_string()
    };
    match outcome {
        OperationOutcome::Written(entity) if shape.inserted => {
            let reply = SubResponse::new(if shape.no_content {
                StatusCode::NO_CONTENT
            } else {
                StatusCode::CREATED
            })
            .header("ETag", entity.etag.as_str())
            .header("Location", odata::entity_url(root, table, &entity.key));
            if shape.no_content {
                reply.header("Preference-Applied", "return-no-content")
            } else {
                reply.body(shape.level.content_type(), entity_body(entity))
            }
        }
        OperationOutcome::Written(entity) => {
            SubResponse::new(StatusCode::NO_CONTENT).header("ETag", entity.etag.as_str())
        }
        OperationOutcome::Deleted(_) => SubResponse::new(StatusCode::NO_CONTENT),
        OperationOutcome::Retrieved(entity) => SubResponse::new(StatusCode::OK)
            .header("ETag", entity.etag.as_str())
            .body(shape.level.content_type(), entity_body(entity)),
    }
}

// ---- Batch ----

fn batch_request(ctx: &RequestContext<'_>) -> ApiResult<Response> {
    let content_type = ctx
        .header("content-type")
        .ok_or(Error::MissingRequiredHeader("Content-Type"))?;
    let boundary = boundary_from_content_type(content_type)?;
    let batch = parse_batch(ctx.body, &boundary)?;

    let responses = match run_batch(ctx, &batch.requests) {
        Ok(responses) => responses,
        Err(failure) => {
            debug!("Batch rejected: {}", failure);
            vec![
                SubResponse::new(status_of(&failure.error))
                    .header("DataServiceVersion", DATA_SERVICE_VERSION)
                    .body(ERROR_CONTENT_TYPE, error_body(&failure.error, failure.index)),
            ]
        }
    };

    let encoded = write_batch_response(&responses, batch.changeset);
    let mut response = (StatusCode::ACCEPTED, encoded.body).into_response();
    if let Ok(value) = HeaderValue::from_str(&encoded.content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

/// Decode and execute the operations of a batch. Nothing is applied unless
/// every operation succeeds.
fn run_batch(
    ctx: &RequestContext<'_>,
    requests: &[SubRequest],
) -> std::result::Result<Vec<SubResponse>, BatchFailure> {
    let mut table: Option<TableName> = None;
    let mut operations = Vec::with_capacity(requests.len());
    let mut shapes = Vec::with_capacity(requests.len());

    for (index, sub) in requests.iter().enumerate() {
        let method = effective_method(&sub.method, sub.header("x-http-method"));
        let resource =
            parse_path(sub.path(), &ctx.state.account).map_err(|e| BatchFailure::at(index, e))?;
        let if_match = sub.header("if-match").map(IfMatch::parse);
        let (op_table, op) = entity_operation(method.as_str(), resource, if_match, &sub.body)
            .map_err(|e| BatchFailure::at(index, e))?;

        match &table {
            Some(existing) if *existing != op_table => {
                return Err(BatchFailure::at(
                    index,
                    Error::invalid_input("all operations in a batch must target the same table"),
                ));
            }
            Some(_) => {}
            None => table = Some(op_table),
        }

        shapes.push(ReplyShape {
            inserted: matches!(op, BatchOperation::Insert(_)),
            no_content: prefers_no_content(sub.header("prefer")),
            level: MetadataLevel::from_accept(sub.header("accept")),
        });
        operations.push(op);
    }

    let Some(table) = table else {
        return Err(BatchFailure::whole(Error::invalid_input(
            "batch contains no operations",
        )));
    };
    let store = ctx
        .state
        .catalog
        .get_table(&table)
        .map_err(|e| BatchFailure::at(0, e))?;
    let outcomes = store.execute_batch(&operations)?;
    debug!(table = %table, operations = outcomes.len(), "batch applied");

    Ok(outcomes
        .iter()
        .zip(&shapes)
        .map(|(outcome, shape)| {
            outcome_reply(&ctx.root, store.name().as_str(), outcome, shape, None)
                .header("DataServiceVersion", DATA_SERVICE_VERSION)
        })
        .collect())
}
