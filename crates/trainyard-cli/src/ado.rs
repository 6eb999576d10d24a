//! Blocking Azure DevOps work-item client.
//!
//! Every write is a JSON-Patch document. A 404 on a read is reported as
//! `Ok(None)`; on a write it is an API error like any other status.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::debug;
use trainyard_core::config::{Credentials, TrackerConfig};
use trainyard_core::error::TrackerError;
use trainyard_core::model::item::{join_tags, parse_tags};
use trainyard_core::model::{ItemId, Relation, RelationKind, WorkItem};
use trainyard_core::tracker::{AggregateDraft, ItemFilter, TrackerClient};
use url::Url;

const API_VERSION: &str = "7.0";
const BATCH_SIZE: usize = 200;
const JSON_PATCH: &str = "application/json-patch+json";
const MAX_ERROR_BODY: usize = 300;

#[derive(Debug, Deserialize)]
struct WireItem {
    id: ItemId,
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    relations: Vec<WireRelation>,
}

#[derive(Debug, Deserialize)]
struct WireRelation {
    rel: String,
    url: String,
    #[serde(default)]
    attributes: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct WiqlResult {
    #[serde(rename = "workItems", default)]
    work_items: Vec<WiqlRef>,
}

#[derive(Debug, Deserialize)]
struct WiqlRef {
    id: ItemId,
}

#[derive(Debug, Deserialize)]
struct Batch {
    /// `errorPolicy=omit` turns deleted ids into nulls.
    #[serde(default)]
    value: Vec<Option<WireItem>>,
}

pub struct AdoClient {
    agent: ureq::Agent,
    organization: Url,
    project: String,
    authorization: String,
    aggregate_type: String,
    rank_field: String,
    estimate_field: String,
    notes_field: String,
}

impl AdoClient {
    pub fn new(credentials: &Credentials, tracker: &TrackerConfig) -> Result<Self, TrackerError> {
        let organization = Url::parse(&credentials.organization_url).map_err(|err| {
            TrackerError::Transport(format!(
                "invalid organization url {}: {err}",
                credentials.organization_url
            ))
        })?;
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(tracker.timeout_secs))
            .user_agent(concat!("trainyard/", env!("CARGO_PKG_VERSION")))
            .build();

        Ok(Self {
            agent,
            organization,
            project: credentials.project.clone(),
            authorization: basic_auth(&credentials.token),
            aggregate_type: tracker.aggregate_type.clone(),
            rank_field: tracker.rank_field.clone(),
            estimate_field: tracker.estimate_field.clone(),
            notes_field: tracker.notes_field.clone(),
        })
    }

    /// `{org}/{project}/_apis/wit/{segments...}?api-version=7.0`
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TrackerError> {
        let mut url = self.organization.clone();
        url.path_segments_mut()
            .map_err(|()| TrackerError::Transport(format!("{} cannot carry a path", self.organization)))?
            .pop_if_empty()
            .push(&self.project)
            .extend(["_apis", "wit"])
            .extend(segments);
        url.query_pairs_mut().append_pair("api-version", API_VERSION);
        Ok(url)
    }

    /// Project-independent item URL used as a relation target.
    fn item_url(&self, id: ItemId) -> Result<String, TrackerError> {
        let mut url = self.organization.clone();
        url.path_segments_mut()
            .map_err(|()| TrackerError::Transport(format!("{} cannot carry a path", self.organization)))?
            .pop_if_empty()
            .extend(["_apis", "wit", "workItems", &id.to_string()]);
        Ok(url.into())
    }

    fn call(
        &self,
        method: &str,
        url: &Url,
        body: Option<(&str, &Value)>,
    ) -> Result<Option<Value>, TrackerError> {
        debug!(method, %url, "tracker request");
        let request = self
            .agent
            .request_url(method, url)
            .set("Authorization", &self.authorization)
            .set("Accept", "application/json");
        let result = match body {
            Some((content_type, payload)) => request
                .set("Content-Type", content_type)
                .send_string(&payload.to_string()),
            None => request.call(),
        };

        match result {
            Ok(response) => response
                .into_json::<Value>()
                .map(Some)
                .map_err(|err| TrackerError::Decode(err.to_string())),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(ureq::Error::Status(status @ (401 | 403), _)) => {
                Err(TrackerError::Unauthorized { status })
            }
            Err(ureq::Error::Status(status, response)) => Err(TrackerError::Api {
                status,
                message: error_message(response),
            }),
            Err(ureq::Error::Transport(transport)) => {
                Err(TrackerError::Transport(transport.to_string()))
            }
        }
    }

    fn fetch(&self, url: &Url) -> Result<Option<WorkItem>, TrackerError> {
        self.call("GET", url, None)?
            .map(|body| decode::<WireItem>(body).map(|wire| self.to_work_item(wire)))
            .transpose()
    }

    /// Apply a JSON-Patch document to one item.
    fn patch(&self, id: ItemId, operations: &Value) -> Result<(), TrackerError> {
        let url = self.endpoint(&["workitems", &id.to_string()])?;
        self.call("PATCH", &url, Some((JSON_PATCH, operations)))?
            .ok_or_else(|| not_found(id))
            .map(|_| ())
    }

    fn patch_field(&self, id: ItemId, field: &str, value: &str) -> Result<(), TrackerError> {
        self.patch(
            id,
            &json!([{ "op": "add", "path": format!("/fields/{field}"), "value": value }]),
        )
    }

    fn fetch_batch(&self, ids: &[ItemId]) -> Result<Vec<WorkItem>, TrackerError> {
        let mut url = self.endpoint(&["workitems"])?;
        url.query_pairs_mut()
            .append_pair("ids", &join_ids(ids))
            .append_pair("errorPolicy", "omit");

        let Some(body) = self.call("GET", &url, None)? else {
            return Ok(Vec::new());
        };
        let mut by_id: HashMap<ItemId, WireItem> = decode::<Batch>(body)?
            .value
            .into_iter()
            .flatten()
            .map(|wire| (wire.id, wire))
            .collect();

        Ok(ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .map(|wire| self.to_work_item(wire))
            .collect())
    }

    fn to_work_item(&self, wire: WireItem) -> WorkItem {
        let text = |name: &str| {
            wire.fields
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        WorkItem {
            id: wire.id,
            title: text("System.Title").unwrap_or_default(),
            item_type: text("System.WorkItemType").unwrap_or_default(),
            state: text("System.State").unwrap_or_default(),
            description: text("System.Description"),
            notes: text(&self.notes_field),
            area_path: text("System.AreaPath").unwrap_or_default(),
            iteration_path: text("System.IterationPath").unwrap_or_default(),
            tags: text("System.Tags")
                .map(|raw| parse_tags(&raw))
                .unwrap_or_default(),
            estimate: wire.fields.get(&self.estimate_field).and_then(Value::as_f64),
            relations: wire.relations.iter().filter_map(to_relation).collect(),
        }
    }
}

impl TrackerClient for AdoClient {
    fn query_items(&self, filter: &ItemFilter) -> Result<Vec<WorkItem>, TrackerError> {
        let mut url = self.endpoint(&["wiql"])?;
        if let Some(limit) = filter.limit {
            url.query_pairs_mut().append_pair("$top", &limit.to_string());
        }
        let query = build_wiql(filter, &self.rank_field);
        debug!(%query, "running wiql");

        let body = self
            .call("POST", &url, Some(("application/json", &json!({ "query": query }))))?
            .ok_or_else(|| TrackerError::Api {
                status: 404,
                message: format!("project {} not found", self.project),
            })?;
        let ids: Vec<ItemId> = decode::<WiqlResult>(body)?
            .work_items
            .into_iter()
            .map(|r| r.id)
            .collect();

        let mut items = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(BATCH_SIZE) {
            items.extend(self.fetch_batch(chunk)?);
        }
        debug!(matched = ids.len(), fetched = items.len(), "query complete");
        Ok(items)
    }

    fn get_item(&self, id: ItemId) -> Result<Option<WorkItem>, TrackerError> {
        let url = self.endpoint(&["workitems", &id.to_string()])?;
        self.fetch(&url)
    }

    fn get_item_with_relations(&self, id: ItemId) -> Result<Option<WorkItem>, TrackerError> {
        let mut url = self.endpoint(&["workitems", &id.to_string()])?;
        url.query_pairs_mut().append_pair("$expand", "relations");
        self.fetch(&url)
    }

    fn create_aggregate(&self, draft: &AggregateDraft) -> Result<ItemId, TrackerError> {
        let url = self.endpoint(&["workitems", &format!("${}", self.aggregate_type)])?;
        let mut operations = vec![
            json!({ "op": "add", "path": "/fields/System.Title", "value": draft.title }),
            json!({ "op": "add", "path": "/fields/System.AreaPath", "value": draft.area_path }),
        ];
        if !draft.tags.is_empty() {
            operations.push(
                json!({ "op": "add", "path": "/fields/System.Tags", "value": join_tags(&draft.tags) }),
            );
        }

        let body = self
            .call("POST", &url, Some((JSON_PATCH, &Value::Array(operations))))?
            .ok_or_else(|| TrackerError::Api {
                status: 404,
                message: format!("work item type {} not found", self.aggregate_type),
            })?;
        Ok(decode::<WireItem>(body)?.id)
    }

    fn create_relation(
        &self,
        source: ItemId,
        target: ItemId,
        kind: &RelationKind,
        comment: &str,
    ) -> Result<(), TrackerError> {
        let mut value = json!({ "rel": kind.reference(), "url": self.item_url(target)? });
        if !comment.is_empty() {
            value["attributes"] = json!({ "comment": comment });
        }
        self.patch(source, &json!([{ "op": "add", "path": "/relations/-", "value": value }]))
    }

    fn update_title(&self, id: ItemId, title: &str) -> Result<(), TrackerError> {
        self.patch_field(id, "System.Title", title)
    }

    fn update_notes(&self, id: ItemId, notes: &str) -> Result<(), TrackerError> {
        self.patch_field(id, &self.notes_field, notes)
    }
}

fn basic_auth(token: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!(":{token}")))
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, TrackerError> {
    serde_json::from_value(body).map_err(|err| TrackerError::Decode(err.to_string()))
}

fn not_found(id: ItemId) -> TrackerError {
    TrackerError::Api {
        status: 404,
        message: format!("work item {id} does not exist"),
    }
}

fn join_ids(ids: &[ItemId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

/// ADO error bodies are `{"message": ...}`; anything else is passed through, truncated.
fn error_message(response: ureq::Response) -> String {
    let raw = response.into_string().unwrap_or_default();
    let message = serde_json::from_str::<Value>(&raw)
        .ok()
        .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(raw);
    message.chars().take(MAX_ERROR_BODY).collect()
}

/// Relations whose URL does not end in a numeric id (hyperlinks, artifacts) are dropped.
fn to_relation(wire: &WireRelation) -> Option<Relation> {
    let target = wire.url.rsplit('/').next()?.parse().ok()?;
    Some(Relation {
        kind: RelationKind::from_reference(&wire.rel),
        target,
        comment: wire
            .attributes
            .get("comment")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn wiql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn build_wiql(filter: &ItemFilter, rank_field: &str) -> String {
    let mut clauses = vec!["[System.TeamProject] = @project".to_string()];
    if let Some(area) = &filter.area_path {
        clauses.push(format!("[System.AreaPath] UNDER {}", wiql_literal(area)));
    }
    if !filter.item_types.is_empty() {
        let types: Vec<String> = filter.item_types.iter().map(|t| wiql_literal(t)).collect();
        clauses.push(format!("[System.WorkItemType] IN ({})", types.join(", ")));
    }
    format!(
        "SELECT [System.Id] FROM WorkItems WHERE {} ORDER BY [{rank_field}] ASC, [System.Id] ASC",
        clauses.join(" AND ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AdoClient {
        let creds = Credentials {
            organization_url: "https://dev.azure.com/contoso/".to_string(),
            project: "Fabrikam Fiber".to_string(),
            token: "secret".to_string(),
        };
        AdoClient::new(&creds, &TrackerConfig::default()).expect("client")
    }

    #[test]
    fn wiql_filters_and_orders_by_rank() {
        let filter = ItemFilter {
            area_path: Some("Fabrikam\\Team's Area".to_string()),
            item_types: vec!["Feature".to_string(), "Epic".to_string()],
            limit: Some(10),
        };
        let wiql = build_wiql(&filter, "Microsoft.VSTS.Common.StackRank");
        assert_eq!(
            wiql,
            "SELECT [System.Id] FROM WorkItems WHERE [System.TeamProject] = @project \
             AND [System.AreaPath] UNDER 'Fabrikam\\Team''s Area' \
             AND [System.WorkItemType] IN ('Feature', 'Epic') \
             ORDER BY [Microsoft.VSTS.Common.StackRank] ASC, [System.Id] ASC"
        );
    }

    #[test]
    fn endpoints_encode_project_and_type() {
        let client = client();
        let url = client
            .endpoint(&["workitems", "$Release Train"])
            .expect("endpoint");
        assert_eq!(
            url.as_str(),
            "https://dev.azure.com/contoso/Fabrikam%20Fiber/_apis/wit/workitems/$Release%20Train?api-version=7.0"
        );
        assert_eq!(
            client.item_url(42).expect("item url"),
            "https://dev.azure.com/contoso/_apis/wit/workItems/42"
        );
    }

    #[test]
    fn basic_auth_uses_empty_user() {
        // base64(":secret")
        assert_eq!(basic_auth("secret"), "Basic OnNlY3JldA==");
    }

    #[test]
    fn wire_item_maps_fields_and_relations() {
        let wire: WireItem = serde_json::from_value(json!({
            "id": 7,
            "fields": {
                "System.Title": "----- Q1 -----rt:9",
                "System.WorkItemType": "Feature",
                "System.State": "Active",
                "System.AreaPath": "Fabrikam",
                "System.IterationPath": "Fabrikam\\Sprint 1",
                "System.Tags": "auto-generated; q1",
                "Microsoft.VSTS.Scheduling.Effort": 5.0,
                "Custom.Notes": "[ESTIMATE: 5] hi"
            },
            "relations": [
                { "rel": "System.LinkTypes.Related", "url": "https://dev.azure.com/contoso/_apis/wit/workItems/9",
                  "attributes": { "comment": "linked by trainyard" } },
                { "rel": "ArtifactLink", "url": "vstfs:///Git/Commit/abc", "attributes": {} }
            ]
        }))
        .expect("wire item");

        let item = client().to_work_item(wire);
        assert_eq!(item.id, 7);
        assert_eq!(item.tags, vec!["auto-generated", "q1"]);
        assert_eq!(item.estimate, Some(5.0));
        assert_eq!(item.notes.as_deref(), Some("[ESTIMATE: 5] hi"));
        assert_eq!(item.relations.len(), 1);
        assert_eq!(item.relations[0].target, 9);
        assert_eq!(item.relations[0].kind, RelationKind::Related);
    }

    #[test]
    fn batch_tolerates_omitted_items() {
        let batch: Batch = serde_json::from_value(json!({
            "count": 2,
            "value": [ { "id": 1, "fields": {} }, null ]
        }))
        .expect("batch");
        assert_eq!(batch.value.into_iter().flatten().count(), 1);
    }
}
