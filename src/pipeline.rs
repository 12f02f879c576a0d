//! Ingestion pipeline.
//!
//! ```text
//! received → verified → persisted → [template resolved → rendered → [agent triggered → completed]]
//! ```
//!
//! Only persisting the event can fail a delivery. Everything after it is best
//! effort and reported through the audit log. Agent runs are handed to a
//! background dispatcher keyed by document id, so the webhook response never
//! waits on them.

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::agent::AgentInvoker;
use crate::error::{AgentError, ExecuteError, StoreError};
use crate::render;
use crate::store::RecordStore;
use crate::templates::TemplateStore;
use crate::types::{
    Ack, Delivery, ExecutionRecord, ExecutionStatus, NewDocument, NewEvent, NewExecution,
    RenderedDocument, PROJECTS_REPOSITORY, UNKNOWN,
};
use crate::verification;

/// When a freshly rendered document is sent to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub auto_dispatch: bool,
    /// When set, only payloads mentioning this tag in their text fields are
    /// dispatched.
    pub tag: Option<String>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            auto_dispatch: true,
            tag: None,
        }
    }
}

impl DispatchPolicy {
    pub fn should_dispatch(&self, payload: &Value) -> bool {
        if !self.auto_dispatch {
            return false;
        }
        match self.tag.as_deref() {
            Some(tag) => mentions_tag(payload, tag),
            None => true,
        }
    }
}

/// Case-insensitive search for `tag` in the free-text fields people write in.
pub fn mentions_tag(payload: &Value, tag: &str) -> bool {
    const FIELDS: &[&str] = &[
        "/issue/body",
        "/issue/title",
        "/pull_request/body",
        "/pull_request/title",
        "/release/body",
        "/commits/0/message",
        "/comment/body",
    ];
    let tag = tag.to_lowercase();
    FIELDS
        .iter()
        .filter_map(|pointer| payload.pointer(pointer).and_then(Value::as_str))
        .any(|text| text.to_lowercase().contains(&tag))
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    /// Empty means unauthenticated mode.
    pub secret: String,
    pub dispatch: DispatchPolicy,
    /// Do not auto-dispatch a delivery whose id is already on record.
    pub skip_redelivered: bool,
}

/// Fields pulled out of a payload for indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derived {
    pub sender_login: String,
    pub sender_id: Option<i64>,
    pub repository: String,
    pub action: Option<String>,
}

pub fn derive_fields(payload: &Value) -> Derived {
    let sender = present(payload.get("sender"));
    let sender_login = present(sender.and_then(|s| s.get("login")))
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN)
        .to_string();
    let sender_id = sender.and_then(|s| s.get("id")).and_then(Value::as_i64);

    let repository = if let Some(repo) = present(payload.get("repository")) {
        present(repo.get("full_name"))
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN)
    } else if let Some(org) = present(payload.get("organization")) {
        present(org.get("login"))
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN)
    } else if present(payload.get("projects_v2_item")).is_some() {
        PROJECTS_REPOSITORY
    } else {
        UNKNOWN
    }
    .to_string();

    let action = present(payload.get("action"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Derived {
        sender_login,
        sender_id,
        repository,
        action,
    }
}

/// Drop values that carry nothing: null, `false`, zero and the empty string.
fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

/// Turn a request body into the effective payload.
///
/// Form-encoded deliveries carry the JSON document in a `payload` field. A
/// body that cannot be read as intended is kept in its rawest usable form
/// rather than rejected.
pub fn normalize_payload(content_type: Option<&str>, body: &[u8]) -> Value {
    let is_form = content_type
        .map(|ct| ct.trim().starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    if is_form {
        let fields: Vec<(String, String)> = match serde_urlencoded::from_bytes(body) {
            Ok(fields) => fields,
            Err(e) => {
                tracing::warn!("unreadable form body, storing raw text: {e}");
                return Value::String(String::from_utf8_lossy(body).into_owned());
            }
        };
        let form: Map<String, Value> = fields
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect();
        if let Some(Value::String(inner)) = form.get("payload") {
            match serde_json::from_str(inner) {
                Ok(parsed) => return parsed,
                Err(e) => tracing::warn!("form payload field is not JSON, keeping form data: {e}"),
            }
        }
        return Value::Object(form);
    }

    if body.iter().all(u8::is_ascii_whitespace) {
        return Value::Object(Map::new());
    }
    match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("malformed JSON body, storing raw text: {e}");
            Value::String(String::from_utf8_lossy(body).into_owned())
        }
    }
}

struct DispatchJob {
    document_id: i64,
}

pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn RecordStore>,
    templates: TemplateStore,
    agent: Arc<dyn AgentInvoker>,
    dispatch_tx: mpsc::UnboundedSender<DispatchJob>,
}

impl Pipeline {
    /// Build the pipeline and start its background dispatcher on the current
    /// runtime.
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn RecordStore>,
        templates: TemplateStore,
        agent: Arc<dyn AgentInvoker>,
    ) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(dispatch_rx, store.clone(), agent.clone()));
        Self {
            config,
            store,
            templates,
            agent,
            dispatch_tx,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// Process one inbound delivery. Fails only when the event itself cannot
    /// be persisted.
    pub async fn ingest(&self, delivery: Delivery) -> Result<Ack, StoreError> {
        let event_type = delivery
            .event_type
            .clone()
            .unwrap_or_else(|| UNKNOWN.to_string());

        let verified = verification::verify(
            &delivery.body,
            delivery.signature.as_deref().unwrap_or(""),
            &self.config.secret,
        );
        if !verified {
            tracing::warn!(
                event_type = %event_type,
                delivery_id = delivery.delivery_id.as_deref().unwrap_or(""),
                "signature verification failed"
            );
        }

        let payload = normalize_payload(delivery.content_type.as_deref(), &delivery.body);
        let derived = derive_fields(&payload);

        let redelivered = match (&delivery.delivery_id, self.config.skip_redelivered) {
            (Some(id), true) => self.store.delivery_seen(id).await.unwrap_or_else(|e| {
                tracing::warn!("redelivery lookup failed: {e}");
                false
            }),
            _ => false,
        };

        let event = self
            .store
            .insert_event(NewEvent {
                event_type: event_type.clone(),
                action: derived.action.clone(),
                delivery_id: delivery.delivery_id.clone(),
                signature: delivery.signature.clone(),
                payload,
                sender_login: derived.sender_login.clone(),
                sender_id: derived.sender_id,
                repository: derived.repository.clone(),
                verified,
            })
            .await
            .inspect_err(|e| {
                tracing::error!(
                    event_type = %event_type,
                    delivery_id = delivery.delivery_id.as_deref().unwrap_or(""),
                    "failed to persist event: {e}"
                );
            })?;

        tracing::info!(
            event_id = event.id,
            event_type = %event.event_type,
            repository = %event.repository,
            sender = %event.sender_login,
            verified,
            "event persisted"
        );

        if event.repository != UNKNOWN {
            let rendered = self
                .render_for(&event.repository, &event.event_type, event.id, &event.payload)
                .await;
            if let Some(document) = rendered {
                if redelivered {
                    tracing::info!(
                        document_id = document.id,
                        "delivery already on record, not dispatching"
                    );
                } else if self.config.dispatch.should_dispatch(&event.payload) {
                    self.dispatch(document.id);
                }
            }
        }

        Ok(Ack {
            received: true,
            event: event.event_type,
            action: event.action,
            repository: event.repository,
            verified,
        })
    }

    async fn render_for(
        &self,
        repository: &str,
        event_type: &str,
        event_id: i64,
        payload: &Value,
    ) -> Option<RenderedDocument> {
        let Some(template) = self.templates.resolve(repository, event_type).await else {
            tracing::debug!(event_id, repository, event_type, "no template");
            return None;
        };
        let content = render::render(&template, payload);

        match self
            .store
            .insert_document(NewDocument {
                webhook_id: event_id,
                repository: repository.to_string(),
                event_type: event_type.to_string(),
                prompt_template: template,
                parsed_content: content,
            })
            .await
        {
            Ok(document) => {
                tracing::info!(
                    event_id,
                    document_id = document.id,
                    repository,
                    event_type,
                    "document rendered"
                );
                Some(document)
            }
            Err(e) => {
                tracing::error!(
                    event_id,
                    repository,
                    event_type,
                    "failed to persist rendered document: {e}"
                );
                None
            }
        }
    }

    fn dispatch(&self, document_id: i64) {
        tracing::info!(document_id, "dispatching agent");
        if self.dispatch_tx.send(DispatchJob { document_id }).is_err() {
            tracing::error!(document_id, "agent dispatcher is gone");
        }
    }

    /// Run the agent over a stored document now and return the recorded result.
    pub async fn execute_now(
        &self,
        document_id: i64,
    ) -> Result<(RenderedDocument, ExecutionRecord), ExecuteError> {
        let view = self
            .store
            .get_document(document_id)
            .await?
            .ok_or(ExecuteError::DocumentNotFound(document_id))?;
        let record =
            execute_document(self.store.as_ref(), self.agent.as_ref(), &view.document).await?;
        Ok((view.document, record))
    }
}

async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<DispatchJob>,
    store: Arc<dyn RecordStore>,
    agent: Arc<dyn AgentInvoker>,
) {
    while let Some(job) = rx.recv().await {
        let store = store.clone();
        let agent = agent.clone();
        // Runs are independent; nothing serializes them.
        tokio::spawn(async move {
            let document = match store.get_document(job.document_id).await {
                Ok(Some(view)) => view.document,
                Ok(None) => {
                    tracing::error!(document_id = job.document_id, "dispatched document vanished");
                    return;
                }
                Err(e) => {
                    tracing::error!(
                        document_id = job.document_id,
                        "failed to load dispatched document: {e}"
                    );
                    return;
                }
            };
            if let Err(e) = execute_document(store.as_ref(), agent.as_ref(), &document).await {
                tracing::error!(document_id = job.document_id, "failed to record agent run: {e}");
            }
        });
    }
}

/// Invoke the agent over `document` and persist whatever happened.
async fn execute_document(
    store: &dyn RecordStore,
    agent: &dyn AgentInvoker,
    document: &RenderedDocument,
) -> Result<ExecutionRecord, StoreError> {
    let started = Instant::now();
    let execution = match agent.invoke(&document.parsed_content).await {
        Ok(outcome) => {
            let status = if outcome.timed_out {
                ExecutionStatus::TimedOut
            } else if outcome.exit_code == Some(0) {
                ExecutionStatus::Succeeded
            } else {
                ExecutionStatus::Failed
            };
            NewExecution {
                prompt_id: document.id,
                error_message: (!outcome.stderr.is_empty()).then_some(outcome.stderr),
                response_content: outcome.stdout,
                exit_code: outcome.exit_code,
                execution_time: outcome.duration_ms,
                status,
            }
        }
        Err(e) => {
            tracing::error!(document_id = document.id, "agent run failed: {e}");
            let status = match e {
                AgentError::Launch { .. } => ExecutionStatus::LaunchFailed,
                AgentError::Io(_) => ExecutionStatus::Failed,
            };
            NewExecution {
                prompt_id: document.id,
                response_content: String::new(),
                error_message: Some(e.to_string()),
                exit_code: None,
                execution_time: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                status,
            }
        }
    };

    let record = store.insert_execution(execution).await?;
    tracing::info!(
        document_id = document.id,
        execution_id = record.id,
        status = record.status.as_str(),
        exit_code = ?record.exit_code,
        duration_ms = record.execution_time,
        "agent run recorded"
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::agent::ExecutionOutcome;
    use crate::store::SqliteStore;
    use crate::templates::TemplateKey;

    enum Script {
        Exit(i32, &'static str, &'static str),
        Missing,
    }

    struct FakeAgent {
        script: Script,
        seen: Mutex<Vec<String>>,
    }

    impl FakeAgent {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn invocations(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentInvoker for FakeAgent {
        async fn invoke(&self, instructions: &str) -> Result<ExecutionOutcome, AgentError> {
            self.seen.lock().unwrap().push(instructions.to_string());
            match self.script {
                Script::Exit(code, stdout, stderr) => Ok(ExecutionOutcome {
                    stdout: stdout.to_string(),
                    stderr: stderr.to_string(),
                    exit_code: Some(code),
                    duration_ms: 5,
                    timed_out: false,
                }),
                Script::Missing => Err(AgentError::Launch {
                    program: "claude",
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
            }
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<SqliteStore>,
        templates: TemplateStore,
        agent: Arc<FakeAgent>,
        pipeline: Pipeline,
    }

    fn harness(config: PipelineConfig, script: Script) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("events.db")).unwrap());
        let templates = TemplateStore::new(dir.path().join("prompts"));
        let agent = FakeAgent::new(script);
        let pipeline = Pipeline::new(config, store.clone(), templates.clone(), agent.clone());
        Harness {
            _dir: dir,
            store,
            templates,
            agent,
            pipeline,
        }
    }

    fn json_delivery(event_type: &str, payload: Value) -> Delivery {
        Delivery {
            event_type: Some(event_type.to_string()),
            delivery_id: Some("72d3162e-cc78-11e3-81ab-4c9367dc0958".to_string()),
            signature: None,
            content_type: Some("application/json".to_string()),
            body: serde_json::to_vec(&payload).unwrap(),
        }
    }

    fn issue_opened() -> Value {
        json!({
            "action": "opened",
            "issue": {"number": 3, "title": "Widget crashes", "body": "boom"},
            "repository": {"full_name": "acme/widgets"},
            "sender": {"login": "octocat", "id": 583231}
        })
    }

    async fn wait_for_execution(store: &SqliteStore, document_id: i64) -> ExecutionRecord {
        for _ in 0..200 {
            if let Some(record) = store.latest_execution(document_id).await.unwrap() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no execution recorded for document {document_id}");
    }

    async fn only_document(store: &SqliteStore) -> Option<RenderedDocument> {
        let docs = store
            .list_documents(crate::types::DocumentQuery {
                webhook_id: None,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert!(docs.len() <= 1);
        docs.into_iter().next().map(|v| v.document)
    }

    #[test]
    fn derives_sender_repository_and_action() {
        let derived = derive_fields(&issue_opened());
        assert_eq!(derived.sender_login, "octocat");
        assert_eq!(derived.sender_id, Some(583231));
        assert_eq!(derived.repository, "acme/widgets");
        assert_eq!(derived.action.as_deref(), Some("opened"));
    }

    #[test]
    fn derivation_fallbacks() {
        let org = derive_fields(&json!({"organization": {"login": "acme"}}));
        assert_eq!(org.repository, "acme");

        let project = derive_fields(&json!({"projects_v2_item": {"id": 1}}));
        assert_eq!(project.repository, PROJECTS_REPOSITORY);

        let nameless = derive_fields(&json!({"repository": {}, "organization": {"login": "acme"}}));
        assert_eq!(nameless.repository, UNKNOWN);

        let null_repo = derive_fields(&json!({
            "repository": null,
            "organization": {"login": "acme"}
        }));
        assert_eq!(null_repo.repository, "acme");

        let null_org = derive_fields(&json!({
            "repository": null,
            "organization": null,
            "projects_v2_item": {"id": 1}
        }));
        assert_eq!(null_org.repository, PROJECTS_REPOSITORY);

        let blank = derive_fields(&json!({
            "repository": {"full_name": ""},
            "sender": {"login": "", "id": 9},
            "action": ""
        }));
        assert_eq!(blank.repository, UNKNOWN);
        assert_eq!(blank.sender_login, UNKNOWN);
        assert_eq!(blank.sender_id, Some(9));
        assert_eq!(blank.action, None);

        let bare = derive_fields(&json!({"zen": "Half measures are as bad as nothing at all."}));
        assert_eq!(bare.repository, UNKNOWN);
        assert_eq!(bare.sender_login, UNKNOWN);
        assert_eq!(bare.sender_id, None);
        assert_eq!(bare.action, None);
    }

    #[test]
    fn form_payload_field_is_unwrapped() {
        let pairs: &[(&str, &str)] = &[("payload", r#"{"action":"closed"}"#)];
        let body = serde_urlencoded::to_string(pairs).unwrap();
        let value = normalize_payload(
            Some("application/x-www-form-urlencoded"),
            body.as_bytes(),
        );
        assert_eq!(value, json!({"action": "closed"}));
    }

    #[test]
    fn unparseable_form_payload_keeps_form_data() {
        let pairs: &[(&str, &str)] = &[("payload", "{not json"), ("x", "1")];
        let body = serde_urlencoded::to_string(pairs).unwrap();
        let value = normalize_payload(
            Some("application/x-www-form-urlencoded; charset=utf-8"),
            body.as_bytes(),
        );
        assert_eq!(value, json!({"payload": "{not json", "x": "1"}));
    }

    #[test]
    fn malformed_json_is_kept_as_text() {
        assert_eq!(
            normalize_payload(Some("application/json"), b"{oops"),
            Value::String("{oops".into())
        );
        assert_eq!(normalize_payload(None, b""), json!({}));
    }

    #[test]
    fn tag_predicate_checks_text_fields() {
        let tagged = json!({"comment": {"body": "Hey @Clide, take a look"}});
        let untagged = json!({"comment": {"body": "nothing here"}, "other": "@clide"});
        assert!(mentions_tag(&tagged, "@clide"));
        assert!(!mentions_tag(&untagged, "@clide"));
        assert!(mentions_tag(&json!({"commits": [{"message": "fix @clide"}]}), "@clide"));

        let policy = DispatchPolicy {
            auto_dispatch: true,
            tag: Some("@clide".into()),
        };
        assert!(policy.should_dispatch(&tagged));
        assert!(!policy.should_dispatch(&untagged));

        let off = DispatchPolicy {
            auto_dispatch: false,
            tag: None,
        };
        assert!(!off.should_dispatch(&tagged));
        assert!(DispatchPolicy::default().should_dispatch(&untagged));
    }

    #[tokio::test]
    async fn ping_without_secret_is_verified() {
        let h = harness(PipelineConfig::default(), Script::Exit(0, "", ""));
        let ack = h
            .pipeline
            .ingest(json_delivery("ping", json!({"zen": "Speak like a human.", "hook_id": 1})))
            .await
            .unwrap();
        assert!(ack.received);
        assert!(ack.verified);
        assert_eq!(ack.event, "ping");
        assert_eq!(ack.repository, UNKNOWN);
        assert!(only_document(&h.store).await.is_none());
    }

    #[tokio::test]
    async fn bad_signature_is_recorded_not_rejected() {
        let config = PipelineConfig {
            secret: "s3cret".into(),
            ..PipelineConfig::default()
        };
        let h = harness(config, Script::Exit(0, "", ""));
        let mut delivery = json_delivery("issues", issue_opened());
        delivery.signature = Some("sha256=00".into());
        let ack = h.pipeline.ingest(delivery).await.unwrap();
        assert!(!ack.verified);

        let events = h.store.list_events(10, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].verified);
    }

    #[tokio::test]
    async fn good_signature_verifies() {
        let config = PipelineConfig {
            secret: "s3cret".into(),
            ..PipelineConfig::default()
        };
        let h = harness(config, Script::Exit(0, "", ""));
        let mut delivery = json_delivery("issues", issue_opened());
        delivery.signature = Some(verification::compute_signature(&delivery.body, "s3cret"));
        assert!(h.pipeline.ingest(delivery).await.unwrap().verified);
    }

    #[tokio::test]
    async fn unknown_repository_skips_templates() {
        let h = harness(PipelineConfig::default(), Script::Exit(0, "", ""));
        h.templates
            .put(&TemplateKey::generic("issues").unwrap(), "generic")
            .await
            .unwrap();
        let ack = h
            .pipeline
            .ingest(json_delivery("issues", json!({"action": "opened"})))
            .await
            .unwrap();
        assert_eq!(ack.repository, UNKNOWN);
        assert_eq!(h.store.list_events(10, 0).await.unwrap().len(), 1);
        assert!(only_document(&h.store).await.is_none());
        assert!(h.agent.invocations().is_empty());
    }

    #[tokio::test]
    async fn repository_template_wins_and_agent_runs() {
        let h = harness(PipelineConfig::default(), Script::Exit(0, "looks good", ""));
        h.templates
            .put(&TemplateKey::generic("issues").unwrap(), "generic {{ issue.title }}")
            .await
            .unwrap();
        h.templates
            .put(
                &TemplateKey::repository("acme/widgets", "issues").unwrap(),
                "widgets {{ action }}: {{ issue.title }}",
            )
            .await
            .unwrap();

        let ack = h
            .pipeline
            .ingest(json_delivery("issues", issue_opened()))
            .await
            .unwrap();
        assert_eq!(ack.action.as_deref(), Some("opened"));
        assert_eq!(ack.repository, "acme/widgets");

        let doc = only_document(&h.store).await.unwrap();
        assert_eq!(doc.prompt_template, "widgets {{ action }}: {{ issue.title }}");
        assert_eq!(doc.parsed_content, "widgets opened: Widget crashes");

        let record = wait_for_execution(&h.store, doc.id).await;
        assert_eq!(record.status, ExecutionStatus::Succeeded);
        assert_eq!(record.response_content, "looks good");
        assert_eq!(h.agent.invocations(), vec!["widgets opened: Widget crashes"]);
    }

    #[tokio::test]
    async fn render_errors_still_produce_a_document() {
        let h = harness(PipelineConfig::default(), Script::Exit(0, "", ""));
        h.templates
            .put(&TemplateKey::generic("issues").unwrap(), "{% if %}")
            .await
            .unwrap();
        h.pipeline
            .ingest(json_delivery("issues", issue_opened()))
            .await
            .unwrap();
        let doc = only_document(&h.store).await.unwrap();
        assert!(doc.parsed_content.starts_with("Error parsing template:"));
    }

    #[tokio::test]
    async fn disabled_dispatch_renders_without_running() {
        let config = PipelineConfig {
            dispatch: DispatchPolicy {
                auto_dispatch: false,
                tag: None,
            },
            ..PipelineConfig::default()
        };
        let h = harness(config, Script::Exit(0, "", ""));
        h.templates
            .put(&TemplateKey::generic("issues").unwrap(), "{{ action }}")
            .await
            .unwrap();
        h.pipeline
            .ingest(json_delivery("issues", issue_opened()))
            .await
            .unwrap();
        let doc = only_document(&h.store).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.store.latest_execution(doc.id).await.unwrap().is_none());
        assert!(h.agent.invocations().is_empty());
    }

    #[tokio::test]
    async fn redelivery_can_suppress_dispatch() {
        let config = PipelineConfig {
            skip_redelivered: true,
            ..PipelineConfig::default()
        };
        let h = harness(config, Script::Exit(0, "", ""));
        h.templates
            .put(&TemplateKey::generic("issues").unwrap(), "{{ action }}")
            .await
            .unwrap();

        h.pipeline
            .ingest(json_delivery("issues", issue_opened()))
            .await
            .unwrap();
        h.pipeline
            .ingest(json_delivery("issues", issue_opened()))
            .await
            .unwrap();

        let docs = h
            .store
            .list_documents(crate::types::DocumentQuery {
                webhook_id: None,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        wait_for_execution(&h.store, docs[1].document.id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.store.latest_execution(docs[0].document.id).await.unwrap().is_none());
        assert_eq!(h.agent.invocations().len(), 1);
    }

    #[tokio::test]
    async fn failed_run_keeps_exit_code_and_stderr() {
        let h = harness(PipelineConfig::default(), Script::Exit(1, "", "auth error"));
        h.templates
            .put(&TemplateKey::generic("issues").unwrap(), "{{ action }}")
            .await
            .unwrap();
        h.pipeline
            .ingest(json_delivery("issues", issue_opened()))
            .await
            .unwrap();
        let doc = only_document(&h.store).await.unwrap();
        let record = wait_for_execution(&h.store, doc.id).await;
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.exit_code, Some(1));
        assert_eq!(record.error_message.as_deref(), Some("auth error"));
    }

    #[tokio::test]
    async fn launch_failure_has_no_exit_code() {
        let h = harness(
            PipelineConfig {
                dispatch: DispatchPolicy {
                    auto_dispatch: false,
                    tag: None,
                },
                ..PipelineConfig::default()
            },
            Script::Missing,
        );
        h.templates
            .put(&TemplateKey::generic("issues").unwrap(), "{{ action }}")
            .await
            .unwrap();
        h.pipeline
            .ingest(json_delivery("issues", issue_opened()))
            .await
            .unwrap();
        let doc = only_document(&h.store).await.unwrap();

        let (document, record) = h.pipeline.execute_now(doc.id).await.unwrap();
        assert_eq!(document.id, doc.id);
        assert_eq!(record.status, ExecutionStatus::LaunchFailed);
        assert_eq!(record.exit_code, None);
        assert!(record.error_message.unwrap().contains("failed to launch"));
    }

    #[tokio::test]
    async fn execute_now_reports_unknown_documents() {
        let h = harness(PipelineConfig::default(), Script::Exit(0, "", ""));
        assert!(matches!(
            h.pipeline.execute_now(42).await,
            Err(ExecuteError::DocumentNotFound(42))
        ));
    }

    #[tokio::test]
    async fn persistence_failure_fails_ingest() {
        let h = harness(PipelineConfig::default(), Script::Exit(0, "", ""));
        h.store.close().await.unwrap();
        let result = h
            .pipeline
            .ingest(json_delivery("issues", issue_opened()))
            .await;
        assert!(matches!(result, Err(StoreError::Closed)));
    }
}
