use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use fs2::FileExt;
use mailroom_config::Config;
use mailroom_contracts::{
    Activity, Communication, Contact, EntityKind, EntityRef, NewActivity, RouteOutcome,
    WebhookTrigger, DEFAULT_LEAD_TITLE, EMAIL_ACTIVITY_TYPE, LEAD_SOURCE_EMAIL,
};
use mailroom_kernel::{lock_marker_name, match_by_subject, parse_mailbox, poll_attempts};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub fn build_app(cfg: Config) -> Result<Router, String> {
    Ok(router(AppState::new(cfg)?))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/webhooks/activity", post(activity_webhook))
        .with_state(state)
}

#[derive(Clone)]
pub struct AppState {
    cfg: Arc<Config>,
    gateway: Arc<CrmGateway>,
    cache: Arc<EntityCache>,
    gate: Arc<RequestGate>,
}

impl AppState {
    pub fn new(cfg: Config) -> Result<Self, String> {
        let gateway = CrmGateway::from_config(&cfg)?;
        let cache = EntityCache::new(Duration::from_secs(cfg.cache.ttl_secs));
        let gate = RequestGate::new(cfg.gate.lock_dir.as_deref());
        Ok(Self {
            cfg: Arc::new(cfg),
            gateway: Arc::new(gateway),
            cache: Arc::new(cache),
            gate: Arc::new(gate),
        })
    }

    pub fn gateway(&self) -> &Arc<CrmGateway> {
        &self.gateway
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// The webhook entry point. One delivery = one synchronous routing run,
/// serialized by the request gate; an overlapping delivery is answered
/// 202/busy rather than queued or failed.
async fn activity_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    Json(trigger): Json<WebhookTrigger>,
) -> Result<(StatusCode, Json<RouteOutcome>), (StatusCode, Json<Value>)> {
    if let Some(expected) = state.cfg.server.webhook_secret.as_deref() {
        let provided = params.get("secret").map(String::as_str).unwrap_or_default();
        if !digest_eq(provided, expected) {
            return Err(error_response(
                StatusCode::FORBIDDEN,
                "forbidden",
                "invalid webhook secret",
            ));
        }
    }
    if let Some(expected) = state.cfg.server.app_token.as_deref() {
        let provided = trigger.application_token().unwrap_or_default();
        if !digest_eq(provided, expected) {
            return Err(error_response(
                StatusCode::FORBIDDEN,
                "forbidden",
                "invalid application token",
            ));
        }
    }

    let activity_id = trigger.activity_id().ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "missing activity id in webhook body",
        )
    })?;

    let wait = Duration::from_secs(state.cfg.gate.wait_timeout_secs);
    let guard = match state.gate.acquire(&state.cfg.gate.key, wait).await {
        Ok(guard) => guard,
        Err(GateError::Busy) => {
            info!(activity_id, "another delivery is being processed; responding busy");
            return Ok((StatusCode::ACCEPTED, Json(RouteOutcome::Busy)));
        }
        Err(GateError::Io(err)) => {
            error!(activity_id, error = %err, "request gate unavailable");
            return Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "lock_unavailable",
                "could not open the dedup lock marker",
            ));
        }
    };

    let outcome = route_activity(&state, activity_id)
        .instrument(info_span!("route", activity_id))
        .await;
    drop(guard);

    info!(activity_id, outcome = ?outcome, "delivery handled");
    Ok((StatusCode::OK, Json(outcome)))
}

fn error_response(status: StatusCode, code: &str, message: &str) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({"error": {"code": code, "message": message}})),
    )
}

/// Digest comparison keeps the timing independent of where the first
/// mismatching byte falls.
fn digest_eq(provided: &str, expected: &str) -> bool {
    Sha256::digest(provided.as_bytes()) == Sha256::digest(expected.as_bytes())
}

// ---------------------------------------------------------------------------
// Routing engine
// ---------------------------------------------------------------------------

/// Run the full routing pipeline for one triggering activity id and return
/// a definite outcome. Remote failures are caught at the state where they
/// happen; nothing escapes as a panic or an error to the caller.
pub async fn route_activity(state: &AppState, activity_id: i64) -> RouteOutcome {
    let activity = match state.gateway.get_activity(activity_id).await {
        Ok(Some(activity)) => activity,
        Ok(None) => {
            info!(activity_id, "activity not found; skipping");
            return RouteOutcome::Skipped {
                reason: "activity_not_found".to_string(),
            };
        }
        Err(err) => {
            error!(activity_id, state = "received", error = %err, "loading the triggering activity failed");
            return RouteOutcome::Failed {
                reason: "remote_error".to_string(),
            };
        }
    };

    if activity.type_id != Some(EMAIL_ACTIVITY_TYPE) {
        info!(activity_id, type_id = ?activity.type_id, "not an email activity; skipping");
        return RouteOutcome::Skipped {
            reason: "not_email".to_string(),
        };
    }

    let subject = activity.subject.clone();
    info!(activity_id, subject = %subject, from = ?activity.email_from(), "routing email activity");

    if state.cfg.routing.contact_first {
        if let Some(outcome) = route_via_contact(state, &activity).await {
            return outcome;
        }
    }

    for kind in [EntityKind::Lead, EntityKind::Deal] {
        debug!(activity_id, state = search_state_name(kind), "searching all entities by subject");
        match find_in_all(state, kind, &subject).await {
            Ok(Some(entity)) => {
                info!(
                    activity_id,
                    kind = kind.as_str(),
                    entity_id = entity.id,
                    title = %entity.title,
                    "subject matched an existing entity"
                );
                return clone_if_not_bound(state, &activity, kind, entity.id).await;
            }
            Ok(None) => {}
            Err(err) => {
                error!(activity_id, state = search_state_name(kind), error = %err, "listing entities failed");
                return RouteOutcome::Failed {
                    reason: "remote_error".to_string(),
                };
            }
        }
    }

    let title = lead_title(&subject);
    info!(activity_id, title = %title, state = "creating_lead", "no lead or deal matched; creating a lead");
    match create_lead_and_wait(state, &title, None).await {
        Some(lead_id) => {
            info!(activity_id, lead_id, "new lead confirmed visible");
            clone_and_delete(state, activity_id, EntityKind::Lead, lead_id).await
        }
        None => {
            error!(activity_id, state = "creating_lead", "lead was not created or never became visible");
            RouteOutcome::Failed {
                reason: "lead_creation_failed".to_string(),
            }
        }
    }
}

fn search_state_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Lead => "searching_leads",
        EntityKind::Deal => "searching_deals",
    }
}

fn lead_title(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.is_empty() {
        DEFAULT_LEAD_TITLE.to_string()
    } else {
        trimmed.to_string()
    }
}

async fn find_in_all(
    state: &AppState,
    kind: EntityKind,
    subject: &str,
) -> Result<Option<EntityRef>, GatewayError> {
    let gateway = Arc::clone(&state.gateway);
    let items = state
        .cache
        .get_all(kind, move || async move {
            match kind {
                EntityKind::Lead => gateway.list_leads().await,
                EntityKind::Deal => gateway.list_deals().await,
            }
        })
        .await?;
    Ok(match_by_subject(subject, &items).cloned())
}

/// Narrow the search to the sender's contact before touching the full
/// listings. Returns `None` to fall through to the all-entities flow —
/// on a missing sender, a missing contact, or any failure along the way.
async fn route_via_contact(state: &AppState, activity: &Activity) -> Option<RouteOutcome> {
    let activity_id = activity.id;
    let sender = match activity.email_from().and_then(parse_mailbox) {
        Some(address) => address,
        None => {
            debug!(activity_id, "no usable sender address; skipping contact-first search");
            return None;
        }
    };

    let contacts = match state.gateway.list_contacts_by_email(&sender).await {
        Ok(contacts) => contacts,
        Err(err) => {
            warn!(activity_id, error = %err, "contact lookup failed; falling back to full search");
            return None;
        }
    };
    let contact = match contacts.into_iter().next() {
        Some(contact) => contact,
        None => {
            info!(activity_id, sender = %sender, "no contact for sender");
            return None;
        }
    };
    info!(activity_id, contact_id = contact.id, "contact found; searching its deals and leads");

    match state.gateway.list_deals_by_contact(contact.id).await {
        Ok(deals) => {
            if let Some(deal) = match_by_subject(&activity.subject, &deals) {
                info!(activity_id, deal_id = deal.id, "subject matched a deal of the contact");
                return Some(clone_if_not_bound(state, activity, EntityKind::Deal, deal.id).await);
            }
        }
        Err(err) => warn!(activity_id, error = %err, "listing the contact's deals failed"),
    }
    match state.gateway.list_leads_by_contact(contact.id).await {
        Ok(leads) => {
            if let Some(lead) = match_by_subject(&activity.subject, &leads) {
                info!(activity_id, lead_id = lead.id, "subject matched a lead of the contact");
                return Some(clone_if_not_bound(state, activity, EntityKind::Lead, lead.id).await);
            }
        }
        Err(err) => warn!(activity_id, error = %err, "listing the contact's leads failed"),
    }

    let title = lead_title(&activity.subject);
    info!(activity_id, contact_id = contact.id, title = %title, "no match among the contact's entities; creating a contact-linked lead");
    match create_lead_and_wait(state, &title, Some(contact.id)).await {
        Some(lead_id) => {
            info!(activity_id, lead_id, contact_id = contact.id, "contact-linked lead confirmed visible");
            Some(clone_and_delete(state, activity_id, EntityKind::Lead, lead_id).await)
        }
        None => {
            warn!(activity_id, "could not create a contact-linked lead; falling back to full search");
            None
        }
    }
}

async fn create_lead_and_wait(
    state: &AppState,
    title: &str,
    contact_id: Option<i64>,
) -> Option<i64> {
    let timeout = Duration::from_secs(state.cfg.convergence.timeout_secs);
    let interval = Duration::from_secs(state.cfg.convergence.interval_secs);
    let create_gateway = Arc::clone(&state.gateway);
    let poll_gateway = Arc::clone(&state.gateway);
    let title = title.to_string();
    create_and_wait(
        move || async move { create_gateway.add_lead(&title, contact_id).await },
        move |id| {
            let gateway = Arc::clone(&poll_gateway);
            async move { Ok(gateway.get_lead(id).await?.is_some()) }
        },
        timeout,
        interval,
    )
    .await
}

/// The idempotency guard: an activity whose (kind, id) binding already
/// equals the target is reported done without any mutating call.
async fn clone_if_not_bound(
    state: &AppState,
    activity: &Activity,
    kind: EntityKind,
    target_id: i64,
) -> RouteOutcome {
    if activity.is_bound_to(kind, target_id) {
        info!(
            activity_id = activity.id,
            target_kind = kind.as_str(),
            target_id,
            "already bound to the target; nothing to migrate"
        );
        return RouteOutcome::Done {
            target_kind: kind,
            target_id,
            new_activity_id: None,
        };
    }
    clone_and_delete(state, activity.id, kind, target_id).await
}

/// Migration is clone-then-best-effort-delete, not a transaction. A crash
/// between the two steps leaves a duplicate activity, which is accepted.
async fn clone_and_delete(
    state: &AppState,
    activity_id: i64,
    kind: EntityKind,
    target_id: i64,
) -> RouteOutcome {
    match clone_activity(&state.gateway, activity_id, kind, target_id).await {
        Ok(new_activity_id) => {
            info!(
                activity_id,
                new_activity_id,
                target_kind = kind.as_str(),
                target_id,
                "activity cloned onto target"
            );
            delete_source_activity(&state.gateway, activity_id).await;
            RouteOutcome::Done {
                target_kind: kind,
                target_id,
                new_activity_id: Some(new_activity_id),
            }
        }
        Err(MigrateError::NotFound) => {
            error!(activity_id, state = "migrating", "source activity disappeared before cloning");
            RouteOutcome::Failed {
                reason: "activity_not_found".to_string(),
            }
        }
        Err(MigrateError::Remote(err)) => {
            error!(activity_id, state = "migrating", error = %err, "cloning failed");
            RouteOutcome::Failed {
                reason: "clone_failed".to_string(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Activity migrator
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("activity not found")]
    NotFound,
    #[error(transparent)]
    Remote(#[from] GatewayError),
}

/// Build a copy of the activity bound to the target entity and create it
/// remotely. Subject, body, settings, timing, priority, direction and the
/// author/responsible ids carry over; completion is reset and the creation
/// timestamp is fresh.
pub async fn clone_activity(
    gateway: &CrmGateway,
    activity_id: i64,
    owner_kind: EntityKind,
    owner_id: i64,
) -> Result<i64, MigrateError> {
    let source = gateway
        .get_activity(activity_id)
        .await?
        .ok_or(MigrateError::NotFound)?;

    let communications = match source.email_from().and_then(parse_mailbox) {
        Some(address) => vec![Communication::work_email(address)],
        None => {
            warn!(activity_id, "sender address missing or unparseable; cloning without communications");
            Vec::new()
        }
    };

    let fields = NewActivity {
        owner_type_id: owner_kind.owner_code(),
        owner_id,
        type_id: source.type_id,
        subject: source.subject.clone(),
        description: source.description.clone(),
        description_type: source.description_type,
        settings: source.settings.clone(),
        communications,
        created: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        start_time: source.start_time.clone(),
        end_time: source.end_time.clone(),
        priority: source.priority,
        direction: source.direction,
        completed: "N".to_string(),
        location: source.location.clone(),
        author_id: source.author_id,
        responsible_id: source.responsible_id,
        sanitize_on_view: 1,
    };

    Ok(gateway.add_activity(&fields).await?)
}

/// Best-effort removal of the migrated-from activity. A failure here never
/// undoes a clone that already succeeded.
pub async fn delete_source_activity(gateway: &CrmGateway, activity_id: i64) -> bool {
    match gateway.delete_activity(activity_id).await {
        Ok(true) => {
            info!(activity_id, "source activity deleted");
            true
        }
        Ok(false) => {
            warn!(activity_id, "remote refused to delete the source activity");
            false
        }
        Err(err) => {
            warn!(activity_id, error = %err, "deleting the source activity failed");
            false
        }
    }
}

/// Repoint an activity in place instead of cloning it. Available as a
/// lighter-weight primitive; the routing policy uses clone-then-delete.
pub async fn rebind_activity(
    gateway: &CrmGateway,
    activity_id: i64,
    owner_kind: EntityKind,
    owner_id: i64,
    subject: &str,
) -> Result<(), GatewayError> {
    let fields = json!({
        "OWNER_TYPE_ID": owner_kind.owner_code(),
        "OWNER_ID": owner_id,
        "SUBJECT": subject,
        "COMPLETED": "N",
        "BINDINGS": [{"OWNER_TYPE_ID": owner_kind.owner_code(), "OWNER_ID": owner_id}],
    });
    gateway.update_activity(activity_id, &fields).await
}

// ---------------------------------------------------------------------------
// Convergence poller
// ---------------------------------------------------------------------------

/// Create an entity and poll until the remote store makes it visible.
///
/// The create runs once — a failed create is not retried, only the
/// visibility of a successful one is polled, at fixed `interval` spacing
/// for up to `ceil(timeout / interval)` attempts, first poll immediate.
/// A gateway error during a poll counts as not visible. Exhausting the
/// budget returns `None` and leaves the entity alone; it may well exist
/// remotely and surface later.
pub async fn create_and_wait<C, CFut, G, GFut>(
    create: C,
    get_by_id: G,
    timeout: Duration,
    interval: Duration,
) -> Option<i64>
where
    C: FnOnce() -> CFut,
    CFut: Future<Output = Result<Option<i64>, GatewayError>>,
    G: Fn(i64) -> GFut,
    GFut: Future<Output = Result<bool, GatewayError>>,
{
    let id = match create().await {
        Ok(Some(id)) => id,
        Ok(None) => {
            warn!("create returned no identifier");
            return None;
        }
        Err(err) => {
            warn!(error = %err, "create failed");
            return None;
        }
    };

    let attempts = poll_attempts(timeout, interval);
    for attempt in 1..=attempts {
        match get_by_id(id).await {
            Ok(true) => {
                debug!(id, attempt, "created entity visible");
                return Some(id);
            }
            Ok(false) => debug!(id, attempt, "created entity not visible yet"),
            Err(err) => debug!(id, attempt, error = %err, "visibility poll failed"),
        }
        if attempt < attempts {
            sleep(interval).await;
        }
    }

    warn!(id, timeout_secs = timeout.as_secs(), "created entity never became visible");
    None
}

// ---------------------------------------------------------------------------
// Entity cache
// ---------------------------------------------------------------------------

/// Process-wide TTL cache of "list all" snapshots, one entry per entity
/// kind. The mutex covers only the check and the store, not the fetch, so
/// two concurrent misses race to at most one redundant fetch.
pub struct EntityCache {
    ttl: Duration,
    entries: Mutex<HashMap<EntityKind, CacheEntry>>,
}

struct CacheEntry {
    items: Vec<EntityRef>,
    fetched_at: Instant,
}

impl EntityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_all<F, Fut>(
        &self,
        kind: EntityKind,
        fetch: F,
    ) -> Result<Vec<EntityRef>, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<EntityRef>, GatewayError>>,
    {
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&kind) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.items.clone());
                }
            }
        }

        let items = fetch().await?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            kind,
            CacheEntry {
                items: items.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(items)
    }
}

// ---------------------------------------------------------------------------
// Request gate
// ---------------------------------------------------------------------------

const GATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum GateError {
    #[error("another delivery holds the lock")]
    Busy,
    #[error("lock marker unavailable: {0}")]
    Io(#[from] io::Error),
}

/// Named mutual exclusion backed by an exclusively-locked marker file.
/// At most one holder per key at any instant, across processes sharing
/// the lock directory.
pub struct RequestGate {
    dir: PathBuf,
}

impl RequestGate {
    pub fn new(lock_dir: Option<&str>) -> Self {
        Self {
            dir: lock_dir.map(PathBuf::from).unwrap_or_else(std::env::temp_dir),
        }
    }

    /// Poll for the lock every 100 ms until acquired or `wait_timeout`
    /// elapses. A marker file that cannot be opened fails immediately.
    pub async fn acquire(&self, key: &str, wait_timeout: Duration) -> Result<LockGuard, GateError> {
        let path = self.dir.join(lock_marker_name(key));
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let deadline = Instant::now() + wait_timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(marker = %path.display(), "request gate acquired");
                    return Ok(LockGuard { file: Some(file) });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(GateError::Busy);
                    }
                    sleep(GATE_POLL_INTERVAL).await;
                }
                Err(err) => return Err(GateError::Io(err)),
            }
        }
    }
}

/// Held for the duration of one routing run. Dropping it releases the
/// lock; the marker file itself is left in place.
pub struct LockGuard {
    file: Option<fs::File>,
}

impl LockGuard {
    /// Idempotent; also runs on drop.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = file.unlock();
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

// ---------------------------------------------------------------------------
// CRM gateway
// ---------------------------------------------------------------------------

/// Remote-call failure. The three kinds are handled identically by every
/// caller — logged and downgraded to "no result" for that step.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("network: {0}")]
    Network(String),
    #[error("http status {0}")]
    Http(u16),
    #[error("decode: {0}")]
    Decode(String),
}

pub enum CrmGateway {
    Rest(RestCrm),
    Memory(MemoryCrm),
}

impl CrmGateway {
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        match cfg.crm.mode.as_str() {
            "rest" => {
                let endpoint = cfg
                    .crm
                    .endpoint
                    .clone()
                    .ok_or_else(|| "crm.endpoint is required when crm.mode=rest".to_string())?;
                Ok(CrmGateway::Rest(RestCrm::new(
                    &endpoint,
                    Duration::from_millis(cfg.crm.timeout_ms),
                )?))
            }
            "memory" => Ok(CrmGateway::Memory(MemoryCrm::new(cfg.crm.visibility_lag))),
            other => Err(format!("crm.mode={other} is not implemented")),
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryCrm> {
        match self {
            CrmGateway::Memory(crm) => Some(crm),
            CrmGateway::Rest(_) => None,
        }
    }

    pub async fn get_activity(&self, id: i64) -> Result<Option<Activity>, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => crm.get_activity(id).await,
            CrmGateway::Memory(crm) => crm.get_activity(id).await,
        }
    }

    pub async fn add_activity(&self, fields: &NewActivity) -> Result<i64, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => crm.add_activity(fields).await,
            CrmGateway::Memory(crm) => crm.add_activity(fields).await,
        }
    }

    pub async fn update_activity(&self, id: i64, fields: &Value) -> Result<(), GatewayError> {
        match self {
            CrmGateway::Rest(crm) => crm.update_activity(id, fields).await,
            CrmGateway::Memory(crm) => crm.update_activity(id, fields).await,
        }
    }

    pub async fn delete_activity(&self, id: i64) -> Result<bool, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => crm.delete_activity(id).await,
            CrmGateway::Memory(crm) => crm.delete_activity(id).await,
        }
    }

    pub async fn list_leads(&self) -> Result<Vec<EntityRef>, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => crm.list_entities("crm.lead.list", None).await,
            CrmGateway::Memory(crm) => crm.list_entities(EntityKind::Lead, None).await,
        }
    }

    pub async fn list_leads_by_contact(
        &self,
        contact_id: i64,
    ) -> Result<Vec<EntityRef>, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => {
                crm.list_entities("crm.lead.list", Some(contact_id)).await
            }
            CrmGateway::Memory(crm) => {
                crm.list_entities(EntityKind::Lead, Some(contact_id)).await
            }
        }
    }

    pub async fn get_lead(&self, id: i64) -> Result<Option<EntityRef>, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => crm.get_entity("crm.lead.get", id).await,
            CrmGateway::Memory(crm) => crm.get_entity(EntityKind::Lead, id).await,
        }
    }

    pub async fn add_lead(
        &self,
        title: &str,
        contact_id: Option<i64>,
    ) -> Result<Option<i64>, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => crm.add_entity("crm.lead.add", title, contact_id).await,
            CrmGateway::Memory(crm) => crm.add_entity(EntityKind::Lead, title, contact_id).await,
        }
    }

    pub async fn list_deals(&self) -> Result<Vec<EntityRef>, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => crm.list_entities("crm.deal.list", None).await,
            CrmGateway::Memory(crm) => crm.list_entities(EntityKind::Deal, None).await,
        }
    }

    pub async fn list_deals_by_contact(
        &self,
        contact_id: i64,
    ) -> Result<Vec<EntityRef>, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => {
                crm.list_entities("crm.deal.list", Some(contact_id)).await
            }
            CrmGateway::Memory(crm) => {
                crm.list_entities(EntityKind::Deal, Some(contact_id)).await
            }
        }
    }

    pub async fn get_deal(&self, id: i64) -> Result<Option<EntityRef>, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => crm.get_entity("crm.deal.get", id).await,
            CrmGateway::Memory(crm) => crm.get_entity(EntityKind::Deal, id).await,
        }
    }

    pub async fn add_deal(&self, title: &str) -> Result<Option<i64>, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => crm.add_entity("crm.deal.add", title, None).await,
            CrmGateway::Memory(crm) => crm.add_entity(EntityKind::Deal, title, None).await,
        }
    }

    pub async fn list_contacts_by_email(&self, email: &str) -> Result<Vec<Contact>, GatewayError> {
        match self {
            CrmGateway::Rest(crm) => crm.list_contacts_by_email(email).await,
            CrmGateway::Memory(crm) => crm.list_contacts_by_email(email).await,
        }
    }
}

/// REST backend. One POST per operation, JSON in and out, fixed per-call
/// timeout, no transport-level retries.
pub struct RestCrm {
    endpoint: String,
    client: Client,
}

impl RestCrm {
    fn new(endpoint: &str, timeout: Duration) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let url = format!("{}/{method}", self.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&params)
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Http(status.as_u16()));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }

    /// Drain every page of a listing via the `start` cursor the remote
    /// returns in `next`.
    async fn fetch_all(&self, method: &str, mut params: Value) -> Result<Vec<Value>, GatewayError> {
        let mut items = Vec::new();
        let mut cursor = Some(0i64);
        while let Some(start) = cursor {
            params["start"] = json!(start);
            let page = self.call(method, params.clone()).await?;
            match page.get("result").and_then(Value::as_array) {
                Some(rows) => items.extend(rows.iter().cloned()),
                None => break,
            }
            cursor = page.get("next").and_then(Value::as_i64);
        }
        Ok(items)
    }

    async fn get_activity(&self, id: i64) -> Result<Option<Activity>, GatewayError> {
        let payload = self.call("crm.activity.get", json!({"id": id})).await?;
        match payload.get("result") {
            Some(result) if result.is_object() => serde_json::from_value(result.clone())
                .map(Some)
                .map_err(|e| GatewayError::Decode(e.to_string())),
            _ => Ok(None),
        }
    }

    async fn add_activity(&self, fields: &NewActivity) -> Result<i64, GatewayError> {
        let payload = self
            .call("crm.activity.add", json!({"fields": fields}))
            .await?;
        payload
            .get("result")
            .and_then(value_as_id)
            .ok_or_else(|| GatewayError::Decode("crm.activity.add returned no identifier".into()))
    }

    async fn update_activity(&self, id: i64, fields: &Value) -> Result<(), GatewayError> {
        self.call("crm.activity.update", json!({"id": id, "fields": fields}))
            .await?;
        Ok(())
    }

    async fn delete_activity(&self, id: i64) -> Result<bool, GatewayError> {
        let payload = self.call("crm.activity.delete", json!({"id": id})).await?;
        Ok(payload.get("result").is_some_and(|v| !v.is_null()))
    }

    async fn list_entities(
        &self,
        method: &str,
        contact_id: Option<i64>,
    ) -> Result<Vec<EntityRef>, GatewayError> {
        let mut params = json!({"select": ["ID", "TITLE"]});
        if let Some(contact_id) = contact_id {
            params["filter"] = json!({"CONTACT_ID": contact_id});
        }
        let rows = self.fetch_all(method, params).await?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row).map_err(|e| GatewayError::Decode(e.to_string()))
            })
            .collect()
    }

    async fn get_entity(&self, method: &str, id: i64) -> Result<Option<EntityRef>, GatewayError> {
        let payload = self.call(method, json!({"id": id})).await?;
        match payload.get("result") {
            Some(result) if result.is_object() => serde_json::from_value(result.clone())
                .map(Some)
                .map_err(|e| GatewayError::Decode(e.to_string())),
            _ => Ok(None),
        }
    }

    async fn add_entity(
        &self,
        method: &str,
        title: &str,
        contact_id: Option<i64>,
    ) -> Result<Option<i64>, GatewayError> {
        let mut fields = json!({"TITLE": title, "SOURCE_ID": LEAD_SOURCE_EMAIL});
        if let Some(contact_id) = contact_id {
            fields["CONTACT_ID"] = json!(contact_id);
        }
        let payload = self.call(method, json!({"fields": fields})).await?;
        Ok(payload.get("result").and_then(value_as_id))
    }

    async fn list_contacts_by_email(&self, email: &str) -> Result<Vec<Contact>, GatewayError> {
        let rows = self
            .fetch_all(
                "crm.contact.list",
                json!({
                    "filter": {"EMAIL": email},
                    "select": ["ID", "NAME", "LAST_NAME", "EMAIL"],
                }),
            )
            .await?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row).map_err(|e| GatewayError::Decode(e.to_string()))
            })
            .collect()
    }
}

fn value_as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// In-process fake CRM for tests and local development. A configurable
/// visibility lag makes newly created entities invisible for the first N
/// reads, mimicking the remote store's eventual consistency; a counter of
/// mutating calls lets tests assert idempotency.
pub struct MemoryCrm {
    visibility_lag: u32,
    mutations: AtomicU64,
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    activities: HashMap<i64, Activity>,
    leads: HashMap<i64, StoredEntity>,
    deals: HashMap<i64, StoredEntity>,
    contacts: Vec<Contact>,
}

#[derive(Debug, Clone)]
struct StoredEntity {
    title: String,
    contact_id: Option<i64>,
    pending_reads: u32,
}

impl MemoryState {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn entities(&self, kind: EntityKind) -> &HashMap<i64, StoredEntity> {
        match kind {
            EntityKind::Lead => &self.leads,
            EntityKind::Deal => &self.deals,
        }
    }

    fn entities_mut(&mut self, kind: EntityKind) -> &mut HashMap<i64, StoredEntity> {
        match kind {
            EntityKind::Lead => &mut self.leads,
            EntityKind::Deal => &mut self.deals,
        }
    }
}

impl MemoryCrm {
    pub fn new(visibility_lag: u32) -> Self {
        Self {
            visibility_lag,
            mutations: AtomicU64::new(0),
            state: Mutex::new(MemoryState {
                // Fixture ids in tests stay below the allocator range.
                next_id: 1000,
                ..MemoryState::default()
            }),
        }
    }

    /// Number of mutating calls (adds, updates, deletes) seen so far.
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    async fn get_activity(&self, id: i64) -> Result<Option<Activity>, GatewayError> {
        Ok(self.state.lock().await.activities.get(&id).cloned())
    }

    async fn add_activity(&self, fields: &NewActivity) -> Result<i64, GatewayError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let id = state.alloc_id();
        let activity = Activity {
            id,
            owner_type_id: Some(fields.owner_type_id),
            owner_id: Some(fields.owner_id),
            type_id: fields.type_id,
            subject: fields.subject.clone(),
            description: fields.description.clone(),
            description_type: fields.description_type,
            settings: fields.settings.clone(),
            completed: Some(fields.completed.clone()),
            created: Some(fields.created.clone()),
            start_time: fields.start_time.clone(),
            end_time: fields.end_time.clone(),
            priority: fields.priority,
            direction: fields.direction,
            location: fields.location.clone(),
            author_id: fields.author_id,
            responsible_id: fields.responsible_id,
        };
        state.activities.insert(id, activity);
        Ok(id)
    }

    async fn update_activity(&self, id: i64, fields: &Value) -> Result<(), GatewayError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let activity = state
            .activities
            .get_mut(&id)
            .ok_or(GatewayError::Http(400))?;
        if let Some(code) = fields.get("OWNER_TYPE_ID").and_then(value_as_id) {
            activity.owner_type_id = Some(code);
        }
        if let Some(owner_id) = fields.get("OWNER_ID").and_then(value_as_id) {
            activity.owner_id = Some(owner_id);
        }
        if let Some(subject) = fields.get("SUBJECT").and_then(Value::as_str) {
            activity.subject = subject.to_string();
        }
        if let Some(completed) = fields.get("COMPLETED").and_then(Value::as_str) {
            activity.completed = Some(completed.to_string());
        }
        Ok(())
    }

    async fn delete_activity(&self, id: i64) -> Result<bool, GatewayError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().await.activities.remove(&id).is_some())
    }

    async fn list_entities(
        &self,
        kind: EntityKind,
        contact_id: Option<i64>,
    ) -> Result<Vec<EntityRef>, GatewayError> {
        let state = self.state.lock().await;
        let mut items: Vec<EntityRef> = state
            .entities(kind)
            .iter()
            .filter(|(_, entity)| entity.pending_reads == 0)
            .filter(|(_, entity)| contact_id.is_none() || entity.contact_id == contact_id)
            .map(|(id, entity)| EntityRef {
                id: *id,
                title: entity.title.clone(),
            })
            .collect();
        items.sort_by_key(|entity| entity.id);
        Ok(items)
    }

    async fn get_entity(
        &self,
        kind: EntityKind,
        id: i64,
    ) -> Result<Option<EntityRef>, GatewayError> {
        let mut state = self.state.lock().await;
        match state.entities_mut(kind).get_mut(&id) {
            Some(entity) if entity.pending_reads > 0 => {
                entity.pending_reads -= 1;
                Ok(None)
            }
            Some(entity) => Ok(Some(EntityRef {
                id,
                title: entity.title.clone(),
            })),
            None => Ok(None),
        }
    }

    async fn add_entity(
        &self,
        kind: EntityKind,
        title: &str,
        contact_id: Option<i64>,
    ) -> Result<Option<i64>, GatewayError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let id = state.alloc_id();
        let entity = StoredEntity {
            title: title.to_string(),
            contact_id,
            pending_reads: self.visibility_lag,
        };
        state.entities_mut(kind).insert(id, entity);
        Ok(Some(id))
    }

    async fn list_contacts_by_email(&self, email: &str) -> Result<Vec<Contact>, GatewayError> {
        let state = self.state.lock().await;
        Ok(state
            .contacts
            .iter()
            .filter(|contact| contact.email.as_deref() == Some(email))
            .cloned()
            .collect())
    }

    // Fixture seeding; none of these count as mutating calls.

    pub async fn seed_activity(&self, activity: Activity) {
        self.state
            .lock()
            .await
            .activities
            .insert(activity.id, activity);
    }

    pub async fn seed_lead(&self, title: &str) -> i64 {
        self.seed_entity(EntityKind::Lead, title, None).await
    }

    pub async fn seed_deal(&self, title: &str) -> i64 {
        self.seed_entity(EntityKind::Deal, title, None).await
    }

    pub async fn seed_lead_for_contact(&self, title: &str, contact_id: i64) -> i64 {
        self.seed_entity(EntityKind::Lead, title, Some(contact_id))
            .await
    }

    pub async fn seed_deal_for_contact(&self, title: &str, contact_id: i64) -> i64 {
        self.seed_entity(EntityKind::Deal, title, Some(contact_id))
            .await
    }

    async fn seed_entity(&self, kind: EntityKind, title: &str, contact_id: Option<i64>) -> i64 {
        let mut state = self.state.lock().await;
        let id = state.alloc_id();
        state.entities_mut(kind).insert(
            id,
            StoredEntity {
                title: title.to_string(),
                contact_id,
                pending_reads: 0,
            },
        );
        id
    }

    pub async fn seed_contact(&self, id: i64, email: &str) {
        self.state.lock().await.contacts.push(Contact {
            id,
            name: None,
            last_name: None,
            email: Some(email.to_string()),
        });
    }

    /// Visible leads, sorted by id.
    pub async fn leads(&self) -> Vec<EntityRef> {
        self.list_entities(EntityKind::Lead, None)
            .await
            .unwrap_or_default()
    }

    pub async fn find_lead_by_title(&self, title: &str) -> Option<i64> {
        self.leads()
            .await
            .into_iter()
            .find(|lead| lead.title == title)
            .map(|lead| lead.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn nanos() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos()
    }

    fn email_activity(id: i64, subject: &str) -> Activity {
        Activity {
            id,
            type_id: Some(EMAIL_ACTIVITY_TYPE),
            subject: subject.to_string(),
            settings: Some(json!({"EMAIL_META": {"from": "Jane <jane@example.com>"}})),
            ..Activity::default()
        }
    }

    #[tokio::test]
    async fn cache_serves_fresh_snapshot_without_refetch() {
        let cache = EntityCache::new(Duration::from_secs(300));
        let calls = Arc::new(AtomicU32::new(0));

        let c1 = Arc::clone(&calls);
        let first = cache
            .get_all(EntityKind::Lead, move || async move {
                c1.fetch_add(1, Ordering::SeqCst);
                Ok(vec![EntityRef {
                    id: 1,
                    title: "a".to_string(),
                }])
            })
            .await
            .unwrap();

        let c2 = Arc::clone(&calls);
        let second = cache
            .get_all(EntityKind::Lead, move || async move {
                c2.fetch_add(1, Ordering::SeqCst);
                Ok(vec![EntityRef {
                    id: 2,
                    title: "b".to_string(),
                }])
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cache_refetches_and_replaces_after_expiry() {
        let cache = EntityCache::new(Duration::from_millis(40));
        let calls = Arc::new(AtomicU32::new(0));

        let c1 = Arc::clone(&calls);
        cache
            .get_all(EntityKind::Deal, move || async move {
                c1.fetch_add(1, Ordering::SeqCst);
                Ok(vec![EntityRef {
                    id: 1,
                    title: "old".to_string(),
                }])
            })
            .await
            .unwrap();

        sleep(Duration::from_millis(60)).await;

        let c2 = Arc::clone(&calls);
        let refreshed = cache
            .get_all(EntityKind::Deal, move || async move {
                c2.fetch_add(1, Ordering::SeqCst);
                Ok(vec![EntityRef {
                    id: 2,
                    title: "new".to_string(),
                }])
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshed[0].title, "new");
    }

    #[tokio::test]
    async fn cache_keys_kinds_independently() {
        let cache = EntityCache::new(Duration::from_secs(300));
        let calls = Arc::new(AtomicU32::new(0));
        for kind in [EntityKind::Lead, EntityKind::Deal] {
            let c = Arc::clone(&calls);
            cache
                .get_all(kind, move || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn poller_returns_after_third_visible_poll() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = Arc::clone(&polls);
        let result = create_and_wait(
            || async { Ok(Some(7)) },
            move |_id| {
                let p = Arc::clone(&p);
                async move { Ok(p.fetch_add(1, Ordering::SeqCst) + 1 >= 3) }
            },
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(result, Some(7));
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poller_gives_up_after_attempt_budget() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = Arc::clone(&polls);
        let result = create_and_wait(
            || async { Ok(Some(7)) },
            move |_id| {
                let p = Arc::clone(&p);
                async move {
                    p.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            },
            Duration::from_millis(40),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(result, None);
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn poller_fails_fast_when_create_returns_no_id() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = Arc::clone(&polls);
        let result = create_and_wait(
            || async { Ok(None) },
            move |_id| {
                let p = Arc::clone(&p);
                async move {
                    p.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                }
            },
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(result, None);
        assert_eq!(polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn poller_counts_errored_polls_against_the_budget() {
        let polls = Arc::new(AtomicU32::new(0));
        let p = Arc::clone(&polls);
        let result = create_and_wait(
            || async { Ok(Some(7)) },
            move |_id| {
                let p = Arc::clone(&p);
                async move {
                    p.fetch_add(1, Ordering::SeqCst);
                    Err(GatewayError::Http(500))
                }
            },
            Duration::from_millis(40),
            Duration::from_millis(20),
        )
        .await;
        assert_eq!(result, None);
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gate_second_acquisition_is_busy_with_zero_wait() {
        let gate = RequestGate::new(None);
        let key = format!("gate-busy-{}", nanos());

        let guard = gate
            .acquire(&key, Duration::ZERO)
            .await
            .expect("first acquisition");
        let second = gate.acquire(&key, Duration::ZERO).await;
        assert!(matches!(second, Err(GateError::Busy)));

        drop(guard);
        let third = gate.acquire(&key, Duration::ZERO).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn gate_release_is_idempotent() {
        let gate = RequestGate::new(None);
        let key = format!("gate-release-{}", nanos());

        let mut guard = gate.acquire(&key, Duration::ZERO).await.unwrap();
        guard.release();
        guard.release();
        drop(guard);

        assert!(gate.acquire(&key, Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn gate_waits_for_release_within_timeout() {
        let gate = RequestGate::new(None);
        let key = format!("gate-wait-{}", nanos());

        let guard = gate.acquire(&key, Duration::ZERO).await.unwrap();
        let holder = tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            drop(guard);
        });

        let second = gate.acquire(&key, Duration::from_secs(5)).await;
        assert!(second.is_ok());
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn gate_fails_immediately_when_marker_unopenable() {
        let gate = RequestGate::new(Some("/nonexistent-mailroom-lock-dir/locks"));
        let result = gate.acquire("any-key", Duration::from_secs(30)).await;
        assert!(matches!(result, Err(GateError::Io(_))));
    }

    #[tokio::test]
    async fn clone_carries_fields_and_resets_completion() {
        let gateway = CrmGateway::Memory(MemoryCrm::new(0));
        let memory = gateway.as_memory().unwrap();
        memory
            .seed_activity(Activity {
                description: Some("quote attached".to_string()),
                completed: Some("Y".to_string()),
                priority: Some(2),
                direction: Some(1),
                author_id: Some(5),
                ..email_activity(41, "Quote")
            })
            .await;
        let lead_id = memory.seed_lead("Quote").await;

        let new_id = clone_activity(&gateway, 41, EntityKind::Lead, lead_id)
            .await
            .unwrap();
        let cloned = gateway.get_activity(new_id).await.unwrap().unwrap();

        assert_eq!(cloned.owner_kind(), Some(EntityKind::Lead));
        assert_eq!(cloned.owner_id, Some(lead_id));
        assert_eq!(cloned.subject, "Quote");
        assert_eq!(cloned.description.as_deref(), Some("quote attached"));
        assert_eq!(cloned.completed.as_deref(), Some("N"));
        assert_eq!(cloned.priority, Some(2));
        assert_eq!(cloned.author_id, Some(5));
        assert!(cloned.created.is_some());

        // Cloning alone leaves the source in place; deletion is separate.
        assert!(gateway.get_activity(41).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clone_of_missing_activity_is_not_found() {
        let gateway = CrmGateway::Memory(MemoryCrm::new(0));
        let result = clone_activity(&gateway, 999, EntityKind::Lead, 1).await;
        assert!(matches!(result, Err(MigrateError::NotFound)));
    }

    #[tokio::test]
    async fn rebind_updates_owner_in_place() {
        let gateway = CrmGateway::Memory(MemoryCrm::new(0));
        let memory = gateway.as_memory().unwrap();
        memory
            .seed_activity(Activity {
                owner_type_id: Some(1),
                owner_id: Some(3),
                completed: Some("Y".to_string()),
                ..email_activity(55, "Old subject")
            })
            .await;

        rebind_activity(&gateway, 55, EntityKind::Deal, 9, "New subject")
            .await
            .unwrap();

        let updated = gateway.get_activity(55).await.unwrap().unwrap();
        assert_eq!(updated.owner_kind(), Some(EntityKind::Deal));
        assert_eq!(updated.owner_id, Some(9));
        assert_eq!(updated.subject, "New subject");
        assert_eq!(updated.completed.as_deref(), Some("N"));
    }

    #[tokio::test]
    async fn memory_gateway_hides_new_entities_for_lagged_reads() {
        let gateway = CrmGateway::Memory(MemoryCrm::new(2));
        let id = gateway.add_lead("Fresh", None).await.unwrap().unwrap();

        assert!(gateway.get_lead(id).await.unwrap().is_none());
        assert!(gateway.list_leads().await.unwrap().is_empty());
        assert!(gateway.get_lead(id).await.unwrap().is_none());
        assert!(gateway.get_lead(id).await.unwrap().is_some());
        assert_eq!(gateway.list_leads().await.unwrap().len(), 1);
    }
}
