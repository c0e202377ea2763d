use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{info, warn};

use crate::common::Error;
use crate::filter::DomainFilter;
use crate::registry::Registry;
use crate::store::UserStore;

use super::models::{
    AddUserRequest, CallReply, CiphersResponse, FilterSourcesRequest, ModifyRequest,
    TrafficReply, UserTraffic, PARAMS_ERROR, USER_EXISTS, USER_NOT_FOUND,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub store: Arc<UserStore>,
    pub filter: Arc<DomainFilter>,
}

fn reply_for(err: &Error) -> CallReply {
    match err {
        Error::UserExists(_) => CallReply::err(USER_EXISTS, err.to_string()),
        Error::UserNotFound(_) => CallReply::err(USER_NOT_FOUND, err.to_string()),
        _ => CallReply::err(PARAMS_ERROR, err.to_string()),
    }
}

pub async fn add_user(
    State(state): State<AppState>,
    Json(req): Json<AddUserRequest>,
) -> Json<CallReply> {
    if state.registry.exists(&req.name).await {
        return Json(CallReply::err(USER_EXISTS, "user already exists"));
    }
    if let Err(e) = state
        .store
        .put_config(&req.name, &req.cipher, &req.password, req.port)
    {
        warn!(user = req.name.as_str(), error = %e, "store write failed");
    }
    match state
        .registry
        .add(&req.name, &req.cipher, &req.password, req.port)
        .await
    {
        Ok(_) => {
            info!(user = req.name.as_str(), "user added");
            Json(CallReply::ok())
        }
        Err(e) => {
            // Roll the persisted config back; the add never happened.
            if let Err(e) = state.store.delete(&req.name) {
                warn!(user = req.name.as_str(), error = %e, "store rollback failed");
            }
            Json(reply_for(&e))
        }
    }
}

pub async fn start_user(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<CallReply> {
    match start_from_store(&state, &name).await {
        Ok(()) => {
            info!(user = name.as_str(), "user started");
            Json(CallReply::ok())
        }
        Err(e) => Json(reply_for(&e)),
    }
}

/// Start one persisted user. A record that cannot start is dirty data and is
/// removed, except when the user is simply running already.
pub(crate) async fn start_from_store(state: &AppState, name: &str) -> Result<(), Error> {
    let Some(record) = state.store.get(name) else {
        return Err(Error::UserNotFound(name.to_string()));
    };
    match state
        .registry
        .add(name, &record.cipher, &record.password, record.port)
        .await
    {
        Ok(tenant) => {
            tenant.set_counters(record.traffic, record.time);
            Ok(())
        }
        Err(e @ Error::UserExists(_)) => Err(e),
        Err(e) => {
            if let Err(del) = state.store.delete(name) {
                warn!(user = name, error = %del, "store delete failed");
            }
            Err(e)
        }
    }
}

pub async fn stop_user(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<CallReply> {
    let Some(tenant) = state.registry.get(&name).await else {
        return Json(CallReply::err(USER_NOT_FOUND, "user doesn't exist"));
    };
    let (traffic, time) = tenant.counters();
    if let Err(e) = state.store.put_counters(&name, traffic, time) {
        warn!(user = name.as_str(), error = %e, "counter persist failed");
    }
    match state.registry.delete(&name).await {
        Ok(()) => {
            info!(user = name.as_str(), "user stopped");
            Json(CallReply::ok())
        }
        Err(e) => Json(reply_for(&e)),
    }
}

pub async fn delete_user(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Json<CallReply> {
    if !state.registry.exists(&name).await {
        return Json(CallReply::err(USER_NOT_FOUND, "user doesn't exist"));
    }
    if let Err(e) = state.store.delete(&name) {
        warn!(user = name.as_str(), error = %e, "store delete failed");
    }
    match state.registry.delete(&name).await {
        Ok(()) => {
            info!(user = name.as_str(), "user deleted");
            Json(CallReply::ok())
        }
        Err(e) => Json(reply_for(&e)),
    }
}

pub async fn modify_user(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<ModifyRequest>,
) -> Json<CallReply> {
    match state
        .registry
        .modify(&name, req.cipher.as_deref(), req.password.as_deref())
        .await
    {
        Ok(tenant) => {
            if let Err(e) = state.store.put_config(
                &name,
                tenant.cipher_name(),
                tenant.password(),
                tenant.port(),
            ) {
                warn!(user = name.as_str(), error = %e, "store write failed");
            }
            Json(CallReply::ok())
        }
        Err(e) => Json(reply_for(&e)),
    }
}

pub async fn get_user(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.registry.get(&name).await {
        Some(tenant) => {
            let (traffic, time) = tenant.counters();
            let mut reply = TrafficReply::new();
            reply.insert(name, UserTraffic { traffic, time });
            Json(reply).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(CallReply::err(USER_NOT_FOUND, "user doesn't exist")),
        )
            .into_response(),
    }
}

pub async fn get_all_users(State(state): State<AppState>) -> Json<TrafficReply> {
    let reply = state
        .registry
        .snapshot()
        .await
        .into_iter()
        .map(|(name, (traffic, time))| (name, UserTraffic { traffic, time }))
        .collect();
    Json(reply)
}

pub async fn reset_all(State(state): State<AppState>) -> Json<CallReply> {
    state.registry.reset_all().await;
    info!("all counters reset");
    Json(CallReply::ok())
}

pub async fn restore(State(state): State<AppState>) -> Json<CallReply> {
    let report = crate::app::restore_users(&state.registry, &state.store).await;
    info!(
        started = report.started,
        failed = report.failed,
        "restore finished"
    );
    Json(CallReply::ok())
}

pub async fn upgrade_filter(State(state): State<AppState>) -> Json<CallReply> {
    state.filter.upgrade().await;
    info!("domain filter upgraded");
    Json(CallReply::ok())
}

pub async fn add_filter_sources(
    State(state): State<AppState>,
    Json(req): Json<FilterSourcesRequest>,
) -> Json<CallReply> {
    if !req.urls.is_empty() {
        state.filter.add_sources(&req.urls).await;
    }
    Json(CallReply::ok())
}

pub async fn list_ciphers() -> Json<CiphersResponse> {
    Json(CiphersResponse {
        ciphers: crate::crypto::list_ciphers(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IpPolicy;
    use crate::dns::Resolver;
    use crate::proxy::ServerContext;
    use crate::store::UserRecord;

    fn state_with_store(dir: &tempfile::TempDir) -> AppState {
        let filter = Arc::new(DomainFilter::new(Vec::new()));
        let policy = Arc::new(IpPolicy::new());
        let resolver = Arc::new(Resolver::new(filter.clone(), policy.clone()));
        let ctx = Arc::new(ServerContext {
            resolver,
            filter: filter.clone(),
            policy,
            hijack: None,
        });
        AppState {
            registry: Arc::new(Registry::new(ctx)),
            store: Arc::new(UserStore::open(dir.path().join("users.json")).unwrap()),
            filter,
        }
    }

    #[tokio::test]
    async fn add_user_persists_and_starts() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);

        let reply = add_user(
            State(state.clone()),
            Json(AddUserRequest {
                name: "alice".into(),
                cipher: "AES-128-GCM".into(),
                password: "pw".into(),
                port: 0,
            }),
        )
        .await;
        assert_eq!(reply.0.code, super::super::models::NO_ERROR);
        assert!(state.registry.exists("alice").await);
        assert!(state.store.get("alice").is_some());
        state.registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn add_duplicate_user_reports_exists() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);
        state.registry.add("alice", "AES-128-GCM", "pw", 0).await.unwrap();

        let reply = add_user(
            State(state.clone()),
            Json(AddUserRequest {
                name: "alice".into(),
                cipher: "AES-128-GCM".into(),
                password: "pw".into(),
                port: 0,
            }),
        )
        .await;
        assert_eq!(reply.0.code, USER_EXISTS);
        state.registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn add_user_with_bad_cipher_rolls_back_store() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);

        let reply = add_user(
            State(state.clone()),
            Json(AddUserRequest {
                name: "alice".into(),
                cipher: "rc4-md5".into(),
                password: "pw".into(),
                port: 0,
            }),
        )
        .await;
        assert_eq!(reply.0.code, PARAMS_ERROR);
        assert!(state.store.get("alice").is_none());
        assert!(!state.registry.exists("alice").await);
    }

    #[tokio::test]
    async fn stop_persists_counters_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);
        state.store.put_config("alice", "AES-128-GCM", "pw", 0).unwrap();
        let tenant = state.registry.add("alice", "AES-128-GCM", "pw", 0).await.unwrap();
        tenant.add_traffic(500);
        tenant.add_time_ms(9);

        let reply = stop_user(State(state.clone()), Path("alice".into())).await;
        assert_eq!(reply.0.code, super::super::models::NO_ERROR);
        assert!(!state.registry.exists("alice").await);

        let record = state.store.get("alice").unwrap();
        assert_eq!((record.traffic, record.time), (500, 9));
    }

    #[tokio::test]
    async fn stop_unknown_user_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);
        let reply = stop_user(State(state), Path("ghost".into())).await;
        assert_eq!(reply.0.code, USER_NOT_FOUND);
    }

    #[tokio::test]
    async fn start_user_reads_record_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);
        state.store.put_config("alice", "AES-256-GCM", "pw", 0).unwrap();
        state.store.put_counters("alice", 42, 17).unwrap();

        let reply = start_user(State(state.clone()), Path("alice".into())).await;
        assert_eq!(reply.0.code, super::super::models::NO_ERROR);
        let tenant = state.registry.get("alice").await.unwrap();
        assert_eq!(tenant.counters(), (42, 17));
        state.registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn start_user_with_dirty_record_drops_it() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);
        state.store.put_config("alice", "rc4-md5", "pw", 0).unwrap();

        let reply = start_user(State(state.clone()), Path("alice".into())).await;
        assert_eq!(reply.0.code, PARAMS_ERROR);
        assert!(state.store.get("alice").is_none(), "dirty record removed");
    }

    #[tokio::test]
    async fn modify_nothing_reports_params_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);
        state.store.put_config("alice", "AES-128-GCM", "pw", 0).unwrap();
        state.registry.add("alice", "AES-128-GCM", "pw", 0).await.unwrap();

        let reply = modify_user(
            State(state.clone()),
            Path("alice".into()),
            Json(ModifyRequest {
                cipher: None,
                password: None,
            }),
        )
        .await;
        assert_eq!(reply.0.code, PARAMS_ERROR);
        state.registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn modify_updates_store() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);
        state.store.put_config("alice", "AES-128-GCM", "pw", 0).unwrap();
        state.registry.add("alice", "AES-128-GCM", "pw", 0).await.unwrap();

        let reply = modify_user(
            State(state.clone()),
            Path("alice".into()),
            Json(ModifyRequest {
                cipher: None,
                password: Some("newpw".into()),
            }),
        )
        .await;
        assert_eq!(reply.0.code, super::super::models::NO_ERROR);
        let record = state.store.get("alice").unwrap();
        assert_eq!(record.password, "newpw");
        assert_eq!(record.cipher, "AES-128-GCM");
        state.registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn restore_starts_all_and_drops_bad_records() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);
        state.store.put_config("good", "AES-128-GCM", "pw", 0).unwrap();
        state.store.put_counters("good", 42, 17).unwrap();
        state.store.put_config("bad", "rc4-md5", "pw", 0).unwrap();

        let reply = restore(State(state.clone())).await;
        assert_eq!(reply.0.code, super::super::models::NO_ERROR);

        assert!(state.registry.exists("good").await);
        let snap = state.registry.snapshot().await;
        assert_eq!(snap["good"], (42, 17));
        assert!(state.store.get("bad").is_none());
        state.registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn list_ciphers_is_sorted_canonical() {
        let reply = list_ciphers().await;
        assert_eq!(
            reply.0.ciphers,
            vec![
                "AEAD_AES_128_GCM",
                "AEAD_AES_256_GCM",
                "AEAD_CHACHA20_POLY1305"
            ]
        );
    }

    #[tokio::test]
    async fn get_user_reports_counters() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);
        let tenant = state.registry.add("alice", "AES-128-GCM", "pw", 0).await.unwrap();
        tenant.add_traffic(5);

        let _ = get_user(State(state.clone()), Path("alice".into())).await;
        let all = get_all_users(State(state.clone())).await;
        assert_eq!(all.0["alice"].traffic, 5);
        state.registry.shutdown_all().await;
    }

    #[tokio::test]
    async fn restore_skips_running_users() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_store(&dir);
        state.store.put_config("alice", "AES-128-GCM", "pw", 0).unwrap();
        state.registry.add("alice", "AES-128-GCM", "pw", 0).await.unwrap();

        let _ = restore(State(state.clone())).await;
        // The running user keeps its record even though add would have failed.
        let record: Option<UserRecord> = state.store.get("alice");
        assert!(record.is_some());
        state.registry.shutdown_all().await;
    }
}
