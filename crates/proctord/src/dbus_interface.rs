use std::sync::Arc;

use proctor_core::MovementReport;
use zbus::interface;

use crate::config::Config;
use crate::engine::{respond, EngineHandle};
use crate::store::SqliteIdentityStore;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: SqliteIdentityStore,
}

/// D-Bus interface for the proctoring daemon.
///
/// Bus name: org.proctor.Proctor1
/// Object path: /org/proctor/Proctor1
///
/// Image arguments are base64 strings. Every method answers with a JSON
/// verdict; request failures are verdicts with `success: false`, never
/// D-Bus errors.
pub struct ProctorService {
    pub state: Arc<AppState>,
}

/// Retrieve the UID of the D-Bus peer identified by `sender_str` (a unique bus name).
async fn get_caller_uid(sender_str: &str, conn: &zbus::Connection) -> zbus::fdo::Result<u32> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    let bus_name = zbus::names::BusName::try_from(sender_str)
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.proctor.Proctor1")]
impl ProctorService {
    /// Register or re-register a user's reference face.
    async fn register(&self, user_id: &str, name: &str, image: &str) -> String {
        tracing::info!(user_id, "register requested");
        respond(
            "register",
            self.state.engine.register(user_id, name, image).await,
        )
    }

    /// Identify the face in `image`. An empty `user_id` searches all
    /// registrations; otherwise the best match must belong to that user.
    async fn verify(&self, image: &str, user_id: &str) -> String {
        tracing::debug!(user_id, "verify requested");
        respond("verify", self.state.engine.verify(image, user_id).await)
    }

    /// Check that the person in front of the camera is still `user_id`.
    async fn monitor_identity(&self, user_id: &str, image: &str) -> String {
        respond(
            "monitor_identity",
            self.state.engine.monitor_identity(user_id, image).await,
        )
    }

    /// Score the next frame of a monitoring session for head movement.
    async fn detect_movement(&self, session_id: &str, image: &str) -> String {
        respond::<MovementReport>(
            "detect_movement",
            self.state.engine.detect_movement(session_id, image).await,
        )
    }

    /// Count faces in an image. Needs a face analyzer.
    async fn check_faces(&self, image: &str) -> String {
        respond("check_faces", self.state.engine.check_faces(image).await)
    }

    /// Forget a monitoring session.
    async fn end_session(&self, session_id: &str) -> bool {
        let ended = self.state.engine.end_session(session_id);
        tracing::info!(session_id, ended, "end_session requested");
        ended
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = &self.state;
        let faces_registered = state.store.count().await.map_err(|e| {
            tracing::error!(error = %e, "status: store count failed");
            zbus::fdo::Error::Failed(e.to_string())
        })?;
        let service = state.engine.service();
        let monitor = state.engine.monitor();

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "comparator": service.engine().name(),
            "full_feature": service.has_analyzer(),
            "faces_registered": faces_registered,
            "sessions_tracked": monitor.sessions().len(),
            "identity_check": service.config().identity_check.to_string(),
            "verify_threshold": service.config().threshold,
            "monitor_threshold": service.config().monitor_threshold,
            "movement_threshold": monitor.config().threshold,
        })
        .to_string())
    }

    /// Delete a user's face record.
    ///
    /// On the system bus only root may remove records; on the session bus
    /// (development mode) the caller is not checked.
    async fn remove_face(
        &self,
        user_id: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(user_id, "remove_face requested");

        if !self.state.config.session_bus {
            let sender = header
                .sender()
                .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
            let caller_uid = get_caller_uid(sender.as_str(), conn).await?;
            if caller_uid != 0 {
                tracing::warn!(user_id, caller_uid, "remove_face: caller is not root");
                return Err(zbus::fdo::Error::AccessDenied(
                    "only root may remove face records".to_string(),
                ));
            }
        }

        let removed = self.state.store.remove(user_id).await.map_err(|e| {
            tracing::error!(error = %e, "remove_face failed");
            zbus::fdo::Error::Failed(e.to_string())
        })?;
        if removed {
            tracing::info!(user_id, "face record removed");
        } else {
            tracing::warn!(user_id, "face record not found");
        }
        Ok(removed)
    }
}
