//! Lazy loading of email previews for confirmation steps.
//!
//! When a snapshot asks for an email confirmation but the workflow payload did
//! not embed the draft, the hydrator fetches it on its own task. The poll loop
//! never waits on it and its failures never reach sync state.

use crate::errors::TransportError;
use crate::interaction::Interaction;
use crate::model::EmailDetails;
use crate::sync_engine::SyncSnapshot;
use crate::transport::WorkflowTransport;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

/// Cached state of one step's email preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailHydration {
    Loading,
    Ready(EmailDetails),
    Failed(String),
}

pub struct EmailHydrator {
    inner: Arc<Inner>,
    task: JoinHandle<()>,
}

struct Inner {
    transport: Arc<dyn WorkflowTransport>,
    previews: Mutex<HashMap<String, EmailHydration>>,
    bodies: Mutex<HashMap<String, String>>,
    /// Outstanding preview fetches, aborted with the hydrator.
    fetches: Mutex<JoinSet<()>>,
    /// Bumped whenever a cache entry changes.
    version: watch::Sender<u64>,
}

impl EmailHydrator {
    /// Starts watching `snapshots`. Must be called inside a tokio runtime.
    pub fn spawn(
        transport: Arc<dyn WorkflowTransport>,
        mut snapshots: watch::Receiver<SyncSnapshot>,
    ) -> Self {
        let (version, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            transport,
            previews: Mutex::new(HashMap::new()),
            bodies: Mutex::new(HashMap::new()),
            fetches: Mutex::new(JoinSet::new()),
            version,
        });

        let task_inner = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            loop {
                let pending = match &snapshots.borrow_and_update().interaction {
                    Interaction::NeedsEmailConfirmation {
                        step_id,
                        email_details: None,
                        ..
                    } => Some(step_id.clone()),
                    _ => None,
                };
                if let Some(step_id) = pending {
                    task_inner.request(&step_id);
                }
                if snapshots.changed().await.is_err() {
                    break;
                }
            }
        });

        Self { inner, task }
    }

    pub fn details(&self, step_id: &str) -> Option<EmailHydration> {
        self.inner.previews().get(step_id).cloned()
    }

    /// Email to show for `interaction`: embedded details win, then a loaded
    /// preview. A fetched full body replaces the truncated preview body.
    pub fn email_for(&self, interaction: &Interaction) -> Option<EmailDetails> {
        let Interaction::NeedsEmailConfirmation {
            step_id,
            email_details,
            ..
        } = interaction
        else {
            return None;
        };

        let mut email = match email_details {
            Some(details) => details.clone(),
            None => match self.details(step_id)? {
                EmailHydration::Ready(details) => details,
                EmailHydration::Loading | EmailHydration::Failed(_) => return None,
            },
        };
        if let Some(body) = self.inner.bodies().get(step_id.as_str()) {
            email.body = body.clone();
            email.body_truncated = false;
        }
        Some(email)
    }

    /// Untruncated body of the email on `step_id`, fetched once and cached.
    pub async fn full_body(&self, step_id: &str) -> Result<String, TransportError> {
        let cached = self.inner.bodies().get(step_id).cloned();
        if let Some(body) = cached {
            return Ok(body);
        }
        let body = self.inner.transport.get_step_email_body(step_id).await?;
        self.inner
            .bodies()
            .insert(step_id.to_string(), body.clone());
        self.inner.bump();
        Ok(body)
    }

    /// Drops a cached preview and fetches it again.
    pub fn retry(&self, step_id: &str) {
        self.inner.previews().remove(step_id);
        self.inner.request(step_id);
    }

    /// Receiver that changes whenever a preview or body is loaded.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }
}

impl Drop for EmailHydrator {
    fn drop(&mut self) {
        self.task.abort();
        self.inner.fetches().abort_all();
    }
}

impl Inner {
    fn previews(&self) -> MutexGuard<'_, HashMap<String, EmailHydration>> {
        self.previews.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bodies(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.bodies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fetches(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.fetches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Starts a fetch unless the step already has a cache entry. Failed
    /// entries stay failed until `retry`.
    fn request(self: &Arc<Self>, step_id: &str) {
        {
            let mut previews = self.previews();
            if previews.contains_key(step_id) {
                return;
            }
            previews.insert(step_id.to_string(), EmailHydration::Loading);
        }
        self.bump();

        let inner = Arc::clone(self);
        let step_id = step_id.to_string();
        let mut fetches = self.fetches();
        while fetches.try_join_next().is_some() {}
        fetches.spawn(async move {
            let entry = match inner.transport.get_step_email(&step_id).await {
                Ok(details) => {
                    tracing::debug!(step_id = %step_id, "email preview loaded");
                    EmailHydration::Ready(details)
                }
                Err(error) => {
                    tracing::warn!(step_id = %step_id, error = %error, "failed to load email preview");
                    EmailHydration::Failed(error.to_string())
                }
            };
            inner.previews().insert(step_id, entry);
            inner.bump();
        });
    }
}

#[cfg(test)]
#[path = "tests/hydration_tests.rs"]
mod tests;
