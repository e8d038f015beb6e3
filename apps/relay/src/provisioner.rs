//! Keeps one usable remote assistant per deployment.
//!
//! The identifier lives in the config store under [`AssistantSpec::record_key`]. Provisioning
//! verifies a stored id against the upstream and replaces it when verification fails; the
//! resolved id is cached for the life of the process and only changes through another
//! provisioning call.

use std::sync::Arc;

use assistants_client::{
    AssistantsApi, AssistantsError, CODE_INTERPRETER_TOOL, CreateAssistantRequest, RetryPolicy,
    ToolSpec,
};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config_store::{ConfigStore, ConfigStoreError};

const LOG_TARGET: &str = "interpreter_relay::provisioner";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantSpec {
    pub record_key: String,
    pub name: String,
    pub model: String,
    pub instructions: String,
}

impl AssistantSpec {
    fn create_request(&self) -> CreateAssistantRequest {
        CreateAssistantRequest {
            name: self.name.clone(),
            instructions: self.instructions.clone(),
            model: self.model.clone(),
            tools: vec![ToolSpec::code_interpreter()],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
    /// Stored id verified and reused.
    Reused,
    /// Nothing was stored; a new assistant was created.
    Created,
    /// A stored id was overwritten by a newly created assistant.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Provisioned {
    pub assistant_id: String,
    pub outcome: ProvisionOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantCheck {
    pub record_key: String,
    pub stored_id: Option<String>,
    pub resolves: bool,
    pub name: Option<String>,
    pub model: Option<String>,
    pub tools: Vec<String>,
    pub code_interpreter_enabled: bool,
    pub model_matches: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("config store error: {0}")]
    Store(#[from] ConfigStoreError),
    #[error("assistant creation failed: {0}")]
    Create(#[source] AssistantsError),
    #[error("upstream returned an assistant without an id")]
    EmptyId,
}

pub struct AssistantProvisioner {
    api: Arc<dyn AssistantsApi>,
    store: Arc<dyn ConfigStore>,
    spec: AssistantSpec,
    retry: RetryPolicy,
    current: RwLock<Option<String>>,
}

impl AssistantProvisioner {
    pub fn new(
        api: Arc<dyn AssistantsApi>,
        store: Arc<dyn ConfigStore>,
        spec: AssistantSpec,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api,
            store,
            spec,
            retry,
            current: RwLock::new(None),
        }
    }

    /// Cached assistant id, `None` until provisioning has succeeded.
    pub async fn current(&self) -> Option<String> {
        self.current.read().await.clone()
    }

    pub async fn provision(&self) -> Result<Provisioned, ProvisionError> {
        let Some(stored_id) = self.stored_id().await? else {
            tracing::info!(
                target: LOG_TARGET,
                record_key = %self.spec.record_key,
                "no stored assistant id; creating assistant",
            );
            let assistant_id = self.create_and_persist().await?;
            return Ok(Provisioned {
                assistant_id,
                outcome: ProvisionOutcome::Created,
            });
        };

        let api = &self.api;
        let id = stored_id.as_str();
        let verified = self
            .retry
            .run("retrieve_assistant", move || api.retrieve_assistant(id))
            .await;

        match verified {
            Ok(assistant) => {
                if !assistant.has_tool(CODE_INTERPRETER_TOOL) {
                    tracing::warn!(
                        target: LOG_TARGET,
                        assistant_id = %assistant.id,
                        "stored assistant has no code_interpreter tool enabled",
                    );
                }
                tracing::info!(
                    target: LOG_TARGET,
                    assistant_id = %stored_id,
                    model = %assistant.model,
                    "reusing stored assistant",
                );
                self.set_current(stored_id.clone()).await;
                Ok(Provisioned {
                    assistant_id: stored_id,
                    outcome: ProvisionOutcome::Reused,
                })
            }
            Err(error) => {
                tracing::warn!(
                    target: LOG_TARGET,
                    assistant_id = %stored_id,
                    error = %error,
                    "stored assistant failed verification; creating replacement",
                );
                let assistant_id = self.create_and_persist().await?;
                Ok(Provisioned {
                    assistant_id,
                    outcome: ProvisionOutcome::Replaced,
                })
            }
        }
    }

    /// Creates a fresh assistant regardless of what is stored and overwrites the record.
    pub async fn recreate(&self) -> Result<Provisioned, ProvisionError> {
        let previous = self.stored_id().await?;
        let assistant_id = self.create_and_persist().await?;
        tracing::info!(
            target: LOG_TARGET,
            assistant_id = %assistant_id,
            previous_id = previous.as_deref().unwrap_or("<none>"),
            "assistant recreated",
        );
        Ok(Provisioned {
            assistant_id,
            outcome: if previous.is_some() {
                ProvisionOutcome::Replaced
            } else {
                ProvisionOutcome::Created
            },
        })
    }

    /// Reports on the stored assistant without changing anything.
    pub async fn check(&self) -> Result<AssistantCheck, ProvisionError> {
        let stored_id = self.stored_id().await?;
        let mut report = AssistantCheck {
            record_key: self.spec.record_key.clone(),
            stored_id: stored_id.clone(),
            resolves: false,
            name: None,
            model: None,
            tools: Vec::new(),
            code_interpreter_enabled: false,
            model_matches: false,
            error: None,
        };
        let Some(stored_id) = stored_id else {
            return Ok(report);
        };

        let api = &self.api;
        let id = stored_id.as_str();
        match self
            .retry
            .run("retrieve_assistant", move || api.retrieve_assistant(id))
            .await
        {
            Ok(assistant) => {
                report.resolves = true;
                report.code_interpreter_enabled = assistant.has_tool(CODE_INTERPRETER_TOOL);
                report.model_matches = assistant.model == self.spec.model;
                report.tools = assistant.tools.into_iter().map(|tool| tool.kind).collect();
                report.name = assistant.name;
                report.model = Some(assistant.model);
            }
            Err(error) => report.error = Some(error.to_string()),
        }
        Ok(report)
    }

    async fn stored_id(&self) -> Result<Option<String>, ProvisionError> {
        let stored = self.store.get(&self.spec.record_key).await?;
        Ok(stored
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }

    async fn create_and_persist(&self) -> Result<String, ProvisionError> {
        let api = &self.api;
        let request = &self.spec.create_request();
        let assistant = self
            .retry
            .run("create_assistant", move || api.create_assistant(request))
            .await
            .map_err(ProvisionError::Create)?;

        let assistant_id = assistant.id.trim().to_string();
        if assistant_id.is_empty() {
            return Err(ProvisionError::EmptyId);
        }

        self.store
            .set(&self.spec.record_key, assistant_id.as_str())
            .await?;
        self.set_current(assistant_id.clone()).await;
        tracing::info!(
            target: LOG_TARGET,
            assistant_id = %assistant_id,
            model = %self.spec.model,
            "assistant created and persisted",
        );
        Ok(assistant_id)
    }

    async fn set_current(&self, assistant_id: String) {
        *self.current.write().await = Some(assistant_id);
    }
}
