//! Telephony workflow resolution.
//!
//! Maps a called number plus the SIP account that received it onto a
//! conversational workflow: which definition runs, which voice settings
//! apply, and how the call is answered. Pure and read-only over the
//! [`WorkflowStore`] interface; persistence lives with the collaborator
//! providing the store.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Workflow resolution failures; the invite runtime answers 404 on all of
/// them.
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("no telephony route for number {0:?}")]
    NoRoute(String),

    #[error("no workflow bound to SIP account {0}")]
    NoAccountWorkflow(i64),

    #[error("workflow {0:?} referenced by route is missing")]
    MissingWorkflow(String),
}

/// Voice overrides a route may apply on top of the workflow defaults.
#[derive(Debug, Clone, Default)]
pub struct RouteOverrides {
    pub model: Option<String>,
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub prompt_variables: HashMap<String, String>,
}

/// One called-number pattern bound to a workflow.
#[derive(Debug, Clone, Default)]
pub struct TelephonyRoute {
    pub label: Option<String>,
    pub workflow_slug: Option<String>,
    pub workflow_id: Option<i64>,
    /// Exact matches, normalized digits plus `+#*`.
    pub phone_numbers: Vec<String>,
    /// Prefix matches, longest wins.
    pub prefixes: Vec<String>,
    pub priority: i32,
    pub overrides: RouteOverrides,
    pub is_default: bool,
}

/// Telephony block of a workflow definition's start node.
#[derive(Debug, Clone, Default)]
pub struct TelephonyStartConfig {
    pub routes: Vec<TelephonyRoute>,
    pub default_route: Option<TelephonyRoute>,
    pub ring_timeout_seconds: f64,
    pub speak_first: bool,
    pub tools: Vec<Value>,
}

/// A resolved workflow definition as the store hands it out.
#[derive(Debug, Clone, Default)]
pub struct WorkflowDefinition {
    pub slug: String,
    pub telephony: Option<TelephonyStartConfig>,
}

/// Global voice settings used when a route does not override them.
#[derive(Debug, Clone)]
pub struct VoiceDefaults {
    pub model: String,
    pub instructions: String,
    pub voice: String,
    pub prompt_variables: HashMap<String, String>,
    pub provider_id: Option<String>,
    pub provider_slug: Option<String>,
}

impl Default for VoiceDefaults {
    fn default() -> Self {
        Self {
            model: "gpt-realtime".to_string(),
            instructions: "Assistant vocal".to_string(),
            voice: "verse".to_string(),
            prompt_variables: HashMap::new(),
            provider_id: None,
            provider_slug: None,
        }
    }
}

/// Read-only lookup interface over workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// The definition bound to a SIP account, if any.
    async fn definition_for_account(&self, sip_account_id: i64) -> Option<WorkflowDefinition>;

    /// A definition by slug, for route-level workflow switches.
    async fn definition_by_slug(&self, slug: &str) -> Option<WorkflowDefinition>;
}

/// Fully resolved context for answering one inbound call.
#[derive(Debug, Clone)]
pub struct TelephonyCallContext {
    pub workflow_slug: String,
    pub normalized_number: String,
    pub original_number: String,
    pub route: Option<TelephonyRoute>,
    pub voice_model: String,
    pub voice_instructions: String,
    pub voice_voice: String,
    pub voice_prompt_variables: HashMap<String, String>,
    pub voice_tools: Vec<Value>,
    pub voice_provider_id: Option<String>,
    pub voice_provider_slug: Option<String>,
    pub ring_timeout_seconds: f64,
    pub speak_first: bool,
}

/// Keep digits and `+#*`; everything else in a number is presentation.
pub fn normalize_number(number: &str) -> String {
    number
        .chars()
        .filter(|ch| ch.is_ascii_digit() || matches!(ch, '+' | '#' | '*'))
        .collect()
}

/// Route matching: exact numbers first (ascending priority, stable order),
/// then the longest matching prefix (ties broken by priority, then stable
/// order), then the explicit default.
fn match_route<'a>(
    config: &'a TelephonyStartConfig,
    normalized_number: &str,
) -> Option<&'a TelephonyRoute> {
    if config.routes.is_empty() && config.default_route.is_none() {
        return None;
    }

    let mut ordered: Vec<&TelephonyRoute> = config.routes.iter().collect();
    ordered.sort_by_key(|route| route.priority);

    let mut exact_matches: Vec<&TelephonyRoute> = Vec::new();
    let mut prefix_matches: Vec<(usize, &TelephonyRoute)> = Vec::new();

    for route in ordered {
        if !normalized_number.is_empty()
            && route.phone_numbers.iter().any(|n| n == normalized_number)
        {
            exact_matches.push(route);
            continue;
        }

        let longest = route
            .prefixes
            .iter()
            .filter(|prefix| !prefix.is_empty() && normalized_number.starts_with(prefix.as_str()))
            .map(|prefix| prefix.len())
            .max()
            .unwrap_or(0);
        if longest > 0 {
            prefix_matches.push((longest, route));
        }
    }

    if exact_matches.len() > 1 {
        tracing::info!(
            "multiple exact telephony routes for {}, keeping the first configured",
            normalized_number
        );
    }
    if let Some(&route) = exact_matches.first() {
        return Some(route);
    }

    if !prefix_matches.is_empty() {
        prefix_matches.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.priority.cmp(&b.1.priority)));
        if prefix_matches.len() > 1 && prefix_matches[0].0 == prefix_matches[1].0 {
            tracing::info!(
                "multiple telephony routes share the longest prefix for {}, keeping the first configured",
                normalized_number
            );
        }
        return Some(prefix_matches[0].1);
    }

    config.default_route.as_ref()
}

fn merged_voice_settings(
    defaults: &VoiceDefaults,
    overrides: Option<&RouteOverrides>,
) -> (String, String, String, HashMap<String, String>) {
    let mut model = defaults.model.clone();
    let mut instructions = defaults.instructions.clone();
    let mut voice = defaults.voice.clone();
    let mut prompt_variables = defaults.prompt_variables.clone();

    if let Some(overrides) = overrides {
        if let Some(value) = overrides.model.as_deref().filter(|v| !v.is_empty()) {
            model = value.to_string();
        }
        if let Some(value) = overrides.instructions.as_deref().filter(|v| !v.is_empty()) {
            instructions = value.to_string();
        }
        if let Some(value) = overrides.voice.as_deref().filter(|v| !v.is_empty()) {
            voice = value.to_string();
        }
        for (key, value) in &overrides.prompt_variables {
            prompt_variables.insert(key.clone(), value.clone());
        }
    }

    (model, instructions, voice, prompt_variables)
}

/// Resolve the workflow and voice settings for an inbound call.
pub async fn resolve_workflow_for_phone_number(
    store: &dyn WorkflowStore,
    defaults: &VoiceDefaults,
    phone_number: &str,
    sip_account_id: i64,
) -> Result<TelephonyCallContext, WorkflowError> {
    tracing::info!(
        "resolving workflow for inbound call to {} (SIP account {})",
        phone_number,
        sip_account_id
    );

    let definition = store
        .definition_for_account(sip_account_id)
        .await
        .ok_or(WorkflowError::NoAccountWorkflow(sip_account_id))?;

    let normalized_number = normalize_number(phone_number);
    if normalized_number != phone_number {
        tracing::info!(
            "inbound number normalized from {} to {}",
            phone_number,
            normalized_number
        );
    }

    let Some(telephony) = definition.telephony.clone() else {
        // No telephony block: answer with the definition and global defaults.
        let (model, instructions, voice, prompt_variables) =
            merged_voice_settings(defaults, None);
        return Ok(TelephonyCallContext {
            workflow_slug: definition.slug,
            normalized_number,
            original_number: phone_number.to_string(),
            route: None,
            voice_model: model,
            voice_instructions: instructions,
            voice_voice: voice,
            voice_prompt_variables: prompt_variables,
            voice_tools: Vec::new(),
            voice_provider_id: defaults.provider_id.clone(),
            voice_provider_slug: defaults.provider_slug.clone(),
            ring_timeout_seconds: 0.0,
            speak_first: false,
        });
    };

    let route = match_route(&telephony, &normalized_number)
        .cloned()
        .ok_or_else(|| WorkflowError::NoRoute(phone_number.to_string()))?;

    tracing::info!(
        "telephony route selected: label={}, workflow={}, priority={}",
        route.label.as_deref().unwrap_or("<unlabelled>"),
        route
            .workflow_slug
            .as_deref()
            .unwrap_or(definition.slug.as_str()),
        route.priority
    );

    let mut selected = definition;
    if let Some(slug) = route.workflow_slug.as_deref().filter(|s| !s.is_empty()) {
        if slug != selected.slug {
            selected = store
                .definition_by_slug(slug)
                .await
                .ok_or_else(|| WorkflowError::MissingWorkflow(slug.to_string()))?;
            tracing::info!("route switched workflow definition to {}", slug);
        }
    }

    let (model, instructions, voice, prompt_variables) =
        merged_voice_settings(defaults, Some(&route.overrides));

    Ok(TelephonyCallContext {
        workflow_slug: selected.slug,
        normalized_number,
        original_number: phone_number.to_string(),
        route: Some(route),
        voice_model: model,
        voice_instructions: instructions,
        voice_voice: voice,
        voice_prompt_variables: prompt_variables,
        voice_tools: telephony.tools.clone(),
        voice_provider_id: defaults.provider_id.clone(),
        voice_provider_slug: defaults.provider_slug.clone(),
        ring_timeout_seconds: telephony.ring_timeout_seconds,
        speak_first: telephony.speak_first,
    })
}

/// Static in-memory store; production deployments provide a database-backed
/// implementation behind the same trait.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    by_account: HashMap<i64, WorkflowDefinition>,
    by_slug: HashMap<String, WorkflowDefinition>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_account(&mut self, sip_account_id: i64, definition: WorkflowDefinition) {
        self.by_slug
            .insert(definition.slug.clone(), definition.clone());
        self.by_account.insert(sip_account_id, definition);
    }

    pub fn insert(&mut self, definition: WorkflowDefinition) {
        self.by_slug.insert(definition.slug.clone(), definition);
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn definition_for_account(&self, sip_account_id: i64) -> Option<WorkflowDefinition> {
        self.by_account.get(&sip_account_id).cloned()
    }

    async fn definition_by_slug(&self, slug: &str) -> Option<WorkflowDefinition> {
        self.by_slug.get(slug).cloned()
    }
}
