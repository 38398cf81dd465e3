//! The built-in agent lineup and the settings layer on top of it.

use std::sync::Arc;

use tracing::info;

use chorus_core::ids::AgentId;
use chorus_core::profile::{AgentProfile, HistoryMode};
use chorus_core::provider::CompletionProvider;
use chorus_settings::AgentSettings;
use chorus_telemetry::MetricsRecorder;

use crate::agent::PromptAgent;
use crate::error::RegistryError;
use crate::registry::AgentRegistry;

pub const CATEGORY_WRITING: &str = "Writing";
pub const CATEGORY_ROLES: &str = "Roles";
pub const CATEGORY_ENTERTAINMENT: &str = "Entertainment";

/// Compile-time description of a built-in agent.
#[derive(Clone, Copy, Debug)]
pub struct BuiltinAgent {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    pub prompt: &'static str,
    pub history: HistoryMode,
    pub temperature: Option<f64>,
}

/// Built-in agents in listing order.
pub const BUILTIN_AGENTS: &[BuiltinAgent] = &[
    BuiltinAgent {
        id: "story_master",
        name: "Story Master",
        description: "Screenwriting assistant that crafts engaging, well-structured stories",
        category: CATEGORY_WRITING,
        prompt: include_str!("../prompts/story_master.md"),
        history: HistoryMode::SingleTurn,
        temperature: None,
    },
    BuiltinAgent {
        id: "rewrite_master",
        name: "Rewrite Master",
        description: "Rewrites articles of any kind so they read as new while keeping the meaning",
        category: CATEGORY_WRITING,
        prompt: include_str!("../prompts/rewrite_master.md"),
        history: HistoryMode::SingleTurn,
        temperature: None,
    },
    BuiltinAgent {
        id: "xiaohongshu_expert",
        name: "Xiaohongshu Post Expert",
        description: "Writes eye-catching recommendation posts for Xiaohongshu",
        category: CATEGORY_WRITING,
        prompt: include_str!("../prompts/xiaohongshu_expert.md"),
        history: HistoryMode::SingleTurn,
        temperature: None,
    },
    BuiltinAgent {
        id: "copywriting_expert",
        name: "Human-Touch Copy Editor",
        description: "Polishes copy so it sounds warm, personal and persuasive",
        category: CATEGORY_ROLES,
        prompt: include_str!("../prompts/copywriting_expert.md"),
        history: HistoryMode::SingleTurn,
        temperature: None,
    },
    BuiltinAgent {
        id: "python_expert",
        name: "Python Expert",
        description: "Python programming assistant for writing, optimizing and explaining code",
        category: CATEGORY_ROLES,
        prompt: include_str!("../prompts/python_expert.md"),
        history: HistoryMode::HistoryAware,
        temperature: None,
    },
    BuiltinAgent {
        id: "crazy_thursday",
        name: "Crazy Thursday",
        description: "Opens with a gripping little story and flips it in the last line",
        category: CATEGORY_ENTERTAINMENT,
        prompt: include_str!("../prompts/crazy_thursday.md"),
        history: HistoryMode::SingleTurn,
        temperature: Some(0.8),
    },
    BuiltinAgent {
        id: "deep_thinker",
        name: "Deep Thinker",
        description: "Takes any topic apart layer by layer",
        category: CATEGORY_ROLES,
        prompt: include_str!("../prompts/deep_thinker.md"),
        history: HistoryMode::SingleTurn,
        temperature: None,
    },
    BuiltinAgent {
        id: "decision_expert",
        name: "Decision Expert",
        description: "Helps you make the best choice using structured decision methods",
        category: CATEGORY_ROLES,
        prompt: include_str!("../prompts/decision_expert.md"),
        history: HistoryMode::SingleTurn,
        temperature: None,
    },
    BuiltinAgent {
        id: "food_critic",
        name: "The Solitary Gourmet",
        description: "Brings the charm and flavour of food to life in words",
        category: CATEGORY_ROLES,
        prompt: include_str!("../prompts/food_critic.md"),
        history: HistoryMode::SingleTurn,
        temperature: None,
    },
    BuiltinAgent {
        id: "debate_expert",
        name: "Debate Expert",
        description: "Arms you with sharp, funny comebacks for a friendly argument",
        category: CATEGORY_ENTERTAINMENT,
        prompt: include_str!("../prompts/debate_expert.md"),
        history: HistoryMode::SingleTurn,
        temperature: None,
    },
    BuiltinAgent {
        id: "ancient_style",
        name: "Classical Roaster",
        description: "Answers in classical Chinese with a cheeky, humorous bite",
        category: CATEGORY_ENTERTAINMENT,
        prompt: include_str!("../prompts/ancient_style.md"),
        history: HistoryMode::SingleTurn,
        temperature: None,
    },
];

/// Everything needed to build one [`PromptAgent`].
#[derive(Clone, Debug, PartialEq)]
pub struct AgentDefinition {
    pub profile: AgentProfile,
    pub history: HistoryMode,
    pub model: Option<String>,
    pub temperature: Option<f64>,
}

impl AgentDefinition {
    pub fn build(
        self,
        provider: Arc<dyn CompletionProvider>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> PromptAgent {
        PromptAgent::new(self.profile, provider)
            .with_history(self.history)
            .with_model(self.model)
            .with_temperature(self.temperature)
            .with_metrics(metrics)
    }

    /// Layer the fields set in `overrides` on top of this definition.
    pub fn merged(mut self, overrides: &AgentSettings) -> Self {
        if let Some(name) = &overrides.name {
            self.profile.name = name.clone();
        }
        if let Some(description) = &overrides.description {
            self.profile.description = description.clone();
        }
        if let Some(category) = &overrides.category {
            self.profile.category = category.clone();
        }
        if let Some(prompt) = &overrides.system_prompt {
            self.profile.system_prompt = prompt.clone();
        }
        if let Some(history) = overrides.history {
            self.history = history;
        }
        if overrides.model.is_some() {
            self.model = overrides.model.clone();
        }
        if overrides.temperature.is_some() {
            self.temperature = overrides.temperature;
        }
        self
    }

    /// A brand-new agent defined entirely in settings.
    pub fn from_settings(settings: &AgentSettings) -> Result<Self, RegistryError> {
        let id = AgentId::from(settings.id.as_str());
        let invalid = |reason: &str| RegistryError::InvalidDefinition {
            agent: id.clone(),
            reason: reason.to_string(),
        };
        let name = settings.name.clone().ok_or_else(|| invalid("missing name"))?;
        let system_prompt = settings
            .system_prompt
            .clone()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| invalid("missing systemPrompt"))?;

        Ok(Self {
            profile: AgentProfile {
                id: id.clone(),
                name,
                description: settings.description.clone().unwrap_or_default(),
                category: settings.category.clone().unwrap_or_else(|| "Custom".to_string()),
                system_prompt,
            },
            history: settings.history.unwrap_or_default(),
            model: settings.model.clone(),
            temperature: settings.temperature,
        })
    }
}

impl From<&BuiltinAgent> for AgentDefinition {
    fn from(agent: &BuiltinAgent) -> Self {
        Self {
            profile: AgentProfile {
                id: AgentId::from(agent.id),
                name: agent.name.to_string(),
                description: agent.description.to_string(),
                category: agent.category.to_string(),
                system_prompt: agent.prompt.to_string(),
            },
            history: agent.history,
            model: None,
            temperature: agent.temperature,
        }
    }
}

pub fn builtin_definitions() -> Vec<AgentDefinition> {
    BUILTIN_AGENTS.iter().map(AgentDefinition::from).collect()
}

/// Register the built-in agents, then apply each settings entry: an id that
/// matches an existing agent patches it in place, any other id adds a new
/// agent at the end of the listing.
pub fn build_registry(
    provider: Arc<dyn CompletionProvider>,
    overrides: &[AgentSettings],
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<AgentRegistry, RegistryError> {
    let mut registry = AgentRegistry::new();
    let mut definitions = builtin_definitions();

    for definition in &definitions {
        registry.register(Arc::new(definition.clone().build(Arc::clone(&provider), metrics.clone())))?;
    }

    for entry in overrides {
        let definition = match definitions.iter().position(|d| d.profile.id.as_str() == entry.id) {
            Some(pos) => {
                let merged = definitions[pos].clone().merged(entry);
                definitions[pos] = merged.clone();
                info!(agent_id = %entry.id, "agent overridden from settings");
                merged
            }
            None => {
                let added = AgentDefinition::from_settings(entry)?;
                definitions.push(added.clone());
                info!(agent_id = %entry.id, "agent added from settings");
                added
            }
        };
        registry.replace(Arc::new(definition.build(Arc::clone(&provider), metrics.clone())));
    }

    Ok(registry)
}
