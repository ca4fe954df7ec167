use serde::Deserialize;

/// Models available to the expert pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    /// Speed tier - fast, cheap model for classification-adjacent roles
    Speed,
    /// Balanced tier - deep reasoning at medium cost for analysis roles
    Balanced,
    /// Smart tier - best reasoning for fix generation
    Smart,
}

/// Completion budget for all model tiers
const MODEL_MAX_TOKENS: u32 = 16384;

/// Models we allow to use JSON formatting / structured outputs.
const JSON_FORMAT_MODELS: [&str; 3] = [
    "openai/gpt-oss-120b:exacto",
    "openai/gpt-5.2:nitro",
    "openai/gpt-5.2-codex:nitro",
];

fn supports_json_format(model_id: &str) -> bool {
    JSON_FORMAT_MODELS.iter().any(|id| *id == model_id)
}

impl Model {
    pub fn id(&self) -> &'static str {
        match self {
            Model::Speed => "openai/gpt-oss-120b:exacto",
            Model::Balanced => "openai/gpt-5.2-codex:nitro",
            Model::Smart => "openai/gpt-5.2:nitro",
        }
    }

    pub fn max_tokens(&self) -> u32 {
        MODEL_MAX_TOKENS
    }

    /// Total context window used by the token budgeter.
    pub fn context_window(&self) -> usize {
        match self {
            Model::Speed => 131_072,
            Model::Balanced => 128_000,
            Model::Smart => 128_000,
        }
    }

    /// Whether this model supports JSON response formatting.
    pub fn supports_json_mode(&self) -> bool {
        supports_json_format(self.id())
    }
}

/// API usage information reported by the backend
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
    /// Actual cost in USD as reported by the backend, when present.
    #[serde(default, alias = "total_cost")]
    pub cost: Option<f64>,
}

/// Merge two optional `Usage` values, summing their token counts and costs.
pub fn merge_usage(primary: Option<Usage>, secondary: Option<Usage>) -> Option<Usage> {
    match (primary, secondary) {
        (Some(p), Some(s)) => Some(Usage {
            prompt_tokens: p.prompt_tokens + s.prompt_tokens,
            completion_tokens: p.completion_tokens + s.completion_tokens,
            total_tokens: p.total_tokens + s.total_tokens,
            cost: match (p.cost, s.cost) {
                (Some(pc), Some(sc)) => Some(pc + sc),
                (Some(pc), None) => Some(pc),
                (None, Some(sc)) => Some(sc),
                (None, None) => None,
            },
        }),
        (Some(p), None) => Some(p),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}
