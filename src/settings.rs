use serde::{Deserialize, Serialize};

pub const DEFAULT_RETRIEVAL_TOP_K: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionSettings {
    pub model_params: Option<ModelParams>,
    pub retrieval_top_k: Option<usize>,
}

/// Partial update sent by `PATCH /v1/sessions/:id/settings`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionSettingsPatch {
    pub model_params: Option<ModelParams>,
    pub retrieval_top_k: Option<usize>,
}

impl SessionSettings {
    pub fn apply_patch(&mut self, patch: SessionSettingsPatch) {
        if let Some(params) = patch.model_params {
            let current = self.model_params.get_or_insert_with(ModelParams::default);
            if params.temperature.is_some() {
                current.temperature = params.temperature;
            }
            if params.max_tokens.is_some() {
                current.max_tokens = params.max_tokens;
            }
            if params.top_p.is_some() {
                current.top_p = params.top_p;
            }
        }
        if patch.retrieval_top_k.is_some() {
            self.retrieval_top_k = patch.retrieval_top_k;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GlobalConfigDefaults {
    pub default_model: Option<String>,
    pub model_params: Option<ModelParams>,
    pub retrieval_top_k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RequestOverrides {
    pub model_params: Option<ModelParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EffectiveSettings {
    pub model_params: ModelParams,
    pub retrieval_top_k: usize,
}

pub fn resolve_effective_settings(
    global: &GlobalConfigDefaults,
    session: &SessionSettings,
    request: &RequestOverrides,
) -> EffectiveSettings {
    let model_params = ModelParams {
        temperature: request
            .model_params
            .as_ref()
            .and_then(|p| p.temperature)
            .or_else(|| session.model_params.as_ref().and_then(|p| p.temperature))
            .or_else(|| global.model_params.as_ref().and_then(|p| p.temperature)),
        max_tokens: request
            .model_params
            .as_ref()
            .and_then(|p| p.max_tokens)
            .or_else(|| session.model_params.as_ref().and_then(|p| p.max_tokens))
            .or_else(|| global.model_params.as_ref().and_then(|p| p.max_tokens)),
        top_p: request
            .model_params
            .as_ref()
            .and_then(|p| p.top_p)
            .or_else(|| session.model_params.as_ref().and_then(|p| p.top_p))
            .or_else(|| global.model_params.as_ref().and_then(|p| p.top_p)),
    };

    let retrieval_top_k = session
        .retrieval_top_k
        .or(global.retrieval_top_k)
        .unwrap_or(DEFAULT_RETRIEVAL_TOP_K)
        .max(1);

    EffectiveSettings {
        model_params,
        retrieval_top_k,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_request_over_session_over_global() {
        let global = GlobalConfigDefaults {
            default_model: Some("global-model".into()),
            model_params: Some(ModelParams {
                temperature: Some(0.1),
                max_tokens: Some(1000),
                top_p: Some(0.9),
            }),
            retrieval_top_k: Some(8),
        };

        let session = SessionSettings {
            model_params: Some(ModelParams {
                temperature: Some(0.2),
                max_tokens: None,
                top_p: None,
            }),
            retrieval_top_k: None,
        };

        let request = RequestOverrides {
            model_params: Some(ModelParams {
                temperature: None,
                max_tokens: Some(2048),
                top_p: None,
            }),
        };

        let eff = resolve_effective_settings(&global, &session, &request);

        assert_eq!(eff.model_params.temperature, Some(0.2)); // from session
        assert_eq!(eff.model_params.max_tokens, Some(2048)); // from request
        assert_eq!(eff.model_params.top_p, Some(0.9)); // from global
        assert_eq!(eff.retrieval_top_k, 8);
    }

    #[test]
    fn patch_only_touches_supplied_fields() {
        let mut settings = SessionSettings {
            model_params: Some(ModelParams {
                temperature: Some(0.7),
                max_tokens: Some(512),
                top_p: None,
            }),
            retrieval_top_k: Some(3),
        };
        settings.apply_patch(SessionSettingsPatch {
            model_params: Some(ModelParams {
                temperature: None,
                max_tokens: None,
                top_p: Some(0.5),
            }),
            retrieval_top_k: None,
        });
        let params = settings.model_params.unwrap();
        assert_eq!(params.temperature, Some(0.7));
        assert_eq!(params.max_tokens, Some(512));
        assert_eq!(params.top_p, Some(0.5));
        assert_eq!(settings.retrieval_top_k, Some(3));
    }

    #[test]
    fn top_k_defaults_and_never_zero() {
        let eff = resolve_effective_settings(
            &GlobalConfigDefaults::default(),
            &SessionSettings {
                model_params: None,
                retrieval_top_k: Some(0),
            },
            &RequestOverrides::default(),
        );
        assert_eq!(eff.retrieval_top_k, 1);
        let eff = resolve_effective_settings(
            &GlobalConfigDefaults::default(),
            &SessionSettings::default(),
            &RequestOverrides::default(),
        );
        assert_eq!(eff.retrieval_top_k, DEFAULT_RETRIEVAL_TOP_K);
    }
}
