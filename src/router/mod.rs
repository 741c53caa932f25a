//! Decision routing: contexts are scored by a predictor and turned into
//! maintenance decisions

pub mod decision;
pub mod predictor;

pub use decision::{DecisionRouter, RouterSettings};
pub use predictor::{
    FeatureSet, FeatureVector, Prediction, Predictor, PredictorError, ThresholdPredictor,
    TreePredictor,
};

use std::sync::Arc;

use crate::config::PipelineConfig;

/// Load the feature set and predictor named by the configuration
///
/// A configured model that cannot be loaded, or that splits on a feature the
/// feature set does not provide, is an error; the runtime cannot start
/// without a predictor.
///
/// # Arguments
/// * `config` - Reads `features_path` (else `features`) and `model_path`
///
/// # Returns
/// The feature set and the tree model when a model path is set, otherwise
/// the threshold fallback
pub fn load_predictor(
    config: &PipelineConfig,
) -> Result<(FeatureSet, Arc<dyn Predictor>), PredictorError> {
    let features = match &config.features_path {
        Some(path) => FeatureSet::from_json_file(path)?,
        None => FeatureSet::new(config.features.iter().cloned())?,
    };

    let predictor: Arc<dyn Predictor> = match &config.model_path {
        Some(path) => {
            let tree = TreePredictor::from_json_file(path)?;
            if let Some(missing) = tree
                .features()
                .iter()
                .find(|name| !features.names().contains(*name))
            {
                return Err(PredictorError::Invalid(format!(
                    "model uses feature {missing:?} which is not in the feature set"
                )));
            }
            log::info!("Loaded decision tree from {}", path.display());
            Arc::new(tree)
        }
        None => Arc::new(ThresholdPredictor::with_defaults()),
    };

    Ok((features, predictor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_predictor() {
        let (features, predictor) = load_predictor(&PipelineConfig::default()).unwrap();
        assert_eq!(features.names().len(), 3);
        assert_eq!(predictor.name(), "threshold");
    }

    #[test]
    fn test_model_feature_must_be_provided() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.json");
        std::fs::write(
            &model,
            r#"{"features": ["spindle_rpm"],
                "nodes": [{"feature": "spindle_rpm", "threshold": 9000.0, "left": 1, "right": 2},
                          {"value": [10, 0]}, {"value": [0, 10]}]}"#,
        )
        .unwrap();

        let config = PipelineConfig {
            model_path: Some(model.clone()),
            ..PipelineConfig::default()
        };
        assert!(matches!(load_predictor(&config), Err(PredictorError::Invalid(_))));

        let config = PipelineConfig {
            model_path: Some(model),
            features: vec!["spindle_rpm".to_string()],
            ..PipelineConfig::default()
        };
        let (_, predictor) = load_predictor(&config).unwrap();
        assert_eq!(predictor.name(), "decision_tree");
    }

    #[test]
    fn test_missing_model_is_fatal() {
        let config = PipelineConfig {
            model_path: Some("/no/such/model.json".into()),
            ..PipelineConfig::default()
        };
        assert!(matches!(load_predictor(&config), Err(PredictorError::Load { .. })));
    }
}
