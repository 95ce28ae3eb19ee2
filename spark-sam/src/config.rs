use crate::error::{Result, SamError};
use crate::inference::postprocess::PostprocessParams;
use crate::model::hparams::Hyperparameters;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-session settings. Threshold fields left as `None` use the values stored
/// in the weight file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub n_threads: usize,

    pub mask_threshold: Option<f32>,
    pub iou_threshold: Option<f32>,
    pub stability_score_threshold: Option<f32>,
    pub stability_score_offset: Option<f32>,

    pub mask_on_value: u8,
    pub mask_off_value: u8,

    /// Return the multimask candidates instead of the single-mask output.
    pub multimask_output: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            n_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            mask_threshold: None,
            iou_threshold: None,
            stability_score_threshold: None,
            stability_score_offset: None,
            mask_on_value: 255,
            mask_off_value: 0,
            multimask_output: true,
        }
    }
}

impl SessionConfig {
    pub fn with_threads(n_threads: usize) -> Self {
        SessionConfig {
            n_threads,
            ..Default::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| SamError::Config(format!("cannot open {}: {e}", path.display())))?;
        let config: SessionConfig = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| SamError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_threads == 0 {
            return Err(SamError::Config("n_threads must be at least 1".to_string()));
        }

        let overrides = [
            ("mask_threshold", self.mask_threshold),
            ("iou_threshold", self.iou_threshold),
            ("stability_score_threshold", self.stability_score_threshold),
            ("stability_score_offset", self.stability_score_offset),
        ];
        if let Some((name, value)) = overrides
            .iter()
            .find_map(|(name, value)| value.filter(|v| !v.is_finite()).map(|v| (name, v)))
        {
            return Err(SamError::Config(format!("{name} = {value} is not finite")));
        }
        if let Some(offset) = self.stability_score_offset.filter(|v| *v < 0.0) {
            return Err(SamError::Config(format!(
                "stability_score_offset = {offset} is negative"
            )));
        }

        Ok(())
    }

    /// Postprocessing parameters: weight-file values with this config's
    /// overrides applied.
    pub fn postprocess_params(&self, hparams: &Hyperparameters) -> PostprocessParams {
        let defaults = PostprocessParams::from_hparams(hparams);
        PostprocessParams {
            img_size: hparams.n_img_size,
            mask_threshold: self.mask_threshold.unwrap_or(defaults.mask_threshold),
            iou_threshold: self.iou_threshold.unwrap_or(defaults.iou_threshold),
            stability_score_threshold: self
                .stability_score_threshold
                .unwrap_or(defaults.stability_score_threshold),
            stability_score_offset: self
                .stability_score_offset
                .unwrap_or(defaults.stability_score_offset),
            mask_on_value: self.mask_on_value,
            mask_off_value: self.mask_off_value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_fields_take_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{ "n_threads": 3, "iou_threshold": 0.5 }"#).unwrap();
        assert_eq!(config.n_threads, 3);
        assert_eq!(config.iou_threshold, Some(0.5));
        assert_eq!(config.mask_on_value, 255);
        assert!(config.multimask_output);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn overrides_replace_weight_file_thresholds() {
        let hparams = Hyperparameters::default();
        let config = SessionConfig {
            stability_score_offset: Some(2.0),
            mask_on_value: 1,
            ..SessionConfig::with_threads(1)
        };
        let params = config.postprocess_params(&hparams);
        assert_eq!(params.stability_score_offset, 2.0);
        assert_eq!(params.iou_threshold, hparams.iou_threshold);
        assert_eq!(params.mask_on_value, 1);
        assert_eq!(params.img_size, 1024);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(SessionConfig::with_threads(0).validate(), Err(SamError::Config(_))));

        let config = SessionConfig {
            iou_threshold: Some(f32::NAN),
            ..SessionConfig::with_threads(1)
        };
        assert!(matches!(config.validate(), Err(SamError::Config(_))));

        let config = SessionConfig {
            stability_score_offset: Some(-0.5),
            ..SessionConfig::with_threads(1)
        };
        assert!(matches!(config.validate(), Err(SamError::Config(_))));
    }

    #[test]
    fn reads_json_files() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{ "n_threads": 2, "multimask_output": false, "mask_off_value": 7 }}"#)?;
        let config = SessionConfig::from_json_file(file.path())?;
        assert_eq!(config.n_threads, 2);
        assert!(!config.multimask_output);
        assert_eq!(config.mask_off_value, 7);

        let mut broken = tempfile::NamedTempFile::new()?;
        write!(broken, r#"{{ "n_threads": 0 }}"#)?;
        assert!(SessionConfig::from_json_file(broken.path()).is_err());
        Ok(())
    }
}
