//! Weighted loss and its cross-worker reduction for logging.

use crate::{
    common::*,
    error::EngineError,
    metric_logger::MetricLogger,
    model::{LossDict, WeightDict},
};

/// The term reported as the classification error meter.
pub const CLASS_ERROR: &str = "class_error";

/// Sums the loss terms that have a weight, each scaled by its weight.
pub fn weighted_loss(loss_dict: &LossDict, weight_dict: &WeightDict) -> Result<Tensor> {
    let terms: Vec<Tensor> = loss_dict
        .iter()
        .filter_map(|(name, loss)| Some(loss * *weight_dict.get(name)?))
        .collect();
    ensure!(
        !terms.is_empty(),
        "none of the loss terms {:?} has a weight",
        loss_dict.keys().collect::<Vec<_>>()
    );

    let total = terms
        .into_iter()
        .reduce(|lhs, rhs| lhs + rhs)
        .ok_or_else(|| format_err!("no weighted loss term"))?;
    Ok(total)
}

/// Loss terms averaged over all workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossTerms {
    /// Every term as produced by the criterion.
    pub reduced: IndexMap<String, f64>,
    /// Weighted terms.
    pub scaled: IndexMap<String, f64>,
    /// Weighted terms before scaling, suffixed with `_unscaled`.
    pub unscaled: IndexMap<String, f64>,
    /// The sum of the scaled terms.
    pub total: f64,
}

impl LossTerms {
    pub fn reduce(
        loss_dict: &LossDict,
        weight_dict: &WeightDict,
        group: &dyn ProcessGroup,
    ) -> Result<Self> {
        let local: IndexMap<String, f64> = loss_dict
            .iter()
            .map(|(name, loss)| -> Result<_> {
                ensure!(
                    loss.size().iter().product::<i64>() == 1,
                    "loss term '{}' is not a scalar, its shape is {:?}",
                    name,
                    loss.size()
                );
                Ok((name.clone(), f64::from(&loss.detach())))
            })
            .collect::<Result<_>>()?;
        let reduced = process_group::reduce_dict(group, &local)?;

        let unscaled: IndexMap<_, _> = reduced
            .iter()
            .map(|(name, &value)| (format!("{}_unscaled", name), value))
            .collect();
        let scaled: IndexMap<_, _> = reduced
            .iter()
            .filter_map(|(name, &value)| {
                let weight = weight_dict.get(name)?;
                Some((name.clone(), value * weight))
            })
            .collect();
        let total = scaled.values().sum();

        Ok(Self {
            reduced,
            scaled,
            unscaled,
            total,
        })
    }

    pub fn class_error(&self) -> Result<f64> {
        self.reduced.get(CLASS_ERROR).copied().ok_or_else(|| {
            EngineError::MissingLossTerm {
                name: CLASS_ERROR.into(),
            }
            .into()
        })
    }

    /// Feeds `loss`, the scaled terms and the unscaled terms to the logger.
    pub fn log_to(&self, metric_logger: &mut MetricLogger) {
        metric_logger.update("loss", self.total);
        metric_logger.update_many(&self.scaled);
        metric_logger.update_many(&self.unscaled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use process_group::SingleProcess;

    fn loss_dict() -> LossDict {
        vec![
            ("loss_ce".to_string(), Tensor::from(0.5f32)),
            ("loss_bbox".to_string(), Tensor::from(0.2f32)),
            ("class_error".to_string(), Tensor::from(25.0f32)),
        ]
        .into_iter()
        .collect()
    }

    fn weight_dict() -> WeightDict {
        vec![
            ("loss_ce".to_string(), 1.0),
            ("loss_bbox".to_string(), 5.0),
            ("loss_giou".to_string(), 2.0),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn weighted_sum_skips_unweighted_terms() {
        let total = weighted_loss(&loss_dict(), &weight_dict()).unwrap();
        assert_abs_diff_eq!(f64::from(&total), 1.5, epsilon = 1e-6);
    }

    #[test]
    fn no_weighted_term_is_an_error() {
        let weights: WeightDict = vec![("loss_mask".to_string(), 1.0)].into_iter().collect();
        assert!(weighted_loss(&loss_dict(), &weights).is_err());
    }

    #[test]
    fn reduced_terms() {
        let terms = LossTerms::reduce(&loss_dict(), &weight_dict(), &SingleProcess).unwrap();

        assert_abs_diff_eq!(terms.total, 1.5, epsilon = 1e-6);
        assert_eq!(
            terms.scaled.keys().collect::<Vec<_>>(),
            vec!["loss_ce", "loss_bbox"]
        );
        assert_abs_diff_eq!(terms.scaled["loss_bbox"], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(terms.unscaled["loss_bbox_unscaled"], 0.2, epsilon = 1e-6);
        assert_eq!(terms.unscaled.len(), 3);
        assert_abs_diff_eq!(terms.class_error().unwrap(), 25.0, epsilon = 1e-6);
    }

    #[test]
    fn missing_class_error() {
        let mut losses = loss_dict();
        losses.shift_remove("class_error");
        let terms = LossTerms::reduce(&losses, &weight_dict(), &SingleProcess).unwrap();
        let err = terms.class_error().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::MissingLossTerm { .. })
        ));
    }
}
