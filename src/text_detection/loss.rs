use crate::dataset::BatchTargets;
use anyhow::{anyhow, Result};
use tch::{Kind, Reduction, Tensor};

/// Loss terms of a DB prediction.
#[derive(Debug)]
pub struct DbLossOutput {
    pub total: Tensor,
    pub bce: Tensor,
    pub l1: Option<Tensor>,
    pub dice: Option<Tensor>,
}

/// Supervision of a DB network.
///
/// The prediction is `(N, C, H, W)`: channel 0 is the probability map, and
/// when present channel 1 the threshold map and channel 2 the approximate
/// binary map.
#[derive(Debug, Clone, Copy)]
pub struct DbLoss {
    pub bce_scale: f64,
    pub l1_scale: f64,
    pub negative_ratio: f64,
    pub eps: f64,
}

impl Default for DbLoss {
    fn default() -> Self {
        Self {
            bce_scale: 5.,
            l1_scale: 10.,
            negative_ratio: 3.,
            eps: 1e-6,
        }
    }
}

impl DbLoss {
    pub fn compute(&self, pred: &Tensor, targets: &BatchTargets) -> Result<DbLossOutput> {
        let size = pred.size();
        if size.len() != 4 || size[1] < 1 {
            return Err(anyhow!("expected an (N, C, H, W) prediction, got {:?}", size));
        }
        let gt = targets.gt.select(1, 0);
        let mask = &targets.mask;

        let bce = self.balance_loss(&pred.select(1, 0), &gt, mask);
        if size[1] < 3 {
            return Ok(DbLossOutput {
                total: bce.shallow_clone(),
                bce,
                l1: None,
                dice: None,
            });
        }

        let l1 = masked_l1_loss(&pred.select(1, 1), &targets.thresh_map, &targets.thresh_mask);
        let dice = self.dice_loss(&pred.select(1, 2), &gt, mask);
        let total = &dice + &l1 * self.l1_scale + &bce * self.bce_scale;
        Ok(DbLossOutput {
            total,
            bce,
            l1: Some(l1),
            dice: Some(dice),
        })
    }

    /// Binary cross entropy over the positive pixels and the hardest
    /// negatives, at most `negative_ratio` times as many as the positives.
    ///
    /// Args:
    ///     pred: shape (N, H, W), the prediction of network
    ///     gt: shape (N, H, W), the target
    ///     mask: shape (N, H, W), the mask indicates positive regions
    pub fn balance_loss(&self, pred: &Tensor, gt: &Tensor, mask: &Tensor) -> Tensor {
        let positive = gt * mask;
        let negative: Tensor = (1. - gt) * mask;
        let positive_count = positive.sum(Kind::Float);
        let negative_count = negative
            .sum(Kind::Float)
            .minimum(&(&positive_count * self.negative_ratio))
            .floor();

        let loss = pred.binary_cross_entropy::<Tensor>(gt, None, Reduction::None);
        let positive_loss = &loss * &positive;
        let negative_loss = (loss * negative).view(-1);
        let (negative_loss, _) =
            negative_loss.topk(negative_count.int64_value(&[]), -1, true, true);

        (positive_loss.sum(Kind::Float) + negative_loss.sum(Kind::Float))
            / (positive_count + negative_count + self.eps)
    }

    pub fn dice_loss(&self, pred: &Tensor, gt: &Tensor, mask: &Tensor) -> Tensor {
        let intersection = (pred * gt * mask).sum(Kind::Float);
        let union = (pred * mask).sum(Kind::Float) + (gt * mask).sum(Kind::Float) + self.eps;
        1. - intersection * 2. / union
    }
}

/// Mean absolute error over the pixels of `mask`; zero for an empty mask.
pub fn masked_l1_loss(pred: &Tensor, gt: &Tensor, mask: &Tensor) -> Tensor {
    let mask_sum = mask.sum(Kind::Float);
    if mask_sum.double_value(&[]) == 0. {
        return mask_sum;
    }
    ((pred - gt).abs() * mask).sum(Kind::Float) / mask_sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    /// A 1x4x4 sample with a 2x2 text region in the middle.
    fn targets() -> BatchTargets {
        let gt = Tensor::from_slice(&[
            0f32, 0., 0., 0., //
            0., 1., 1., 0., //
            0., 1., 1., 0., //
            0., 0., 0., 0., //
        ])
        .view([1, 1, 4, 4]);
        let thresh_map = Tensor::full([1, 4, 4], 0.3, (Kind::Float, Device::Cpu));
        BatchTargets {
            gt,
            mask: Tensor::ones([1, 4, 4], (Kind::Float, Device::Cpu)),
            thresh_map,
            thresh_mask: Tensor::ones([1, 4, 4], (Kind::Float, Device::Cpu)),
            polygons: vec![vec![]],
            ignore_tags: vec![vec![]],
        }
    }

    fn prediction(targets: &BatchTargets, channels: i64) -> Tensor {
        let prob = targets.gt.shallow_clone();
        let thresh = targets.thresh_map.unsqueeze(1);
        Tensor::cat(&[prob.shallow_clone(), thresh, prob], 1).narrow(1, 0, channels)
    }

    #[test]
    fn perfect_prediction_has_zero_loss() -> Result<()> {
        let targets = targets();
        let out = DbLoss::default().compute(&prediction(&targets, 3), &targets)?;
        assert!(out.total.double_value(&[]).abs() < 1e-4);
        assert!(out.l1.expect("l1 term").double_value(&[]).abs() < 1e-6);
        assert!(out.dice.expect("dice term").double_value(&[]).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn single_channel_uses_bce_only() -> Result<()> {
        let targets = targets();
        let pred = Tensor::full([1, 1, 4, 4], 0.5, (Kind::Float, Device::Cpu));
        let out = DbLoss::default().compute(&pred, &targets)?;
        assert!(out.l1.is_none() && out.dice.is_none());
        // 4 positives and min(12, 3 * 4) negatives, all at ln 2
        assert!((out.total.double_value(&[]) - 2f64.ln()).abs() < 1e-4);
        assert!((out.bce.double_value(&[]) - 2f64.ln()).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn loss_combines_terms() -> Result<()> {
        let targets = targets();
        let pred = Tensor::full([1, 3, 4, 4], 0.5, (Kind::Float, Device::Cpu));
        let out = DbLoss::default().compute(&pred, &targets)?;
        let l1 = out.l1.expect("l1 term").double_value(&[]);
        let dice = out.dice.expect("dice term").double_value(&[]);
        let bce = out.bce.double_value(&[]);
        assert!((l1 - 0.2).abs() < 1e-5);
        // 1 - 2 * 2 / (8 + 4)
        assert!((dice - 2. / 3.).abs() < 1e-4);
        assert!((out.total.double_value(&[]) - (dice + 10. * l1 + 5. * bce)).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn empty_mask_gives_zero_l1() {
        let zeros = Tensor::zeros([1, 4, 4], (Kind::Float, Device::Cpu));
        let ones = Tensor::ones([1, 4, 4], (Kind::Float, Device::Cpu));
        assert_eq!(masked_l1_loss(&ones, &zeros, &zeros).double_value(&[]), 0.);
        assert_eq!(masked_l1_loss(&ones, &zeros, &ones).double_value(&[]), 1.);
    }

    #[test]
    fn rejects_malformed_prediction() {
        let targets = targets();
        let pred = Tensor::zeros([4, 4], (Kind::Float, Device::Cpu));
        assert!(DbLoss::default().compute(&pred, &targets).is_err());
    }
}
