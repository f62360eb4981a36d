//! 2値分類の集計（損失・正解率・適合率・再現率）

use crate::ml::ml_model::DECISION_THRESHOLD;

#[derive(Debug, Default, Clone)]
pub struct BinaryMetrics {
    loss_sum: f64,
    loss_examples: usize,
    true_positive: usize,
    false_positive: usize,
    true_negative: usize,
    false_negative: usize,
}

impl BinaryMetrics {
    /// バッチ平均損失を記録（サンプル数で重み付けして集計する）
    pub fn record_loss(&mut self, loss: f64, batch_size: usize) {
        self.loss_sum += loss * batch_size as f64;
        self.loss_examples += batch_size;
    }

    /// 確率とラベル（0/1）から混同行列を更新
    pub fn record_predictions(&mut self, probabilities: &[f32], targets: &[i64]) {
        for (prob, target) in probabilities.iter().zip(targets) {
            let predicted = *prob > DECISION_THRESHOLD;
            match (predicted, *target == 1) {
                (true, true) => self.true_positive += 1,
                (true, false) => self.false_positive += 1,
                (false, false) => self.true_negative += 1,
                (false, true) => self.false_negative += 1,
            }
        }
    }

    pub fn examples(&self) -> usize {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }

    /// サンプル単位の平均損失
    pub fn avg_loss(&self) -> f64 {
        if self.loss_examples == 0 {
            0.0
        } else {
            self.loss_sum / self.loss_examples as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positive + self.true_negative, self.examples())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_positive)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confusion_counts() {
        let mut metrics = BinaryMetrics::default();
        metrics.record_predictions(&[0.9, 0.8, 0.2, 0.4, 0.5], &[1, 0, 0, 1, 0]);
        assert_eq!(metrics.examples(), 5);
        assert!((metrics.accuracy() - 0.6).abs() < 1e-9);
        assert!((metrics.precision() - 0.5).abs() < 1e-9);
        assert!((metrics.recall() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_metrics_are_zero() {
        let metrics = BinaryMetrics::default();
        assert_eq!(metrics.avg_loss(), 0.0);
        assert_eq!(metrics.accuracy(), 0.0);
        assert_eq!(metrics.precision(), 0.0);
    }

    #[test]
    fn test_average_loss() {
        let mut metrics = BinaryMetrics::default();
        metrics.record_loss(1.0, 4);
        metrics.record_loss(0.5, 4);
        assert!((metrics.avg_loss() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_average_loss_weights_short_last_batch() {
        let mut metrics = BinaryMetrics::default();
        metrics.record_loss(0.1, 8);
        metrics.record_loss(1.0, 1);
        assert!((metrics.avg_loss() - 0.2).abs() < 1e-9);
    }
}
