//! 検証損失を監視するコールバック
//!
//! - 早期終了: 改善しないエポックが続いたら学習を止め、最良の重みに戻す
//! - 学習率減衰: 改善しないエポックが続いたら学習率に係数を掛ける

/// 早期終了の判定状態
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    best_epoch: Option<usize>,
    wait: usize,
}

/// 1エポック分の観測結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// 最良値を更新した（重みを保存すべき）
    Improved,
    /// 改善なし、継続
    Continue,
    /// 待機上限に達した
    Stop,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            best_epoch: None,
            wait: 0,
        }
    }

    /// 検証損失を記録して判定する
    pub fn observe(&mut self, epoch: usize, val_loss: f64) -> StopDecision {
        if val_loss < self.best {
            self.best = val_loss;
            self.best_epoch = Some(epoch);
            self.wait = 0;
            return StopDecision::Improved;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            StopDecision::Stop
        } else {
            StopDecision::Continue
        }
    }

    /// 最良の検証損失
    pub fn best(&self) -> Option<f64> {
        self.best_epoch.map(|_| self.best)
    }

    /// 最良の検証損失を出したエポック（0始まり）
    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }
}

/// 改善とみなす最小の損失減少量
pub const PLATEAU_MIN_DELTA: f64 = 1e-4;

/// 停滞時に学習率を下げるスケジューラ
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    min_delta: f64,
    best: f64,
    wait: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(initial_lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            lr: initial_lr,
            factor,
            patience,
            min_lr,
            min_delta: PLATEAU_MIN_DELTA,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    /// 改善とみなす最小減少量を変更する
    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    /// 現在の学習率
    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// 検証損失を記録し、減衰したら新しい学習率を返す
    pub fn observe(&mut self, val_loss: f64) -> Option<f64> {
        if val_loss < self.best - self.min_delta {
            self.best = val_loss;
            self.wait = 0;
            return None;
        }

        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }

        self.wait = 0;
        let reduced = (self.lr * self.factor).max(self.min_lr);
        if reduced < self.lr {
            self.lr = reduced;
            Some(reduced)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_stopping_after_patience() {
        let mut stopper = EarlyStopping::new(2);
        assert_eq!(stopper.observe(0, 1.0), StopDecision::Improved);
        assert_eq!(stopper.observe(1, 0.8), StopDecision::Improved);
        assert_eq!(stopper.observe(2, 0.9), StopDecision::Continue);
        assert_eq!(stopper.observe(3, 0.85), StopDecision::Stop);
        assert_eq!(stopper.best_epoch(), Some(1));
        assert_eq!(stopper.best(), Some(0.8));
    }

    #[test]
    fn test_early_stopping_resets_on_improvement() {
        let mut stopper = EarlyStopping::new(2);
        stopper.observe(0, 1.0);
        assert_eq!(stopper.observe(1, 1.1), StopDecision::Continue);
        assert_eq!(stopper.observe(2, 0.5), StopDecision::Improved);
        assert_eq!(stopper.observe(3, 0.6), StopDecision::Continue);
    }

    #[test]
    fn test_reduce_on_plateau() {
        let mut scheduler = ReduceLrOnPlateau::new(1e-3, 0.5, 3, 1e-6);
        assert_eq!(scheduler.observe(1.0), None);
        assert_eq!(scheduler.observe(1.0), None);
        assert_eq!(scheduler.observe(1.1), None);
        assert_eq!(scheduler.observe(1.2), Some(5e-4));
        assert_eq!(scheduler.lr(), 5e-4);
    }

    #[test]
    fn test_reduce_on_plateau_ignores_tiny_improvements() {
        let mut scheduler = ReduceLrOnPlateau::new(1e-3, 0.5, 2, 1e-6);
        assert_eq!(scheduler.observe(1.0), None);
        assert_eq!(scheduler.observe(0.99995), None);
        assert_eq!(scheduler.observe(0.99992), Some(5e-4));

        let mut strict = ReduceLrOnPlateau::new(1e-3, 0.5, 2, 1e-6).with_min_delta(0.0);
        assert_eq!(strict.observe(1.0), None);
        assert_eq!(strict.observe(0.99995), None);
        assert_eq!(strict.observe(0.99992), None);
        assert_eq!(strict.lr(), 1e-3);
    }

    #[test]
    fn test_reduce_on_plateau_respects_min_lr() {
        let mut scheduler = ReduceLrOnPlateau::new(2e-6, 0.5, 1, 1e-6);
        assert_eq!(scheduler.observe(1.0), None);
        assert_eq!(scheduler.observe(1.0), Some(1e-6));
        assert_eq!(scheduler.observe(1.0), None);
        assert_eq!(scheduler.lr(), 1e-6);
    }
}
