#![recursion_limit = "256"]

// ID画像判定モデルの学習・推論
pub mod ml;
pub mod model;
pub mod utils;
