//! ログ初期化
//!
//! `tracing` によるログ出力を設定します。`RUST_LOG` が設定されていればそちらを優先します。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// ログを初期化する
///
/// 2回目以降の呼び出しは何もしません。
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!(
            "{default_level},wgpu_core=warn,wgpu_hal=warn,naga=warn,cubecl=warn"
        )));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .try_init();
}
