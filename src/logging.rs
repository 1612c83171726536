//! 日志初始化：支持 `RUST_LOG` 覆盖与默认值。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 未设置 `RUST_LOG` 时使用的过滤规则。
const DEFAULT_FILTER: &str = concat!("info,", env!("CARGO_CRATE_NAME"), "=debug");

/// 初始化 tracing 日志订阅与默认过滤规则。
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
