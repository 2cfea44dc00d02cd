//! ロギング初期化
//!
//! `RUST_LOG` が設定されていればそれを優先し、なければ設定ファイルの
//! フィルタを使う。2回目以降の呼び出しは何もしない。

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// ロギング初期化のエラー
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("ログフィルタが不正です '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("グローバルサブスクライバを設定できません: {0}")]
    SetGlobal(#[from] tracing_subscriber::util::TryInitError),
}

/// グローバルなtracingサブスクライバを設定する
///
/// 戻り値は今回の呼び出しで設定したかどうか。
pub fn init(filter: &str) -> Result<bool, LoggingError> {
    if INSTALLED.get().is_some() {
        return Ok(false);
    }
    let env_filter = build_env_filter(filter)?;
    Registry::default()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init()?;
    let _ = INSTALLED.set(true);
    Ok(true)
}

fn build_env_filter(filter: &str) -> Result<EnvFilter, LoggingError> {
    match EnvFilter::try_from_default_env() {
        Ok(from_env) => Ok(from_env),
        Err(_) => EnvFilter::try_new(filter).map_err(|source| LoggingError::InvalidFilter {
            filter: filter.to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_filter_is_parsed() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(build_env_filter("teachable_lite_lib=debug,warn").is_ok());
        assert!(matches!(
            build_env_filter("teachable_lite_lib=notalevel"),
            Err(LoggingError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_init_is_idempotent() {
        let first = init("info");
        assert!(matches!(init("info"), Ok(false)) || first.is_err());
    }
}
