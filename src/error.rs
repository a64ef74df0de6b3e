//! エラー型の定義
//!
//! ミッション制御で扱う失敗は、起動時の接続失敗を除いて全て
//! 発生箇所（エージェント単位・コマンド単位）で捕捉され、ログに記録されます。

use std::time::Duration;
use thiserror::Error;

use crate::controller::MissionState;

/// バックエンド（飛行シミュレータ）側のエラー
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("バックエンドに接続できません: {0}")]
    Unreachable(String),

    #[error("未知の機体: {0}")]
    UnknownVehicle(String),

    #[error("{agent} がコマンドを拒否しました: {reason}")]
    Rejected { agent: String, reason: String },

    #[error("{0:?} 以内に完了しませんでした")]
    TimedOut(Duration),
}

/// ミッション制御のエラー
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MissionError {
    #[error("エージェント '{0}' は既に登録されています")]
    DuplicateAgent(String),

    #[error("エージェント '{0}' は登録されていません")]
    UnknownAgent(String),

    #[error("バックエンド接続失敗: {0}")]
    BackendUnavailable(#[source] BackendError),

    #[error("{agent} のコマンドが失敗しました ({phase}): {source}")]
    CommandFailed {
        agent: String,
        phase: MissionState,
        #[source]
        source: BackendError,
    },

    #[error("エージェント '{0}' の位置が不明です")]
    PositionUnknown(String),

    #[error("設定の不整合: {0}")]
    ConfigInconsistent(String),
}

impl MissionError {
    /// コマンド失敗の対象エージェント
    pub fn agent(&self) -> Option<&str> {
        match self {
            MissionError::DuplicateAgent(name)
            | MissionError::UnknownAgent(name)
            | MissionError::PositionUnknown(name) => Some(name),
            MissionError::CommandFailed { agent, .. } => Some(agent),
            _ => None,
        }
    }
}
